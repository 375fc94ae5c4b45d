//! Requirement tasks and instance requirements (§3, §6 "*Requirement*").
//!
//! A `Requirement` is, in the real system, produced and owned by the
//! planner/component-model framework (§1 external collaborators). This
//! module defines the trait the resolver calls (`instanciate`,
//! `fullfilled_model`, `resolved_dependency_injection`) plus
//! [`InstanceRequirements`], a concrete, serializable requirement used by
//! this crate's tests and demonstration CLI.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;
use crate::model::{Category, ModelRegistry};
use crate::plan::{Handle, PlanBackend, Relation, Task};

/// The queries the resolver issues against a requirement (§6).
pub trait Requirement {
    /// Expand this requirement into a concrete subgraph in `plan`, returning
    /// the handle of the subgraph's root task. The root is later marked
    /// permanent and recorded in `required_instances` by the instantiator
    /// (§4.2); `instanciate` itself only builds structure.
    fn instanciate(
        &self,
        plan: &mut dyn PlanBackend,
        registry: &dyn ModelRegistry,
        next_handle: &mut dyn FnMut() -> Handle,
    ) -> Result<Handle>;

    /// The top model this requirement's resolved task must fulfil (§8 P2).
    fn fullfilled_model(&self) -> &str;

    /// Ancestor-resolved dependency-injection selections, keyed by the
    /// conventional `<service>_dev` argument name (§4.2 device allocation).
    fn resolved_dependency_injection(&self) -> &BTreeMap<String, String>;
}

/// A concrete component-model + selections + argument-override requirement
/// (§3 "Requirement Task").
#[derive(Debug, Clone, Default)]
pub struct InstanceRequirements {
    pub model: String,
    /// Per-role model overrides, e.g. picking a concrete camera model for a
    /// composition's `camera` child.
    pub selections: BTreeMap<String, String>,
    pub arguments: BTreeMap<String, Value>,
    pub dependency_injection: BTreeMap<String, String>,
}

impl InstanceRequirements {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn select(mut self, role: impl Into<String>, model: impl Into<String>) -> Self {
        self.selections.insert(role.into(), model.into());
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn with_device_selection(mut self, service_dev_arg: impl Into<String>, device: impl Into<String>) -> Self {
        self.dependency_injection.insert(service_dev_arg.into(), device.into());
        self
    }

    fn instanciate_model(
        &self,
        model_name: &str,
        plan: &mut dyn PlanBackend,
        registry: &dyn ModelRegistry,
        next_handle: &mut dyn FnMut() -> Handle,
        creation_index: &mut u64,
    ) -> Result<Handle> {
        let handle = next_handle();
        *creation_index += 1;
        let mut task = Task::new(handle, model_name, *creation_index);
        if model_name == self.model {
            for (key, value) in &self.arguments {
                task.set_argument(key.clone(), value.clone());
            }
        }
        let model = registry.model_for(model_name);
        let is_composition = model
            .as_ref()
            .map(|m| m.category == Category::Composition)
            .unwrap_or(false);
        task.is_abstract = true;
        let root = plan.add(task);

        if is_composition {
            let children = registry.each_child(model_name);
            for child in children {
                let child_model = self
                    .selections
                    .get(&child.role)
                    .cloned()
                    .unwrap_or(child.model.clone());
                let child_handle = self.instanciate_model(
                    &child_model,
                    plan,
                    registry,
                    next_handle,
                    creation_index,
                )?;
                if let Some(t) = plan.get_mut(child_handle) {
                    t.add_role(root, child.role.clone());
                }
                plan.add_relation(Relation::Hierarchy, root, child_handle);
            }
        }

        Ok(root)
    }
}

impl Requirement for InstanceRequirements {
    fn instanciate(
        &self,
        plan: &mut dyn PlanBackend,
        registry: &dyn ModelRegistry,
        next_handle: &mut dyn FnMut() -> Handle,
    ) -> Result<Handle> {
        let mut creation_index = plan
            .all_handles()
            .iter()
            .filter_map(|h| plan.get(*h))
            .map(|t| t.creation_index)
            .max()
            .unwrap_or(0);
        self.instanciate_model(&self.model, plan, registry, next_handle, &mut creation_index)
    }

    fn fullfilled_model(&self) -> &str {
        &self.model
    }

    fn resolved_dependency_injection(&self) -> &BTreeMap<String, String> {
        &self.dependency_injection
    }
}
