//! Instantiator (§4.2, ~12%).
//!
//! Expands each requirement task into a concrete subgraph and performs
//! device auto-allocation by walking each device-carrying task's ancestor
//! hierarchy for matching dependency-injection selections.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use crate::error::{NetgenError, Result};
use crate::hooks::HookChain;
use crate::model::ModelRegistry;
use crate::plan::{Handle, PlanBackend, Relation};
use crate::requirement::Requirement;

/// The (top model, provided data-service models, retained arguments) triple
/// tagged onto each instantiated root (§4.2 "fulfilled-model triple").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfilledModelTriple {
    pub top_model: String,
    pub provided_data_services: Vec<String>,
    pub retained_arguments: Vec<String>,
}

/// A single requirement task plus the requirement object it carries.
pub struct RequirementTask {
    pub id: String,
    pub requirements: Box<dyn Requirement>,
}

/// Instantiation output: the resolved roots for every requirement, plus the
/// fulfilled-model triple each was tagged with.
#[derive(Debug, Default)]
pub struct InstantiationResult {
    pub required_instances: BTreeMap<String, Handle>,
    pub fulfilled_models: BTreeMap<Handle, FulfilledModelTriple>,
}

/// Run instantiation for every requirement task, then allocate devices.
#[instrument(skip_all, fields(count = requirements.len()))]
pub fn instantiate_requirements(
    requirements: &[RequirementTask],
    plan: &mut dyn PlanBackend,
    registry: &dyn ModelRegistry,
    next_handle: &mut dyn FnMut() -> Handle,
    hooks: &HookChain,
) -> Result<InstantiationResult> {
    let mut result = InstantiationResult::default();
    let mut selections: BTreeMap<Handle, BTreeMap<String, String>> = BTreeMap::new();

    for req in requirements {
        let root = req.requirements.instanciate(plan, registry, next_handle)?;
        if let Some(task) = plan.get_mut(root) {
            task.permanent = true;
        } else {
            return Err(NetgenError::InstantiationFailed {
                requirement: req.id.clone(),
            });
        }
        selections.insert(root, req.requirements.resolved_dependency_injection().clone());

        let provided_data_services = registry
            .model_for(req.requirements.fullfilled_model())
            .map(|m| m.fulfilled_models.clone())
            .unwrap_or_default();
        result.fulfilled_models.insert(
            root,
            FulfilledModelTriple {
                top_model: req.requirements.fullfilled_model().to_string(),
                provided_data_services,
                retained_arguments: plan
                    .get(root)
                    .map(|t| t.arguments.keys().cloned().collect())
                    .unwrap_or_default(),
            },
        );
        result.required_instances.insert(req.id.clone(), root);
    }

    hooks.run_instantiation(plan)?;

    allocate_devices(plan, registry, &selections)?;

    hooks.run_instantiated_network(plan)?;

    debug!(required = result.required_instances.len(), "instantiation complete");
    Ok(result)
}

/// Device auto-allocation (§4.2, §9 design note on memoized ancestor
/// traversal): for every master driver service on a device-carrying task
/// without a bound device, look for a unique value among ancestor
/// dependency-injection selections for `<service>_dev`.
fn allocate_devices(
    plan: &mut dyn PlanBackend,
    registry: &dyn ModelRegistry,
    selections: &BTreeMap<Handle, BTreeMap<String, String>>,
) -> Result<()> {
    let mut memo: BTreeMap<(Handle, String), BTreeSet<String>> = BTreeMap::new();
    let handles = plan.all_handles();

    for handle in handles {
        let Some(task) = plan.get(handle) else { continue };
        let services = registry.each_master_driver_service(&task.model);
        if services.is_empty() {
            continue;
        }
        for service in services {
            let dev_arg = service.dev_arg_name();
            if plan.get(handle).and_then(|t| t.argument(&dev_arg)).is_some() {
                continue;
            }
            let values = ancestor_selection_values(plan, handle, &dev_arg, selections, &mut memo);
            if values.len() == 1 {
                let value = values.iter().next().unwrap().clone();
                if let Some(t) = plan.get_mut(handle) {
                    t.set_argument(dev_arg, serde_json::Value::from(value));
                }
            }
            // Zero or ambiguous (>1) candidates: leave unset, reported by
            // the generated-network validator (§4.7).
        }
    }
    Ok(())
}

fn ancestor_selection_values(
    plan: &dyn PlanBackend,
    handle: Handle,
    dev_arg: &str,
    selections: &BTreeMap<Handle, BTreeMap<String, String>>,
    memo: &mut BTreeMap<(Handle, String), BTreeSet<String>>,
) -> BTreeSet<String> {
    let key = (handle, dev_arg.to_string());
    if let Some(cached) = memo.get(&key) {
        return cached.clone();
    }
    // Insert a placeholder to guard against diamond re-entrancy within this
    // single traversal before recursing (§9 design note).
    memo.insert(key.clone(), BTreeSet::new());

    let mut values = BTreeSet::new();
    if let Some(sel) = selections.get(&handle) {
        if let Some(v) = sel.get(dev_arg) {
            values.insert(v.clone());
        }
    }
    for parent in plan
        .task_relation_graph_for(Relation::Hierarchy)
        .predecessors(handle)
    {
        values.extend(ancestor_selection_values(plan, parent, dev_arg, selections, memo));
    }

    memo.insert(key, values.clone());
    values
}
