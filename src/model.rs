//! Component model registry (§4.4, §6, §9 design note #2).
//!
//! The real component-model registry is an external collaborator (§1): it is
//! owned by the surrounding framework, not by this crate. What this module
//! provides is (a) the shape of the data it hands back — immutable
//! `ComponentModel`/`DeploymentModel` descriptors — and (b) a `ModelRegistry`
//! trait capturing the handful of queries the resolver actually issues
//! against it, plus a `StaticRegistry` reference implementation built from
//! in-memory tables for testing.
//!
//! Per the design note on dynamic dispatch over task categories, models and
//! tasks alike carry a tagged [`Category`] instead of relying on duck-typed
//! predicates.

use std::collections::BTreeMap;
use std::sync::Arc;

use smallvec::SmallVec;

/// What kind of thing a model (and, transitively, a task built from it) is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    TaskContext,
    Composition,
    Deployment,
    Device,
    Generic,
}

/// Replaces `respond_to?`/`kind_of?` duck typing with an explicit bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const HAS_MASTER_DRIVER_SERVICES: Capabilities = Capabilities(0b0001);
    pub const HAS_CHILDREN: Capabilities = Capabilities(0b0010);
    pub const IS_DEPLOYMENT: Capabilities = Capabilities(0b0100);

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;
    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Capabilities) {
        self.0 |= rhs.0;
    }
}

/// An input or output port declared by a component model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub ty: String,
    /// A static port's identity/type cannot change while the task is
    /// configured (§9 glossary "Static port"); changing one forces a
    /// stop-reconfigure cycle (§4.6).
    pub is_static: bool,
    /// A multiplexing input port may legally have more than one distinct
    /// driver (§4.7 "no multiplexing violation").
    pub multiplexes: bool,
}

impl Port {
    pub fn input(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            is_static: false,
            multiplexes: false,
        }
    }

    pub fn output(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self::input(name, ty)
    }

    pub fn multiplexing(mut self) -> Self {
        self.multiplexes = true;
        self
    }

    pub fn r#static(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// A named child slot of a composition model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub role: String,
    pub model: String,
    pub optional: bool,
}

/// A master driver service: the conventional argument name is
/// `<service>_dev` (§3 Component Model).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDriverService {
    pub name: String,
}

impl MasterDriverService {
    /// The conventional dependency-injection selection key for this service.
    pub fn dev_arg_name(&self) -> String {
        format!("{}_dev", self.name)
    }
}

/// An immutable component-model descriptor (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentModel {
    pub name: String,
    pub category: Category,
    pub capabilities: Capabilities,
    /// Models this model is substitutable for, including itself.
    pub fulfilled_models: Vec<String>,
    pub children: Vec<ChildSpec>,
    pub input_ports: Vec<Port>,
    pub output_ports: Vec<Port>,
    pub master_driver_services: Vec<MasterDriverService>,
}

impl ComponentModel {
    pub fn task_context(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: Category::TaskContext,
            capabilities: Capabilities::empty(),
            fulfilled_models: Vec::new(),
            children: Vec::new(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            master_driver_services: Vec::new(),
        }
    }

    pub fn composition(name: impl Into<String>) -> Self {
        Self {
            category: Category::Composition,
            capabilities: Capabilities::HAS_CHILDREN,
            ..Self::task_context(name)
        }
    }

    pub fn fulfilling(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut all: Vec<String> = models.into_iter().map(Into::into).collect();
        if !all.contains(&self.name) {
            all.push(self.name.clone());
        }
        self.fulfilled_models = all;
        self
    }

    pub fn with_child(mut self, role: impl Into<String>, model: impl Into<String>, optional: bool) -> Self {
        self.children.push(ChildSpec {
            role: role.into(),
            model: model.into(),
            optional,
        });
        self
    }

    pub fn with_input(mut self, port: Port) -> Self {
        self.input_ports.push(port);
        self
    }

    pub fn with_output(mut self, port: Port) -> Self {
        self.output_ports.push(port);
        self
    }

    pub fn with_master_driver_service(mut self, service: impl Into<String>) -> Self {
        self.capabilities |= Capabilities::HAS_MASTER_DRIVER_SERVICES;
        self.master_driver_services.push(MasterDriverService {
            name: service.into(),
        });
        self
    }

    pub fn fullfills(&self, model_name: &str) -> bool {
        self.fulfilled_models.iter().any(|m| m == model_name) || self.name == model_name
    }

    pub fn find_input_port(&self, name: &str) -> Option<&Port> {
        self.input_ports.iter().find(|p| p.name == name)
    }

    pub fn find_output_port(&self, name: &str) -> Option<&Port> {
        self.output_ports.iter().find(|p| p.name == name)
    }
}

/// One `(deployment-local name, task-context model)` entry hosted by a
/// deployment (§3 Deployment Model).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedTaskContext {
    pub local_name: String,
    pub task_context_model: String,
}

/// An immutable deployment descriptor: a single OS process hosting a fixed
/// set of task contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentModel {
    pub name: String,
    pub deployed_task_contexts: Vec<DeployedTaskContext>,
}

impl DeploymentModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deployed_task_contexts: Vec::new(),
        }
    }

    pub fn hosting(mut self, local_name: impl Into<String>, task_context_model: impl Into<String>) -> Self {
        self.deployed_task_contexts.push(DeployedTaskContext {
            local_name: local_name.into(),
            task_context_model: task_context_model.into(),
        });
        self
    }
}

/// The abstract root models excluded from the deployed-model closure (§4.4).
pub const ABSTRACT_ROOTS: &[&str] = &["TaskContext", "DataService", "Composition", "Component"];

/// The queries the resolver issues against the component-model registry
/// (§6 "Consumed from external collaborators").
pub trait ModelRegistry: Send + Sync {
    fn model_for(&self, name: &str) -> Option<Arc<ComponentModel>>;

    /// All known component models (used by `each_submodel`/closure walks).
    fn each_submodel(&self) -> Vec<Arc<ComponentModel>>;

    fn each_child(&self, model: &str) -> SmallVec<[ChildSpec; 4]> {
        self.model_for(model)
            .map(|m| m.children.clone().into())
            .unwrap_or_default()
    }

    fn each_fullfilled_model(&self, model: &str) -> Vec<String> {
        self.model_for(model)
            .map(|m| m.fulfilled_models.clone())
            .unwrap_or_default()
    }

    fn each_master_driver_service(&self, model: &str) -> Vec<MasterDriverService> {
        self.model_for(model)
            .map(|m| m.master_driver_services.clone())
            .unwrap_or_default()
    }

    fn find_input_port(&self, model: &str, port: &str) -> Option<Port> {
        self.model_for(model).and_then(|m| m.find_input_port(port).cloned())
    }

    fn find_output_port(&self, model: &str, port: &str) -> Option<Port> {
        self.model_for(model).and_then(|m| m.find_output_port(port).cloned())
    }

    /// All deployment models registered with the framework, keyed by name.
    fn each_deployment(&self) -> Vec<Arc<DeploymentModel>>;

    /// `each_orogen_deployed_task_context_model`: the task-context model
    /// names known to be deployable by at least one registered deployment.
    fn each_orogen_deployed_task_context_model(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        for dep in self.each_deployment() {
            for t in &dep.deployed_task_contexts {
                seen.insert(t.task_context_model.clone());
            }
        }
        seen.into_iter().collect()
    }
}

/// A simple in-memory registry, the reference implementation used by tests
/// and by the demonstration CLI. Not part of the specified system (§6 treats
/// the registry as external); this is the fixture.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    models: BTreeMap<String, Arc<ComponentModel>>,
    deployments: Vec<Arc<DeploymentModel>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_model(&mut self, model: ComponentModel) -> &mut Self {
        self.models.insert(model.name.clone(), Arc::new(model));
        self
    }

    pub fn register_deployment(&mut self, deployment: DeploymentModel) -> &mut Self {
        self.deployments.push(Arc::new(deployment));
        self
    }
}

impl ModelRegistry for StaticRegistry {
    fn model_for(&self, name: &str) -> Option<Arc<ComponentModel>> {
        self.models.get(name).cloned()
    }

    fn each_submodel(&self) -> Vec<Arc<ComponentModel>> {
        self.models.values().cloned().collect()
    }

    fn each_deployment(&self) -> Vec<Arc<DeploymentModel>> {
        self.deployments.clone()
    }
}
