//! Working-plan task nodes (§3 "Task", "Deployment Instance").

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

/// A stable integer identity assigned at plan insertion (§9 design note
/// "Graph identity across transactions"). The merge graph keys exclusively
/// on handles, never on Rust object identity, so that a staging proxy and
/// its real-plan counterpart are interchangeable once merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An argument value: either bound to a concrete value, or explicitly unset
/// (distinct from "absent", §3).
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Set(Value),
    Unset,
}

impl Argument {
    pub fn is_set(&self) -> bool {
        matches!(self, Argument::Set(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Argument::Set(v) => Some(v),
            Argument::Unset => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Pending,
    Starting,
    Running,
    Finishing,
    Finished,
}

impl LifecycleState {
    pub fn is_finished(self) -> bool {
        matches!(self, LifecycleState::Finished)
    }

    pub fn is_finishing(self) -> bool {
        matches!(self, LifecycleState::Finishing)
    }

    pub fn is_running(self) -> bool {
        matches!(self, LifecycleState::Running)
    }
}

/// A matcher used to disambiguate deployment candidates (§4.5): either an
/// exact deployment-model identity, or a regex over the deployment-local
/// name.
#[derive(Debug, Clone)]
pub enum DeploymentHint {
    DeploymentModel(String),
    LocalNameRegex(regex::Regex),
}

impl DeploymentHint {
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(DeploymentHint::LocalNameRegex(regex::Regex::new(pattern)?))
    }

    pub fn matches(&self, deployment_model: &str, local_name: &str) -> bool {
        match self {
            DeploymentHint::DeploymentModel(m) => m == deployment_model,
            DeploymentHint::LocalNameRegex(re) => re.is_match(local_name),
        }
    }
}

/// A mutable node in the working plan (§3 "Task").
#[derive(Debug, Clone)]
pub struct Task {
    pub handle: Handle,
    pub model: String,
    pub arguments: BTreeMap<String, Argument>,
    pub is_abstract: bool,
    /// Roles held within each parent composition: parent handle -> role names.
    pub roles: BTreeMap<Handle, BTreeSet<String>>,
    pub execution_agent: Option<Handle>,
    pub orocos_name: Option<String>,
    pub deployment_hints: Vec<DeploymentHint>,
    pub lifecycle: LifecycleState,
    pub reusable: bool,
    pub setup: bool,
    pub transaction_proxy: bool,
    pub permanent: bool,
    /// Creation order, used for deterministic, stable iteration (§5) and as
    /// the final merge-solver tie-break (§4.1).
    pub creation_index: u64,
}

impl Task {
    pub fn new(handle: Handle, model: impl Into<String>, creation_index: u64) -> Self {
        Self {
            handle,
            model: model.into(),
            arguments: BTreeMap::new(),
            is_abstract: true,
            roles: BTreeMap::new(),
            execution_agent: None,
            orocos_name: None,
            deployment_hints: Vec::new(),
            lifecycle: LifecycleState::Pending,
            reusable: true,
            setup: false,
            transaction_proxy: false,
            permanent: false,
            creation_index,
        }
    }

    pub fn set_argument(&mut self, key: impl Into<String>, value: Value) {
        self.arguments.insert(key.into(), Argument::Set(value));
    }

    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key).and_then(Argument::value)
    }

    pub fn role_in(&self, parent: Handle) -> Option<&BTreeSet<String>> {
        self.roles.get(&parent)
    }

    pub fn add_role(&mut self, parent: Handle, role: impl Into<String>) {
        self.roles.entry(parent).or_default().insert(role.into());
    }

    /// §3: "a `reusable?` predicate" — whether this task's dataflow/role
    /// edges may survive a merge onto another task during reconciliation.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub fn is_setup(&self) -> bool {
        self.setup
    }

    /// Two tasks can only reuse one another if their arguments agree on
    /// every key both have set (§3 Merge Solver "compatible arguments").
    pub fn arguments_compatible_with(&self, other: &Task) -> bool {
        for (key, value) in &self.arguments {
            if let Argument::Set(v) = value {
                if let Some(Argument::Set(other_v)) = other.arguments.get(key) {
                    if v != other_v {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// §4.6 `can_be_deployed_by?`: whether a running task `other` is a valid
    /// reuse target for `self` during reconciliation.
    pub fn can_be_deployed_by(&self, other: &Task) -> bool {
        self.model == other.model && self.arguments_compatible_with(other)
    }
}

/// A deployment instance: a task representing a running/to-run OS process
/// (§3 "Deployment Instance").
#[derive(Debug, Clone)]
pub struct DeploymentInstance {
    pub handle: Handle,
    pub deployment_model: String,
    pub process_name: String,
    pub host: String,
    pub hosted_task_contexts: BTreeSet<Handle>,
}

impl DeploymentInstance {
    pub fn new(
        handle: Handle,
        deployment_model: impl Into<String>,
        process_name: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            handle,
            deployment_model: deployment_model.into(),
            process_name: process_name.into(),
            host: host.into(),
            hosted_task_contexts: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_compatible_requires_agreement_on_shared_keys() {
        let mut a = Task::new(Handle(1), "M", 0);
        a.set_argument("x", Value::from(1));
        let mut b = Task::new(Handle(2), "M", 1);
        b.set_argument("x", Value::from(2));
        assert!(!a.arguments_compatible_with(&b));

        b.set_argument("x", Value::from(1));
        assert!(a.arguments_compatible_with(&b));
    }

    #[test]
    fn arguments_compatible_ignores_keys_only_one_side_sets() {
        let mut a = Task::new(Handle(1), "M", 0);
        a.set_argument("x", Value::from(1));
        let b = Task::new(Handle(2), "M", 1);
        assert!(a.arguments_compatible_with(&b));
        assert!(b.arguments_compatible_with(&a));
    }

    #[test]
    fn deployment_hint_regex_matches_local_name() {
        let hint = DeploymentHint::regex("D1").unwrap();
        assert!(hint.matches("other", "slot-D1-x"));
        assert!(!hint.matches("other", "slot-D2-x"));
    }

    #[test]
    fn can_be_deployed_by_requires_same_model_and_compatible_args() {
        let a = Task::new(Handle(1), "M", 0);
        let mut other_model = Task::new(Handle(2), "N", 1);
        assert!(!a.can_be_deployed_by(&other_model));
        other_model.model = "M".into();
        assert!(a.can_be_deployed_by(&other_model));
    }
}
