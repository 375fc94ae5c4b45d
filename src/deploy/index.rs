//! Deployment Candidate Index (§4.4, ~8%).
//!
//! Maintains the deployed-model closure and the task-context-model ->
//! candidate-slot map, both derived from the component-model registry plus
//! the `available_deployments` configuration (host -> deployment model
//! names runnable there).

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Category, ModelRegistry, ABSTRACT_ROOTS};

/// One deployable slot: a task context hosted by a named deployment model
/// on a given host, identified by its deployment-local name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeploymentCandidate {
    pub host: String,
    pub deployment_model: String,
    pub local_name: String,
}

#[derive(Debug, Default)]
pub struct CandidateIndex {
    deployed_model_closure: BTreeSet<String>,
    candidates_by_model: BTreeMap<String, Vec<DeploymentCandidate>>,
}

impl CandidateIndex {
    /// Build the index from scratch (§4.8 step 3 "refresh candidate index").
    pub fn build(registry: &dyn ModelRegistry, available_deployments: &BTreeMap<String, Vec<String>>) -> Self {
        let mut candidates_by_model: BTreeMap<String, Vec<DeploymentCandidate>> = BTreeMap::new();
        let deployments_by_name: BTreeMap<String, _> = registry
            .each_deployment()
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let mut seed_models: BTreeSet<String> = BTreeSet::new();
        for (host, deployment_names) in available_deployments {
            for deployment_name in deployment_names {
                let Some(deployment) = deployments_by_name.get(deployment_name) else {
                    continue;
                };
                for dtc in &deployment.deployed_task_contexts {
                    seed_models.insert(dtc.task_context_model.clone());
                    candidates_by_model
                        .entry(dtc.task_context_model.clone())
                        .or_default()
                        .push(DeploymentCandidate {
                            host: host.clone(),
                            deployment_model: deployment_name.clone(),
                            local_name: dtc.local_name.clone(),
                        });
                }
            }
        }

        let deployed_model_closure = Self::compute_closure(registry, seed_models);

        Self {
            deployed_model_closure,
            candidates_by_model,
        }
    }

    /// §4.4: iteratively expand the seed set with fulfilled models and with
    /// composition models whose every child is already in the set, until
    /// fixed point; then drop the abstract roots.
    fn compute_closure(registry: &dyn ModelRegistry, seed: BTreeSet<String>) -> BTreeSet<String> {
        let mut closure = seed;
        let compositions: Vec<_> = registry
            .each_submodel()
            .into_iter()
            .filter(|m| m.category == Category::Composition)
            .collect();

        loop {
            let mut added = false;

            let snapshot: Vec<String> = closure.iter().cloned().collect();
            for model_name in snapshot {
                for fulfilled in registry.each_fullfilled_model(&model_name) {
                    // §4.4 restricts this expansion to component/data-service
                    // kinds. A fulfilled name with no registered model of its
                    // own (the common case: an abstract data-service
                    // interface like "ImageProvider") is admitted by
                    // default; one that *is* registered must tag as a task
                    // context (component) or Generic (this registry's
                    // data-service bucket, §9 design note #2) to qualify.
                    let admits = match registry.model_for(&fulfilled) {
                        Some(model) => matches!(model.category, Category::TaskContext | Category::Generic),
                        None => true,
                    };
                    if admits && closure.insert(fulfilled) {
                        added = true;
                    }
                }
            }

            for comp in &compositions {
                if closure.contains(&comp.name) {
                    continue;
                }
                if !comp.children.is_empty() && comp.children.iter().all(|c| closure.contains(&c.model)) {
                    closure.insert(comp.name.clone());
                    added = true;
                }
            }

            if !added {
                break;
            }
        }

        for root in ABSTRACT_ROOTS {
            closure.remove(*root);
        }
        closure
    }

    pub fn deployed_model_closure(&self) -> &BTreeSet<String> {
        &self.deployed_model_closure
    }

    pub fn candidates_for(&self, model: &str) -> &[DeploymentCandidate] {
        self.candidates_by_model
            .get(model)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}
