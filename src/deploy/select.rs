//! Deployment Selector (§4.5, ~14%).
//!
//! Chooses at most one deployment candidate per task context without an
//! execution agent, disambiguating multi-candidate cases via `orocos_name`
//! then deployment hints, and materializes the chosen deployment instances.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use crate::error::{CandidateDiagnostic, MissingDeploymentDiagnostic, Result};
use crate::merge::MergeGraph;
use crate::model::{Category, ModelRegistry};
use crate::plan::{Handle, PlanBackend, Relation, Task};

use super::index::{CandidateIndex, DeploymentCandidate};

/// A materialized deployment instance (§3 "Deployment Instance").
#[derive(Debug, Clone)]
pub struct DeploymentInstanceRecord {
    pub handle: Handle,
    pub deployment_model: String,
    pub process_name: String,
    pub host: String,
    pub hosted_task_contexts: BTreeSet<Handle>,
}

#[derive(Debug, Default)]
pub struct SelectionResult {
    pub instances: Vec<DeploymentInstanceRecord>,
    pub missing: Vec<MissingDeploymentDiagnostic>,
}

fn tuple_of(c: &DeploymentCandidate) -> (String, String, String) {
    (c.host.clone(), c.deployment_model.clone(), c.local_name.clone())
}

/// §4.5 steps 1-5 plus `apply_selected_deployments`: run selection for every
/// eligible task context, then materialize the chosen deployment instances
/// and merge each original task onto its deployed counterpart.
#[instrument(skip_all)]
pub fn select_and_apply_deployments(
    plan: &mut dyn PlanBackend,
    registry: &dyn ModelRegistry,
    index: &CandidateIndex,
    merges: &mut MergeGraph,
    next_handle: &mut dyn FnMut() -> Handle,
) -> Result<SelectionResult> {
    let mut assigned: BTreeSet<(String, String, String)> = BTreeSet::new();
    let mut assigned_by: BTreeMap<(String, String, String), String> = BTreeMap::new();
    let mut instance_by_key: BTreeMap<(String, String), Handle> = BTreeMap::new();
    let mut result = SelectionResult::default();

    let mut handles = plan.all_handles();
    handles.sort_by_key(|h| plan.get(*h).map(|t| t.creation_index).unwrap_or(u64::MAX));

    for handle in handles {
        let Some(task) = plan.get(handle) else { continue };
        if task.execution_agent.is_some() {
            continue;
        }
        let is_task_context = registry
            .model_for(&task.model)
            .map(|m| m.category == Category::TaskContext)
            .unwrap_or(false);
        if !is_task_context {
            continue;
        }

        let candidates = index.candidates_for(&task.model);
        if candidates.is_empty() {
            continue;
        }

        let available: Vec<&DeploymentCandidate> = candidates
            .iter()
            .filter(|c| !assigned.contains(&tuple_of(c)))
            .collect();

        let selected = match available.len() {
            0 => None,
            1 => Some(available[0]),
            _ => {
                if let Some(name) = task.orocos_name.clone() {
                    let matched: Vec<&&DeploymentCandidate> =
                        available.iter().filter(|c| c.local_name == name).collect();
                    (matched.len() == 1).then(|| *matched[0])
                } else if !task.deployment_hints.is_empty() {
                    let matched: Vec<&&DeploymentCandidate> = available
                        .iter()
                        .filter(|c| {
                            task.deployment_hints
                                .iter()
                                .any(|h| h.matches(&c.deployment_model, &c.local_name))
                        })
                        .collect();
                    (matched.len() == 1).then(|| *matched[0])
                } else {
                    None
                }
            }
        };

        let Some(candidate) = selected else {
            let diag_candidates = candidates
                .iter()
                .map(|c| CandidateDiagnostic {
                    host: c.host.clone(),
                    deployment_model: c.deployment_model.clone(),
                    deployment_local_name: c.local_name.clone(),
                    already_bound_to: assigned_by.get(&tuple_of(c)).cloned(),
                })
                .collect();
            result.missing.push(MissingDeploymentDiagnostic {
                task: task.model.clone(),
                candidates: diag_candidates,
            });
            continue;
        };

        let tuple = tuple_of(candidate);
        assigned.insert(tuple.clone());
        assigned_by.insert(tuple, task.model.clone());

        let instance_key = (candidate.host.clone(), candidate.deployment_model.clone());
        let instance_handle = *instance_by_key.entry(instance_key).or_insert_with(|| {
            let h = next_handle();
            let mut instance_task = Task::new(h, candidate.deployment_model.clone(), 0);
            instance_task.permanent = true;
            instance_task.set_argument("host", serde_json::Value::from(candidate.host.clone()));
            instance_task.set_argument(
                "process_name",
                serde_json::Value::from(candidate.deployment_model.clone()),
            );
            plan.add(instance_task)
        });

        let deployed_handle = next_handle();
        let original = plan.get(handle).expect("task exists").clone();
        let mut deployed = Task {
            handle: deployed_handle,
            ..original
        };
        deployed.is_abstract = false;
        deployed.execution_agent = Some(instance_handle);
        deployed.orocos_name = Some(candidate.local_name.clone());
        plan.add(deployed);
        plan.add_relation(Relation::Dependency, deployed_handle, instance_handle);

        merges.apply_merge_group(&[(handle, deployed_handle)], plan)?;

        let record = result
            .instances
            .iter_mut()
            .find(|r: &&mut DeploymentInstanceRecord| r.handle == instance_handle);
        if let Some(record) = record {
            record.hosted_task_contexts.insert(deployed_handle);
        } else {
            let mut hosted = BTreeSet::new();
            hosted.insert(deployed_handle);
            result.instances.push(DeploymentInstanceRecord {
                handle: instance_handle,
                deployment_model: candidate.deployment_model.clone(),
                process_name: candidate.deployment_model.clone(),
                host: candidate.host.clone(),
                hosted_task_contexts: hosted,
            });
        }
    }

    debug!(
        deployed = result.instances.iter().map(|r| r.hosted_task_contexts.len()).sum::<usize>(),
        missing = result.missing.len(),
        "deployment selection complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::index::CandidateIndex;
    use crate::model::{ComponentModel, DeploymentModel, StaticRegistry};
    use crate::plan::InMemoryPlan;

    fn next_handle_fn(plan: &InMemoryPlan) -> impl FnMut() -> Handle + '_ {
        let mut counter = plan.all_handles().iter().map(|h| h.0).max().map(|m| m + 1).unwrap_or(0);
        move || {
            let h = Handle(counter);
            counter += 1;
            h
        }
    }

    #[test]
    fn single_candidate_is_selected_and_merged() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Camera"));
        registry.register_deployment(DeploymentModel::new("D1").hosting("t", "Camera"));
        let mut available = BTreeMap::new();
        available.insert("h1".to_string(), vec!["D1".to_string()]);
        let index = CandidateIndex::build(&registry, &available);

        let mut plan = InMemoryPlan::new();
        let task_handle = plan.allocate_handle();
        let mut t = Task::new(task_handle, "Camera", 0);
        t.is_abstract = false;
        plan.add(t);
        let mut merges = MergeGraph::new();
        let mut next = next_handle_fn(&plan);

        let result =
            select_and_apply_deployments(&mut plan, &registry, &index, &mut merges, &mut next).unwrap();

        assert_eq!(result.instances.len(), 1);
        assert!(result.missing.is_empty());
        let deployed = merges.replacement_for(task_handle);
        assert_ne!(deployed, task_handle);
        assert_eq!(plan.get(deployed).unwrap().orocos_name.as_deref(), Some("t"));
    }

    #[test]
    fn ambiguous_candidates_without_hint_are_reported_missing() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Camera"));
        registry.register_deployment(DeploymentModel::new("D1").hosting("a", "Camera"));
        registry.register_deployment(DeploymentModel::new("D2").hosting("a", "Camera"));
        let mut available = BTreeMap::new();
        available.insert("h1".to_string(), vec!["D1".to_string()]);
        available.insert("h2".to_string(), vec!["D2".to_string()]);
        let index = CandidateIndex::build(&registry, &available);

        let mut plan = InMemoryPlan::new();
        let task_handle = plan.allocate_handle();
        let mut t = Task::new(task_handle, "Camera", 0);
        t.is_abstract = false;
        plan.add(t);
        let mut merges = MergeGraph::new();
        let mut next = next_handle_fn(&plan);

        let result =
            select_and_apply_deployments(&mut plan, &registry, &index, &mut merges, &mut next).unwrap();

        assert!(result.instances.is_empty());
        assert_eq!(result.missing.len(), 1);
        assert_eq!(result.missing[0].candidates.len(), 2);
    }

    #[test]
    fn deployment_hint_regex_disambiguates() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Camera"));
        registry.register_deployment(DeploymentModel::new("D1").hosting("a", "Camera"));
        registry.register_deployment(DeploymentModel::new("D2").hosting("a", "Camera"));
        let mut available = BTreeMap::new();
        available.insert("h1".to_string(), vec!["D1".to_string()]);
        available.insert("h2".to_string(), vec!["D2".to_string()]);
        let index = CandidateIndex::build(&registry, &available);

        let mut plan = InMemoryPlan::new();
        let task_handle = plan.allocate_handle();
        let mut t = Task::new(task_handle, "Camera", 0);
        t.is_abstract = false;
        t.deployment_hints.push(crate::plan::DeploymentHint::DeploymentModel("D1".to_string()));
        plan.add(t);
        let mut merges = MergeGraph::new();
        let mut next = next_handle_fn(&plan);

        let result =
            select_and_apply_deployments(&mut plan, &registry, &index, &mut merges, &mut next).unwrap();

        assert_eq!(result.instances.len(), 1);
        assert_eq!(result.instances[0].deployment_model, "D1");
    }

    #[test]
    fn already_bound_slot_is_not_selected_twice() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Camera"));
        registry.register_deployment(DeploymentModel::new("D1").hosting("a", "Camera"));
        let mut available = BTreeMap::new();
        available.insert("h1".to_string(), vec!["D1".to_string()]);
        let index = CandidateIndex::build(&registry, &available);

        let mut plan = InMemoryPlan::new();
        let t1 = plan.allocate_handle();
        let mut task1 = Task::new(t1, "Camera", 0);
        task1.is_abstract = false;
        plan.add(task1);
        let t2 = plan.allocate_handle();
        let mut task2 = Task::new(t2, "Camera", 1);
        task2.is_abstract = false;
        plan.add(task2);
        let mut merges = MergeGraph::new();
        let mut next = next_handle_fn(&plan);

        let result =
            select_and_apply_deployments(&mut plan, &registry, &index, &mut merges, &mut next).unwrap();

        assert_eq!(result.instances.len(), 1);
        assert_eq!(result.missing.len(), 1);
    }
}
