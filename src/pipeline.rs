//! Pipeline Driver (§4.8, ~6%): sequences the stages over one staging
//! transaction and applies the `on_error` failure policy.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument, warn};

use crate::bus::link_busses;
use crate::config::{OnError, ResolverConfig};
use crate::deploy::{select_and_apply_deployments, CandidateIndex};
use crate::dynamics::DataflowDynamics;
use crate::error::Result;
use crate::graphviz::{dump_dataflow, dump_hierarchy};
use crate::hooks::HookChain;
use crate::instantiate::{instantiate_requirements, RequirementTask};
use crate::merge::{merge_identical_tasks, MergeGraph};
use crate::model::{Category, ModelRegistry};
use crate::plan::{ConnectionPolicy, Handle, InMemoryPlan, PlanBackend, PlanTransaction, PortPair, Relation};
use crate::reconcile::reconcile;
use crate::validate::{
    validate_abstract_network, validate_deployed_network, validate_final_network, validate_generated_network,
};

/// Drives one `resolve` call end to end over a fresh staging transaction.
/// Owns the monotonically increasing invocation counter used to name dot
/// dumps (§4.8, §6 "Produced at the boundary").
#[derive(Debug, Default)]
pub struct Pipeline {
    invocation: usize,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one full resolution pass (§4.8 steps 1-7) and, on success, commit
    /// the staging transaction onto `real_plan`. Returns the final
    /// `required_instances` map (requirement id -> resolved, committed
    /// handle).
    #[instrument(skip_all, fields(invocation = self.invocation + 1))]
    pub fn resolve(
        &mut self,
        real_plan: &mut InMemoryPlan,
        registry: &dyn ModelRegistry,
        dynamics: &mut dyn DataflowDynamics,
        hooks: &HookChain,
        config: &ResolverConfig,
        requirements: &[RequirementTask],
    ) -> Result<BTreeMap<String, Handle>> {
        self.invocation += 1;
        let invocation = self.invocation;

        let mut txn = PlanTransaction::open(real_plan);
        let mut merges = MergeGraph::new();

        let outcome = Self::run_stages(&mut txn, registry, dynamics, hooks, config, requirements, &mut merges);

        match outcome {
            Ok(mut required_instances) => {
                if config.save_plans {
                    Self::dump(txn.working_plan_ref(), invocation);
                }
                let staging_to_real = txn.commit(&merges)?;
                for handle in required_instances.values_mut() {
                    if let Some(&real_handle) = staging_to_real.get(handle) {
                        *handle = real_handle;
                    }
                }
                Ok(required_instances)
            }
            Err(err) => {
                debug!(%err, on_error = ?config.on_error, "resolve failed, applying failure policy");
                match config.on_error {
                    OnError::Save => {
                        Self::dump(txn.working_plan_ref(), invocation);
                        txn.discard();
                        Err(err)
                    }
                    OnError::Commit => {
                        if let Err(commit_err) = txn.commit(&merges) {
                            warn!(%commit_err, "on_error=commit: committing inconsistent staging state also failed");
                        }
                        Err(err)
                    }
                    OnError::Drop => {
                        txn.discard();
                        Err(err)
                    }
                }
            }
        }
    }

    fn dump(plan: &InMemoryPlan, invocation: usize) {
        let dataflow_path = format!("syskit-plan-{invocation}.dataflow.dot");
        if let Err(e) = std::fs::write(&dataflow_path, dump_dataflow(plan)) {
            warn!(error = %e, path = %dataflow_path, "failed to write dataflow dot dump");
        }
        let hierarchy_path = format!("syskit-plan-{invocation}.hierarchy.dot");
        if let Err(e) = std::fs::write(&hierarchy_path, dump_hierarchy(plan)) {
            warn!(error = %e, path = %hierarchy_path, "failed to write hierarchy dot dump");
        }
    }

    /// §4.8 steps 2-7, run entirely against the staging plan. Commit/discard
    /// is the caller's responsibility so the failure policy can inspect the
    /// staging state either way.
    fn run_stages(
        txn: &mut PlanTransaction,
        registry: &dyn ModelRegistry,
        dynamics: &mut dyn DataflowDynamics,
        hooks: &HookChain,
        config: &ResolverConfig,
        requirements: &[RequirementTask],
        merges: &mut MergeGraph,
    ) -> Result<BTreeMap<String, Handle>> {
        // ── compute_system_network ──────────────────────────────────
        let (plan, mut next) = txn.working_plan_and_handle_fn();
        let instantiation = instantiate_requirements(requirements, plan, registry, &mut next, hooks)?;

        merge_identical_tasks(txn.working_plan(), merges)?;

        let (plan, mut next) = txn.working_plan_and_handle_fn();
        link_busses(plan, registry, &mut next)?;

        merge_identical_tasks(txn.working_plan(), merges)?;

        prune_unresolved_optional_children(txn.working_plan(), registry);
        concretize_structural_tasks(txn.working_plan(), registry);
        freeze_default_configuration(txn.working_plan());

        let mut required_instances = instantiation.required_instances;

        if config.garbage_collect {
            let mut removed = Vec::new();
            txn.working_plan().static_garbage_collect(&mut |h| removed.push(h));
            debug!(removed = removed.len(), "garbage collection complete");
        }

        for &handle in required_instances.values() {
            txn.working_plan().unmark_permanent_task(handle);
        }

        hooks.run_system_network(txn.working_plan())?;

        if config.validate_abstract_network {
            validate_abstract_network(txn.working_plan_ref(), registry)?;
        }

        if !config.compute_deployments {
            for handle in required_instances.values_mut() {
                *handle = merges.replacement_for(*handle);
            }
            return Ok(required_instances);
        }

        // ── compute_deployed_network ─────────────────────────────────
        let candidate_index = CandidateIndex::build(registry, &config.available_deployments);

        let (plan, mut next) = txn.working_plan_and_handle_fn();
        let selection = select_and_apply_deployments(plan, registry, &candidate_index, merges, &mut next)?;

        if config.validate_deployed_network {
            validate_deployed_network(&selection.missing)?;
        }
        if config.validate_generated_network {
            // Run after deployment rather than in step 2 as literally
            // ordered: a task context's `is_abstract` only flips once the
            // Deployment Selector binds it, so checking "no task remains
            // abstract" earlier would reject every not-yet-deployed task
            // context (see DESIGN.md).
            validate_generated_network(txn.working_plan_ref(), registry)?;
        }

        if config.compute_policies {
            let policies = dynamics.compute_connection_policies(txn.working_plan_ref())?;
            apply_connection_policies(txn.working_plan(), &policies);
            dynamics.apply_merges(merges);
        }

        hooks.run_deployment(txn.working_plan())?;

        // ── reconciliation against running deployments, then re-merge ──
        reconcile(txn, registry, &selection.instances, merges)?;
        merge_identical_tasks(txn.working_plan(), merges)?;

        // ── apply_merge_to_stored_instances ─────────────────────────
        for handle in required_instances.values_mut() {
            *handle = merges.replacement_for(*handle);
        }

        // `fix_toplevel_tasks` in the original design swaps a
        // planner-owned placeholder task for the resolved one and
        // switches the `Planning` relation. This crate's `Requirement`
        // trait has no separate placeholder: `instanciate` builds the
        // resolved subgraph directly, so the rewrite above already names
        // the right handle for every requirement (see DESIGN.md).

        hooks.run_final_network(txn.working_plan())?;

        if config.validate_final_network {
            validate_final_network(txn.working_plan_ref(), &required_instances)?;
        }

        Ok(required_instances)
    }
}

/// §4.8 step 2 "remove optional unresolved composition children": a child
/// held under only optional roles and carrying no dataflow connections is
/// dropped entirely; a child held under a mix of optional and required
/// roles just loses the optional ones.
fn prune_unresolved_optional_children(plan: &mut dyn PlanBackend, registry: &dyn ModelRegistry) {
    for parent in plan.all_handles() {
        let Some(parent_task) = plan.get(parent) else { continue };
        let Some(model) = registry.model_for(&parent_task.model) else { continue };
        if model.category != Category::Composition {
            continue;
        }
        let optional_roles: BTreeSet<String> =
            model.children.iter().filter(|c| c.optional).map(|c| c.role.clone()).collect();
        if optional_roles.is_empty() {
            continue;
        }

        let children: Vec<Handle> = plan.task_relation_graph_for(Relation::Hierarchy).successors(parent).collect();
        for child in children {
            let Some(child_task) = plan.get(child) else { continue };
            let Some(roles_here) = child_task.role_in(parent).cloned() else { continue };
            let has_dataflow = plan.dataflow_edges().keys().any(|(source, sink)| *source == child || *sink == child);
            if has_dataflow {
                continue;
            }
            let unresolved_optional: BTreeSet<String> = roles_here.intersection(&optional_roles).cloned().collect();
            if unresolved_optional.is_empty() {
                continue;
            }
            if unresolved_optional == roles_here {
                plan.remove_task(child);
            } else if let Some(task) = plan.get_mut(child) {
                if let Some(roles) = task.roles.get_mut(&parent) {
                    for role in &unresolved_optional {
                        roles.remove(role);
                    }
                }
            }
        }
    }
}

/// A task is only ever abstract because it awaits a deployment decision
/// (§8 scenario 5: once a composition's unresolved optional children are
/// pruned, the composition itself is no longer abstract -- it is never
/// deployed, only task contexts are). Flip every non-task-context task
/// concrete once structure is final; task contexts stay abstract until the
/// Deployment Selector binds them.
fn concretize_structural_tasks(plan: &mut dyn PlanBackend, registry: &dyn ModelRegistry) {
    for handle in plan.all_handles() {
        let Some(task) = plan.get(handle) else { continue };
        let is_task_context = registry
            .model_for(&task.model)
            .map(|m| m.category == Category::TaskContext)
            .unwrap_or(true);
        if is_task_context {
            continue;
        }
        if let Some(task) = plan.get_mut(handle) {
            task.is_abstract = false;
        }
    }
}

/// §4.8 step 2 "freeze default configuration": once a task carries its
/// final, concrete argument set it is marked set up, which is what
/// reconciliation's static-port-change check (§4.6) gates on.
fn freeze_default_configuration(plan: &mut dyn PlanBackend) {
    for handle in plan.all_handles() {
        if let Some(task) = plan.get_mut(handle) {
            if !task.is_abstract {
                task.setup = true;
            }
        }
    }
}

/// Apply dataflow-dynamics-computed policies (§6 `compute_connection_policies`)
/// onto the matching port pair of whichever edge currently carries it.
fn apply_connection_policies(plan: &mut dyn PlanBackend, policies: &BTreeMap<PortPair, ConnectionPolicy>) {
    if policies.is_empty() {
        return;
    }
    let edges: Vec<(Handle, Handle)> = plan.dataflow_edges().keys().copied().collect();
    for (source, sink) in edges {
        let edge = plan.dataflow_edge_mut(source, sink);
        for (pair, policy) in policies {
            if edge.connections.contains_key(pair) {
                edge.connections.insert(pair.clone(), policy.clone());
            }
        }
    }
}
