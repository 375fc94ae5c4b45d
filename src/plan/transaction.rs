//! Plan Transaction Adapter (§4.8 component table, ~8%).
//!
//! Wraps the real plan in a staging transaction: resolution happens against
//! a disposable working plan seeded with proxies for every real task the
//! resolver needs to see (permanent roots, running deployments). On commit,
//! proxy->real replacements recorded by the merge solver (§4.1
//! `register_replacement`) are the only way a staging task becomes part of
//! the real plan.

use std::collections::BTreeMap;

use crate::error::{NetgenError, Result};
use crate::merge::MergeGraph;
use crate::plan::backend::{InMemoryPlan, PlanBackend};
use crate::plan::task::{Handle, Task};

pub struct PlanTransaction<'a> {
    real: &'a mut InMemoryPlan,
    staging: InMemoryPlan,
    /// staging proxy handle -> real handle it wraps.
    proxy_to_real: BTreeMap<Handle, Handle>,
    next_handle: u64,
}

impl<'a> PlanTransaction<'a> {
    /// Open a staging transaction over `real`. Every permanent task in the
    /// real plan is wrapped as a proxy in the staging plan so the resolver
    /// can discover requirement tasks and running deployments (§6).
    pub fn open(real: &'a mut InMemoryPlan) -> Self {
        let next_handle = real.all_handles().iter().map(|h| h.0).max().unwrap_or(0) + 1;
        let mut txn = Self {
            real,
            staging: InMemoryPlan::new(),
            proxy_to_real: BTreeMap::new(),
            next_handle,
        };
        let roots = txn.real.permanent_handles();
        for root in roots {
            txn.wrap_task(root);
        }
        txn
    }

    pub fn working_plan(&mut self) -> &mut InMemoryPlan {
        &mut self.staging
    }

    pub fn working_plan_ref(&self) -> &InMemoryPlan {
        &self.staging
    }

    /// Read-only view of the real plan, for reconciliation (§4.6), which
    /// must inspect running deployments without wrapping every one of them
    /// as a staging proxy up front.
    pub fn real_plan(&self) -> &InMemoryPlan {
        self.real
    }

    pub(crate) fn fresh_handle(&mut self) -> Handle {
        let h = Handle(self.next_handle);
        self.next_handle += 1;
        h
    }

    /// Split borrow of the staging plan and a handle-allocating closure
    /// drawn from the same counter `fresh_handle` uses, for pipeline stages
    /// (§4.2, §4.3, §4.5) that need both at once. The two returned values
    /// borrow disjoint fields of `self`, so they can be passed to a single
    /// call (e.g. `instantiate_requirements(..., plan, ..., &mut next, ...)`)
    /// without aliasing.
    pub fn working_plan_and_handle_fn(&mut self) -> (&mut InMemoryPlan, impl FnMut() -> Handle + '_) {
        let staging = &mut self.staging;
        let counter = &mut self.next_handle;
        let next = move || {
            let h = Handle(*counter);
            *counter += 1;
            h
        };
        (staging, next)
    }

    /// `wrap_task`: obtain (creating if necessary) the staging proxy for a
    /// real-plan task (§6).
    pub fn wrap_task(&mut self, real_handle: Handle) -> Handle {
        if let Some((&proxy, _)) = self
            .proxy_to_real
            .iter()
            .find(|(_, &real)| real == real_handle)
        {
            return proxy;
        }
        let Some(real_task) = self.real.get(real_handle) else {
            return real_handle;
        };
        let proxy_handle = self.fresh_handle();
        let mut proxy = Task {
            handle: proxy_handle,
            ..real_task.clone()
        };
        proxy.transaction_proxy = true;
        proxy.is_abstract = real_task.is_abstract;
        self.staging.add(proxy);
        self.proxy_to_real.insert(proxy_handle, real_handle);
        proxy_handle
    }

    pub fn is_proxy(&self, handle: Handle) -> bool {
        self.proxy_to_real.contains_key(&handle)
    }

    pub fn real_for_proxy(&self, handle: Handle) -> Option<Handle> {
        self.proxy_to_real.get(&handle).copied()
    }

    /// Commit: every remaining proxy must have been merged onto a concrete
    /// resolved task via the merge graph (directly or indirectly); any
    /// proxy whose replacement is still itself is a bug (§7 `InternalError`,
    /// §8 P2). Resolved, non-proxy tasks are copied into the real plan and
    /// wired to replace the proxy's original real counterpart.
    ///
    /// Returns the staging-handle -> real-handle translation so a caller
    /// holding staging handles (e.g. `required_instances`, keyed by
    /// `merges.replacement_for(...)`) can look up where each one landed.
    pub fn commit(mut self, merges: &MergeGraph) -> Result<BTreeMap<Handle, Handle>> {
        // Build the complete staging-representative -> real-handle mapping
        // up front, before copying any task data, so that Handle-typed
        // fields (`execution_agent`, `roles`) and relation/dataflow edges
        // can be translated in one pass regardless of which side (wrapped
        // proxy or freshly created task) produced the real handle.
        let mut staging_to_real: BTreeMap<Handle, Handle> = self
            .proxy_to_real
            .iter()
            .map(|(&p, &r)| (merges.replacement_for(p), r))
            .collect();
        for handle in self.staging.all_handles() {
            let resolved = merges.replacement_for(handle);
            if staging_to_real.contains_key(&resolved) {
                continue;
            }
            if self.proxy_to_real.contains_key(&handle) {
                continue;
            }
            let Some(task) = self.staging.get(resolved) else {
                continue;
            };
            if task.transaction_proxy {
                return Err(NetgenError::internal(
                    "transaction proxy survived commit with no real counterpart",
                ));
            }
            let real_handle = self.fresh_handle_for_real();
            staging_to_real.insert(resolved, real_handle);
        }

        for (&proxy, &real_handle) in self.proxy_to_real.clone().iter() {
            let resolved = merges.replacement_for(proxy);
            if resolved == proxy {
                // Untouched proxy: the original real task survives as is.
                continue;
            }
            if self.is_proxy(resolved) {
                return Err(NetgenError::internal(format!(
                    "proxy {:?} resolved to another proxy {:?} at commit",
                    proxy, resolved
                )));
            }
            let Some(resolved_task) = self.staging.get(resolved).cloned() else {
                return Err(NetgenError::internal(format!(
                    "merge target {:?} missing from staging plan",
                    resolved
                )));
            };
            let mut committed = resolved_task;
            committed.handle = real_handle;
            committed.transaction_proxy = false;
            translate_task_handles(&mut committed, merges, &staging_to_real);
            self.real.remove_task(real_handle);
            self.real.add(committed);
        }

        // Any freshly created, non-proxy staging task not already reachable
        // from a wrapped real task must also land in the real plan under a
        // fresh handle (e.g. newly instantiated tasks kept permanent).
        for (&resolved, &real_handle) in staging_to_real.clone().iter() {
            if self.proxy_to_real.values().any(|&r| r == real_handle) {
                // Real handle already owned by a proxy, handled above
                // (whether merged away or left untouched).
                continue;
            }
            let Some(task) = self.staging.get(resolved).cloned() else {
                continue;
            };
            let mut committed = task;
            committed.handle = real_handle;
            translate_task_handles(&mut committed, merges, &staging_to_real);
            self.real.add(committed);
        }

        // Translate ordering constraints recorded against staging handles
        // (bus linking, reconciliation) onto their committed real handles.
        for constraint in self.staging.ordering_constraints() {
            let before = merges.replacement_for(constraint.before.0);
            let after = merges.replacement_for(constraint.after.0);
            let (Some(&real_before), Some(&real_after)) =
                (staging_to_real.get(&before), staging_to_real.get(&after))
            else {
                continue;
            };
            self.real.add_ordering_constraint(crate::plan::OrderingConstraint {
                before: (real_before, constraint.before.1),
                after: (real_after, constraint.after.1),
            });
        }

        // Migrate every relation edge and dataflow connection recorded in
        // staging onto the committed real handles. Staging edges already
        // reference post-merge representative handles (the merge solver
        // rewrites edges onto representatives via `PlanBackend::replace` as
        // it runs), so a direct lookup in `staging_to_real` suffices.
        for relation in [
            crate::plan::Relation::Hierarchy,
            crate::plan::Relation::Dependency,
            crate::plan::Relation::Planning,
        ] {
            let edges: Vec<(Handle, Handle)> = self
                .staging
                .task_relation_graph_for(relation)
                .edges
                .iter()
                .copied()
                .collect();
            for (from, to) in edges {
                let (Some(&real_from), Some(&real_to)) =
                    (staging_to_real.get(&from), staging_to_real.get(&to))
                else {
                    continue;
                };
                self.real.add_relation(relation, real_from, real_to);
            }
        }

        let dataflow: Vec<((Handle, Handle), crate::plan::dataflow::DataflowEdge)> = self
            .staging
            .dataflow_edges()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for ((source, sink), edge) in dataflow {
            let (Some(&real_source), Some(&real_sink)) =
                (staging_to_real.get(&source), staging_to_real.get(&sink))
            else {
                continue;
            };
            let real_edge = self.real.dataflow_edge_mut(real_source, real_sink);
            for (pair, policy) in edge.connections {
                real_edge.connect(pair.source_port, pair.sink_port, policy);
            }
        }

        self.real.mark_finalized();
        Ok(staging_to_real)
    }

    fn fresh_handle_for_real(&mut self) -> Handle {
        let max = self.real.all_handles().iter().map(|h| h.0).max().unwrap_or(0);
        Handle(max + 1)
    }

    pub fn discard(self) {
        // Dropping the transaction without calling `commit` leaves the real
        // plan untouched (§4.8 failure policy `drop`/`save`).
    }
}

/// Translate a staging handle onto its committed real handle: resolve it to
/// its post-merge representative first, then look that up in the
/// staging-to-real map. A handle outside this transaction's scope (not a
/// merge target and not a wrapped proxy) is left as is.
fn translate_handle(h: Handle, merges: &MergeGraph, staging_to_real: &BTreeMap<Handle, Handle>) -> Handle {
    let resolved = merges.replacement_for(h);
    staging_to_real.get(&resolved).copied().unwrap_or(h)
}

/// Rewrite every `Handle`-typed field inside a task copied from staging
/// (`execution_agent`, the parent keys of `roles`) onto real handles, so
/// reconciliation's `execution_agent == real_instance` lookups (§4.6) keep
/// working across commits.
fn translate_task_handles(task: &mut Task, merges: &MergeGraph, staging_to_real: &BTreeMap<Handle, Handle>) {
    if let Some(agent) = task.execution_agent {
        task.execution_agent = Some(translate_handle(agent, merges, staging_to_real));
    }
    task.roles = task
        .roles
        .iter()
        .map(|(parent, roles)| (translate_handle(*parent, merges, staging_to_real), roles.clone()))
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::task::Task;

    #[test]
    fn open_wraps_permanent_tasks_as_proxies() {
        let mut real = InMemoryPlan::new();
        let h = real.allocate_handle();
        real.add_permanent_task(Task::new(h, "Req", 0));

        let txn = PlanTransaction::open(&mut real);
        assert_eq!(txn.working_plan_ref().tasks().count(), 1);
    }

    #[test]
    fn working_plan_and_handle_fn_allocates_distinct_handles_usable_immediately() {
        let mut real = InMemoryPlan::new();
        let mut txn = PlanTransaction::open(&mut real);

        let (plan, mut next) = txn.working_plan_and_handle_fn();
        let a = next();
        plan.add(Task::new(a, "A", 0));
        let b = next();
        plan.add(Task::new(b, "B", 1));

        assert_ne!(a, b);
        assert_eq!(txn.working_plan_ref().tasks().count(), 2);
    }

    #[test]
    fn commit_translates_execution_agent_and_migrates_relations() {
        use crate::plan::backend::Relation;

        let mut real = InMemoryPlan::new();
        let instance_handle = real.allocate_handle();
        real.add_permanent_task(Task::new(instance_handle, "Instance", 0));

        let mut txn = PlanTransaction::open(&mut real);
        let instance_proxy = txn.wrap_task(instance_handle);

        let fresh = txn.fresh_handle();
        let mut hosted = Task::new(fresh, "Hosted", 1);
        hosted.execution_agent = Some(instance_proxy);
        hosted.permanent = true;
        txn.working_plan().add(hosted);
        txn.working_plan()
            .add_relation(Relation::Dependency, fresh, instance_proxy);

        let graph = MergeGraph::new();
        let translation = txn.commit(&graph).unwrap();

        let real_hosted = translation[&fresh];
        let committed = real.get(real_hosted).unwrap();
        assert_eq!(committed.execution_agent, Some(instance_handle));
        assert!(real
            .task_relation_graph_for(Relation::Dependency)
            .edges
            .contains(&(real_hosted, instance_handle)));
    }

    #[test]
    fn discard_leaves_real_plan_untouched() {
        let mut real = InMemoryPlan::new();
        let h = real.allocate_handle();
        real.add_permanent_task(Task::new(h, "Req", 0));
        let before = real.all_handles().len();

        let mut txn = PlanTransaction::open(&mut real);
        let fresh = txn.fresh_handle();
        txn.working_plan().add(Task::new(fresh, "New", 1));
        txn.discard();

        assert_eq!(real.all_handles().len(), before);
    }
}
