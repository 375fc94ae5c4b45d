//! Plan backend trait boundary (§6 "Consumed from external collaborators: *Plan*").
//!
//! The real plan-database engine — transactions, task-relation graphs,
//! garbage collection, mission/permanent markers — is external to this
//! crate (§1). `PlanBackend` is the minimal surface the resolver actually
//! calls; `InMemoryPlan` is the reference implementation this crate's own
//! tests and demonstration CLI run against.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::error::{NetgenError, Result};

use super::dataflow::DataflowEdge;
use super::ordering::OrderingConstraint;
use super::task::{Handle, LifecycleState, Task};

/// The relation graphs the resolver queries (§6 `task_relation_graph_for`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    /// Parent/child composition membership.
    Hierarchy,
    /// Port-to-port dataflow.
    Dataflow,
    /// `depends_on` ordering edges (e.g. task depends on its bus, §4.3).
    Dependency,
    /// Requirement task -> placeholder/resolved task (§3, §4.8 step 6).
    Planning,
}

/// A thin view over one relation's edge set.
#[derive(Debug, Default, Clone)]
pub struct RelationGraph {
    pub edges: BTreeSet<(Handle, Handle)>,
}

impl RelationGraph {
    pub fn successors(&self, of: Handle) -> impl Iterator<Item = Handle> + '_ {
        self.edges
            .iter()
            .filter(move |(from, _)| *from == of)
            .map(|(_, to)| *to)
    }

    pub fn predecessors(&self, of: Handle) -> impl Iterator<Item = Handle> + '_ {
        self.edges
            .iter()
            .filter(move |(_, to)| *to == of)
            .map(|(from, _)| *from)
    }
}

/// Relation filters (§6): restrict a set of handles to those satisfying a
/// predicate over the underlying task.
pub fn not_finished(plan: &dyn PlanBackend, handle: Handle) -> bool {
    plan.get(handle)
        .map(|t| !t.lifecycle.is_finished())
        .unwrap_or(false)
}

pub fn not_finishing(plan: &dyn PlanBackend, handle: Handle) -> bool {
    plan.get(handle)
        .map(|t| !t.lifecycle.is_finishing())
        .unwrap_or(false)
}

pub fn not_abstract(plan: &dyn PlanBackend, handle: Handle) -> bool {
    plan.get(handle).map(|t| !t.is_abstract).unwrap_or(false)
}

/// The plan operations the resolver consumes (§6).
pub trait PlanBackend {
    fn get(&self, handle: Handle) -> Option<&Task>;
    fn get_mut(&mut self, handle: Handle) -> Option<&mut Task>;

    fn add(&mut self, task: Task) -> Handle;
    fn add_permanent_task(&mut self, mut task: Task) -> Handle {
        task.permanent = true;
        self.add(task)
    }
    fn unmark_permanent_task(&mut self, handle: Handle);
    fn remove_task(&mut self, handle: Handle);

    /// Redirect every relation edge and dataflow connection incident on
    /// `from` onto `to`, then drop `from`. This is the plan-level primitive
    /// the merge solver's `apply_merge_group` compiles down to (§4.1).
    fn replace(&mut self, from: Handle, to: Handle) -> Result<()>;

    fn find_local_tasks(&self, model: &str) -> Vec<Handle>;
    fn find_tasks(&self, model: &str) -> Vec<Handle> {
        self.find_local_tasks(model)
    }

    fn task_relation_graph_for(&self, relation: Relation) -> &RelationGraph;
    fn task_relation_graph_for_mut(&mut self, relation: Relation) -> &mut RelationGraph;

    fn dataflow_edge_mut(&mut self, source: Handle, sink: Handle) -> &mut DataflowEdge;
    fn dataflow_edges(&self) -> &BTreeMap<(Handle, Handle), DataflowEdge>;
    fn remove_dataflow_edge(&mut self, source: Handle, sink: Handle);

    fn add_relation(&mut self, relation: Relation, from: Handle, to: Handle) {
        self.task_relation_graph_for_mut(relation)
            .edges
            .insert((from, to));
    }

    /// Record a lifecycle-event ordering constraint (§4.3, §4.6).
    fn add_ordering_constraint(&mut self, constraint: OrderingConstraint);

    fn ordering_constraints(&self) -> &[OrderingConstraint];

    /// Mark unreachable tasks for removal: any task not reachable from a
    /// permanent root via any relation is removed. `on_remove` is invoked
    /// once per removed handle so callers can react (§4.8 step 2).
    fn static_garbage_collect(&mut self, on_remove: &mut dyn FnMut(Handle));

    fn all_handles(&self) -> Vec<Handle>;

    fn finalized(&self) -> bool;
}

/// In-memory reference implementation of [`PlanBackend`].
#[derive(Debug, Default)]
pub struct InMemoryPlan {
    tasks: FxHashMap<Handle, Task>,
    relations: FxHashMap<Relation, RelationGraph>,
    dataflow: BTreeMap<(Handle, Handle), DataflowEdge>,
    ordering: Vec<OrderingConstraint>,
    order: Vec<Handle>,
    finalized: bool,
    next_handle: u64,
}

impl InMemoryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_handle(&mut self) -> Handle {
        let h = Handle(self.next_handle);
        self.next_handle += 1;
        h
    }

    pub fn permanent_handles(&self) -> Vec<Handle> {
        self.order
            .iter()
            .copied()
            .filter(|h| self.tasks.get(h).map(|t| t.permanent).unwrap_or(false))
            .collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(move |h| self.tasks.get(h))
    }
}

impl PlanBackend for InMemoryPlan {
    fn get(&self, handle: Handle) -> Option<&Task> {
        self.tasks.get(&handle)
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut Task> {
        self.tasks.get_mut(&handle)
    }

    fn add(&mut self, task: Task) -> Handle {
        let handle = task.handle;
        self.order.push(handle);
        self.tasks.insert(handle, task);
        handle
    }

    fn unmark_permanent_task(&mut self, handle: Handle) {
        if let Some(t) = self.tasks.get_mut(&handle) {
            t.permanent = false;
        }
    }

    fn remove_task(&mut self, handle: Handle) {
        self.tasks.remove(&handle);
        self.order.retain(|h| *h != handle);
        for graph in self.relations.values_mut() {
            graph.edges.retain(|(a, b)| *a != handle && *b != handle);
        }
        self.dataflow.retain(|(a, b), _| *a != handle && *b != handle);
        self.ordering
            .retain(|c| c.before.0 != handle && c.after.0 != handle);
    }

    fn replace(&mut self, from: Handle, to: Handle) -> Result<()> {
        if from == to {
            return Ok(());
        }
        for graph in self.relations.values_mut() {
            let rewritten: BTreeSet<(Handle, Handle)> = graph
                .edges
                .iter()
                .map(|(a, b)| {
                    let a = if *a == from { to } else { *a };
                    let b = if *b == from { to } else { *b };
                    (a, b)
                })
                .filter(|(a, b)| a != b)
                .collect();
            graph.edges = rewritten;
        }

        let incident: Vec<((Handle, Handle), DataflowEdge)> = self
            .dataflow
            .iter()
            .filter(|((a, b), _)| *a == from || *b == from)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for ((a, b), edge) in incident {
            self.dataflow.remove(&(a, b));
            let new_a = if a == from { to } else { a };
            let new_b = if b == from { to } else { b };
            if new_a == new_b {
                continue;
            }
            let existing = self
                .dataflow
                .entry((new_a, new_b))
                .or_insert_with(|| DataflowEdge::new(new_a, new_b));
            for (pair, policy) in edge.connections {
                if let Some(current) = existing.connections.get(&pair) {
                    if *current != policy {
                        return Err(NetgenError::MergeConflict {
                            source_port: pair.source_port.clone(),
                            sink_port: pair.sink_port.clone(),
                        });
                    }
                } else {
                    existing.connections.insert(pair, policy);
                }
            }
        }

        for constraint in &mut self.ordering {
            if constraint.before.0 == from {
                constraint.before.0 = to;
            }
            if constraint.after.0 == from {
                constraint.after.0 = to;
            }
        }
        self.ordering.retain(|c| c.before.0 != c.after.0);

        self.remove_task(from);
        Ok(())
    }

    fn find_local_tasks(&self, model: &str) -> Vec<Handle> {
        self.order
            .iter()
            .copied()
            .filter(|h| self.tasks.get(h).map(|t| t.model == model).unwrap_or(false))
            .collect()
    }

    fn task_relation_graph_for(&self, relation: Relation) -> &RelationGraph {
        static EMPTY: std::sync::OnceLock<RelationGraph> = std::sync::OnceLock::new();
        self.relations
            .get(&relation)
            .unwrap_or_else(|| EMPTY.get_or_init(RelationGraph::default))
    }

    fn task_relation_graph_for_mut(&mut self, relation: Relation) -> &mut RelationGraph {
        self.relations.entry(relation).or_default()
    }

    fn dataflow_edge_mut(&mut self, source: Handle, sink: Handle) -> &mut DataflowEdge {
        self.dataflow
            .entry((source, sink))
            .or_insert_with(|| DataflowEdge::new(source, sink))
    }

    fn dataflow_edges(&self) -> &BTreeMap<(Handle, Handle), DataflowEdge> {
        &self.dataflow
    }

    fn remove_dataflow_edge(&mut self, source: Handle, sink: Handle) {
        self.dataflow.remove(&(source, sink));
    }

    fn add_ordering_constraint(&mut self, constraint: OrderingConstraint) {
        if !self.ordering.contains(&constraint) {
            self.ordering.push(constraint);
        }
    }

    fn ordering_constraints(&self) -> &[OrderingConstraint] {
        &self.ordering
    }

    fn static_garbage_collect(&mut self, on_remove: &mut dyn FnMut(Handle)) {
        let roots: Vec<Handle> = self.permanent_handles();
        let mut reachable: BTreeSet<Handle> = BTreeSet::new();
        let mut stack = roots;
        while let Some(h) = stack.pop() {
            if !reachable.insert(h) {
                continue;
            }
            for relation in [Relation::Hierarchy, Relation::Dependency, Relation::Planning] {
                for succ in self.task_relation_graph_for(relation).successors(h) {
                    stack.push(succ);
                }
            }
            for (a, b) in self.dataflow.keys() {
                if *a == h {
                    stack.push(*b);
                } else if *b == h {
                    stack.push(*a);
                }
            }
        }

        let to_remove: Vec<Handle> = self
            .order
            .iter()
            .copied()
            .filter(|h| !reachable.contains(h))
            .collect();
        for h in to_remove {
            self.remove_task(h);
            on_remove(h);
        }
    }

    fn all_handles(&self) -> Vec<Handle> {
        self.order.clone()
    }

    fn finalized(&self) -> bool {
        self.finalized
    }
}

impl InMemoryPlan {
    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::task::Task;

    fn task(plan: &mut InMemoryPlan, model: &str) -> Handle {
        let h = plan.allocate_handle();
        plan.add(Task::new(h, model, h.0))
    }

    #[test]
    fn replace_redirects_hierarchy_and_drops_source() {
        let mut plan = InMemoryPlan::new();
        let a = task(&mut plan, "A");
        let b = task(&mut plan, "B");
        let parent = task(&mut plan, "P");
        plan.add_relation(Relation::Hierarchy, parent, a);

        plan.replace(a, b).unwrap();

        assert!(plan.get(a).is_none());
        assert!(plan
            .task_relation_graph_for(Relation::Hierarchy)
            .edges
            .contains(&(parent, b)));
    }

    #[test]
    fn replace_merges_dataflow_connections() {
        let mut plan = InMemoryPlan::new();
        let a = task(&mut plan, "A");
        let b = task(&mut plan, "B");
        let sink = task(&mut plan, "S");
        plan.dataflow_edge_mut(a, sink).connect(
            "out",
            "in",
            crate::plan::dataflow::ConnectionPolicy::new("p1"),
        );

        plan.replace(a, b).unwrap();
        assert_eq!(plan.dataflow_edges().len(), 1);
        assert!(plan.dataflow_edges().contains_key(&(b, sink)));
    }

    #[test]
    fn replace_detects_merge_conflict() {
        let mut plan = InMemoryPlan::new();
        let a = task(&mut plan, "A");
        let b = task(&mut plan, "B");
        let sink = task(&mut plan, "S");
        plan.dataflow_edge_mut(a, sink).connect(
            "out",
            "in",
            crate::plan::dataflow::ConnectionPolicy::new("p1"),
        );
        plan.dataflow_edge_mut(b, sink).connect(
            "out",
            "in",
            crate::plan::dataflow::ConnectionPolicy::new("p2"),
        );

        let err = plan.replace(a, b).unwrap_err();
        assert!(matches!(err, NetgenError::MergeConflict { .. }));
    }

    #[test]
    fn replace_rewrites_ordering_constraints() {
        use super::super::ordering::{LifecycleEvent, OrderingConstraint};

        let mut plan = InMemoryPlan::new();
        let a = task(&mut plan, "A");
        let b = task(&mut plan, "B");
        let bus = task(&mut plan, "Bus");
        plan.add_ordering_constraint(OrderingConstraint::new(
            a,
            LifecycleEvent::Configure,
            bus,
            LifecycleEvent::Start,
        ));

        plan.replace(a, b).unwrap();

        assert_eq!(plan.ordering_constraints().len(), 1);
        assert_eq!(plan.ordering_constraints()[0].before.0, b);
    }

    #[test]
    fn static_garbage_collect_keeps_only_reachable() {
        let mut plan = InMemoryPlan::new();
        let root = task(&mut plan, "Root");
        plan.get_mut(root).unwrap().permanent = true;
        let kept = task(&mut plan, "Kept");
        plan.add_relation(Relation::Hierarchy, root, kept);
        let orphan = task(&mut plan, "Orphan");

        let mut removed = vec![];
        plan.static_garbage_collect(&mut |h| removed.push(h));

        assert_eq!(removed, vec![orphan]);
        assert!(plan.get(kept).is_some());
    }
}
