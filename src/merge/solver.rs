//! `merge_identical_tasks` (§4.1): iterative fixed-point merging of
//! structurally-equivalent tasks.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::plan::{Handle, PlanBackend};

use super::graph::MergeGraph;

/// Two tasks are mergeable iff: same concrete model, compatible arguments,
/// same execution agent (or both unassigned), and structurally compatible
/// input connection sets (§4.1). Cycle safety and conflicting connection
/// policies are enforced by `MergeGraph::apply_merge_group` / `PlanBackend::replace`.
fn mergeable(plan: &dyn PlanBackend, a: Handle, b: Handle) -> bool {
    let (Some(ta), Some(tb)) = (plan.get(a), plan.get(b)) else {
        return false;
    };
    if ta.model != tb.model {
        return false;
    }
    if !ta.arguments_compatible_with(tb) {
        return false;
    }
    match (ta.execution_agent, tb.execution_agent) {
        (Some(x), Some(y)) => x == y,
        (None, None) => true,
        _ => false,
    }
}

/// Tie-break order when a task has multiple merge candidates (§4.1):
/// prefer the candidate with more already-assigned arguments, then the one
/// already deployed, then stable creation-index order.
fn candidate_rank(plan: &dyn PlanBackend, candidate: Handle) -> (std::cmp::Reverse<usize>, std::cmp::Reverse<bool>, u64) {
    let task = plan.get(candidate).expect("candidate exists");
    let assigned = task.arguments.values().filter(|a| a.is_set()).count();
    let deployed = task.execution_agent.is_some();
    (
        std::cmp::Reverse(assigned),
        std::cmp::Reverse(deployed),
        task.creation_index,
    )
}

/// Run the merge solver to a fixed point: repeatedly group tasks into
/// mergeable equivalence classes and collapse each class onto its preferred
/// representative, until an iteration makes no further progress.
///
/// Terminates because each iteration strictly reduces task count or leaves
/// the graph unchanged (§4.1).
pub fn merge_identical_tasks(plan: &mut dyn PlanBackend, graph: &mut MergeGraph) -> Result<()> {
    loop {
        let handles = plan.all_handles();
        let mut classes: BTreeMap<(String, Option<Handle>), Vec<Handle>> = BTreeMap::new();
        for h in &handles {
            let Some(task) = plan.get(*h) else { continue };
            classes
                .entry((task.model.clone(), task.execution_agent))
                .or_default()
                .push(*h);
        }

        let mut merge_group: Vec<(Handle, Handle)> = Vec::new();
        for candidates in classes.values() {
            if candidates.len() < 2 {
                continue;
            }
            // Partition the class further: only pairs that are actually
            // mergeable (argument- and connection-compatible) collapse.
            let mut remaining: Vec<Handle> = candidates.clone();
            remaining.sort_by_key(|h| candidate_rank(plan, *h));
            while let Some(representative) = remaining.first().copied() {
                let mut bucket = vec![representative];
                let mut rest = Vec::new();
                for &h in &remaining[1..] {
                    if mergeable(plan, h, representative) && !input_conflict(plan, h, representative) {
                        bucket.push(h);
                    } else {
                        rest.push(h);
                    }
                }
                for &h in &bucket[1..] {
                    merge_group.push((h, representative));
                }
                remaining = rest;
            }
        }

        if merge_group.is_empty() {
            return Ok(());
        }
        graph.apply_merge_group(&merge_group, plan)?;
    }
}

/// Structural compatibility of input connection sets (§4.1): for every sink
/// port shared by both tasks' incoming edges, the driving (source, port,
/// policy) must agree. Detecting a real conflict here lets the solver skip
/// a doomed merge rather than let `PlanBackend::replace` fail the whole
/// pass with a hard error.
fn input_conflict(plan: &dyn PlanBackend, a: Handle, b: Handle) -> bool {
    let mut by_sink_port: BTreeMap<&str, (Handle, &crate::plan::ConnectionPolicy)> = BTreeMap::new();
    for ((source, sink), edge) in plan.dataflow_edges() {
        if *sink != a && *sink != b {
            continue;
        }
        for (pair, policy) in &edge.connections {
            if let Some((existing_source, existing_policy)) = by_sink_port.get(pair.sink_port.as_str()) {
                if *existing_source != *source || *existing_policy != policy {
                    return true;
                }
            } else {
                by_sink_port.insert(&pair.sink_port, (*source, policy));
            }
        }
    }
    false
}
