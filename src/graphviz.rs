//! Graphviz dumps (§6 "Consumed from external collaborators: *Graphviz*").
//!
//! Pure functions producing DOT text from a [`PlanBackend`] snapshot. Used
//! by the pipeline driver's `save` failure recovery (§4.8, §6 "Produced at
//! the boundary") to dump `syskit-plan-<index>.{dataflow,hierarchy}.dot`.

use std::fmt::Write as _;

use crate::plan::{PlanBackend, Relation};

/// Dump every dataflow edge as a DOT digraph.
pub fn dump_dataflow(plan: &dyn PlanBackend) -> String {
    let mut out = String::new();
    writeln!(out, "digraph dataflow {{").unwrap();
    for handle in plan.all_handles() {
        if let Some(task) = plan.get(handle) {
            writeln!(out, "  \"{handle}\" [label=\"{} {handle}\"];", task.model).unwrap();
        }
    }
    for ((source, sink), edge) in plan.dataflow_edges() {
        for pair in edge.connections.keys() {
            writeln!(
                out,
                "  \"{source}\" -> \"{sink}\" [label=\"{}->{}\"];",
                pair.source_port, pair.sink_port
            )
            .unwrap();
        }
    }
    writeln!(out, "}}").unwrap();
    out
}

/// Dump the hierarchy (parent/child composition membership) relation as a
/// DOT digraph.
pub fn dump_hierarchy(plan: &dyn PlanBackend) -> String {
    let mut out = String::new();
    writeln!(out, "digraph hierarchy {{").unwrap();
    for handle in plan.all_handles() {
        if let Some(task) = plan.get(handle) {
            writeln!(out, "  \"{handle}\" [label=\"{} {handle}\"];", task.model).unwrap();
        }
    }
    for (parent, child) in &plan.task_relation_graph_for(Relation::Hierarchy).edges {
        writeln!(out, "  \"{parent}\" -> \"{child}\";").unwrap();
    }
    writeln!(out, "}}").unwrap();
    out
}
