//! Dataflow dynamics trait boundary (§6 "Consumed from external
//! collaborators: *Dataflow dynamics*").
//!
//! Connection-policy computation is, in the real system, a pure function
//! over the deployed network owned by a separate collaborator. This module
//! defines the trait the pipeline driver calls and a no-op reference
//! implementation for callers that don't care about computed policy values
//! (e.g. tests running with `compute_policies = false`).

use crate::error::Result;
use crate::plan::{ConnectionPolicy, PlanBackend, PortPair};

/// The queries the resolver issues against the dataflow-dynamics
/// collaborator (§6).
pub trait DataflowDynamics {
    /// Compute the connection policy for every dataflow edge in the
    /// deployed network, keyed by `(source port, sink port)`.
    fn compute_connection_policies(
        &self,
        plan: &dyn PlanBackend,
    ) -> Result<std::collections::BTreeMap<PortPair, ConnectionPolicy>>;

    /// Apply the merge solver's replacement graph to any policy-computation
    /// caches this collaborator keeps internally.
    fn apply_merges(&mut self, merges: &crate::merge::MergeGraph);
}

/// No-op implementation: computes no policies and carries no internal
/// state to rewrite on merge.
#[derive(Debug, Default)]
pub struct NullDynamics;

impl DataflowDynamics for NullDynamics {
    fn compute_connection_policies(
        &self,
        _plan: &dyn PlanBackend,
    ) -> Result<std::collections::BTreeMap<PortPair, ConnectionPolicy>> {
        Ok(std::collections::BTreeMap::new())
    }

    fn apply_merges(&mut self, _merges: &crate::merge::MergeGraph) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeGraph;
    use crate::plan::InMemoryPlan;

    #[test]
    fn null_dynamics_computes_no_policies() {
        let plan = InMemoryPlan::new();
        let dynamics = NullDynamics;
        let policies = dynamics.compute_connection_policies(&plan).unwrap();
        assert!(policies.is_empty());
    }

    #[test]
    fn null_dynamics_apply_merges_is_a_no_op() {
        let mut dynamics = NullDynamics;
        dynamics.apply_merges(&MergeGraph::new());
    }
}
