//! Replacement graph (§3 "Merge Graph", §4.1).
//!
//! Records rewrites `from -> to` and answers `replacement_for` queries
//! against the transitive closure, with path compression so repeated
//! queries are cheap. Keys exclusively on [`Handle`]s (§9 design note
//! "Graph identity across transactions"), never on task identity, so the
//! same mechanism that merges two equivalent tasks also merges a
//! transaction proxy onto its real-plan counterpart (`register_replacement`).

use rustc_hash::FxHashMap;

use crate::error::{NetgenError, Result};
use crate::plan::{Handle, PlanBackend};

#[derive(Debug, Default)]
pub struct MergeGraph {
    edges: FxHashMap<Handle, Handle>,
}

impl MergeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `apply_merge_group`: record that every key of `group` is replaced by
    /// its value, redirect incident relations/dataflow on the plan, and
    /// return an error if the rewrite is structurally impossible (cycle or
    /// conflicting connection policy, §4.1).
    pub fn apply_merge_group(
        &mut self,
        group: &[(Handle, Handle)],
        plan: &mut dyn PlanBackend,
    ) -> Result<()> {
        for &(from, to) in group {
            if self.would_introduce_cycle(from, to) {
                return Err(NetgenError::MergeCycle {
                    from: format!("{from}"),
                    to: format!("{to}"),
                });
            }
            plan.replace(from, to)?;
            self.edges.insert(from, to);
        }
        Ok(())
    }

    /// `register_replacement`: equivalent to a single-pair merge group, used
    /// when committing the staging transaction (§4.1, §4.8 step 5). Unlike
    /// `apply_merge_group` this does not touch the plan — the transaction
    /// adapter performs the actual copy at commit time.
    pub fn register_replacement(&mut self, proxy: Handle, real: Handle) {
        self.edges.insert(proxy, real);
    }

    /// `replacement_for`: follow the transitive closure to the current
    /// representative of `t`, with path compression.
    pub fn replacement_for(&self, t: Handle) -> Handle {
        let mut current = t;
        let mut seen = vec![current];
        while let Some(&next) = self.edges.get(&current) {
            if next == current || seen.contains(&next) {
                break;
            }
            current = next;
            seen.push(current);
        }
        current
    }

    fn would_introduce_cycle(&self, from: Handle, to: Handle) -> bool {
        self.replacement_for(to) == from
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Every distinct representative currently pointed to by at least one
    /// rewrite — used by property tests to check confluence (§8 P5).
    pub fn representatives(&self) -> std::collections::BTreeSet<Handle> {
        self.edges.keys().map(|&h| self.replacement_for(h)).collect()
    }
}
