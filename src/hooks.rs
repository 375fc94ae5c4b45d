//! Registered post-processing hooks (§9 design note): five ordered stages —
//! instantiation, instantiated-network, system-network, deployment, and
//! final-network — each an ordered sequence of named, synchronous
//! callbacks invoked with the working plan. Hooks must not start
//! transactions of their own (§9).

use crate::error::Result;
use crate::plan::PlanBackend;

pub type Hook = Box<dyn Fn(&mut dyn PlanBackend) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct NamedHooks {
    entries: Vec<(String, Hook)>,
}

impl NamedHooks {
    fn push(&mut self, name: impl Into<String>, hook: Hook) {
        self.entries.push((name.into(), hook));
    }

    fn run(&self, plan: &mut dyn PlanBackend) -> Result<()> {
        for (_name, hook) in &self.entries {
            hook(plan)?;
        }
        Ok(())
    }

    /// "Chain-to-parent" composition (§9 Open Question): register a hook
    /// under a name already present, running the existing hook(s) of that
    /// name first, then the new one — modeling Ruby's
    /// `super if defined?(super)` pattern explicitly.
    fn chain(&mut self, name: impl Into<String>, hook: Hook) {
        let name = name.into();
        if let Some(existing_idx) = self.entries.iter().position(|(n, _)| *n == name) {
            let (_, previous) = self.entries.remove(existing_idx);
            let chained: Hook = Box::new(move |plan: &mut dyn PlanBackend| {
                previous(plan)?;
                hook(plan)
            });
            self.entries.push((name, chained));
        } else {
            self.push(name, hook);
        }
    }
}

/// The five ordered hook registries a [`crate::config::ResolverConfig`]
/// injects into the pipeline driver.
#[derive(Default)]
pub struct HookChain {
    instantiation: NamedHooks,
    instantiated_network: NamedHooks,
    system_network: NamedHooks,
    deployment: NamedHooks,
    final_network: NamedHooks,
}

impl HookChain {
    pub fn on_instantiation(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.instantiation.push(name, hook);
        self
    }

    pub fn on_instantiated_network(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.instantiated_network.push(name, hook);
        self
    }

    pub fn on_system_network(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.system_network.push(name, hook);
        self
    }

    pub fn on_deployment(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.deployment.push(name, hook);
        self
    }

    pub fn on_final_network(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.final_network.push(name, hook);
        self
    }

    pub fn chain_instantiation(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.instantiation.chain(name, hook);
        self
    }

    pub(crate) fn run_instantiation(&self, plan: &mut dyn PlanBackend) -> Result<()> {
        self.instantiation.run(plan)
    }

    pub(crate) fn run_instantiated_network(&self, plan: &mut dyn PlanBackend) -> Result<()> {
        self.instantiated_network.run(plan)
    }

    pub(crate) fn run_system_network(&self, plan: &mut dyn PlanBackend) -> Result<()> {
        self.system_network.run(plan)
    }

    pub(crate) fn run_deployment(&self, plan: &mut dyn PlanBackend) -> Result<()> {
        self.deployment.run(plan)
    }

    pub(crate) fn run_final_network(&self, plan: &mut dyn PlanBackend) -> Result<()> {
        self.final_network.run(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::InMemoryPlan;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn hooks_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut chain = HookChain::default();
        let o1 = order.clone();
        chain.on_instantiation("a", Box::new(move |_| {
            o1.lock().unwrap().push("a");
            Ok(())
        }));
        let o2 = order.clone();
        chain.on_instantiation("b", Box::new(move |_| {
            o2.lock().unwrap().push("b");
            Ok(())
        }));

        let mut plan = InMemoryPlan::new();
        chain.run_instantiation(&mut plan).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn chained_hook_runs_previous_first() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = HookChain::default();
        let c1 = calls.clone();
        chain.on_instantiation("x", Box::new(move |_| {
            assert_eq!(c1.fetch_add(1, Ordering::SeqCst), 0);
            Ok(())
        }));
        let c2 = calls.clone();
        chain.chain_instantiation("x", Box::new(move |_| {
            assert_eq!(c2.fetch_add(1, Ordering::SeqCst), 1);
            Ok(())
        }));

        let mut plan = InMemoryPlan::new();
        chain.run_instantiation(&mut plan).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
