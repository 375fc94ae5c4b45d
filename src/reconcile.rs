//! Reconciliation Engine (§4.6, ~20%).
//!
//! Runs after the deployed network has been built in the staging plan but
//! before commit. Adapts each freshly computed deployment instance against
//! any already-running deployment with the same process name, preferring
//! reuse (merge) over spawning fresh tasks, and preserving the liveness of
//! tasks that must keep running (§8 P6).

use std::collections::BTreeSet;

use tracing::{debug, instrument, warn};

use crate::deploy::DeploymentInstanceRecord;
use crate::error::{NetgenError, Result};
use crate::merge::MergeGraph;
use crate::model::ModelRegistry;
use crate::plan::{Handle, LifecycleEvent, OrderingConstraint, PlanBackend, PlanTransaction, Relation};

/// §4.6 pre-merge scrub: non-reusable tasks lose their dataflow/dependency
/// edges, abstract transaction proxies are dropped, and dataflow edges
/// whose port pair no longer exists on both endpoints are removed.
fn scrub_stale_state(staging: &mut dyn PlanBackend, registry: &dyn ModelRegistry) {
    for handle in staging.all_handles() {
        let Some(task) = staging.get(handle) else { continue };
        if !task.is_reusable() {
            let incident: Vec<(Handle, Handle)> = staging
                .dataflow_edges()
                .keys()
                .filter(|(a, b)| *a == handle || *b == handle)
                .copied()
                .collect();
            for (a, b) in incident {
                staging.remove_dataflow_edge(a, b);
            }
            staging
                .task_relation_graph_for_mut(Relation::Dependency)
                .edges
                .retain(|(a, b)| *a != handle && *b != handle);
        }
        if task.transaction_proxy && task.is_abstract {
            staging.remove_task(handle);
        }
    }

    let stale: Vec<(Handle, Handle)> = staging
        .dataflow_edges()
        .iter()
        .filter_map(|((source, sink), edge)| {
            let source_model = staging.get(*source).map(|t| t.model.clone());
            let sink_model = staging.get(*sink).map(|t| t.model.clone());
            let (Some(source_model), Some(sink_model)) = (source_model, sink_model) else {
                return Some((*source, *sink));
            };
            let all_dead = edge.connections.keys().all(|pair| {
                registry.find_output_port(&source_model, &pair.source_port).is_none()
                    || registry.find_input_port(&sink_model, &pair.sink_port).is_none()
            });
            all_dead.then_some((*source, *sink))
        })
        .collect();
    for (source, sink) in stale {
        staging.remove_dataflow_edge(source, sink);
    }
}

fn incoming_source_ports(plan: &dyn PlanBackend, sink: Handle, port_name: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for ((_source, s), edge) in plan.dataflow_edges() {
        if *s != sink {
            continue;
        }
        for pair in edge.connections.keys() {
            if pair.sink_port == port_name {
                out.insert(pair.source_port.clone());
            }
        }
    }
    out
}

/// Whether reusing `old_handle` (in `old_plan`) for `new_handle` (in
/// `new_plan`, same model) would change the driver of a static port (§4.6
/// third paragraph, §8 scenario 4).
fn static_port_changed(
    registry: &dyn ModelRegistry,
    model: &str,
    new_plan: &dyn PlanBackend,
    new_handle: Handle,
    old_plan: &dyn PlanBackend,
    old_handle: Handle,
) -> bool {
    let Some(component_model) = registry.model_for(model) else {
        return false;
    };
    for port in component_model.input_ports.iter().filter(|p| p.is_static) {
        let new_drivers = incoming_source_ports(new_plan, new_handle, &port.name);
        let old_drivers = incoming_source_ports(old_plan, old_handle, &port.name);
        if new_drivers != old_drivers {
            return true;
        }
    }
    false
}

/// Reconcile every freshly selected deployment instance against the real
/// plan's running deployments (§4.6), mutating the staging plan in `txn`
/// and recording merges in `merges`.
#[instrument(skip_all, fields(instances = instances.len()))]
pub fn reconcile(
    txn: &mut PlanTransaction,
    registry: &dyn ModelRegistry,
    instances: &[DeploymentInstanceRecord],
    merges: &mut MergeGraph,
) -> Result<()> {
    scrub_stale_state(txn.working_plan(), registry);

    for instance in instances {
        let process_name = instance.process_name.clone();

        let running_matches: Vec<Handle> = txn
            .real_plan()
            .all_handles()
            .into_iter()
            .filter(|h| {
                txn.real_plan()
                    .get(*h)
                    .map(|t| {
                        t.argument("process_name").and_then(|v| v.as_str()) == Some(process_name.as_str())
                            && !t.lifecycle.is_finished()
                            && !t.lifecycle.is_finishing()
                    })
                    .unwrap_or(false)
            })
            .collect();

        let finishing_matches: Vec<Handle> = txn
            .real_plan()
            .all_handles()
            .into_iter()
            .filter(|h| {
                txn.real_plan()
                    .get(*h)
                    .map(|t| {
                        t.argument("process_name").and_then(|v| v.as_str()) == Some(process_name.as_str())
                            && t.lifecycle.is_finishing()
                    })
                    .unwrap_or(false)
            })
            .collect();

        if running_matches.len() > 1 {
            return Err(NetgenError::DuplicateRunningDeployment { process_name });
        }

        let representative = if let Some(&real_instance) = running_matches.first() {
            let existing_proxy = txn.wrap_task(real_instance);
            merges.apply_merge_group(&[(instance.handle, existing_proxy)], txn.working_plan())?;

            for &hosted in &instance.hosted_task_contexts {
                reconcile_hosted_task(txn, registry, merges, hosted, real_instance, existing_proxy)?;
            }
            existing_proxy
        } else {
            instance.handle
        };

        if let Some(&finishing_real) = finishing_matches.first() {
            let finishing_proxy = txn.wrap_task(finishing_real);
            txn.working_plan().add_ordering_constraint(OrderingConstraint::new(
                merges.replacement_for(representative),
                LifecycleEvent::Start,
                finishing_proxy,
                LifecycleEvent::Stop,
            ));
        }
    }

    debug!("reconciliation complete");
    Ok(())
}

fn reconcile_hosted_task(
    txn: &mut PlanTransaction,
    registry: &dyn ModelRegistry,
    merges: &mut MergeGraph,
    new_handle: Handle,
    real_instance: Handle,
    instance_proxy: Handle,
) -> Result<()> {
    let Some(new_task) = txn.working_plan().get(new_handle).cloned() else {
        return Ok(());
    };

    let candidates: Vec<Handle> = txn
        .real_plan()
        .all_handles()
        .into_iter()
        .filter(|h| {
            txn.real_plan()
                .get(*h)
                .map(|t| t.execution_agent == Some(real_instance) && t.orocos_name == new_task.orocos_name)
                .unwrap_or(false)
        })
        .collect();

    let old_handle = candidates
        .iter()
        .copied()
        .max_by_key(|h| txn.real_plan().get(*h).map(|t| t.lifecycle.is_running()).unwrap_or(false));

    let Some(old_handle) = old_handle else {
        return Ok(());
    };
    let old_task = txn.real_plan().get(old_handle).cloned().expect("candidate exists");

    let reusable = new_task.can_be_deployed_by(&old_task)
        && !(old_task.is_setup()
            && static_port_changed(
                registry,
                &new_task.model,
                txn.working_plan_ref(),
                new_handle,
                txn.real_plan(),
                old_handle,
            ));

    if reusable {
        let old_proxy = txn.wrap_task(old_handle);
        merges.apply_merge_group(&[(new_handle, old_proxy)], txn.working_plan())?;
        return Ok(());
    }

    warn!(task = %new_task.model, "static port change or incompatible reuse, spawning reconfiguration");
    let old_proxy = txn.wrap_task(old_handle);
    let fresh_handle = txn.fresh_handle();
    let mut fresh_task = new_task.clone();
    fresh_task.handle = fresh_handle;
    fresh_task.execution_agent = Some(instance_proxy);
    txn.working_plan().add(fresh_task);

    let parents: Vec<Handle> = txn
        .working_plan_ref()
        .task_relation_graph_for(Relation::Hierarchy)
        .predecessors(old_proxy)
        .collect();
    if !parents.is_empty() {
        txn.working_plan()
            .task_relation_graph_for_mut(Relation::Hierarchy)
            .edges
            .retain(|(_, child)| *child != old_proxy);
    }

    txn.working_plan().add_ordering_constraint(OrderingConstraint::new(
        fresh_handle,
        LifecycleEvent::Configure,
        old_proxy,
        LifecycleEvent::Stop,
    ));

    merges.apply_merge_group(&[(new_handle, fresh_handle)], txn.working_plan())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComponentModel, StaticRegistry};
    use crate::plan::{InMemoryPlan, LifecycleState, Task};
    use std::collections::BTreeSet as Set;

    /// Regression test pinning the correct field spelling (§9 Open
    /// Question) against future refactors.
    #[test]
    fn process_name_field_is_spelled_correctly() {
        let instance = DeploymentInstanceRecord {
            handle: Handle(0),
            deployment_model: "D1".into(),
            process_name: "D1".into(),
            host: "h1".into(),
            hosted_task_contexts: Set::new(),
        };
        assert_eq!(instance.process_name, "D1");
    }

    #[test]
    fn reuses_running_task_with_compatible_model() {
        let registry = StaticRegistry::new();
        let mut real = InMemoryPlan::new();
        let instance_real = real.allocate_handle();
        let mut instance_task = Task::new(instance_real, "D1", 0);
        instance_task.set_argument("process_name", serde_json::Value::from("D1"));
        instance_task.lifecycle = LifecycleState::Running;
        instance_task.permanent = true;
        real.add(instance_task);
        let running = real.allocate_handle();
        let mut running_task = Task::new(running, "Camera", 1);
        running_task.execution_agent = Some(instance_real);
        running_task.orocos_name = Some("t".into());
        running_task.lifecycle = LifecycleState::Running;
        running_task.permanent = true;
        real.add(running_task);

        let mut txn = PlanTransaction::open(&mut real);
        let new_instance_handle = txn.working_plan().allocate_handle();
        let mut new_instance = Task::new(new_instance_handle, "D1", 10);
        new_instance.set_argument("process_name", serde_json::Value::from("D1"));
        txn.working_plan().add(new_instance);
        let new_task_handle = txn.working_plan().allocate_handle();
        let mut new_task = Task::new(new_task_handle, "Camera", 11);
        new_task.is_abstract = false;
        new_task.orocos_name = Some("t".into());
        txn.working_plan().add(new_task);

        let record = DeploymentInstanceRecord {
            handle: new_instance_handle,
            deployment_model: "D1".into(),
            process_name: "D1".into(),
            host: "h1".into(),
            hosted_task_contexts: Set::from([new_task_handle]),
        };
        let mut merges = MergeGraph::new();

        reconcile(&mut txn, &registry, &[record], &mut merges).unwrap();

        assert_ne!(merges.replacement_for(new_task_handle), new_task_handle);
    }

    #[test]
    fn static_port_change_forces_fresh_task_ordered_after_stop() {
        let mut registry = StaticRegistry::new();
        registry.register_model(
            ComponentModel::task_context("Camera")
                .with_input(crate::model::Port::input("frame", "Image").r#static()),
        );
        let mut real = InMemoryPlan::new();
        let instance_real = real.allocate_handle();
        let mut instance_task = Task::new(instance_real, "D1", 0);
        instance_task.set_argument("process_name", serde_json::Value::from("D1"));
        instance_task.lifecycle = LifecycleState::Running;
        instance_task.permanent = true;
        real.add(instance_task);
        let old_source = real.allocate_handle();
        real.add(Task::new(old_source, "OldSource", 1));
        let running = real.allocate_handle();
        let mut running_task = Task::new(running, "Camera", 2);
        running_task.execution_agent = Some(instance_real);
        running_task.orocos_name = Some("t".into());
        running_task.lifecycle = LifecycleState::Running;
        running_task.setup = true;
        running_task.permanent = true;
        real.add(running_task);
        real.dataflow_edge_mut(old_source, running).connect(
            "out",
            "frame",
            crate::plan::ConnectionPolicy::new("p"),
        );

        let mut txn = PlanTransaction::open(&mut real);
        let new_instance_handle = txn.working_plan().allocate_handle();
        let mut new_instance = Task::new(new_instance_handle, "D1", 10);
        new_instance.set_argument("process_name", serde_json::Value::from("D1"));
        txn.working_plan().add(new_instance);
        let new_source = txn.working_plan().allocate_handle();
        txn.working_plan().add(Task::new(new_source, "NewSource", 11));
        let new_task_handle = txn.working_plan().allocate_handle();
        let mut new_task = Task::new(new_task_handle, "Camera", 12);
        new_task.is_abstract = false;
        new_task.orocos_name = Some("t".into());
        txn.working_plan().add(new_task);
        txn.working_plan()
            .dataflow_edge_mut(new_source, new_task_handle)
            .connect("out", "frame", crate::plan::ConnectionPolicy::new("p"));

        let record = DeploymentInstanceRecord {
            handle: new_instance_handle,
            deployment_model: "D1".into(),
            process_name: "D1".into(),
            host: "h1".into(),
            hosted_task_contexts: Set::from([new_task_handle]),
        };
        let mut merges = MergeGraph::new();

        reconcile(&mut txn, &registry, &[record], &mut merges).unwrap();

        let resolved = merges.replacement_for(new_task_handle);
        assert_ne!(resolved, running);
        assert!(txn
            .working_plan_ref()
            .ordering_constraints()
            .iter()
            .any(|c| c.before.0 == resolved));
    }
}
