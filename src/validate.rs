//! Validator Suite (§4.7, ~8%): four independently runnable checks.

use std::collections::{BTreeMap, BTreeSet};

use tracing::instrument;

use crate::error::{MissingDeploymentDiagnostic, NetgenError, Result};
use crate::model::ModelRegistry;
use crate::plan::{Handle, PlanBackend};

/// Abstract-network check: no non-multiplexing input port may have more
/// than one distinct `(source task, source port)` driver (§8 P4).
#[instrument(skip_all)]
pub fn validate_abstract_network(plan: &dyn PlanBackend, registry: &dyn ModelRegistry) -> Result<()> {
    let mut drivers: BTreeMap<(Handle, String), BTreeSet<(Handle, String)>> = BTreeMap::new();
    for ((source, sink), edge) in plan.dataflow_edges() {
        for pair in edge.connections.keys() {
            drivers
                .entry((*sink, pair.sink_port.clone()))
                .or_default()
                .insert((*source, pair.source_port.clone()));
        }
    }

    for ((sink, port_name), sources) in drivers {
        if sources.len() <= 1 {
            continue;
        }
        let Some(task) = plan.get(sink) else { continue };
        let multiplexes = registry
            .find_input_port(&task.model, &port_name)
            .map(|p| p.multiplexes)
            .unwrap_or(false);
        if !multiplexes {
            return Err(NetgenError::MultiplexingError {
                task: task.model.clone(),
                port: port_name,
                driver_count: sources.len(),
            });
        }
    }
    Ok(())
}

/// Generated-network check: no task remains abstract, and every master
/// driver service is bound to a unique device (§8 invariants I2, I5).
#[instrument(skip_all)]
pub fn validate_generated_network(plan: &dyn PlanBackend, registry: &dyn ModelRegistry) -> Result<()> {
    let abstract_tasks: Vec<String> = plan
        .all_handles()
        .into_iter()
        .filter_map(|h| plan.get(h))
        .filter(|t| t.is_abstract)
        .map(|t| t.model.clone())
        .collect();
    if !abstract_tasks.is_empty() {
        return Err(NetgenError::TaskAllocationFailed { tasks: abstract_tasks });
    }

    let mut device_owner: BTreeMap<String, (Handle, String)> = BTreeMap::new();
    for handle in plan.all_handles() {
        let Some(task) = plan.get(handle) else { continue };
        for service in registry.each_master_driver_service(&task.model) {
            let dev_arg = service.dev_arg_name();
            let Some(device) = task.argument(&dev_arg).and_then(|v| v.as_str()) else {
                return Err(NetgenError::DeviceAllocationFailed {
                    task: task.model.clone(),
                    service: service.name.clone(),
                });
            };
            if let Some((owner_handle, owner_model)) = device_owner.get(device) {
                if *owner_handle != handle {
                    return Err(NetgenError::ConflictingDeviceAllocation {
                        device: device.to_string(),
                        task_a: owner_model.clone(),
                        task_b: task.model.clone(),
                    });
                }
            } else {
                device_owner.insert(device.to_string(), (handle, task.model.clone()));
            }
        }
    }
    Ok(())
}

/// Deployed-network check: every task context must have found a
/// deployable slot. The Deployment Selector (§4.5) already accumulates the
/// per-task candidate diagnostics for anything left unbound; this check
/// simply surfaces them as a typed failure.
#[instrument(skip_all)]
pub fn validate_deployed_network(missing: &[MissingDeploymentDiagnostic]) -> Result<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(NetgenError::missing_deployments(missing.to_vec()))
    }
}

/// Final-network check: every `required_instances` entry still refers to a
/// real, non-proxy, attached task (§8 P2).
#[instrument(skip_all)]
pub fn validate_final_network(
    plan: &dyn PlanBackend,
    required_instances: &BTreeMap<String, Handle>,
) -> Result<()> {
    for (requirement, &handle) in required_instances {
        match plan.get(handle) {
            Some(task) if !task.transaction_proxy => {}
            _ => {
                return Err(NetgenError::FinalNetworkInvariantViolated {
                    requirement: requirement.clone(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CandidateDiagnostic;
    use crate::model::{ComponentModel, Port, StaticRegistry};
    use crate::plan::{ConnectionPolicy, InMemoryPlan, Task};

    #[test]
    fn multiplexing_violation_detected_on_non_multiplexing_port() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Sink").with_input(Port::input("in", "T")));
        let mut plan = InMemoryPlan::new();
        let a = plan.allocate_handle();
        plan.add(Task::new(a, "SrcA", 0));
        let b = plan.allocate_handle();
        plan.add(Task::new(b, "SrcB", 1));
        let sink = plan.allocate_handle();
        plan.add(Task::new(sink, "Sink", 2));
        plan.dataflow_edge_mut(a, sink).connect("out", "in", ConnectionPolicy::new("p"));
        plan.dataflow_edge_mut(b, sink).connect("out", "in", ConnectionPolicy::new("p"));

        let err = validate_abstract_network(&plan, &registry).unwrap_err();
        assert!(matches!(err, NetgenError::MultiplexingError { .. }));
    }

    #[test]
    fn multiplexing_port_allows_multiple_drivers() {
        let mut registry = StaticRegistry::new();
        registry.register_model(
            ComponentModel::task_context("Sink").with_input(Port::input("in", "T").multiplexing()),
        );
        let mut plan = InMemoryPlan::new();
        let a = plan.allocate_handle();
        plan.add(Task::new(a, "SrcA", 0));
        let b = plan.allocate_handle();
        plan.add(Task::new(b, "SrcB", 1));
        let sink = plan.allocate_handle();
        plan.add(Task::new(sink, "Sink", 2));
        plan.dataflow_edge_mut(a, sink).connect("out", "in", ConnectionPolicy::new("p"));
        plan.dataflow_edge_mut(b, sink).connect("out", "in", ConnectionPolicy::new("p"));

        assert!(validate_abstract_network(&plan, &registry).is_ok());
    }

    #[test]
    fn task_allocation_failure_lists_abstract_tasks() {
        let registry = StaticRegistry::new();
        let mut plan = InMemoryPlan::new();
        let h = plan.allocate_handle();
        plan.add(Task::new(h, "Camera", 0));

        let err = validate_generated_network(&plan, &registry).unwrap_err();
        assert!(matches!(err, NetgenError::TaskAllocationFailed { .. }));
    }

    #[test]
    fn conflicting_device_allocation_detected() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Imu").with_master_driver_service("can"));
        let mut plan = InMemoryPlan::new();
        let a = plan.allocate_handle();
        let mut ta = Task::new(a, "Imu", 0);
        ta.is_abstract = false;
        ta.set_argument("can_dev", serde_json::Value::from("can0"));
        plan.add(ta);
        let b = plan.allocate_handle();
        let mut tb = Task::new(b, "Imu", 1);
        tb.is_abstract = false;
        tb.set_argument("can_dev", serde_json::Value::from("can0"));
        plan.add(tb);

        let err = validate_generated_network(&plan, &registry).unwrap_err();
        assert!(matches!(err, NetgenError::ConflictingDeviceAllocation { .. }));
    }

    #[test]
    fn deployed_network_passes_with_no_missing_diagnostics() {
        assert!(validate_deployed_network(&[]).is_ok());
    }

    #[test]
    fn deployed_network_fails_with_missing_diagnostics() {
        let missing = vec![MissingDeploymentDiagnostic {
            task: "Camera".into(),
            candidates: vec![CandidateDiagnostic {
                host: "h1".into(),
                deployment_model: "D1".into(),
                deployment_local_name: "t".into(),
                already_bound_to: None,
            }],
        }];
        let err = validate_deployed_network(&missing).unwrap_err();
        assert!(matches!(err, NetgenError::MissingDeployments(1, _)));
    }

    #[test]
    fn final_network_rejects_dangling_requirement() {
        let plan = InMemoryPlan::new();
        let mut required = BTreeMap::new();
        required.insert("req1".to_string(), Handle(99));

        let err = validate_final_network(&plan, &required).unwrap_err();
        assert!(matches!(err, NetgenError::FinalNetworkInvariantViolated { .. }));
    }

    #[test]
    fn final_network_accepts_attached_non_proxy_task() {
        let mut plan = InMemoryPlan::new();
        let h = plan.allocate_handle();
        plan.add(Task::new(h, "Camera", 0));
        let mut required = BTreeMap::new();
        required.insert("req1".to_string(), h);

        assert!(validate_final_network(&plan, &required).is_ok());
    }
}
