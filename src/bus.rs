//! Bus Linker (§4.3, ~6%).
//!
//! Attaches every device-carrying task to the communication-bus task for
//! each device it requires, instantiating bus tasks on demand (memoized so
//! exactly one bus task exists per bus device in the plan).

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::error::Result;
use crate::model::ModelRegistry;
use crate::plan::{Handle, LifecycleEvent, OrderingConstraint, PlanBackend, Relation, Task};

/// The component model used for synthesized bus tasks, and the convention
/// for deriving a bus's device name from a `<service>_dev` argument: the
/// bus device is the value itself (e.g. `can0`).
const BUS_MODEL: &str = "Bus";

/// Link every task carrying a master driver service to its bus task,
/// creating bus tasks as needed (§4.3).
#[instrument(skip_all)]
pub fn link_busses(
    plan: &mut dyn PlanBackend,
    registry: &dyn ModelRegistry,
    next_handle: &mut dyn FnMut() -> Handle,
) -> Result<()> {
    let mut bus_by_device: BTreeMap<String, Handle> = BTreeMap::new();
    for handle in plan.all_handles() {
        if let Some(task) = plan.get(handle) {
            if task.model == BUS_MODEL {
                if let Some(device) = task.argument("device").and_then(|v| v.as_str()) {
                    bus_by_device.insert(device.to_string(), handle);
                }
            }
        }
    }

    let mut linked = 0usize;
    for handle in plan.all_handles() {
        let Some(task) = plan.get(handle) else { continue };
        let services = registry.each_master_driver_service(&task.model);
        if services.is_empty() {
            continue;
        }
        for service in services {
            let dev_arg = service.dev_arg_name();
            let Some(device) = plan
                .get(handle)
                .and_then(|t| t.argument(&dev_arg))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
            else {
                continue;
            };

            let bus = *bus_by_device.entry(device.clone()).or_insert_with(|| {
                let bus_handle = next_handle();
                let mut bus_task = Task::new(bus_handle, BUS_MODEL, 0);
                bus_task.permanent = true;
                bus_task.set_argument("device", serde_json::Value::from(device.clone()));
                plan.add(bus_task)
            });

            plan.add_relation(Relation::Dependency, handle, bus);
            plan.add_ordering_constraint(OrderingConstraint::new(
                handle,
                LifecycleEvent::Configure,
                bus,
                LifecycleEvent::Start,
            ));
            linked += 1;
        }
    }

    debug!(linked, busses = bus_by_device.len(), "bus linking complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComponentModel, StaticRegistry};
    use crate::plan::InMemoryPlan;

    fn next_handle_fn(plan: &InMemoryPlan) -> impl FnMut() -> Handle + '_ {
        let mut counter = plan.all_handles().iter().map(|h| h.0).max().map(|m| m + 1).unwrap_or(0);
        move || {
            let h = Handle(counter);
            counter += 1;
            h
        }
    }

    #[test]
    fn creates_single_bus_task_and_links_device() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Imu").with_master_driver_service("can"));
        let mut plan = InMemoryPlan::new();
        let task_handle = plan.allocate_handle();
        let mut task = Task::new(task_handle, "Imu", 0);
        task.set_argument("can_dev", serde_json::Value::from("can0"));
        plan.add(task);

        let mut next = next_handle_fn(&plan);
        link_busses(&mut plan, &registry, &mut next).unwrap();

        let busses = plan.find_local_tasks(BUS_MODEL);
        assert_eq!(busses.len(), 1);
        assert!(plan
            .task_relation_graph_for(Relation::Dependency)
            .successors(task_handle)
            .any(|b| b == busses[0]));
        assert_eq!(plan.ordering_constraints().len(), 1);
    }

    #[test]
    fn two_tasks_sharing_a_device_reuse_one_bus() {
        let mut registry = StaticRegistry::new();
        registry.register_model(ComponentModel::task_context("Imu").with_master_driver_service("can"));
        registry.register_model(ComponentModel::task_context("Gps").with_master_driver_service("can"));
        let mut plan = InMemoryPlan::new();
        let mut a = Task::new(plan.allocate_handle(), "Imu", 0);
        a.set_argument("can_dev", serde_json::Value::from("can0"));
        plan.add(a);
        let mut b = Task::new(plan.allocate_handle(), "Gps", 1);
        b.set_argument("can_dev", serde_json::Value::from("can0"));
        plan.add(b);

        let mut next = next_handle_fn(&plan);
        link_busses(&mut plan, &registry, &mut next).unwrap();

        assert_eq!(plan.find_local_tasks(BUS_MODEL).len(), 1);
    }
}
