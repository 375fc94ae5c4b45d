//! Plan module — working-plan data model and the `PlanBackend` trait
//! boundary to the external plan-database engine (§3, §6).

mod backend;
mod dataflow;
mod ordering;
mod task;
mod transaction;

pub use backend::{not_abstract, not_finished, not_finishing, InMemoryPlan, PlanBackend, Relation, RelationGraph};
pub use dataflow::{ConnectionPolicy, ConnectionSet, DataflowEdge, PortPair};
pub use ordering::{LifecycleEvent, OrderingConstraint};
pub use task::{Argument, DeploymentHint, DeploymentInstance, Handle, LifecycleState, Task};
pub use transaction::PlanTransaction;
