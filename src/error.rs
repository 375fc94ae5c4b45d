//! Error taxonomy for the network generation engine.
//!
//! Error code ranges (mirrors §7 of the specification):
//! - NETGEN-000-009: plan-backend / transaction errors
//! - NETGEN-010-019: instantiation errors
//! - NETGEN-020-029: merge solver errors
//! - NETGEN-030-039: abstract-network validation errors
//! - NETGEN-040-049: generated-network validation errors (allocation)
//! - NETGEN-050-059: deployed-network validation errors
//! - NETGEN-060-069: final-network validation errors
//! - NETGEN-070-079: reconciliation errors
//! - NETGEN-080-089: configuration / parse errors
//! - NETGEN-090-099: internal invariant violations

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetgenError>;

/// All error variants raised while driving [`crate::pipeline::Pipeline::resolve`].
#[derive(Error, Debug, Diagnostic)]
pub enum NetgenError {
    // ─── plan backend (000-009) ───────────────────────────────────
    #[error("[NETGEN-001] plan backend rejected the operation: {reason}")]
    #[diagnostic(help("check that the task/handle referenced still exists in the plan"))]
    PlanBackend { reason: String },

    #[error("[NETGEN-002] transaction already finalized")]
    #[diagnostic(help("a Pipeline may only call resolve() once per transaction"))]
    TransactionFinalized,

    // ─── instantiation (010-019) ───────────────────────────────────
    #[error("[NETGEN-010] requirement task {requirement:?} produced no root task")]
    InstantiationFailed { requirement: String },

    #[error("[NETGEN-011] device allocation left master driver service '{service}' on task {task:?} unresolved due to disagreeing ancestors")]
    #[diagnostic(help("ensure only one ancestor selects a device for this service"))]
    AmbiguousDeviceSelection { task: String, service: String },

    // ─── merge solver (020-029) ────────────────────────────────────
    #[error("[NETGEN-020] merge conflict on ({source_port} -> {sink_port}): incompatible connection policies")]
    #[diagnostic(help("the two merge candidates disagree on the policy for this port pair and cannot be unified"))]
    MergeConflict {
        source_port: String,
        sink_port: String,
    },

    #[error("[NETGEN-021] merge of {from:?} into {to:?} would introduce a cycle")]
    MergeCycle { from: String, to: String },

    // ─── abstract-network validation (030-039) ─────────────────────
    #[error("[NETGEN-030] multiplexing violation on task {task:?} input port '{port}': {driver_count} distinct drivers on a non-multiplexing port")]
    #[diagnostic(help("mark the port as multiplexing, or ensure only one source drives it"))]
    MultiplexingError {
        task: String,
        port: String,
        driver_count: usize,
    },

    // ─── generated-network validation (040-049) ────────────────────
    #[error("[NETGEN-040] task(s) remained abstract after the generated-network stage: {tasks:?}")]
    TaskAllocationFailed { tasks: Vec<String> },

    #[error("[NETGEN-041] master driver service '{service}' on task {task:?} has no bound device")]
    #[diagnostic(help("add a dependency-injection selection for '{service}_dev' on an ancestor composition"))]
    DeviceAllocationFailed { task: String, service: String },

    #[error("[NETGEN-042] device '{device}' is bound to two distinct tasks: {task_a:?} and {task_b:?}")]
    ConflictingDeviceAllocation {
        device: String,
        task_a: String,
        task_b: String,
    },

    // ─── deployed-network validation (050-059) ─────────────────────
    #[error("[NETGEN-050] {0} task context(s) have no deployable slot")]
    MissingDeployments(usize, #[source] MissingDeploymentsDetail),

    #[error("[NETGEN-051] composition specialization selection for {composition:?} is ambiguous under strict mode")]
    AmbiguousSpecialization { composition: String },

    // ─── final-network validation (060-069) ────────────────────────
    #[error("[NETGEN-060] required_instances[{requirement:?}] does not refer to a real, attached task")]
    FinalNetworkInvariantViolated { requirement: String },

    // ─── reconciliation (070-079) ───────────────────────────────────
    #[error("[NETGEN-070] more than one non-finished deployment with process name '{process_name}' is running")]
    DuplicateRunningDeployment { process_name: String },

    // ─── configuration / parse (080-089) ───────────────────────────
    #[error("[NETGEN-080] failed to parse resolver configuration: {reason}")]
    ConfigParse { reason: String },

    #[error("[NETGEN-081] failed to read resolver configuration file: {0}")]
    ConfigIo(#[from] std::io::Error),

    // ─── internal invariants (090-099) ─────────────────────────────
    #[error("[NETGEN-090] internal invariant violated: {detail}")]
    #[diagnostic(help("this should not be reachable; please file a bug report"))]
    InternalError { detail: String },
}

/// Per-task diagnostics attached to a [`NetgenError::MissingDeployments`].
///
/// Carries, for each missing task context, the candidate
/// `(host, deployment_model, deployment_local_name, existing_binding)` tuples
/// considered and rejected, per §4.7.
#[derive(Debug, Error)]
#[error("missing deployment diagnostics for {} task(s)", .0.len())]
pub struct MissingDeploymentsDetail(pub Vec<MissingDeploymentDiagnostic>);

#[derive(Debug, Clone)]
pub struct MissingDeploymentDiagnostic {
    pub task: String,
    pub candidates: Vec<CandidateDiagnostic>,
}

#[derive(Debug, Clone)]
pub struct CandidateDiagnostic {
    pub host: String,
    pub deployment_model: String,
    pub deployment_local_name: String,
    pub already_bound_to: Option<String>,
}

impl NetgenError {
    pub fn internal(detail: impl Into<String>) -> Self {
        NetgenError::InternalError {
            detail: detail.into(),
        }
    }

    pub fn missing_deployments(diags: Vec<MissingDeploymentDiagnostic>) -> Self {
        let count = diags.len();
        NetgenError::MissingDeployments(count, MissingDeploymentsDetail(diags))
    }
}
