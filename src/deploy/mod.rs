//! Deployment Candidate Index + Deployment Selector (§4.4, §4.5).

mod index;
mod select;

pub use index::{CandidateIndex, DeploymentCandidate};
pub use select::{select_and_apply_deployments, DeploymentInstanceRecord, SelectionResult};
