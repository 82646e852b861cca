//! Per-workload heal errors

use thiserror::Error;
use uuid::Uuid;

use crate::report::RunStatus;

fn list<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why healing one workload failed. None of these abort a run.
#[derive(Error, Debug)]
pub enum HealError {
    /// The workload's shape is not handled by this healer
    #[error("{0}")]
    Unsupported(String),

    /// Zero allocation candidates for the ports' resource requests
    #[error(
        "Placement returned no allocation candidate to fulfill the resource request of ports [{}]: {query}",
        list(.ports)
    )]
    InsufficientCapacity { ports: Vec<Uuid>, query: String },

    /// More than one candidate; no tie-break is attempted
    #[error(
        "Placement returned more than one possible allocation candidates ({count}) to fulfill the resource request of ports [{}]: {query}",
        list(.ports)
    )]
    AmbiguousCandidates {
        count: usize,
        ports: Vec<Uuid>,
        query: String,
    },

    /// A ledger call failed
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// A workload store call failed
    #[error("Workload store unavailable: {0}")]
    StoreUnavailable(String),

    /// Ports could not be listed, or carry unusable allocation keys
    #[error("Unable to query ports for instance {workload}: {message}")]
    PortQueryFailed { workload: Uuid, message: String },

    /// A port update failed and every earlier change was rolled back
    #[error("Unable to update ports with allocations: {0}")]
    PortUpdateFailed(String),

    /// Rolling back failed; the listed ports still carry the new keys
    #[error(
        "{message}. Make sure that the binding:profile.allocation key of the affected ports [{}] are manually cleaned",
        .ports.join(", ")
    )]
    ManualCleanupRequired { ports: Vec<String>, message: String },

    /// No compute node record for the workload's host and node
    #[error("Compute node for host {host} and node {node} could not be found")]
    ComputeNodeNotFound { host: String, node: String },

    /// The workload or its shard mapping is missing
    #[error("{0}")]
    NotFound(String),
}

impl HealError {
    /// Run status class this error contributes
    pub fn status(&self) -> RunStatus {
        match self {
            HealError::Unsupported(_) => RunStatus::Unsupported,
            HealError::InsufficientCapacity { .. } | HealError::AmbiguousCandidates { .. } => {
                RunStatus::AllocationFailed
            }
            HealError::LedgerUnavailable(_) | HealError::StoreUnavailable(_) => {
                RunStatus::ServiceUnavailable
            }
            HealError::PortQueryFailed { .. } => RunStatus::PortQueryFailed,
            HealError::PortUpdateFailed(_) => RunStatus::PortUpdateFailed,
            HealError::ComputeNodeNotFound { .. } => RunStatus::ComputeNodeNotFound,
            HealError::ManualCleanupRequired { .. } => RunStatus::ManualCleanupRequired,
            HealError::NotFound(_) => RunStatus::NotFound,
        }
    }
}
