//! Error types for placemend

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ShardId;

/// External service a call was made against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Resource accounting service (placement)
    Ledger,
    /// Network port service
    Network,
    /// Accelerator request service
    Accelerator,
    /// Workload record store
    Store,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Ledger => write!(f, "ledger"),
            Service::Network => write!(f, "network"),
            Service::Accelerator => write!(f, "accelerator"),
            Service::Store => write!(f, "store"),
        }
    }
}

/// Main error type for placemend
#[derive(Error, Debug)]
pub enum PlacemendError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The service could not be reached or refused the call
    #[error("{service} service unavailable: {message}")]
    ServiceUnavailable { service: Service, message: String },

    /// The requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A generation or consumer-generation check failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The service answered with something we could not interpret
    #[error("Invalid response from {service}: {message}")]
    InvalidResponse { service: Service, message: String },

    /// Device profile lookup failed
    #[error("Device profile name {name}: {message}")]
    DeviceProfile { name: String, message: String },

    /// An accelerator request operation failed
    #[error("Failed to {op} accelerator requests: {message}")]
    AcceleratorRequest { op: String, message: String },

    /// Binding accelerator requests failed
    #[error("Failed to bind accelerator requests {}: {message}", .arqs.join(","))]
    AcceleratorBinding { arqs: Vec<String>, message: String },

    /// A workload shard could not be reached
    #[error("Shard {0} is unreachable")]
    ShardUnavailable(ShardId),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlacemendError {
    /// Shorthand for a service-unavailable error
    pub fn unavailable(service: Service, message: impl Into<String>) -> Self {
        PlacemendError::ServiceUnavailable {
            service,
            message: message.into(),
        }
    }

    /// Whether the error means the remote side could not serve the call
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            PlacemendError::ServiceUnavailable { .. } | PlacemendError::ShardUnavailable(_)
        )
    }
}

/// Result type for placemend operations
pub type PlacemendResult<T> = Result<T, PlacemendError>;

impl From<serde_json::Error> for PlacemendError {
    fn from(err: serde_json::Error) -> Self {
        PlacemendError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PlacemendError {
    fn from(err: toml::de::Error) -> Self {
        PlacemendError::Config(err.to_string())
    }
}
