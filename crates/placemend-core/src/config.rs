//! Configuration types for placemend

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default ledger microversion; same_subtree needs 1.36
pub const DEFAULT_LEDGER_MICROVERSION: &str = "1.36";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacemendConfig {
    /// Resource ledger (placement) service
    pub ledger: LedgerConfig,
    /// Network port service
    pub network: NetworkConfig,
    /// Accelerator request service
    pub accelerator: AcceleratorConfig,
    /// Workload store
    pub store: StoreConfig,
    /// Heal run defaults
    pub heal: HealConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl PlacemendConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, crate::PlacemendError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::PlacemendError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::PlacemendError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Resource ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base URL of the ledger API
    pub endpoint: String,
    /// Microversion sent in the version header
    pub microversion: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8778".to_string(),
            microversion: DEFAULT_LEDGER_MICROVERSION.to_string(),
            timeout_secs: 30,
        }
    }
}

/// Network service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9696".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Accelerator service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:6666".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Workload store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON export of shard contents
    pub snapshot_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("/var/lib/placemend/shards.json"),
        }
    }
}

/// Heal run defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Page size for each workload fetch
    pub batch_size: usize,
    /// Stop after this many changed workloads; unbounded when absent
    pub max_count: Option<usize>,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_count: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// JSON structured logs
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PlacemendConfig::default();
        assert_eq!(config.heal.batch_size, 50);
        assert_eq!(config.heal.max_count, None);
        assert_eq!(config.ledger.microversion, "1.36");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ledger]\nendpoint = \"http://placement:8778\"\n\n[heal]\nbatch_size = 10\nmax_count = 3"
        )
        .unwrap();

        let config = PlacemendConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ledger.endpoint, "http://placement:8778");
        assert_eq!(config.ledger.timeout_secs, 30);
        assert_eq!(config.heal.batch_size, 10);
        assert_eq!(config.heal.max_count, Some(3));
        assert_eq!(config.network.endpoint, "http://127.0.0.1:9696");
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[heal]\nbatch_size = \"many\"").unwrap();
        let err = PlacemendConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, crate::PlacemendError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = PlacemendConfig::from_file(Path::new("/nonexistent/placemend.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
