//! Workload, Flavor, Shard and Migration type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::allocation::{resource_class, Resources};
use crate::extra_specs::{self, SpecPrefix};

/// Extra spec selecting dedicated (PCPU) instead of shared (VCPU) CPUs
pub const CPU_POLICY_KEY: &str = "hw:cpu_policy";
/// Extra spec naming an accelerator device profile
pub const DEVICE_PROFILE_KEY: &str = "accel:device_profile";

/// Identifier of one independently stored partition of workload records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shard (cell) of the workload store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub uuid: Uuid,
    pub name: String,
}

/// Resource quantities and extra specifications of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub root_gb: u64,
    #[serde(default)]
    pub ephemeral_gb: u64,
    #[serde(default)]
    pub swap_mb: u64,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl Flavor {
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mb: u64, root_gb: u64) -> Self {
        Self {
            name: name.into(),
            vcpus,
            memory_mb,
            root_gb,
            ephemeral_gb: 0,
            swap_mb: 0,
            extra_specs: BTreeMap::new(),
        }
    }

    /// Whether the CPU policy asks for dedicated host CPUs
    pub fn dedicated_cpus(&self) -> bool {
        self.extra_specs
            .get(CPU_POLICY_KEY)
            .map_or(false, |policy| policy == "dedicated")
    }

    /// The accelerator device profile this flavor requests, if any
    pub fn device_profile(&self) -> Option<&str> {
        self.extra_specs
            .get(DEVICE_PROFILE_KEY)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Whether any request group asks for a non-zero amount of VGPU
    pub fn requests_vgpu(&self) -> bool {
        self.extra_specs.iter().any(|(key, value)| {
            extra_specs::parse_key(key).map_or(false, |k| {
                k.prefix == SpecPrefix::Resources
                    && k.name == resource_class::VGPU
                    && value.trim().parse::<u64>().map_or(false, |n| n > 0)
            })
        })
    }

    /// Resources a workload of this flavor consumes on its compute node
    ///
    /// Root disk is not claimed for volume-backed workloads. Unsuffixed
    /// `resources:<RC>` extra specs override the computed amounts, and a zero
    /// override removes the class.
    pub fn resources(&self, volume_backed: bool) -> Resources {
        let mut resources = Resources::new();

        let cpu_class = if self.dedicated_cpus() {
            resource_class::PCPU
        } else {
            resource_class::VCPU
        };
        resources.insert(cpu_class.to_string(), u64::from(self.vcpus));
        resources.insert(resource_class::MEMORY_MB.to_string(), self.memory_mb);

        let root = if volume_backed { 0 } else { self.root_gb };
        let swap_gb = (self.swap_mb + 1023) / 1024;
        resources.insert(
            resource_class::DISK_GB.to_string(),
            root + self.ephemeral_gb + swap_gb,
        );

        for (key, value) in &self.extra_specs {
            let Some(parsed) = extra_specs::parse_key(key) else {
                continue;
            };
            if parsed.prefix != SpecPrefix::Resources || !parsed.is_unsuffixed() {
                continue;
            }
            if let Ok(amount) = value.trim().parse::<u64>() {
                resources.insert(parsed.name.to_string(), amount);
            }
        }

        resources.retain(|_, amount| *amount > 0);
        resources
    }
}

/// One compute instance as seen from its shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub uuid: Uuid,
    pub shard: ShardId,
    pub project_id: String,
    pub user_id: String,
    /// Compute host; `None` when the workload is not scheduled
    pub host: Option<String>,
    /// Hypervisor node on the host
    pub node: Option<String>,
    pub flavor: Flavor,
    /// Lifecycle transition in progress, if any
    #[serde(default)]
    pub task_state: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    /// Boots from a volume, so root disk is not claimed locally
    #[serde(default)]
    pub volume_backed: bool,
    /// Attached port ids, in attachment order
    #[serde(default)]
    pub interfaces: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Workload {
    /// Create a scheduled workload with default ownership
    pub fn new(shard: ShardId, host: &str, flavor: Flavor) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            shard,
            project_id: "project".to_string(),
            user_id: "user".to_string(),
            host: Some(host.to_string()),
            node: Some(host.to_string()),
            flavor,
            task_state: None,
            deleted: false,
            volume_backed: false,
            interfaces: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Position of this workload in its shard's creation order
    pub fn marker(&self) -> PageMarker {
        PageMarker {
            created_at: self.created_at,
            uuid: self.uuid,
        }
    }

    pub fn device_profile(&self) -> Option<&str> {
        self.flavor.device_profile()
    }
}

/// Creation-order position within a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageMarker {
    pub created_at: DateTime<Utc>,
    pub uuid: Uuid,
}

/// Filters applied by the store when listing workloads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadFilter {
    /// Include soft-deleted records
    pub include_deleted: bool,
    /// Only workloads on this host
    pub host: Option<String>,
}

impl WorkloadFilter {
    pub fn matches(&self, workload: &Workload) -> bool {
        if workload.deleted && !self.include_deleted {
            return false;
        }
        match &self.host {
            Some(host) => workload.host.as_deref() == Some(host.as_str()),
            None => true,
        }
    }
}

/// One page of workloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadPage {
    pub workloads: Vec<Workload>,
    /// Marker to resume after; `None` when the shard is exhausted
    pub next: Option<PageMarker>,
}

/// Migration status as recorded by the lifecycle subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    Accepted,
    PreMigrating,
    Migrating,
    PostMigrating,
    Finished,
    Confirming,
    Reverting,
    Confirmed,
    Reverted,
    Completed,
    Done,
    Error,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    /// Whether allocations may still legitimately be held by the migration
    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self,
            MigrationStatus::Confirmed
                | MigrationStatus::Reverted
                | MigrationStatus::Completed
                | MigrationStatus::Done
                | MigrationStatus::Error
                | MigrationStatus::Failed
                | MigrationStatus::Cancelled
        )
    }
}

/// A move operation; its uuid is a ledger consumer while it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub uuid: Uuid,
    pub instance_uuid: Uuid,
    pub status: MigrationStatus,
    #[serde(default)]
    pub source_node: Option<String>,
    #[serde(default)]
    pub dest_node: Option<String>,
}

/// A compute node record and its provider in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub uuid: Uuid,
    pub host: String,
    pub node: String,
}

/// A host aggregate mirrored into ledger provider aggregates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAggregate {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}
