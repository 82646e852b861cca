//! Run reports and exit statuses
//!
//! Each command produces one report. A report carries a status whose `code()`
//! becomes the process exit code. When several conditions apply the most
//! severe one wins; severity is the declaration order of the status enums,
//! which is not the same as numeric code order.

use placemend_core::ShardId;
use serde::Serialize;
use uuid::Uuid;

use crate::auditor::OrphanRecord;

/// Outcome class of a heal run, least severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one workload was healed
    Healed,
    /// Nothing needed healing
    NothingToDo,
    /// Stopped at `max_count` with candidates left
    MaxCountReached,
    /// A workload uses a shape the healer does not handle
    Unsupported,
    /// No single allocation candidate for the ports of a workload
    AllocationFailed,
    /// The ledger or the workload store could not be reached
    ServiceUnavailable,
    PortQueryFailed,
    PortUpdateFailed,
    ComputeNodeNotFound,
    /// Rollback failed; ports need manual cleanup
    ManualCleanupRequired,
    /// The requested workload is unknown
    NotFound,
}

impl RunStatus {
    pub fn code(&self) -> i32 {
        match self {
            RunStatus::Healed => 0,
            RunStatus::MaxCountReached => 1,
            RunStatus::ComputeNodeNotFound => 2,
            RunStatus::AllocationFailed | RunStatus::ServiceUnavailable => 3,
            RunStatus::NothingToDo => 4,
            RunStatus::PortQueryFailed => 5,
            RunStatus::PortUpdateFailed => 6,
            RunStatus::ManualCleanupRequired => 7,
            RunStatus::Unsupported => 8,
            RunStatus::NotFound => 127,
        }
    }
}

/// What happened to one workload during a heal run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadResult {
    Created,
    Updated,
    UpToDate,
    /// Dry run found a change to make
    Planned,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub workload: Uuid,
    pub shard: ShardId,
    pub result: WorkloadResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Summary of a heal run
#[derive(Debug, Clone, Serialize)]
pub struct HealRunReport {
    pub status: RunStatus,
    /// Workloads examined
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub up_to_date: usize,
    pub planned: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Stopped because `max_count` workloads were healed
    pub truncated: bool,
    pub unreachable_shards: Vec<ShardId>,
    pub workloads: Vec<WorkloadReport>,
    /// Operator-facing lines, in the order they were produced
    pub messages: Vec<String>,
}

impl HealRunReport {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Healed,
            processed: 0,
            created: 0,
            updated: 0,
            up_to_date: 0,
            planned: 0,
            skipped: 0,
            failed: 0,
            truncated: false,
            unreachable_shards: Vec::new(),
            workloads: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Workloads whose allocations were written; dry-run plans are not counted
    pub fn healed(&self) -> usize {
        self.created + self.updated
    }

    pub fn record(&mut self, report: WorkloadReport) {
        self.processed += 1;
        match report.result {
            WorkloadResult::Created => self.created += 1,
            WorkloadResult::Updated => self.updated += 1,
            WorkloadResult::UpToDate => self.up_to_date += 1,
            WorkloadResult::Planned => self.planned += 1,
            WorkloadResult::Skipped => self.skipped += 1,
            WorkloadResult::Failed => self.failed += 1,
        }
        if let Some(message) = &report.message {
            self.messages.push(message.clone());
        }
        self.workloads.push(report);
    }

    /// Raise the status to `status` if it is more severe
    pub fn escalate(&mut self, status: RunStatus) {
        self.status = self.status.max(status);
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code()
    }
}

impl Default for HealRunReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome class of an audit run, least severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    NoOrphans,
    OrphansFound,
    OrphansDeleted,
    Error,
    ProviderNotFound,
}

impl AuditStatus {
    pub fn code(&self) -> i32 {
        match self {
            AuditStatus::NoOrphans => 0,
            AuditStatus::Error => 1,
            AuditStatus::OrphansFound => 3,
            AuditStatus::OrphansDeleted => 4,
            AuditStatus::ProviderNotFound => 127,
        }
    }
}

/// Summary of an orphan audit
#[derive(Debug, Clone, Serialize)]
pub struct AuditRunReport {
    pub status: AuditStatus,
    pub orphans: Vec<OrphanRecord>,
    pub deleted: usize,
    pub allocations_checked: usize,
    pub unreachable_shards: Vec<ShardId>,
    pub messages: Vec<String>,
}

impl AuditRunReport {
    pub fn new() -> Self {
        Self {
            status: AuditStatus::NoOrphans,
            orphans: Vec::new(),
            deleted: 0,
            allocations_checked: 0,
            unreachable_shards: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn escalate(&mut self, status: AuditStatus) {
        self.status = self.status.max(status);
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code()
    }
}

impl Default for AuditRunReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome class of an aggregate sync, least severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Ok,
    /// Adding a provider to an aggregate failed
    LedgerWriteFailed,
    /// A host in an aggregate has no compute node
    NoComputeNode,
    /// A compute node has no resource provider
    ProviderMissing,
    /// A host maps to several compute nodes
    MultipleComputeNodes,
    /// Listing aggregates, nodes or providers failed
    ServiceError,
}

impl SyncStatus {
    pub fn code(&self) -> i32 {
        match self {
            SyncStatus::Ok => 0,
            SyncStatus::MultipleComputeNodes => 1,
            SyncStatus::ServiceError => 2,
            SyncStatus::LedgerWriteFailed => 3,
            SyncStatus::NoComputeNode => 5,
            SyncStatus::ProviderMissing => 6,
        }
    }
}

/// Summary of a host aggregate sync
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunReport {
    pub status: SyncStatus,
    pub aggregates: usize,
    /// Provider memberships added
    pub added: usize,
    pub messages: Vec<String>,
}

impl SyncRunReport {
    pub fn new() -> Self {
        Self {
            status: SyncStatus::Ok,
            aggregates: 0,
            added: 0,
            messages: Vec::new(),
        }
    }

    pub fn escalate(&mut self, status: SyncStatus) {
        self.status = self.status.max(status);
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code()
    }
}

impl Default for SyncRunReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_precedence_is_not_code_order() {
        let mut report = HealRunReport::new();
        report.escalate(RunStatus::NothingToDo);
        report.escalate(RunStatus::Healed);
        assert_eq!(report.exit_code(), 4);

        report.escalate(RunStatus::MaxCountReached);
        assert_eq!(report.exit_code(), 1);

        report.escalate(RunStatus::ComputeNodeNotFound);
        report.escalate(RunStatus::PortQueryFailed);
        assert_eq!(report.status, RunStatus::ComputeNodeNotFound);
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn test_record_counts_results() {
        let mut report = HealRunReport::new();
        for result in [
            WorkloadResult::Created,
            WorkloadResult::Updated,
            WorkloadResult::UpToDate,
            WorkloadResult::Planned,
            WorkloadResult::Failed,
        ] {
            report.record(WorkloadReport {
                workload: Uuid::new_v4(),
                shard: ShardId(1),
                result,
                message: None,
            });
        }
        assert_eq!(report.processed, 5);
        assert_eq!(report.healed(), 2);
        assert_eq!(report.planned, 1);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_new_report_starts_healed() {
        let mut report = HealRunReport::new();
        assert_eq!(report.status, RunStatus::Healed);
        assert_eq!(report.exit_code(), 0);

        report.escalate(RunStatus::NothingToDo);
        assert_eq!(report.exit_code(), 4);
        report.escalate(RunStatus::Healed);
        assert_eq!(report.exit_code(), 4);
    }

    #[test]
    fn test_audit_status_precedence() {
        let mut report = AuditRunReport::new();
        report.escalate(AuditStatus::OrphansDeleted);
        report.escalate(AuditStatus::OrphansFound);
        assert_eq!(report.exit_code(), 4);
        report.escalate(AuditStatus::Error);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::ManualCleanupRequired).unwrap();
        assert_eq!(json, "\"manual_cleanup_required\"");
    }
}
