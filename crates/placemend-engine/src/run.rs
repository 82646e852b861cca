//! Run drivers: turn a scope and options into a finished report
//!
//! One bad workload never stops a heal run. Its error is recorded and the run
//! moves to the next workload; the worst error class decides the run status.

use placemend_clients::{PortBindingClient, ResourceLedgerClient, WorkloadStore};
use placemend_core::{PlacemendError, ResourceProvider, ShardId, Workload, WorkloadFilter};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auditor::OrphanAuditor;
use crate::error::HealError;
use crate::healer::{AllocationHealer, HealOptions, HealOutcome, HealResult, PlannedChange, SkipReason};
use crate::iterator::ShardedInstanceIterator;
use crate::report::{
    AuditRunReport, AuditStatus, HealRunReport, RunStatus, WorkloadReport, WorkloadResult,
};

/// Default page size for shard reads
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Which workloads a heal run looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealScope {
    Workload(Uuid),
    Shard(ShardId),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealRunOptions {
    pub heal: HealOptions,
    /// Stop after this many workloads were healed
    pub max_count: Option<usize>,
    pub batch_size: usize,
}

impl Default for HealRunOptions {
    fn default() -> Self {
        Self {
            heal: HealOptions::default(),
            max_count: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Whether a result counts against `max_count`; dry-run plans do not
fn counts_against_limit(result: &HealResult) -> bool {
    matches!(result, Ok(HealOutcome::Created | HealOutcome::Updated))
}

fn describe(workload: &Workload, result: HealResult) -> WorkloadReport {
    let id = workload.uuid;
    let (result, message) = match result {
        Ok(HealOutcome::Created) => (
            WorkloadResult::Created,
            Some(format!("Successfully created allocations for instance {}.", id)),
        ),
        Ok(HealOutcome::Updated) => (
            WorkloadResult::Updated,
            Some(format!("Successfully updated allocations for instance {}.", id)),
        ),
        Ok(HealOutcome::UpToDate) => (WorkloadResult::UpToDate, None),
        Ok(HealOutcome::NoChange { planned }) => {
            let verb = match planned {
                PlannedChange::Create => "Create",
                PlannedChange::Update => "Update",
            };
            (
                WorkloadResult::Planned,
                Some(format!("[dry-run] {} allocations for instance {}", verb, id)),
            )
        }
        Ok(HealOutcome::Skipped(reason)) => {
            let message = match reason {
                SkipReason::Deleted => format!("Instance {} is deleted.", id),
                SkipReason::TaskInProgress(state) => format!(
                    "Instance {} is undergoing a task state transition: {}",
                    id, state
                ),
                SkipReason::NotOnHost => format!("Instance {} is not on a host.", id),
            };
            (WorkloadResult::Skipped, Some(message))
        }
        Err(e) => (WorkloadResult::Failed, Some(e.to_string())),
    };
    WorkloadReport {
        workload: id,
        shard: workload.shard,
        result,
        message,
    }
}

/// Heal run over a scope of workloads
pub struct HealRun<'a> {
    ledger: &'a ResourceLedgerClient,
    ports: &'a PortBindingClient,
    store: &'a dyn WorkloadStore,
}

impl<'a> HealRun<'a> {
    pub fn new(
        ledger: &'a ResourceLedgerClient,
        ports: &'a PortBindingClient,
        store: &'a dyn WorkloadStore,
    ) -> Self {
        Self {
            ledger,
            ports,
            store,
        }
    }

    pub async fn heal(&self, scope: HealScope, options: &HealRunOptions) -> HealRunReport {
        info!(scope = ?scope, dry_run = options.heal.dry_run, "Starting heal run");
        let mut report = HealRunReport::new();

        match scope {
            HealScope::Workload(uuid) => self.heal_one(uuid, options, &mut report).await,
            HealScope::Shard(shard) => match self.store.list_shards().await {
                Ok(shards) if shards.iter().any(|s| s.id == shard) => {
                    self.heal_shards(vec![shard], options, &mut report).await
                }
                Ok(_) => fail(&mut report, HealError::NotFound(format!("Cell {} not found.", shard))),
                Err(e) => fail(&mut report, HealError::StoreUnavailable(e.to_string())),
            },
            HealScope::All => match self.store.list_shards().await {
                Ok(shards) => {
                    let ids = shards.iter().map(|s| s.id).collect();
                    self.heal_shards(ids, options, &mut report).await
                }
                Err(e) => fail(&mut report, HealError::StoreUnavailable(e.to_string())),
            },
        }

        self.finish(&mut report);
        report
    }

    async fn heal_one(&self, uuid: Uuid, options: &HealRunOptions, report: &mut HealRunReport) {
        let shard = match self.store.locate_workload(uuid).await {
            Ok(Some(shard)) => shard,
            Ok(None) => {
                return fail(
                    report,
                    HealError::NotFound(format!(
                        "Unable to find cell for instance {}, is it mapped?",
                        uuid
                    )),
                )
            }
            Err(e) => return fail(report, HealError::StoreUnavailable(e.to_string())),
        };

        let workload = match self.store.get_workload(shard, uuid).await {
            Ok(Some(workload)) => workload,
            Ok(None) => {
                return fail(
                    report,
                    HealError::NotFound(format!("Instance {} not found.", uuid)),
                )
            }
            Err(PlacemendError::ShardUnavailable(shard)) => {
                report.unreachable_shards.push(shard);
                return;
            }
            Err(e) => return fail(report, HealError::StoreUnavailable(e.to_string())),
        };

        let healer = AllocationHealer::new(self.ledger, self.ports, self.store);
        let result = healer.heal(&workload, &options.heal).await;
        record(report, &workload, result);
    }

    async fn heal_shards(
        &self,
        shards: Vec<ShardId>,
        options: &HealRunOptions,
        report: &mut HealRunReport,
    ) {
        let healer = AllocationHealer::new(self.ledger, self.ports, self.store);
        let mut iter = ShardedInstanceIterator::new(
            self.store,
            shards,
            WorkloadFilter::default(),
            options.batch_size,
            options.max_count,
        );

        while let Some(workload) = iter.next().await {
            let result = healer.heal(&workload, &options.heal).await;
            if !counts_against_limit(&result) {
                iter.release();
            }
            record(report, &workload, result);
        }

        report.truncated = iter.limit_reached();
        if report.truncated {
            info!(
                max_count = ?options.max_count,
                more_remaining = iter.has_more().await,
                "Stopped at max count"
            );
        }
        report
            .unreachable_shards
            .extend_from_slice(iter.unreachable_shards());
    }

    fn finish(&self, report: &mut HealRunReport) {
        let healed = report.healed();
        if healed == 0 {
            report.escalate(RunStatus::NothingToDo);
        }

        for shard in report.unreachable_shards.clone() {
            report.escalate(RunStatus::ServiceUnavailable);
            report.messages.push(format!(
                "Unable to reach cell {}; its instances were not processed.",
                shard
            ));
        }

        if report.truncated {
            report.escalate(RunStatus::MaxCountReached);
            report
                .messages
                .push(format!("Max count reached. Processed {} instances.", healed));
        } else {
            report.messages.push(format!("Processed {} instances.", healed));
            if healed == 0 && report.failed == 0 && report.status == RunStatus::NothingToDo {
                report.messages.push("Nothing to be healed.".to_string());
            }
        }

        info!(
            status = ?report.status,
            processed = report.processed,
            healed = healed,
            failed = report.failed,
            "Heal run finished"
        );
    }
}

fn record(report: &mut HealRunReport, workload: &Workload, result: HealResult) {
    if let Err(e) = &result {
        warn!(workload_id = %workload.uuid, error = %e, "Failed to heal workload");
        report.escalate(e.status());
    }
    report.record(describe(workload, result));
}

/// A failure before any workload could be looked at
fn fail(report: &mut HealRunReport, error: HealError) {
    warn!(error = %error, "Heal run failed");
    report.escalate(error.status());
    report.messages.push(error.to_string());
}

/// Which providers an audit looks at
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AuditScope {
    All,
    /// A provider name or uuid
    Provider(String),
}

pub struct AuditRun<'a> {
    ledger: &'a ResourceLedgerClient,
    store: &'a dyn WorkloadStore,
    batch_size: usize,
}

impl<'a> AuditRun<'a> {
    pub fn new(
        ledger: &'a ResourceLedgerClient,
        store: &'a dyn WorkloadStore,
        batch_size: usize,
    ) -> Self {
        Self {
            ledger,
            store,
            batch_size,
        }
    }

    pub async fn audit(&self, scope: &AuditScope, delete: bool) -> AuditRunReport {
        info!(scope = ?scope, delete = delete, "Starting audit");
        let mut report = AuditRunReport::new();

        let providers = match self.providers(scope).await {
            Ok(providers) => providers,
            Err(PlacemendError::NotFound(_)) => {
                report.escalate(AuditStatus::ProviderNotFound);
                let name = match scope {
                    AuditScope::Provider(name) => name.as_str(),
                    AuditScope::All => "",
                };
                report
                    .messages
                    .push(format!("Resource provider {} not found.", name));
                return report;
            }
            Err(e) => {
                report.escalate(AuditStatus::Error);
                report
                    .messages
                    .push(format!("Unable to list resource providers: {}", e));
                return report;
            }
        };

        let shards: Vec<ShardId> = match self.store.list_shards().await {
            Ok(shards) => shards.into_iter().map(|s| s.id).collect(),
            Err(e) => {
                report.escalate(AuditStatus::Error);
                report.messages.push(format!("Unable to list cells: {}", e));
                return report;
            }
        };

        let auditor = OrphanAuditor::new(self.ledger, self.store, self.batch_size);
        let scan = auditor.scan(&shards, &providers).await;
        report.allocations_checked = scan.allocations_checked;
        report.unreachable_shards = scan.unreachable_shards.clone();

        if !scan.errors.is_empty() {
            report.escalate(AuditStatus::Error);
            report.messages.extend(scan.errors.iter().cloned());
        }
        for shard in &scan.unreachable_shards {
            report.escalate(AuditStatus::Error);
            report
                .messages
                .push(format!("Unable to reach cell {}.", shard));
        }

        if !scan.orphans.is_empty() {
            report.escalate(AuditStatus::OrphansFound);
        }

        if delete && !scan.orphans.is_empty() {
            if scan.is_complete() {
                let summary = auditor.delete(&scan.orphans).await;
                for orphan in &summary.deleted {
                    report.messages.push(format!(
                        "Deleted allocations for consumer UUID {} on Resource Provider {}",
                        orphan.consumer, orphan.provider
                    ));
                }
                for (orphan, error) in &summary.failed {
                    report.escalate(AuditStatus::Error);
                    report.messages.push(format!(
                        "Unable to delete allocations for consumer UUID {} on Resource Provider {}: {}",
                        orphan.consumer, orphan.provider, error
                    ));
                }
                report.deleted = summary.deleted.len();
                if report.deleted > 0 {
                    report.escalate(AuditStatus::OrphansDeleted);
                }
            } else {
                warn!(
                    unreachable = scan.unreachable_shards.len(),
                    "Refusing to delete allocations with unreachable cells"
                );
                report.escalate(AuditStatus::Error);
                report.messages.push(
                    "Refusing to delete allocations while some cells are unreachable."
                        .to_string(),
                );
            }
        } else {
            for orphan in &scan.orphans {
                report.messages.push(format!(
                    "Allocations for consumer UUID {} on Resource Provider {} can be deleted",
                    orphan.consumer, orphan.provider
                ));
            }
        }

        report.orphans = scan.orphans;
        report.messages.push(format!(
            "Processed {} allocation(s).",
            report.allocations_checked
        ));
        debug!(status = ?report.status, "Audit finished");
        report
    }

    async fn providers(&self, scope: &AuditScope) -> Result<Vec<ResourceProvider>, PlacemendError> {
        match scope {
            AuditScope::All => self.ledger.list_providers().await,
            AuditScope::Provider(name) => Ok(vec![self.ledger.find_provider(name).await?]),
        }
    }
}
