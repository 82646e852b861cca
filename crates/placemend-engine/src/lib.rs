//! placemend-engine: Allocation reconciliation
//!
//! This crate provides:
//! - Sharded, bounded workload iteration
//! - Ordered multi-service writes with compensating rollback
//! - The allocation healer and its run driver
//! - Orphaned allocation audit
//! - Host aggregate sync into the ledger

pub mod aggregates;
pub mod auditor;
pub mod error;
pub mod healer;
pub mod iterator;
pub mod report;
pub mod run;
pub mod transaction;

pub use aggregates::AggregateSync;
pub use auditor::{AuditScan, DeleteSummary, OrphanAuditor, OrphanRecord};
pub use error::HealError;
pub use healer::{AllocationHealer, HealOptions, HealOutcome, HealResult, PlannedChange, SkipReason};
pub use iterator::{ShardCursor, ShardedInstanceIterator};
pub use report::*;
pub use run::{AuditRun, AuditScope, HealRun, HealRunOptions, HealScope, DEFAULT_BATCH_SIZE};
pub use transaction::{CompensationFailure, MultiResourceTransaction, Step, TransactionOutcome};
