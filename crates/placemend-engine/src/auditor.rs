//! Orphaned allocation detection and removal
//!
//! A consumer holding allocations against a provider is orphaned when no live
//! workload and no in-progress migration carries its uuid in any shard.
//! Scanning only reads. Deleting is a separate call that takes the records a
//! scan returned.

use placemend_clients::{ResourceLedgerClient, WorkloadStore};
use placemend_core::{PlacemendError, ResourceProvider, Resources, ShardId, WorkloadFilter};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::iterator::ShardedInstanceIterator;

/// A consumer's allocations against one provider with no owner behind them
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanRecord {
    pub consumer: Uuid,
    pub provider: Uuid,
    pub provider_name: String,
    pub resources: Resources,
}

/// What a scan found
#[derive(Debug, Default)]
pub struct AuditScan {
    pub orphans: Vec<OrphanRecord>,
    /// Consumer/provider pairs looked at
    pub allocations_checked: usize,
    pub unreachable_shards: Vec<ShardId>,
    /// Ledger failures, one line per provider
    pub errors: Vec<String>,
}

impl AuditScan {
    /// Whether the live set was built from every shard
    pub fn is_complete(&self) -> bool {
        self.unreachable_shards.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DeleteSummary {
    pub deleted: Vec<OrphanRecord>,
    pub failed: Vec<(OrphanRecord, String)>,
}

pub struct OrphanAuditor<'a> {
    ledger: &'a ResourceLedgerClient,
    store: &'a dyn WorkloadStore,
    batch_size: usize,
}

impl<'a> OrphanAuditor<'a> {
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

    /// Find orphaned allocations against `providers`
    pub async fn scan(&self, shards: &[ShardId], providers: &[ResourceProvider]) -> AuditScan {
        let mut scan = AuditScan::default();
        let live = self.live_consumers(shards, &mut scan).await;

        for provider in providers {
            let consumers = match self.ledger.provider_consumers(provider.uuid).await {
                Ok(consumers) => consumers,
                Err(e) => {
                    warn!(provider = %provider.uuid, error = %e, "Unable to list provider allocations");
                    scan.errors.push(format!(
                        "Unable to list allocations of resource provider {}: {}",
                        provider.uuid, e
                    ));
                    continue;
                }
            };

            for (consumer, resources) in consumers {
                scan.allocations_checked += 1;
                if live.contains(&consumer) {
                    continue;
                }
                debug!(consumer = %consumer, provider = %provider.uuid, "Orphaned allocation");
                scan.orphans.push(OrphanRecord {
                    consumer,
                    provider: provider.uuid,
                    provider_name: provider.name.clone(),
                    resources,
                });
            }
        }
        scan
    }

    /// Remove each record's provider share from its consumer's allocations
    pub async fn delete(&self, orphans: &[OrphanRecord]) -> DeleteSummary {
        let mut summary = DeleteSummary::default();
        for orphan in orphans {
            match self
                .ledger
                .remove_provider_allocation(orphan.consumer, orphan.provider)
                .await
            {
                Ok(false) => {
                    debug!(consumer = %orphan.consumer, "Allocation already gone");
                }
                Ok(true) => {
                    info!(
                        consumer = %orphan.consumer,
                        provider = %orphan.provider,
                        "Deleted orphaned allocation"
                    );
                    summary.deleted.push(orphan.clone());
                }
                Err(e) => {
                    warn!(consumer = %orphan.consumer, error = %e, "Unable to delete allocation");
                    summary.failed.push((orphan.clone(), e.to_string()));
                }
            }
        }
        summary
    }

    /// Uuids of live workloads and in-progress migrations across shards
    async fn live_consumers(&self, shards: &[ShardId], scan: &mut AuditScan) -> HashSet<Uuid> {
        let mut live = HashSet::new();
        let mut iter = ShardedInstanceIterator::new(
            self.store,
            shards.to_vec(),
            WorkloadFilter::default(),
            self.batch_size,
            None,
        );
        while let Some(workload) = iter.next().await {
            live.insert(workload.uuid);
        }
        scan.unreachable_shards
            .extend_from_slice(iter.unreachable_shards());

        for shard in shards {
            if scan.unreachable_shards.contains(shard) {
                continue;
            }
            match self.store.migrations_in_progress(*shard).await {
                Ok(migrations) => live.extend(migrations.iter().map(|m| m.uuid)),
                Err(e) => {
                    warn!(shard = %shard, error = %e, "Unable to list migrations");
                    if !matches!(e, PlacemendError::ShardUnavailable(_)) {
                        scan.errors.push(format!(
                            "Unable to list migrations of shard {}: {}",
                            shard, e
                        ));
                    }
                    scan.unreachable_shards.push(*shard);
                }
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placemend_clients::memory::{MemoryLedger, MemoryStore};
    use placemend_core::resource_class::*;
    use placemend_core::{AllocationRecord, Flavor, Migration, MigrationStatus, Workload};
    use std::sync::Arc;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        store: MemoryStore,
        client: ResourceLedgerClient,
        node: Uuid,
    }

    impl Fixture {
        async fn new() -> Self {
            let ledger = Arc::new(MemoryLedger::new());
            let node = ledger.add_provider("host1", None).await;
            let store = MemoryStore::new();
            store.add_shard(ShardId(1)).await;
            store.add_shard(ShardId(2)).await;
            Self {
                client: ResourceLedgerClient::new(ledger.clone()),
                ledger,
                store,
                node,
            }
        }

        async fn allocate(&self, consumer: Uuid) {
            let mut record = AllocationRecord::new("p", "u");
            record.add(self.node, &[(VCPU.to_string(), 1)].into_iter().collect());
            self.ledger.seed_allocations(consumer, record).await;
        }

        async fn workload(&self, shard: ShardId) -> Uuid {
            let workload = Workload::new(shard, "host1", Flavor::new("small", 1, 512, 1));
            let uuid = workload.uuid;
            self.store.put_workload(workload).await;
            self.allocate(uuid).await;
            uuid
        }

        async fn migration(&self, status: MigrationStatus) -> Uuid {
            let uuid = Uuid::new_v4();
            self.store
                .add_migration(
                    ShardId(2),
                    Migration {
                        uuid,
                        instance_uuid: Uuid::new_v4(),
                        status,
                        source_node: Some("host1".to_string()),
                        dest_node: Some("host2".to_string()),
                    },
                )
                .await;
            self.allocate(uuid).await;
            uuid
        }

        fn auditor(&self) -> OrphanAuditor<'_> {
            OrphanAuditor::new(&self.client, &self.store, 10)
        }

        async fn providers(&self) -> Vec<ResourceProvider> {
            self.client.list_providers().await.unwrap()
        }
    }

    const SHARDS: [ShardId; 2] = [ShardId(1), ShardId(2)];

    #[tokio::test]
    async fn test_live_workloads_and_migrations_are_not_orphans() {
        let fx = Fixture::new().await;
        fx.workload(ShardId(1)).await;
        fx.workload(ShardId(2)).await;
        fx.migration(MigrationStatus::Migrating).await;

        let scan = fx.auditor().scan(&SHARDS, &fx.providers().await).await;
        assert!(scan.orphans.is_empty());
        assert_eq!(scan.allocations_checked, 3);
        assert!(scan.is_complete());
    }

    #[tokio::test]
    async fn test_finds_unowned_and_finished_consumers() {
        let fx = Fixture::new().await;
        fx.workload(ShardId(1)).await;
        let stray = Uuid::new_v4();
        fx.allocate(stray).await;
        let finished = fx.migration(MigrationStatus::Confirmed).await;

        let mut deleted = Workload::new(ShardId(1), "host1", Flavor::new("small", 1, 512, 1));
        deleted.deleted = true;
        let gone = deleted.uuid;
        fx.store.put_workload(deleted).await;
        fx.allocate(gone).await;

        let scan = fx.auditor().scan(&SHARDS, &fx.providers().await).await;
        let mut found: Vec<Uuid> = scan.orphans.iter().map(|o| o.consumer).collect();
        found.sort();
        let mut expected = vec![stray, finished, gone];
        expected.sort();
        assert_eq!(found, expected);
        assert!(scan.orphans.iter().all(|o| o.provider_name == "host1"));
    }

    #[tokio::test]
    async fn test_scan_never_writes() {
        let fx = Fixture::new().await;
        fx.allocate(Uuid::new_v4()).await;
        let scan = fx.auditor().scan(&SHARDS, &fx.providers().await).await;
        assert_eq!(scan.orphans.len(), 1);
        assert_eq!(fx.ledger.faults().calls("put_allocations").await, 0);
        assert_eq!(fx.ledger.faults().calls("delete_allocations").await, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_only_the_provider_share() {
        let fx = Fixture::new().await;
        let other = fx.ledger.add_provider("host2", None).await;
        let stray = Uuid::new_v4();
        let mut record = AllocationRecord::new("p", "u");
        record.add(fx.node, &[(VCPU.to_string(), 1)].into_iter().collect());
        record.add(other, &[(VCPU.to_string(), 2)].into_iter().collect());
        fx.ledger.seed_allocations(stray, record).await;

        let providers: Vec<ResourceProvider> = fx
            .providers()
            .await
            .into_iter()
            .filter(|p| p.uuid == fx.node)
            .collect();
        let auditor = fx.auditor();
        let scan = auditor.scan(&SHARDS, &providers).await;
        assert_eq!(scan.orphans.len(), 1);

        let summary = auditor.delete(&scan.orphans).await;
        assert_eq!(summary.deleted.len(), 1);
        assert!(summary.failed.is_empty());

        let left = fx.ledger.allocations(stray).await.unwrap();
        assert!(left.provider_resources(&fx.node).is_none());
        assert!(left.provider_resources(&other).is_some());
    }

    #[tokio::test]
    async fn test_unreachable_shard_is_reported() {
        let fx = Fixture::new().await;
        let hidden = fx.workload(ShardId(2)).await;
        fx.store.set_unreachable(ShardId(2), true).await;

        let scan = fx.auditor().scan(&SHARDS, &fx.providers().await).await;
        assert_eq!(scan.unreachable_shards, vec![ShardId(2)]);
        assert!(!scan.is_complete());
        // Its workloads look orphaned, which is why deletion must be refused
        assert_eq!(scan.orphans[0].consumer, hidden);
    }

    #[tokio::test]
    async fn test_ledger_failure_is_an_error_line() {
        let fx = Fixture::new().await;
        fx.allocate(Uuid::new_v4()).await;
        fx.ledger
            .faults()
            .fail_always("get_provider_allocations")
            .await;

        let scan = fx.auditor().scan(&SHARDS, &fx.providers().await).await;
        assert_eq!(scan.errors.len(), 1);
        assert!(scan.orphans.is_empty());
    }
}
