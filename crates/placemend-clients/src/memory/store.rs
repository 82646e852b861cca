//! In-memory sharded workload store

use async_trait::async_trait;
use placemend_core::{
    ComputeNode, HostAggregate, Migration, PageMarker, PlacemendError, PlacemendResult, Service,
    Shard, ShardId, Workload, WorkloadFilter, WorkloadPage,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::FaultInjector;
use crate::traits::WorkloadStore;

/// Contents of one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardData {
    pub shard: Shard,
    #[serde(default)]
    pub workloads: Vec<Workload>,
    #[serde(default)]
    pub migrations: Vec<Migration>,
    #[serde(default)]
    pub compute_nodes: Vec<ComputeNode>,
}

/// Serializable form of a whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub shards: Vec<ShardData>,
    #[serde(default)]
    pub host_aggregates: Vec<HostAggregate>,
}

/// Workload store kept in memory, one map entry per shard
#[derive(Debug)]
pub struct MemoryStore {
    shards: RwLock<BTreeMap<ShardId, ShardData>>,
    host_aggregates: RwLock<Vec<HostAggregate>>,
    unreachable: RwLock<BTreeSet<ShardId>>,
    faults: FaultInjector,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_snapshot(StoreSnapshot::default())
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let shards = snapshot
            .shards
            .into_iter()
            .map(|data| (data.shard.id, data))
            .collect();
        Self {
            shards: RwLock::new(shards),
            host_aggregates: RwLock::new(snapshot.host_aggregates),
            unreachable: RwLock::new(BTreeSet::new()),
            faults: FaultInjector::new(Service::Store),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            shards: self.shards.read().await.values().cloned().collect(),
            host_aggregates: self.host_aggregates.read().await.clone(),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn add_shard(&self, id: ShardId) {
        self.shards.write().await.insert(
            id,
            ShardData {
                shard: Shard {
                    id,
                    uuid: Uuid::new_v4(),
                    name: format!("cell{}", id),
                },
                workloads: Vec::new(),
                migrations: Vec::new(),
                compute_nodes: Vec::new(),
            },
        );
    }

    /// Insert or replace a workload in its shard
    pub async fn put_workload(&self, workload: Workload) {
        let mut shards = self.shards.write().await;
        if let Some(data) = shards.get_mut(&workload.shard) {
            data.workloads.retain(|w| w.uuid != workload.uuid);
            data.workloads.push(workload);
        }
    }

    pub async fn add_migration(&self, shard: ShardId, migration: Migration) {
        if let Some(data) = self.shards.write().await.get_mut(&shard) {
            data.migrations.push(migration);
        }
    }

    pub async fn add_compute_node(&self, shard: ShardId, node: ComputeNode) {
        if let Some(data) = self.shards.write().await.get_mut(&shard) {
            data.compute_nodes.push(node);
        }
    }

    pub async fn add_host_aggregate(&self, aggregate: HostAggregate) {
        self.host_aggregates.write().await.push(aggregate);
    }

    /// Make a shard fail every query until marked reachable again
    pub async fn set_unreachable(&self, shard: ShardId, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(shard);
        } else {
            set.remove(&shard);
        }
    }

    async fn reachable(&self, shard: ShardId) -> PlacemendResult<()> {
        if self.unreachable.read().await.contains(&shard) {
            return Err(PlacemendError::ShardUnavailable(shard));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_shard(shard: ShardId) -> PlacemendError {
    PlacemendError::NotFound(format!("Shard {}", shard))
}

#[async_trait]
impl WorkloadStore for MemoryStore {
    async fn list_shards(&self) -> PlacemendResult<Vec<Shard>> {
        self.faults.check("list_shards").await?;
        Ok(self
            .shards
            .read()
            .await
            .values()
            .map(|d| d.shard.clone())
            .collect())
    }

    async fn list_workloads(
        &self,
        shard: ShardId,
        filter: &WorkloadFilter,
        after: Option<PageMarker>,
        limit: usize,
    ) -> PlacemendResult<WorkloadPage> {
        self.faults.check("list_workloads").await?;
        self.reachable(shard).await?;
        let shards = self.shards.read().await;
        let data = shards.get(&shard).ok_or_else(|| unknown_shard(shard))?;

        let mut matching: Vec<&Workload> = data
            .workloads
            .iter()
            .filter(|w| filter.matches(w))
            .filter(|w| after.map_or(true, |marker| w.marker() > marker))
            .collect();
        matching.sort_by_key(|w| w.marker());

        let more = matching.len() > limit;
        let workloads: Vec<Workload> = matching.into_iter().take(limit).cloned().collect();
        let next = if more {
            workloads.last().map(|w| w.marker())
        } else {
            None
        };
        Ok(WorkloadPage { workloads, next })
    }

    async fn locate_workload(&self, uuid: Uuid) -> PlacemendResult<Option<ShardId>> {
        self.faults.check("locate_workload").await?;
        Ok(self
            .shards
            .read()
            .await
            .values()
            .find(|d| d.workloads.iter().any(|w| w.uuid == uuid))
            .map(|d| d.shard.id))
    }

    async fn get_workload(&self, shard: ShardId, uuid: Uuid) -> PlacemendResult<Option<Workload>> {
        self.faults.check("get_workload").await?;
        self.reachable(shard).await?;
        let shards = self.shards.read().await;
        let data = shards.get(&shard).ok_or_else(|| unknown_shard(shard))?;
        Ok(data.workloads.iter().find(|w| w.uuid == uuid).cloned())
    }

    async fn migrations_in_progress(&self, shard: ShardId) -> PlacemendResult<Vec<Migration>> {
        self.faults.check("migrations_in_progress").await?;
        self.reachable(shard).await?;
        let shards = self.shards.read().await;
        let data = shards.get(&shard).ok_or_else(|| unknown_shard(shard))?;
        Ok(data
            .migrations
            .iter()
            .filter(|m| m.status.is_in_progress())
            .cloned()
            .collect())
    }

    async fn compute_node(
        &self,
        shard: ShardId,
        host: &str,
        node: &str,
    ) -> PlacemendResult<Option<ComputeNode>> {
        self.faults.check("compute_node").await?;
        self.reachable(shard).await?;
        let shards = self.shards.read().await;
        let data = shards.get(&shard).ok_or_else(|| unknown_shard(shard))?;
        Ok(data
            .compute_nodes
            .iter()
            .find(|n| n.host == host && n.node == node)
            .cloned())
    }

    async fn compute_nodes_for_host(&self, host: &str) -> PlacemendResult<Vec<ComputeNode>> {
        self.faults.check("compute_nodes_for_host").await?;
        let unreachable = self.unreachable.read().await;
        Ok(self
            .shards
            .read()
            .await
            .values()
            .filter(|d| !unreachable.contains(&d.shard.id))
            .flat_map(|d| d.compute_nodes.iter().filter(|n| n.host == host).cloned())
            .collect())
    }

    async fn host_aggregates(&self) -> PlacemendResult<Vec<HostAggregate>> {
        self.faults.check("host_aggregates").await?;
        Ok(self.host_aggregates.read().await.clone())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use placemend_core::{Flavor, MigrationStatus};

    async fn store_with(count: usize) -> (MemoryStore, Vec<Uuid>) {
        let store = MemoryStore::new();
        store.add_shard(ShardId(1)).await;
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..count {
            let mut w = Workload::new(ShardId(1), "host1", Flavor::new("small", 1, 512, 1));
            w.created_at = base + Duration::seconds(i as i64);
            ids.push(w.uuid);
            store.put_workload(w).await;
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_pages_follow_creation_order() {
        let (store, ids) = store_with(5).await;
        let filter = WorkloadFilter::default();

        let first = store.list_workloads(ShardId(1), &filter, None, 2).await.unwrap();
        assert_eq!(first.workloads.len(), 2);
        assert_eq!(first.workloads[0].uuid, ids[0]);
        let next = first.next.unwrap();

        let second = store.list_workloads(ShardId(1), &filter, Some(next), 3).await.unwrap();
        assert_eq!(second.workloads.len(), 3);
        assert_eq!(second.workloads[2].uuid, ids[4]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_shard() {
        let (store, ids) = store_with(1).await;
        store.set_unreachable(ShardId(1), true).await;
        let err = store
            .list_workloads(ShardId(1), &WorkloadFilter::default(), None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, PlacemendError::ShardUnavailable(ShardId(1))));

        // The mapping table still answers while the shard is down
        assert_eq!(store.locate_workload(ids[0]).await.unwrap(), Some(ShardId(1)));
    }

    #[tokio::test]
    async fn test_migrations_in_progress_only() {
        let (store, ids) = store_with(1).await;
        for status in [MigrationStatus::Migrating, MigrationStatus::Confirmed] {
            store
                .add_migration(
                    ShardId(1),
                    Migration {
                        uuid: Uuid::new_v4(),
                        instance_uuid: ids[0],
                        status,
                        source_node: None,
                        dest_node: None,
                    },
                )
                .await;
        }
        let migrations = store.migrations_in_progress(ShardId(1)).await.unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].status, MigrationStatus::Migrating);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_shards() {
        let (store, ids) = store_with(2).await;
        let restored = MemoryStore::from_snapshot(store.snapshot().await);
        let workload = restored.get_workload(ShardId(1), ids[1]).await.unwrap();
        assert!(workload.is_some());
    }
}
