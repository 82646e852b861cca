//! Mirror host aggregate membership into ledger provider aggregates
//!
//! Memberships are only ever added. A provider that belongs to an aggregate
//! the workload store no longer knows about is left alone.

use placemend_clients::{ResourceLedgerClient, WorkloadStore};
use placemend_core::{HostAggregate, PlacemendError};
use tracing::{info, warn};

use crate::report::{SyncRunReport, SyncStatus};

pub struct AggregateSync<'a> {
    ledger: &'a ResourceLedgerClient,
    store: &'a dyn WorkloadStore,
}

impl<'a> AggregateSync<'a> {
    pub fn new(ledger: &'a ResourceLedgerClient, store: &'a dyn WorkloadStore) -> Self {
        Self { ledger, store }
    }

    pub async fn sync(&self) -> SyncRunReport {
        let mut report = SyncRunReport::new();
        let aggregates = match self.store.host_aggregates().await {
            Ok(aggregates) => aggregates,
            Err(e) => {
                warn!(error = %e, "Unable to list host aggregates");
                report.escalate(SyncStatus::ServiceError);
                report
                    .messages
                    .push(format!("Unable to list host aggregates: {}", e));
                return report;
            }
        };

        for aggregate in &aggregates {
            report.aggregates += 1;
            for host in &aggregate.hosts {
                self.sync_host(aggregate, host, &mut report).await;
            }
        }
        report
    }

    async fn sync_host(&self, aggregate: &HostAggregate, host: &str, report: &mut SyncRunReport) {
        let nodes = match self.store.compute_nodes_for_host(host).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(host = %host, error = %e, "Unable to list compute nodes");
                report.escalate(SyncStatus::ServiceError);
                report
                    .messages
                    .push(format!("Unable to list compute nodes for host {}: {}", host, e));
                return;
            }
        };

        let node = match nodes.as_slice() {
            [node] => node,
            [] => {
                report.escalate(SyncStatus::NoComputeNode);
                report
                    .messages
                    .push(format!("Failed to find compute node for host {}", host));
                return;
            }
            _ => {
                report.escalate(SyncStatus::MultipleComputeNodes);
                report.messages.push(format!(
                    "Host {} maps to {} compute nodes; unable to pick a resource provider",
                    host,
                    nodes.len()
                ));
                return;
            }
        };

        match self.ledger.ensure_aggregate(node.uuid, aggregate.uuid).await {
            Ok(true) => {
                info!(
                    host = %host,
                    provider = %node.uuid,
                    aggregate = %aggregate.uuid,
                    "Added provider to aggregate"
                );
                report.added += 1;
                report.messages.push(format!(
                    "Successfully added host ({}) and provider ({}) to aggregate ({})",
                    host, node.uuid, aggregate.uuid
                ));
            }
            Ok(false) => {}
            Err(PlacemendError::NotFound(_)) => {
                report.escalate(SyncStatus::ProviderMissing);
                report.messages.push(format!(
                    "Unable to find matching resource provider record in placement with uuid {} for host {}",
                    node.uuid, host
                ));
            }
            Err(e) => {
                warn!(provider = %node.uuid, error = %e, "Unable to update provider aggregates");
                report.escalate(SyncStatus::LedgerWriteFailed);
                report.messages.push(format!(
                    "Failed to add provider {} to aggregate {}: {}",
                    node.uuid, aggregate.uuid, e
                ));
            }
        }
    }
}
