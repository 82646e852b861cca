//! CLI commands implementation

use anyhow::Result;
use placemend_clients::http::{HttpAccelerator, HttpNetwork, HttpPlacement};
use placemend_clients::memory::MemoryStore;
use placemend_clients::snapshot::open_snapshot;
use placemend_clients::{
    AcceleratorService, DeviceBindingClient, LedgerService, NetworkService, PortBindingClient,
    ResourceLedgerClient,
};
use placemend_core::{AcceleratorRequest, PlacemendConfig};
use placemend_engine::{
    AggregateSync, AuditRun, AuditRunReport, AuditScope, HealRun, HealRunOptions, HealRunReport,
    HealScope, SyncRunReport,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Clients for every service a command may talk to
pub struct Services {
    pub ledger: ResourceLedgerClient,
    pub ports: PortBindingClient,
    pub devices: DeviceBindingClient,
    pub store: MemoryStore,
}

impl Services {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        network: Arc<dyn NetworkService>,
        accelerator: Arc<dyn AcceleratorService>,
        store: MemoryStore,
    ) -> Self {
        Self {
            ledger: ResourceLedgerClient::new(ledger),
            ports: PortBindingClient::new(network),
            devices: DeviceBindingClient::new(accelerator),
            store,
        }
    }

    /// HTTP backends from config, with the workload store read from its snapshot
    pub async fn connect(config: &PlacemendConfig) -> Result<Self> {
        let ledger = Arc::new(HttpPlacement::new(&config.ledger)?);
        let network = Arc::new(HttpNetwork::new(&config.network)?);
        let accelerator = Arc::new(HttpAccelerator::new(&config.accelerator)?);
        let store = open_snapshot(&config.store.snapshot_path).await?;
        debug!(
            ledger = %config.ledger.endpoint,
            network = %config.network.endpoint,
            "Connected service clients"
        );
        Ok(Self::new(ledger, network, accelerator, store))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_heal(report: &HealRunReport) {
    for message in &report.messages {
        println!("{}", message);
    }
    println!(
        "Processed {} instance(s): {} created, {} updated, {} up to date, {} skipped, {} failed",
        report.processed,
        report.created,
        report.updated,
        report.up_to_date,
        report.skipped,
        report.failed
    );
}

fn print_audit(report: &AuditRunReport) {
    for message in &report.messages {
        println!("{}", message);
    }
}

fn print_sync(report: &SyncRunReport) {
    for message in &report.messages {
        println!("{}", message);
    }
    println!(
        "Checked {} aggregate(s), added {} provider membership(s)",
        report.aggregates, report.added
    );
}

/// Heal allocations; returns the exit code
pub async fn heal(
    services: &Services,
    scope: HealScope,
    options: &HealRunOptions,
    json: bool,
) -> Result<i32> {
    let run = HealRun::new(&services.ledger, &services.ports, &services.store);
    let report = run.heal(scope, options).await;
    if json {
        print_json(&report)?;
    } else {
        print_heal(&report);
    }
    Ok(report.exit_code())
}

/// Audit orphaned allocations; returns the exit code
pub async fn audit(
    services: &Services,
    scope: &AuditScope,
    delete: bool,
    batch_size: usize,
    json: bool,
) -> Result<i32> {
    let run = AuditRun::new(&services.ledger, &services.store, batch_size);
    let report = run.audit(scope, delete).await;
    if json {
        print_json(&report)?;
    } else {
        print_audit(&report);
    }
    Ok(report.exit_code())
}

/// Sync host aggregates into provider aggregates; returns the exit code
pub async fn sync_aggregates(services: &Services, json: bool) -> Result<i32> {
    let report = AggregateSync::new(&services.ledger, &services.store)
        .sync()
        .await;
    if json {
        print_json(&report)?;
    } else {
        print_sync(&report);
    }
    Ok(report.exit_code())
}

/// Accelerator request as shown to the operator
#[derive(Debug, Serialize)]
struct RequestRow {
    uuid: Uuid,
    state: String,
    device_profile: String,
    group: u32,
    hostname: Option<String>,
    device_rp_uuid: Option<Uuid>,
    pci_slot: Option<String>,
}

impl From<&AcceleratorRequest> for RequestRow {
    fn from(arq: &AcceleratorRequest) -> Self {
        Self {
            uuid: arq.uuid,
            state: format!("{:?}", arq.state),
            device_profile: arq.device_profile_name.clone(),
            group: arq.device_profile_group_id,
            hostname: arq.hostname.clone(),
            device_rp_uuid: arq.device_rp_uuid,
            pci_slot: DeviceBindingClient::pci_device_profile(arq).map(|p| p.pci_slot),
        }
    }
}

/// List the accelerator requests of an instance; returns the exit code
pub async fn accelerator_requests(
    services: &Services,
    instance: Uuid,
    only_resolved: bool,
    json: bool,
) -> Result<i32> {
    let arqs = match services
        .devices
        .requests_for_workload(instance, only_resolved)
        .await
    {
        Ok(arqs) => arqs,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(1);
        }
    };
    let rows: Vec<RequestRow> = arqs.iter().map(RequestRow::from).collect();

    if json {
        print_json(&rows)?;
        return Ok(0);
    }

    if rows.is_empty() {
        println!("No accelerator requests for instance {}", instance);
        return Ok(0);
    }
    println!(
        "{:<38} {:<12} {:<20} {:<6} {:<20} {}",
        "UUID", "STATE", "PROFILE", "GROUP", "HOST", "PCI SLOT"
    );
    for row in &rows {
        println!(
            "{:<38} {:<12} {:<20} {:<6} {:<20} {}",
            row.uuid,
            row.state,
            row.device_profile,
            row.group,
            row.hostname.as_deref().unwrap_or("-"),
            row.pci_slot.as_deref().unwrap_or("-")
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use placemend_clients::memory::{MemoryAccelerator, MemoryLedger, MemoryNetwork};
    use placemend_clients::snapshot::write_snapshot;
    use placemend_core::resource_class::*;
    use placemend_core::{ComputeNode, Flavor, ShardId, Workload};

    async fn services_from_snapshot() -> (Services, Arc<MemoryLedger>, Workload) {
        let ledger = Arc::new(MemoryLedger::new());
        let node = ledger.add_provider("host1", None).await;
        for (rc, total) in [(VCPU, 16), (MEMORY_MB, 8192), (DISK_GB, 100)] {
            ledger.set_inventory(node, rc, total).await;
        }

        let seed = MemoryStore::new();
        seed.add_shard(ShardId(1)).await;
        seed.add_compute_node(
            ShardId(1),
            ComputeNode {
                uuid: node,
                host: "host1".to_string(),
                node: "host1".to_string(),
            },
        )
        .await;
        let workload = Workload::new(ShardId(1), "host1", Flavor::new("small", 1, 512, 1));
        seed.put_workload(workload.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.json");
        write_snapshot(&seed, &path).await.unwrap();
        let store = open_snapshot(&path).await.unwrap();

        let services = Services::new(
            ledger.clone(),
            Arc::new(MemoryNetwork::new()),
            Arc::new(MemoryAccelerator::new()),
            store,
        );
        (services, ledger, workload)
    }

    #[tokio::test]
    async fn test_heal_exit_codes() {
        let (services, ledger, workload) = services_from_snapshot().await;
        let options = HealRunOptions::default();

        let code = heal(&services, HealScope::All, &options, false).await.unwrap();
        assert_eq!(code, 0);
        assert!(ledger.allocations(workload.uuid).await.is_some());

        let code = heal(&services, HealScope::All, &options, true).await.unwrap();
        assert_eq!(code, 4);

        let code = heal(&services, HealScope::Workload(Uuid::new_v4()), &options, false)
            .await
            .unwrap();
        assert_eq!(code, 127);
    }

    #[tokio::test]
    async fn test_audit_exit_codes() {
        let (services, _ledger, _) = services_from_snapshot().await;
        let code = audit(&services, &AuditScope::All, false, 10, false)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let code = audit(
            &services,
            &AuditScope::Provider("missing".to_string()),
            false,
            10,
            true,
        )
        .await
        .unwrap();
        assert_eq!(code, 127);
    }

    #[tokio::test]
    async fn test_sync_without_aggregates() {
        let (services, _, _) = services_from_snapshot().await;
        assert_eq!(sync_aggregates(&services, false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accelerator_requests_listing() {
        let (services, _, workload) = services_from_snapshot().await;
        let code = accelerator_requests(&services, workload.uuid, false, false)
            .await
            .unwrap();
        assert_eq!(code, 0);
    }
}
