//! Allocation healing for a single workload
//!
//! The healer derives the allocations a workload should hold from its
//! scheduling facts (compute node, flavor, ports with resource requests),
//! compares them with what the ledger holds for the workload and, when they
//! differ, writes the port binding keys and then the ledger record as one
//! [`MultiResourceTransaction`].

use async_trait::async_trait;
use placemend_clients::{PortBindingClient, PortUpdate, ResourceLedgerClient, WorkloadStore};
use placemend_core::{
    AllocationRecord, CandidateQuery, PlacemendResult, Port, PortBindingState,
    PortResourceRequest, Workload,
};
use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::HealError;
use crate::transaction::{MultiResourceTransaction, Step, TransactionOutcome};

/// Per-heal switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealOptions {
    /// Compute the change but write nothing
    pub dry_run: bool,
    /// Rewrite allocations even when they already match
    pub force: bool,
    /// Only heal compute node resources; leave port allocations as they are
    pub skip_port_allocations: bool,
}

/// Why a workload was not looked at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Deleted,
    /// A lifecycle transition is in progress
    TaskInProgress(String),
    NotOnHost,
}

/// Change a dry run would have made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedChange {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    /// The workload had no allocations and now has them
    Created,
    /// Existing allocations were replaced
    Updated,
    /// Allocations already matched; nothing was written
    UpToDate,
    /// Dry run: the planned change was not made
    NoChange { planned: PlannedChange },
    Skipped(SkipReason),
}

pub type HealResult = Result<HealOutcome, HealError>;

/// Host and node a workload is scheduled on, or why it should be skipped
fn scheduled_on(workload: &Workload) -> Result<(&str, &str), SkipReason> {
    if workload.deleted {
        return Err(SkipReason::Deleted);
    }
    if let Some(state) = &workload.task_state {
        return Err(SkipReason::TaskInProgress(state.clone()));
    }
    let host = workload.host.as_deref().ok_or(SkipReason::NotOnHost)?;
    Ok((host, workload.node.as_deref().unwrap_or(host)))
}

fn check_supported(workload: &Workload) -> Result<(), HealError> {
    if workload.flavor.requests_vgpu() {
        return Err(HealError::Unsupported(format!(
            "Healing allocation for instance {} with vGPU resource request is not supported.",
            workload.uuid
        )));
    }
    if workload.device_profile().is_some() {
        return Err(HealError::Unsupported(format!(
            "Healing allocation for instance {} with Cyborg device profile request is not supported.",
            workload.uuid
        )));
    }
    Ok(())
}

/// Writes a port's allocation key; compensation restores the previous profile
struct PortBindingStep<'a> {
    client: &'a PortBindingClient,
    port: Port,
    binding: PortBindingState,
    update: Option<PortUpdate>,
}

#[async_trait]
impl<'a> Step for PortBindingStep<'a> {
    fn name(&self) -> String {
        self.port.id.to_string()
    }

    async fn forward(&mut self) -> PlacemendResult<()> {
        let update = self
            .client
            .bind_allocation(&self.port, self.binding.clone())
            .await?;
        self.update = Some(update);
        Ok(())
    }

    async fn compensate(&mut self) -> PlacemendResult<()> {
        match &self.update {
            Some(update) => self.client.rollback(update).await,
            None => Ok(()),
        }
    }
}

/// Replaces the consumer's allocations. Always the last step, so it is never
/// compensated.
struct LedgerWriteStep<'a> {
    client: &'a ResourceLedgerClient,
    consumer: Uuid,
    record: AllocationRecord,
}

#[async_trait]
impl<'a> Step for LedgerWriteStep<'a> {
    fn name(&self) -> String {
        format!("allocations of {}", self.consumer)
    }

    async fn forward(&mut self) -> PlacemendResult<()> {
        self.client.put_allocations(self.consumer, &self.record).await
    }

    async fn compensate(&mut self) -> PlacemendResult<()> {
        Ok(())
    }
}

/// Reconciles one workload's ledger allocations and port binding keys
pub struct AllocationHealer<'a> {
    ledger: &'a ResourceLedgerClient,
    ports: &'a PortBindingClient,
    store: &'a dyn WorkloadStore,
}

impl<'a> AllocationHealer<'a> {
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

    pub async fn heal(&self, workload: &Workload, options: &HealOptions) -> HealResult {
        let (host, node) = match scheduled_on(workload) {
            Ok(placement) => placement,
            Err(reason) => {
                debug!(workload_id = %workload.uuid, reason = ?reason, "Skipping workload");
                return Ok(HealOutcome::Skipped(reason));
            }
        };
        check_supported(workload)?;

        let compute_node = self
            .store
            .compute_node(workload.shard, host, node)
            .await
            .map_err(|e| HealError::StoreUnavailable(e.to_string()))?
            .ok_or_else(|| HealError::ComputeNodeNotFound {
                host: host.to_string(),
                node: node.to_string(),
            })?;

        let current = self
            .ledger
            .get_allocations(workload.uuid)
            .await
            .map_err(|e| HealError::LedgerUnavailable(e.to_string()))?;

        let mut expected = AllocationRecord::new(&workload.project_id, &workload.user_id);
        expected.add(
            compute_node.uuid,
            &workload.flavor.resources(workload.volume_backed),
        );

        let bindings = if options.skip_port_allocations {
            if let Some(current) = &current {
                for (rp, alloc) in &current.allocations {
                    if *rp != compute_node.uuid {
                        expected.add(*rp, &alloc.resources);
                    }
                }
            }
            Vec::new()
        } else {
            self.plan_ports(workload, compute_node.uuid, &mut expected)
                .await?
        };
        expected.consumer_generation = current.as_ref().and_then(|r| r.consumer_generation);

        let up_to_date = bindings.is_empty()
            && match &current {
                Some(current) => current.matches(&expected),
                None => expected.is_empty(),
            };
        if up_to_date {
            if !options.force {
                debug!(workload_id = %workload.uuid, "Allocations are up to date");
                return Ok(HealOutcome::UpToDate);
            }
            info!(workload_id = %workload.uuid, "Force flag passed for instance");
        }

        let planned = if current.is_some() {
            PlannedChange::Update
        } else {
            PlannedChange::Create
        };
        if options.dry_run {
            info!(
                workload_id = %workload.uuid,
                planned = ?planned,
                ports = bindings.len(),
                "Dry run, not writing allocations"
            );
            return Ok(HealOutcome::NoChange { planned });
        }

        self.commit(workload.uuid, expected, bindings).await?;
        Ok(match planned {
            PlannedChange::Create => HealOutcome::Created,
            PlannedChange::Update => HealOutcome::Updated,
        })
    }

    /// Add the port claims to `expected` and return the allocation keys to
    /// write for ports that lack them
    async fn plan_ports(
        &self,
        workload: &Workload,
        node_rp: Uuid,
        expected: &mut AllocationRecord,
    ) -> Result<Vec<(Port, PortBindingState)>, HealError> {
        let ports = self
            .ports
            .ports_for_workload(workload)
            .await
            .map_err(|e| HealError::PortQueryFailed {
                workload: workload.uuid,
                message: e.to_string(),
            })?;

        let mut to_heal: Vec<(Port, PortResourceRequest)> = Vec::new();
        for port in ports {
            if !port.has_resource_request() {
                continue;
            }
            let Some(request) = port.resource_request.clone() else {
                continue;
            };
            match &port.binding_profile.allocation {
                Some(binding) => {
                    let claims = request.provider_resources(binding).map_err(|reason| {
                        HealError::PortQueryFailed {
                            workload: workload.uuid,
                            message: format!(
                                "port {} has an unusable allocation key: {}",
                                port.id, reason
                            ),
                        }
                    })?;
                    for (rp, resources) in claims {
                        expected.add(rp, &resources);
                    }
                }
                None => to_heal.push((port, request)),
            }
        }

        if to_heal.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = CandidateQuery {
            in_tree: Some(node_rp),
            ..Default::default()
        };
        for (port, request) in &to_heal {
            query.groups.extend(request.request_groups(port.id));
            if let Some(subtree) = request.same_subtree() {
                query.same_subtree.push(subtree);
            }
        }
        let port_ids: Vec<Uuid> = to_heal.iter().map(|(port, _)| port.id).collect();
        debug!(
            workload_id = %workload.uuid,
            ports = port_ids.len(),
            query = %query.describe(),
            "Querying allocation candidates for ports"
        );

        let candidates = self
            .ledger
            .get_allocation_candidates(&query)
            .await
            .map_err(|e| HealError::LedgerUnavailable(e.to_string()))?;
        let description = query.describe();
        let candidate = candidates.exactly_one().map_err(|count| {
            if count == 0 {
                HealError::InsufficientCapacity {
                    ports: port_ids,
                    query: description,
                }
            } else {
                HealError::AmbiguousCandidates {
                    count,
                    ports: port_ids,
                    query: description,
                }
            }
        })?;

        for (rp, resources) in &candidate.allocations {
            expected.add(*rp, resources);
        }

        let mut bindings = Vec::with_capacity(to_heal.len());
        for (port, request) in to_heal {
            let binding = request
                .binding_from_mappings(port.id, &candidate.mappings)
                .ok_or_else(|| HealError::PortQueryFailed {
                    workload: workload.uuid,
                    message: format!("allocation candidate does not cover port {}", port.id),
                })?;
            bindings.push((port, binding));
        }
        Ok(bindings)
    }

    async fn commit(
        &self,
        consumer: Uuid,
        expected: AllocationRecord,
        bindings: Vec<(Port, PortBindingState)>,
    ) -> Result<(), HealError> {
        let mut tx = MultiResourceTransaction::new();
        for (port, binding) in bindings {
            tx.push(PortBindingStep {
                client: self.ports,
                port,
                binding,
                update: None,
            });
        }
        let ledger_step = LedgerWriteStep {
            client: self.ledger,
            consumer,
            record: expected,
        };
        let ledger_step_name = ledger_step.name();
        tx.push(ledger_step);

        match tx.apply().await {
            TransactionOutcome::Committed => Ok(()),
            TransactionOutcome::RolledBack { failed_step, error } if failed_step == ledger_step_name => {
                Err(HealError::LedgerUnavailable(error.to_string()))
            }
            TransactionOutcome::RolledBack { failed_step, error } => Err(
                HealError::PortUpdateFailed(format!("port {}: {}", failed_step, error)),
            ),
            TransactionOutcome::RollbackFailed {
                failed_step,
                error,
                uncompensated,
            } => {
                for failure in &uncompensated {
                    error!(
                        workload_id = %consumer,
                        port_id = %failure.step,
                        error = %failure.error,
                        "Port left with an allocation key after a failed heal"
                    );
                }
                Err(HealError::ManualCleanupRequired {
                    ports: uncompensated.into_iter().map(|f| f.step).collect(),
                    message: format!(
                        "Healing instance {} failed at {} ({}) and rolling back the port updates failed",
                        consumer, failed_step, error
                    ),
                })
            }
        }
    }
}
