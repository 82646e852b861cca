//! Port binding client with a compensating rollback primitive

use placemend_core::{BindingProfile, PlacemendResult, Port, PortBindingState, Workload};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::traits::{NetworkService, PortFilter};

/// A binding-profile write that has been applied, with what it replaced
#[derive(Debug, Clone, PartialEq)]
pub struct PortUpdate {
    pub port_id: Uuid,
    pub previous: BindingProfile,
}

/// Client for port lookup and binding-profile allocation keys
#[derive(Clone)]
pub struct PortBindingClient {
    service: Arc<dyn NetworkService>,
}

impl PortBindingClient {
    pub fn new(service: Arc<dyn NetworkService>) -> Self {
        Self { service }
    }

    /// Ports bound to the workload, restricted to its attached interfaces and
    /// in interface order
    pub async fn ports_for_workload(&self, workload: &Workload) -> PlacemendResult<Vec<Port>> {
        let ports = self
            .service
            .list_ports(&PortFilter::device(workload.uuid))
            .await?;

        let ordered = workload
            .interfaces
            .iter()
            .filter_map(|id| ports.iter().find(|p| p.id == *id).cloned())
            .collect();
        Ok(ordered)
    }

    /// Write the allocation key into a port's binding profile
    pub async fn bind_allocation(
        &self,
        port: &Port,
        binding: PortBindingState,
    ) -> PlacemendResult<PortUpdate> {
        let profile = port.binding_profile.with_allocation(binding);
        self.service
            .update_binding_profile(port.id, &profile)
            .await?;
        info!(port_id = %port.id, "Updated port binding profile allocation");
        Ok(PortUpdate {
            port_id: port.id,
            previous: port.binding_profile.clone(),
        })
    }

    /// Restore the binding profile a port had before `update`
    pub async fn rollback(&self, update: &PortUpdate) -> PlacemendResult<()> {
        info!(port_id = %update.port_id, "Rolling back port update");
        self.service
            .update_binding_profile(update.port_id, &update.previous)
            .await
    }

    pub fn backend(&self) -> &'static str {
        self.service.name()
    }
}
