//! In-memory network port service

use async_trait::async_trait;
use placemend_core::{BindingProfile, PlacemendError, PlacemendResult, Port, Service};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::FaultInjector;
use crate::traits::{NetworkService, PortFilter};

/// Network port service kept in memory
pub struct MemoryNetwork {
    ports: RwLock<BTreeMap<Uuid, Port>>,
    faults: FaultInjector,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(BTreeMap::new()),
            faults: FaultInjector::new(Service::Network),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn add_port(&self, port: Port) {
        self.ports.write().await.insert(port.id, port);
    }

    /// Current state of a port, bypassing call counting and faults
    pub async fn port(&self, id: Uuid) -> Option<Port> {
        self.ports.read().await.get(&id).cloned()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkService for MemoryNetwork {
    async fn list_ports(&self, filter: &PortFilter) -> PlacemendResult<Vec<Port>> {
        self.faults.check("list_ports").await?;
        Ok(self
            .ports
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn update_binding_profile(
        &self,
        port_id: Uuid,
        profile: &BindingProfile,
    ) -> PlacemendResult<()> {
        self.faults.check("update_binding_profile").await?;
        let mut ports = self.ports.write().await;
        let port = ports
            .get_mut(&port_id)
            .ok_or_else(|| PlacemendError::NotFound(format!("Port {}", port_id)))?;
        port.binding_profile = profile.clone();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_ports_by_device() {
        let network = MemoryNetwork::new();
        let vm = Uuid::new_v4();
        network.add_port(Port::new(Uuid::new_v4(), vm)).await;
        network.add_port(Port::new(Uuid::new_v4(), Uuid::new_v4())).await;

        let ports = network.list_ports(&PortFilter::device(vm)).await.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(network.list_ports(&PortFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_port() {
        let network = MemoryNetwork::new();
        let err = network
            .update_binding_profile(Uuid::new_v4(), &BindingProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlacemendError::NotFound(_)));
        assert_eq!(network.faults().calls("update_binding_profile").await, 1);
    }
}
