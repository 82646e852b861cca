//! In-memory accelerator request service

use async_trait::async_trait;
use placemend_core::{
    device_amount_of_groups, AcceleratorRequest, ArqBinding, ArqState, DeviceProfile,
    PlacemendError, PlacemendResult, Service,
};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::FaultInjector;
use crate::traits::AcceleratorService;

/// Accelerator service kept in memory
pub struct MemoryAccelerator {
    profiles: RwLock<Vec<DeviceProfile>>,
    requests: RwLock<BTreeMap<Uuid, AcceleratorRequest>>,
    faults: FaultInjector,
}

impl MemoryAccelerator {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(Vec::new()),
            requests: RwLock::new(BTreeMap::new()),
            faults: FaultInjector::new(Service::Accelerator),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Force a request into a state, bypassing call counting and faults
    pub async fn set_state(&self, uuid: Uuid, state: ArqState) {
        if let Some(arq) = self.requests.write().await.get_mut(&uuid) {
            arq.state = state;
        }
    }

    /// Number of requests held
    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }
}

impl Default for MemoryAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcceleratorService for MemoryAccelerator {
    async fn create_device_profile(&self, profile: &DeviceProfile) -> PlacemendResult<()> {
        self.faults.check("create_device_profile").await?;
        let mut profiles = self.profiles.write().await;
        if profiles.iter().any(|p| p.name == profile.name) {
            return Err(PlacemendError::Conflict(format!(
                "Device profile {} already exists",
                profile.name
            )));
        }
        profiles.push(profile.clone());
        Ok(())
    }

    async fn get_device_profiles(&self, name: &str) -> PlacemendResult<Vec<DeviceProfile>> {
        self.faults.check("get_device_profiles").await?;
        Ok(self
            .profiles
            .read()
            .await
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect())
    }

    async fn create_requests(
        &self,
        profile_name: &str,
    ) -> PlacemendResult<Vec<AcceleratorRequest>> {
        self.faults.check("create_requests").await?;
        let profile = self
            .profiles
            .read()
            .await
            .iter()
            .find(|p| p.name == profile_name)
            .cloned()
            .ok_or_else(|| PlacemendError::NotFound(format!("Device profile {}", profile_name)))?;

        let mut created = Vec::new();
        for (index, group) in profile.groups.iter().enumerate() {
            let amount = device_amount_of_groups(std::slice::from_ref(group));
            for _ in 0..amount {
                created.push(AcceleratorRequest::new(profile_name, index as u32));
            }
        }

        let mut requests = self.requests.write().await;
        for arq in &created {
            requests.insert(arq.uuid, arq.clone());
        }
        Ok(created)
    }

    async fn bind_requests(&self, bindings: &[ArqBinding]) -> PlacemendResult<()> {
        self.faults.check("bind_requests").await?;
        let mut requests = self.requests.write().await;
        if let Some(missing) = bindings.iter().find(|b| !requests.contains_key(&b.arq_uuid)) {
            return Err(PlacemendError::NotFound(format!(
                "Accelerator request {}",
                missing.arq_uuid
            )));
        }
        for binding in bindings {
            if let Some(arq) = requests.get_mut(&binding.arq_uuid) {
                arq.hostname = Some(binding.hostname.clone());
                arq.device_rp_uuid = Some(binding.device_rp_uuid);
                arq.instance_uuid = Some(binding.instance_uuid);
                arq.state = ArqState::BindStarted;
            }
        }
        Ok(())
    }

    async fn list_requests(
        &self,
        instance: Uuid,
        only_resolved: bool,
    ) -> PlacemendResult<Vec<AcceleratorRequest>> {
        self.faults.check("list_requests").await?;
        Ok(self
            .requests
            .read()
            .await
            .values()
            .filter(|arq| arq.instance_uuid == Some(instance))
            .filter(|arq| !only_resolved || arq.state.is_resolved())
            .cloned()
            .collect())
    }

    async fn get_request(&self, uuid: Uuid) -> PlacemendResult<Option<AcceleratorRequest>> {
        self.faults.check("get_request").await?;
        Ok(self.requests.read().await.get(&uuid).cloned())
    }

    async fn delete_requests_for_instance(&self, instance: Uuid) -> PlacemendResult<()> {
        self.faults.check("delete_requests_for_instance").await?;
        self.requests
            .write()
            .await
            .retain(|_, arq| arq.instance_uuid != Some(instance));
        Ok(())
    }

    async fn delete_requests(&self, uuids: &[Uuid]) -> PlacemendResult<()> {
        self.faults.check("delete_requests").await?;
        let mut requests = self.requests.write().await;
        for uuid in uuids {
            requests.remove(uuid);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
