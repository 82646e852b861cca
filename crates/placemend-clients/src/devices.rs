//! Accelerator request client

use placemend_core::{
    device_amount_of_groups, device_request_groups, AcceleratorRequest, ArqBinding, DeviceProfile,
    DeviceProfileGroup, PciDeviceProfile, PlacemendError, PlacemendResult, RequestGroup,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::traits::AcceleratorService;

/// Client for device profiles and the accelerator request lifecycle
#[derive(Clone)]
pub struct DeviceBindingClient {
    service: Arc<dyn AcceleratorService>,
}

impl DeviceBindingClient {
    pub fn new(service: Arc<dyn AcceleratorService>) -> Self {
        Self { service }
    }

    pub async fn create_device_profile(&self, profile: &DeviceProfile) -> PlacemendResult<()> {
        self.service
            .create_device_profile(profile)
            .await
            .map_err(|e| PlacemendError::DeviceProfile {
                name: profile.name.clone(),
                message: e.to_string(),
            })
    }

    /// Groups of the one profile with this name
    pub async fn device_profile_groups(&self, name: &str) -> PlacemendResult<Vec<DeviceProfileGroup>> {
        let profiles = self
            .service
            .get_device_profiles(name)
            .await
            .map_err(|e| PlacemendError::DeviceProfile {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        match profiles.len() {
            0 => Err(PlacemendError::DeviceProfile {
                name: name.to_string(),
                message: "not found".to_string(),
            }),
            1 => Ok(profiles.into_iter().flat_map(|p| p.groups).collect()),
            n => Err(PlacemendError::DeviceProfile {
                name: name.to_string(),
                message: format!("expected exactly one device profile, found {}", n),
            }),
        }
    }

    /// Ledger request groups for device profile groups
    pub fn device_request_groups(
        groups: &[DeviceProfileGroup],
        owner: Option<&str>,
    ) -> Vec<RequestGroup> {
        device_request_groups(groups, owner)
    }

    /// Number of devices the groups ask for
    pub fn device_amount_of_groups(groups: &[DeviceProfileGroup]) -> u64 {
        device_amount_of_groups(groups)
    }

    /// Create one request per requested device
    pub async fn create_requests(&self, profile_name: &str) -> PlacemendResult<Vec<AcceleratorRequest>> {
        let arqs = self
            .service
            .create_requests(profile_name)
            .await
            .map_err(|e| PlacemendError::AcceleratorRequest {
                op: "create".to_string(),
                message: e.to_string(),
            })?;
        info!(device_profile = %profile_name, count = arqs.len(), "Created accelerator requests");
        Ok(arqs)
    }

    /// Create requests and fill in the device provider each one should bind
    /// to, from a requester id -> providers map taken from a chosen candidate
    pub async fn create_requests_and_match_providers(
        &self,
        profile_name: &str,
        providers: &BTreeMap<String, Vec<Uuid>>,
    ) -> PlacemendResult<Vec<AcceleratorRequest>> {
        let mut arqs = self.create_requests(profile_name).await?;
        for arq in &mut arqs {
            let requester_id = arq.requester_id(None);
            let rp = providers
                .get(&requester_id)
                .and_then(|rps| rps.first())
                .ok_or_else(|| PlacemendError::AcceleratorRequest {
                    op: "match".to_string(),
                    message: format!("no resource provider for request group {}", requester_id),
                })?;
            arq.device_rp_uuid = Some(*rp);
        }
        Ok(arqs)
    }

    pub async fn bind_requests(&self, bindings: &[ArqBinding]) -> PlacemendResult<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        self.service
            .bind_requests(bindings)
            .await
            .map_err(|e| PlacemendError::AcceleratorBinding {
                arqs: bindings.iter().map(|b| b.arq_uuid.to_string()).collect(),
                message: e.to_string(),
            })?;
        debug!(count = bindings.len(), "Bound accelerator requests");
        Ok(())
    }

    /// Requests of a workload; with `only_resolved`, only those in Bound,
    /// BindFailed or Deleting
    pub async fn requests_for_workload(
        &self,
        workload: Uuid,
        only_resolved: bool,
    ) -> PlacemendResult<Vec<AcceleratorRequest>> {
        let arqs = self
            .service
            .list_requests(workload, only_resolved)
            .await
            .map_err(|e| PlacemendError::AcceleratorRequest {
                op: "get".to_string(),
                message: e.to_string(),
            })?;
        Ok(arqs
            .into_iter()
            .filter(|arq| !only_resolved || arq.state.is_resolved())
            .collect())
    }

    pub async fn request(&self, uuid: Uuid) -> PlacemendResult<Option<AcceleratorRequest>> {
        self.service
            .get_request(uuid)
            .await
            .map_err(|e| PlacemendError::AcceleratorRequest {
                op: "get".to_string(),
                message: e.to_string(),
            })
    }

    pub async fn request_uuids_for_workload(&self, workload: Uuid) -> PlacemendResult<Vec<Uuid>> {
        Ok(self
            .requests_for_workload(workload, false)
            .await?
            .into_iter()
            .map(|arq| arq.uuid)
            .collect())
    }

    pub async fn delete_requests_for_workload(&self, workload: Uuid) -> PlacemendResult<()> {
        self.service
            .delete_requests_for_instance(workload)
            .await
            .map_err(|e| PlacemendError::AcceleratorRequest {
                op: "delete".to_string(),
                message: e.to_string(),
            })
    }

    /// Delete requests by uuid. Failures are logged, never returned.
    pub async fn delete_requests(&self, uuids: &[Uuid]) {
        if uuids.is_empty() {
            return;
        }
        if let Err(e) = self.service.delete_requests(uuids).await {
            let arqs: Vec<String> = uuids.iter().map(|u| u.to_string()).collect();
            error!(arqs = %arqs.join(","), error = %e, "Failed to delete accelerator requests");
        }
    }

    pub fn pci_device_profile(arq: &AcceleratorRequest) -> Option<PciDeviceProfile> {
        arq.pci_device_profile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAccelerator;
    use placemend_core::ArqState;

    fn profile(name: &str) -> DeviceProfile {
        DeviceProfile {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            groups: vec![
                [("resources:FPGA".to_string(), "2".to_string())]
                    .into_iter()
                    .collect(),
                [("resources:GPU".to_string(), "1".to_string())]
                    .into_iter()
                    .collect(),
            ],
        }
    }

    async fn client_with_profile() -> (Arc<MemoryAccelerator>, DeviceBindingClient) {
        let service = Arc::new(MemoryAccelerator::new());
        let client = DeviceBindingClient::new(service.clone());
        client.create_device_profile(&profile("fpga")).await.unwrap();
        (service, client)
    }

    #[tokio::test]
    async fn test_profile_groups() {
        let (_, client) = client_with_profile().await;
        let groups = client.device_profile_groups("fpga").await.unwrap();
        assert_eq!(DeviceBindingClient::device_amount_of_groups(&groups), 3);

        let rgs = DeviceBindingClient::device_request_groups(&groups, None);
        assert_eq!(rgs[1].requester_id, "device_profile_1");

        let err = client.device_profile_groups("missing").await.unwrap_err();
        assert!(matches!(err, PlacemendError::DeviceProfile { .. }));
    }

    #[tokio::test]
    async fn test_create_and_match_providers() {
        let (_, client) = client_with_profile().await;
        let fpga_rp = Uuid::new_v4();
        let gpu_rp = Uuid::new_v4();
        let map: BTreeMap<String, Vec<Uuid>> = [
            ("device_profile_0".to_string(), vec![fpga_rp]),
            ("device_profile_1".to_string(), vec![gpu_rp]),
        ]
        .into_iter()
        .collect();

        let arqs = client
            .create_requests_and_match_providers("fpga", &map)
            .await
            .unwrap();
        assert_eq!(arqs.len(), 3);
        assert_eq!(arqs.iter().filter(|a| a.device_rp_uuid == Some(fpga_rp)).count(), 2);
        assert_eq!(arqs.iter().filter(|a| a.device_rp_uuid == Some(gpu_rp)).count(), 1);

        let partial: BTreeMap<String, Vec<Uuid>> =
            [("device_profile_0".to_string(), vec![fpga_rp])].into_iter().collect();
        assert!(client
            .create_requests_and_match_providers("fpga", &partial)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bind_and_resolve() {
        let (service, client) = client_with_profile().await;
        let arqs = client.create_requests("fpga").await.unwrap();
        let instance = Uuid::new_v4();
        let bindings: Vec<ArqBinding> = arqs
            .iter()
            .map(|arq| ArqBinding {
                arq_uuid: arq.uuid,
                hostname: "host1".to_string(),
                device_rp_uuid: Uuid::new_v4(),
                instance_uuid: instance,
            })
            .collect();
        client.bind_requests(&bindings).await.unwrap();

        assert_eq!(client.requests_for_workload(instance, false).await.unwrap().len(), 3);
        assert!(client.requests_for_workload(instance, true).await.unwrap().is_empty());

        service.set_state(arqs[0].uuid, ArqState::Bound).await;
        let resolved = client.requests_for_workload(instance, true).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].uuid, arqs[0].uuid);

        let uuids = client.request_uuids_for_workload(instance).await.unwrap();
        assert_eq!(uuids.len(), 3);

        client.delete_requests_for_workload(instance).await.unwrap();
        assert_eq!(service.request_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_names_requests() {
        let (service, client) = client_with_profile().await;
        service.faults().fail_on("bind_requests", 1).await;
        let binding = ArqBinding {
            arq_uuid: Uuid::new_v4(),
            hostname: "host1".to_string(),
            device_rp_uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
        };
        let err = client.bind_requests(&[binding.clone()]).await.unwrap_err();
        match err {
            PlacemendError::AcceleratorBinding { arqs, .. } => {
                assert_eq!(arqs, vec![binding.arq_uuid.to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_requests_swallows_errors() {
        let (service, client) = client_with_profile().await;
        let arqs = client.create_requests("fpga").await.unwrap();
        service.faults().fail_always("delete_requests").await;
        client.delete_requests(&[arqs[0].uuid]).await;
        assert_eq!(service.request_count().await, 3);

        service.faults().clear("delete_requests").await;
        client.delete_requests(&[arqs[0].uuid]).await;
        assert_eq!(service.request_count().await, 2);
        assert!(client.request(arqs[0].uuid).await.unwrap().is_none());
    }
}
