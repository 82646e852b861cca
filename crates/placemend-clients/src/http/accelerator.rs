//! Accelerator (cyborg) HTTP API backend

use async_trait::async_trait;
use placemend_core::{
    AcceleratorConfig, AcceleratorRequest, ArqBinding, DeviceProfile, PlacemendError,
    PlacemendResult, Service,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{build_client, check_status, join, json, transport_error};
use crate::traits::AcceleratorService;

#[derive(Deserialize)]
struct ProfilesBody {
    device_profiles: Vec<DeviceProfile>,
}

#[derive(Deserialize)]
struct ArqsBody {
    arqs: Vec<AcceleratorRequest>,
}

/// JSON-patch body binding each request to host, provider and instance
fn binding_patch(bindings: &[ArqBinding]) -> BTreeMap<String, Value> {
    bindings
        .iter()
        .map(|b| {
            let ops = json!([
                {"path": "/hostname", "op": "add", "value": b.hostname},
                {"path": "/device_rp_uuid", "op": "add", "value": b.device_rp_uuid.to_string()},
                {"path": "/instance_uuid", "op": "add", "value": b.instance_uuid.to_string()},
            ]);
            (b.arq_uuid.to_string(), ops)
        })
        .collect()
}

/// Accelerator service backed by the cyborg REST API
pub struct HttpAccelerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAccelerator {
    pub fn new(config: &AcceleratorConfig) -> PlacemendResult<Self> {
        Ok(Self {
            client: build_client(Service::Accelerator, config.timeout_secs)?,
            endpoint: config.endpoint.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        join(&self.endpoint, path)
    }

    async fn send(
        &self,
        what: &str,
        builder: reqwest::RequestBuilder,
    ) -> PlacemendResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(Service::Accelerator, e))?;
        check_status(Service::Accelerator, what, response).await
    }
}

#[async_trait]
impl AcceleratorService for HttpAccelerator {
    async fn create_device_profile(&self, profile: &DeviceProfile) -> PlacemendResult<()> {
        let body = json!([{ "name": profile.name, "groups": profile.groups }]);
        self.send(
            "POST device_profiles",
            self.client.post(self.url("v2/device_profiles")).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_device_profiles(&self, name: &str) -> PlacemendResult<Vec<DeviceProfile>> {
        let response = self
            .send(
                "GET device_profiles",
                self.client
                    .get(self.url("v2/device_profiles"))
                    .query(&[("name", name)]),
            )
            .await?;
        let body: ProfilesBody = json(Service::Accelerator, response).await?;
        Ok(body.device_profiles)
    }

    async fn create_requests(
        &self,
        profile_name: &str,
    ) -> PlacemendResult<Vec<AcceleratorRequest>> {
        let response = self
            .send(
                "POST accelerator_requests",
                self.client
                    .post(self.url("v2/accelerator_requests"))
                    .json(&json!({ "device_profile_name": profile_name })),
            )
            .await?;
        let body: ArqsBody = json(Service::Accelerator, response).await?;
        Ok(body.arqs)
    }

    async fn bind_requests(&self, bindings: &[ArqBinding]) -> PlacemendResult<()> {
        self.send(
            "PATCH accelerator_requests",
            self.client
                .patch(self.url("v2/accelerator_requests"))
                .json(&binding_patch(bindings)),
        )
        .await?;
        Ok(())
    }

    async fn list_requests(
        &self,
        instance: Uuid,
        only_resolved: bool,
    ) -> PlacemendResult<Vec<AcceleratorRequest>> {
        let mut query = vec![("instance", instance.to_string())];
        if only_resolved {
            query.push(("bind_state", "resolved".to_string()));
        }
        let response = self
            .send(
                "GET accelerator_requests",
                self.client
                    .get(self.url("v2/accelerator_requests"))
                    .query(&query),
            )
            .await?;
        let body: ArqsBody = json(Service::Accelerator, response).await?;
        Ok(body.arqs)
    }

    async fn get_request(&self, uuid: Uuid) -> PlacemendResult<Option<AcceleratorRequest>> {
        let url = self.url(&format!("v2/accelerator_requests/{}", uuid));
        match self.send("GET accelerator_request", self.client.get(url)).await {
            Ok(response) => Ok(Some(json(Service::Accelerator, response).await?)),
            Err(PlacemendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_requests_for_instance(&self, instance: Uuid) -> PlacemendResult<()> {
        self.send(
            "DELETE accelerator_requests",
            self.client
                .delete(self.url("v2/accelerator_requests"))
                .query(&[("instance", instance.to_string())]),
        )
        .await?;
        Ok(())
    }

    async fn delete_requests(&self, uuids: &[Uuid]) -> PlacemendResult<()> {
        let arqs: Vec<String> = uuids.iter().map(|u| u.to_string()).collect();
        self.send(
            "DELETE accelerator_requests",
            self.client
                .delete(self.url("v2/accelerator_requests"))
                .query(&[("arqs", arqs.join(","))]),
        )
        .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cyborg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placemend_core::ArqState;

    #[test]
    fn test_binding_patch() {
        let binding = ArqBinding {
            arq_uuid: Uuid::new_v4(),
            hostname: "host1".to_string(),
            device_rp_uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
        };
        let patch = binding_patch(&[binding.clone()]);
        let ops = &patch[&binding.arq_uuid.to_string()];
        assert_eq!(ops[0]["path"], "/hostname");
        assert_eq!(ops[0]["value"], "host1");
        assert_eq!(ops[2]["value"], binding.instance_uuid.to_string());
    }

    #[test]
    fn test_parse_arqs() {
        let uuid = Uuid::new_v4();
        let body: ArqsBody = serde_json::from_value(json!({
            "arqs": [{
                "uuid": uuid.to_string(),
                "state": "Bound",
                "device_profile_name": "fpga",
                "device_profile_group_id": 0,
                "hostname": "host1",
                "attach_handle_type": "PCI",
                "attach_handle_info": {
                    "domain": "0000", "bus": "0c", "device": "0", "function": "1",
                    "physical_network": "PHYSNET1"
                }
            }]
        }))
        .unwrap();
        let arq = &body.arqs[0];
        assert_eq!(arq.state, ArqState::Bound);
        assert_eq!(arq.pci_device_profile().unwrap().pci_slot, "0000:0c:0.1");
    }
}
