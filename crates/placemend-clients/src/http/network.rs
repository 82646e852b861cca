//! Network (neutron) HTTP API backend

use async_trait::async_trait;
use placemend_core::{
    BindingProfile, NetworkConfig, PlacemendResult, Port, PortResourceRequest, Service,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{build_client, check_status, join, json, transport_error};
use crate::traits::{NetworkService, PortFilter};

#[derive(Deserialize)]
struct WirePort {
    id: Uuid,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    network_id: Option<Uuid>,
    #[serde(default)]
    resource_request: Option<PortResourceRequest>,
    #[serde(rename = "binding:profile", default)]
    binding_profile: Option<BindingProfile>,
}

impl From<WirePort> for Port {
    fn from(wire: WirePort) -> Self {
        Port {
            id: wire.id,
            device_id: Uuid::parse_str(&wire.device_id).ok(),
            network_id: wire.network_id,
            resource_request: wire.resource_request,
            binding_profile: wire.binding_profile.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct PortsBody {
    ports: Vec<WirePort>,
}

/// Network service backed by the neutron REST API
pub struct HttpNetwork {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNetwork {
    pub fn new(config: &NetworkConfig) -> PlacemendResult<Self> {
        Ok(Self {
            client: build_client(Service::Network, config.timeout_secs)?,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl NetworkService for HttpNetwork {
    async fn list_ports(&self, filter: &PortFilter) -> PlacemendResult<Vec<Port>> {
        let mut request = self.client.get(join(&self.endpoint, "v2.0/ports"));
        if let Some(device) = filter.device_id {
            request = request.query(&[("device_id", device.to_string())]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(Service::Network, e))?;
        let response = check_status(Service::Network, "GET ports", response).await?;
        let body: PortsBody = json(Service::Network, response).await?;
        Ok(body.ports.into_iter().map(Port::from).collect())
    }

    async fn update_binding_profile(
        &self,
        port_id: Uuid,
        profile: &BindingProfile,
    ) -> PlacemendResult<()> {
        let body = json!({ "port": { "binding:profile": profile } });
        let response = self
            .client
            .put(join(&self.endpoint, &format!("v2.0/ports/{}", port_id)))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Service::Network, e))?;
        check_status(Service::Network, "PUT port", response).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "neutron"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placemend_core::PortBindingState;

    #[test]
    fn test_wire_port_conversion() {
        let rp = Uuid::new_v4();
        let id = Uuid::new_v4();
        let body: PortsBody = serde_json::from_value(json!({
            "ports": [
                {
                    "id": id.to_string(),
                    "device_id": "",
                    "resource_request": {
                        "resources": {"NET_BW_IGR_KILOBIT_PER_SEC": 1000},
                        "required": ["CUSTOM_PHYSNET_PHYSNET0"]
                    },
                    "binding:profile": {"allocation": rp.to_string()}
                },
                {"id": Uuid::new_v4().to_string(), "binding:profile": null}
            ]
        }))
        .unwrap();

        let ports: Vec<Port> = body.ports.into_iter().map(Port::from).collect();
        assert_eq!(ports[0].id, id);
        assert_eq!(ports[0].device_id, None);
        assert_eq!(
            ports[0].binding_profile.allocation,
            Some(PortBindingState::Legacy(rp))
        );
        assert!(!ports[0].needs_healing());
        assert_eq!(ports[1].binding_profile, BindingProfile::default());
    }

    #[test]
    fn test_malformed_resource_request_fails_the_listing() {
        let result = serde_json::from_value::<PortsBody>(json!({
            "ports": [
                {
                    "id": Uuid::new_v4().to_string(),
                    "resource_request": {
                        "request_groups": [
                            {"resources": {"NET_BW_EGR_KILOBIT_PER_SEC": 1000}}
                        ]
                    }
                }
            ]
        }));
        assert!(result.is_err());
    }
}
