//! Network port types: resource requests and binding-profile allocation keys
//!
//! A port may carry a resource request in one of two shapes. The legacy shape
//! is a single group of resources and required traits; the extended shape is a
//! list of named request groups plus a same-subtree constraint. The binding
//! profile mirrors the chosen providers back into the port, as a single
//! provider uuid for legacy requests or a group-id keyed map for extended ones.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::allocation::{add_resources, RequestGroup, Resources, TraitPolicy};

/// Legacy single-group resource request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyResourceRequest {
    pub resources: Resources,
    #[serde(default)]
    pub required: Vec<String>,
}

/// One named group of an extended resource request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequestGroup {
    pub id: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub required: Vec<String>,
}

/// Multi-group resource request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedResourceRequest {
    pub request_groups: Vec<PortRequestGroup>,
    #[serde(default)]
    pub same_subtree: Vec<String>,
}

/// Resource request carried by a port, in either wire format
///
/// The format is picked by the presence of `request_groups`; a payload that
/// does not fully match the picked format is an error, never the other one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PortResourceRequest {
    Extended(ExtendedResourceRequest),
    Legacy(LegacyResourceRequest),
}

impl<'de> Deserialize<'de> for PortResourceRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let extended = value
            .as_object()
            .ok_or_else(|| D::Error::custom("resource request must be an object"))?
            .contains_key("request_groups");

        if extended {
            serde_json::from_value(value)
                .map(PortResourceRequest::Extended)
                .map_err(|e| D::Error::custom(format!("invalid extended resource request: {}", e)))
        } else {
            serde_json::from_value(value)
                .map(PortResourceRequest::Legacy)
                .map_err(|e| D::Error::custom(format!("invalid legacy resource request: {}", e)))
        }
    }
}

/// Allocation key stored in a port's binding profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortBindingState {
    /// Provider uuid serving the single legacy group
    Legacy(Uuid),
    /// Request group id -> provider uuid
    Extended(BTreeMap<String, Uuid>),
}

impl PortBindingState {
    /// Providers named by this binding
    pub fn providers(&self) -> Vec<Uuid> {
        match self {
            PortBindingState::Legacy(rp) => vec![*rp],
            PortBindingState::Extended(map) => map.values().copied().collect(),
        }
    }
}

/// Port binding profile; keys other than `allocation` are preserved untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<PortBindingState>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BindingProfile {
    /// Copy of this profile with the allocation key replaced
    pub fn with_allocation(&self, allocation: PortBindingState) -> Self {
        Self {
            allocation: Some(allocation),
            extra: self.extra.clone(),
        }
    }
}

/// A network port attached to a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: Uuid,
    #[serde(default)]
    pub device_id: Option<Uuid>,
    #[serde(default)]
    pub network_id: Option<Uuid>,
    #[serde(default)]
    pub resource_request: Option<PortResourceRequest>,
    #[serde(default)]
    pub binding_profile: BindingProfile,
}

impl Port {
    pub fn new(id: Uuid, device_id: Uuid) -> Self {
        Self {
            id,
            device_id: Some(device_id),
            network_id: None,
            resource_request: None,
            binding_profile: BindingProfile::default(),
        }
    }

    /// Whether the port asks for any resources at all
    pub fn has_resource_request(&self) -> bool {
        self.resource_request
            .as_ref()
            .map_or(false, |req| !req.total_resources().is_empty())
    }

    /// A resource request without an allocation key in the binding profile
    pub fn needs_healing(&self) -> bool {
        self.has_resource_request() && self.binding_profile.allocation.is_none()
    }
}

fn to_request_group(
    requester_id: String,
    resources: &Resources,
    required: &[String],
) -> RequestGroup {
    let mut group = RequestGroup::new(requester_id);
    for (rc, amount) in resources {
        if *amount > 0 {
            group.add_resource(rc.clone(), *amount);
        }
    }
    for name in required {
        match name.strip_prefix('!') {
            Some(forbidden) => group.add_trait(forbidden, TraitPolicy::Forbidden),
            None => group.add_trait(name.clone(), TraitPolicy::Required),
        }
    }
    group
}

impl PortResourceRequest {
    /// Request groups for a candidate query; legacy groups use the port id as
    /// their requester id
    pub fn request_groups(&self, port_id: Uuid) -> Vec<RequestGroup> {
        match self {
            PortResourceRequest::Legacy(req) => {
                vec![to_request_group(port_id.to_string(), &req.resources, &req.required)]
            }
            PortResourceRequest::Extended(req) => req
                .request_groups
                .iter()
                .filter(|g| g.resources.values().any(|n| *n > 0))
                .map(|g| to_request_group(g.id.clone(), &g.resources, &g.required))
                .collect(),
        }
    }

    /// Requester ids that must land in one provider subtree
    pub fn same_subtree(&self) -> Option<Vec<String>> {
        match self {
            PortResourceRequest::Extended(req) if req.same_subtree.len() > 1 => {
                Some(req.same_subtree.clone())
            }
            _ => None,
        }
    }

    /// Summed resources of every group
    pub fn total_resources(&self) -> Resources {
        let mut total = Resources::new();
        match self {
            PortResourceRequest::Legacy(req) => add_resources(&mut total, &req.resources),
            PortResourceRequest::Extended(req) => {
                for group in &req.request_groups {
                    add_resources(&mut total, &group.resources);
                }
            }
        }
        total.retain(|_, n| *n > 0);
        total
    }

    /// Build the binding state from candidate mappings (requester id -> rp)
    pub fn binding_from_mappings(
        &self,
        port_id: Uuid,
        mappings: &BTreeMap<String, Uuid>,
    ) -> Option<PortBindingState> {
        match self {
            PortResourceRequest::Legacy(_) => mappings
                .get(&port_id.to_string())
                .copied()
                .map(PortBindingState::Legacy),
            PortResourceRequest::Extended(_) => {
                let mut map = BTreeMap::new();
                for group in self.request_groups(port_id) {
                    let rp = mappings.get(&group.requester_id)?;
                    map.insert(group.requester_id, *rp);
                }
                Some(PortBindingState::Extended(map))
            }
        }
    }

    /// Per-provider resources implied by an existing binding. Fails with the
    /// name of the first group the binding does not cover, or when the binding
    /// shape does not match the request shape.
    pub fn provider_resources(
        &self,
        binding: &PortBindingState,
    ) -> Result<Vec<(Uuid, Resources)>, String> {
        match (self, binding) {
            (PortResourceRequest::Legacy(req), PortBindingState::Legacy(rp)) => {
                Ok(vec![(*rp, req.resources.clone())])
            }
            (PortResourceRequest::Extended(req), PortBindingState::Extended(map)) => req
                .request_groups
                .iter()
                .filter(|g| g.resources.values().any(|n| *n > 0))
                .map(|g| {
                    map.get(&g.id)
                        .map(|rp| (*rp, g.resources.clone()))
                        .ok_or_else(|| g.id.clone())
                })
                .collect(),
            (PortResourceRequest::Legacy(_), PortBindingState::Extended(_)) => {
                Err("extended allocation key on a legacy resource request".to_string())
            }
            (PortResourceRequest::Extended(_), PortBindingState::Legacy(_)) => {
                Err("legacy allocation key on an extended resource request".to_string())
            }
        }
    }
}
