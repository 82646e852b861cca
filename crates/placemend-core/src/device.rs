//! Accelerator device profiles and accelerator requests (ARQs)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::allocation::{RequestGroup, TraitPolicy};
use crate::extra_specs::{self, SpecPrefix};

/// Prefix of the requester id assigned to device profile request groups
pub const DEVICE_PROFILE_REQUESTER_PREFIX: &str = "device_profile_";

/// One device profile group: extra-spec style key/value pairs
pub type DeviceProfileGroup = BTreeMap<String, String>;

/// A named device profile as stored by the accelerator service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<DeviceProfileGroup>,
}

/// Translate device profile groups into ledger request groups.
///
/// Requester ids are `device_profile_<index><owner>`. Trait entries only count
/// when their value is `required` or `forbidden`; unparseable amounts are
/// ignored.
pub fn device_request_groups(
    groups: &[DeviceProfileGroup],
    owner: Option<&str>,
) -> Vec<RequestGroup> {
    groups
        .iter()
        .enumerate()
        .map(|(index, group)| {
            let requester_id = format!(
                "{}{}{}",
                DEVICE_PROFILE_REQUESTER_PREFIX,
                index,
                owner.unwrap_or("")
            );
            let mut request = RequestGroup::new(requester_id);
            for (key, value) in group {
                let Some(parsed) = extra_specs::parse_key(key) else {
                    continue;
                };
                match parsed.prefix {
                    SpecPrefix::Resources => {
                        if let Ok(amount) = value.trim().parse::<u64>() {
                            request.add_resource(parsed.name, amount);
                        }
                    }
                    SpecPrefix::Trait => match value.as_str() {
                        "required" => request.add_trait(parsed.name, TraitPolicy::Required),
                        "forbidden" => request.add_trait(parsed.name, TraitPolicy::Forbidden),
                        _ => {}
                    },
                }
            }
            request
        })
        .collect()
}

/// Total number of devices requested across all groups
pub fn device_amount_of_groups(groups: &[DeviceProfileGroup]) -> u64 {
    groups
        .iter()
        .flat_map(|group| group.iter())
        .filter(|(key, _)| {
            extra_specs::parse_key(key).map_or(false, |k| k.prefix == SpecPrefix::Resources)
        })
        .filter_map(|(_, value)| value.trim().parse::<u64>().ok())
        .sum()
}

/// Lifecycle state of an accelerator request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArqState {
    Initial,
    BindStarted,
    Bound,
    BindFailed,
    Unbound,
    Deleting,
}

impl ArqState {
    /// Binding finished one way or the other
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ArqState::Bound | ArqState::BindFailed | ArqState::Deleting
        )
    }
}

impl fmt::Display for ArqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArqState::Initial => write!(f, "Initial"),
            ArqState::BindStarted => write!(f, "BindStarted"),
            ArqState::Bound => write!(f, "Bound"),
            ArqState::BindFailed => write!(f, "BindFailed"),
            ArqState::Unbound => write!(f, "Unbound"),
            ArqState::Deleting => write!(f, "Deleting"),
        }
    }
}

/// PCI address and network of the device an ARQ is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachHandleInfo {
    pub domain: String,
    pub bus: String,
    pub device: String,
    pub function: String,
    #[serde(default)]
    pub physical_network: Option<String>,
}

/// An accelerator request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorRequest {
    pub uuid: Uuid,
    pub state: ArqState,
    pub device_profile_name: String,
    #[serde(default)]
    pub device_profile_group_id: u32,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub device_rp_uuid: Option<Uuid>,
    #[serde(default)]
    pub instance_uuid: Option<Uuid>,
    #[serde(default)]
    pub attach_handle_type: Option<String>,
    #[serde(default)]
    pub attach_handle_info: Option<AttachHandleInfo>,
}

impl AcceleratorRequest {
    /// Fresh request for one group of a device profile
    pub fn new(device_profile_name: impl Into<String>, group_id: u32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            state: ArqState::Initial,
            device_profile_name: device_profile_name.into(),
            device_profile_group_id: group_id,
            hostname: None,
            device_rp_uuid: None,
            instance_uuid: None,
            attach_handle_type: None,
            attach_handle_info: None,
        }
    }

    /// Requester id of the request group this ARQ was created from
    pub fn requester_id(&self, owner: Option<&str>) -> String {
        format!(
            "{}{}{}",
            DEVICE_PROFILE_REQUESTER_PREFIX,
            self.device_profile_group_id,
            owner.unwrap_or("")
        )
    }

    /// Port binding-profile data for a PCI-attached device, once bound
    pub fn pci_device_profile(&self) -> Option<PciDeviceProfile> {
        let info = self.attach_handle_info.as_ref()?;
        Some(PciDeviceProfile {
            physical_network: info.physical_network.clone(),
            pci_slot: format!(
                "{}:{}:{}.{}",
                info.domain, info.bus, info.device, info.function
            ),
            arq_uuid: self.uuid,
        })
    }
}

/// Binding-profile fields describing a bound PCI accelerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceProfile {
    pub physical_network: Option<String>,
    pub pci_slot: String,
    pub arq_uuid: Uuid,
}

/// Where one ARQ should be bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArqBinding {
    pub arq_uuid: Uuid,
    pub hostname: String,
    pub device_rp_uuid: Uuid,
    pub instance_uuid: Uuid,
}
