//! Ledger-side types: resource classes, allocation records, request groups
//! and allocation candidates

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Standard resource class names
pub mod resource_class {
    pub const VCPU: &str = "VCPU";
    pub const PCPU: &str = "PCPU";
    pub const MEMORY_MB: &str = "MEMORY_MB";
    pub const DISK_GB: &str = "DISK_GB";
    pub const VGPU: &str = "VGPU";
    pub const NET_BW_IGR_KILOBIT_PER_SEC: &str = "NET_BW_IGR_KILOBIT_PER_SEC";
    pub const NET_BW_EGR_KILOBIT_PER_SEC: &str = "NET_BW_EGR_KILOBIT_PER_SEC";
    pub const NET_PACKET_RATE_KILOPACKET_PER_SEC: &str = "NET_PACKET_RATE_KILOPACKET_PER_SEC";
}

/// Project/user id the ledger assigns to consumers written without identity
pub const INCOMPLETE_CONSUMER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Resource class name -> amount
pub type Resources = BTreeMap<String, u64>;

/// Add every amount in `from` onto `into`
pub fn add_resources(into: &mut Resources, from: &Resources) {
    for (rc, amount) in from {
        *into.entry(rc.clone()).or_insert(0) += amount;
    }
}

/// Claims held by one consumer against one provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAllocation {
    pub resources: Resources,
}

/// Allocations held by a consumer, keyed by resource provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Provider uuid -> claimed resources
    pub allocations: BTreeMap<Uuid, ProviderAllocation>,
    /// Owning project; the sentinel for legacy records
    pub project_id: String,
    /// Owning user; the sentinel for legacy records
    pub user_id: String,
    /// Consumer generation as last read from the ledger
    #[serde(default)]
    pub consumer_generation: Option<u64>,
}

impl AllocationRecord {
    /// Create an empty record owned by the given project and user
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            allocations: BTreeMap::new(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            consumer_generation: None,
        }
    }

    /// Whether the record holds no claims at all
    pub fn is_empty(&self) -> bool {
        self.allocations
            .values()
            .all(|alloc| alloc.resources.values().all(|amount| *amount == 0))
    }

    /// Add resources against a provider, summing with what is already there
    pub fn add(&mut self, provider: Uuid, resources: &Resources) {
        let entry = self.allocations.entry(provider).or_default();
        add_resources(&mut entry.resources, resources);
        entry.resources.retain(|_, amount| *amount > 0);
        if entry.resources.is_empty() {
            self.allocations.remove(&provider);
        }
    }

    /// Resources claimed against one provider
    pub fn provider_resources(&self, provider: &Uuid) -> Option<&Resources> {
        self.allocations.get(provider).map(|a| &a.resources)
    }

    /// Drop one provider's claims, returning them
    pub fn remove_provider(&mut self, provider: &Uuid) -> Option<ProviderAllocation> {
        self.allocations.remove(provider)
    }

    /// Whether project or user still carries the sentinel value
    pub fn has_incomplete_consumer(&self) -> bool {
        self.project_id == INCOMPLETE_CONSUMER_ID || self.user_id == INCOMPLETE_CONSUMER_ID
    }

    /// Same claims and same owner; generations are not compared
    pub fn matches(&self, other: &AllocationRecord) -> bool {
        self.allocations == other.allocations
            && self.project_id == other.project_id
            && self.user_id == other.user_id
    }

    /// Sum of all claims across providers
    pub fn total(&self) -> Resources {
        let mut total = Resources::new();
        for alloc in self.allocations.values() {
            add_resources(&mut total, &alloc.resources);
        }
        total
    }
}

/// Whether a trait must be present or absent on the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraitPolicy {
    Required,
    Forbidden,
}

/// Resources and traits that a single provider must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGroup {
    /// Identifier the ledger echoes back in candidate mappings
    pub requester_id: String,
    pub resources: Resources,
    #[serde(default)]
    pub required_traits: BTreeSet<String>,
    #[serde(default)]
    pub forbidden_traits: BTreeSet<String>,
}

impl RequestGroup {
    pub fn new(requester_id: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            ..Default::default()
        }
    }

    pub fn add_resource(&mut self, rclass: impl Into<String>, amount: u64) {
        *self.resources.entry(rclass.into()).or_insert(0) += amount;
    }

    pub fn add_trait(&mut self, name: impl Into<String>, policy: TraitPolicy) {
        let name = name.into();
        match policy {
            TraitPolicy::Required => self.required_traits.insert(name),
            TraitPolicy::Forbidden => self.forbidden_traits.insert(name),
        };
    }
}

/// A request for allocation candidates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub groups: Vec<RequestGroup>,
    /// Restrict candidates to the provider tree rooted here
    pub in_tree: Option<Uuid>,
    /// Requester ids that must be satisfied from one subtree
    #[serde(default)]
    pub same_subtree: Vec<Vec<String>>,
}

impl CandidateQuery {
    /// Human-readable form used in operator messages
    pub fn describe(&self) -> String {
        let groups: Vec<String> = self
            .groups
            .iter()
            .map(|g| {
                let resources: Vec<String> = g
                    .resources
                    .iter()
                    .map(|(rc, amount)| format!("{}:{}", rc, amount))
                    .collect();
                let traits: Vec<&str> = g.required_traits.iter().map(|t| t.as_str()).collect();
                format!(
                    "{}[resources={} required={}]",
                    g.requester_id,
                    resources.join(","),
                    traits.join(",")
                )
            })
            .collect();
        match self.in_tree {
            Some(root) => format!("{} in_tree={}", groups.join(" "), root),
            None => groups.join(" "),
        }
    }
}

/// One viable way to satisfy a CandidateQuery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationCandidate {
    /// Provider uuid -> resources this candidate would claim there
    pub allocations: BTreeMap<Uuid, Resources>,
    /// Requester id -> provider satisfying that group
    pub mappings: BTreeMap<String, Uuid>,
}

/// Transient result of a candidate query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationCandidateSet {
    pub candidates: Vec<AllocationCandidate>,
}

impl AllocationCandidateSet {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The single candidate, or the number of candidates found when that is
    /// not exactly one. No tie-break is attempted.
    pub fn exactly_one(mut self) -> Result<AllocationCandidate, usize> {
        if self.candidates.len() == 1 {
            Ok(self.candidates.remove(0))
        } else {
            Err(self.candidates.len())
        }
    }
}

/// A resource provider as listed by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProvider {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub parent_provider_uuid: Option<Uuid>,
    #[serde(default)]
    pub root_provider_uuid: Option<Uuid>,
}

/// Aggregate membership of a provider, with the generation to write against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAggregates {
    pub aggregates: BTreeSet<Uuid>,
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::resource_class::*;
    use super::*;

    fn resources(pairs: &[(&str, u64)]) -> Resources {
        pairs.iter().map(|(rc, n)| (rc.to_string(), *n)).collect()
    }

    #[test]
    fn test_add_merges_per_provider() {
        let rp = Uuid::new_v4();
        let mut record = AllocationRecord::new("p", "u");
        record.add(rp, &resources(&[(NET_BW_IGR_KILOBIT_PER_SEC, 1000)]));
        record.add(rp, &resources(&[(NET_BW_IGR_KILOBIT_PER_SEC, 500)]));

        assert_eq!(
            record.provider_resources(&rp).unwrap()[NET_BW_IGR_KILOBIT_PER_SEC],
            1500
        );
    }

    #[test]
    fn test_add_drops_zero_amounts() {
        let rp = Uuid::new_v4();
        let mut record = AllocationRecord::new("p", "u");
        record.add(rp, &resources(&[(VCPU, 0)]));
        assert!(record.allocations.is_empty());
        assert!(record.is_empty());
    }

    #[test]
    fn test_matches_ignores_generation() {
        let rp = Uuid::new_v4();
        let mut a = AllocationRecord::new("p", "u");
        a.add(rp, &resources(&[(VCPU, 1), (MEMORY_MB, 512)]));
        let mut b = a.clone();
        b.consumer_generation = Some(7);
        assert!(a.matches(&b));

        b.user_id = INCOMPLETE_CONSUMER_ID.to_string();
        assert!(!a.matches(&b));
        assert!(b.has_incomplete_consumer());
    }

    #[test]
    fn test_exactly_one() {
        let set = AllocationCandidateSet::default();
        assert_eq!(set.exactly_one(), Err(0));

        let set = AllocationCandidateSet {
            candidates: vec![AllocationCandidate::default(); 2],
        };
        assert_eq!(set.exactly_one(), Err(2));

        let set = AllocationCandidateSet {
            candidates: vec![AllocationCandidate::default()],
        };
        assert!(set.exactly_one().is_ok());
    }

    #[test]
    fn test_total() {
        let mut record = AllocationRecord::new("p", "u");
        record.add(Uuid::new_v4(), &resources(&[(VCPU, 1)]));
        record.add(Uuid::new_v4(), &resources(&[(VCPU, 2), (DISK_GB, 1)]));
        assert_eq!(record.total(), resources(&[(VCPU, 3), (DISK_GB, 1)]));
    }
}
