//! In-memory resource ledger with provider trees, inventories and traits

use async_trait::async_trait;
use placemend_core::{
    add_resources, AllocationCandidate, AllocationCandidateSet, AllocationRecord, CandidateQuery,
    PlacemendError, PlacemendResult, ProviderAggregates, RequestGroup, ResourceProvider, Resources,
    Service,
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::FaultInjector;
use crate::traits::LedgerService;

struct ProviderState {
    provider: ResourceProvider,
    inventory: Resources,
    traits: BTreeSet<String>,
    aggregates: BTreeSet<Uuid>,
}

#[derive(Default)]
struct LedgerState {
    providers: BTreeMap<Uuid, ProviderState>,
    consumers: BTreeMap<Uuid, AllocationRecord>,
}

impl LedgerState {
    fn usage(&self, provider: &Uuid) -> Resources {
        let mut used = Resources::new();
        for record in self.consumers.values() {
            if let Some(resources) = record.provider_resources(provider) {
                add_resources(&mut used, resources);
            }
        }
        used
    }

    fn free(&self, provider: &Uuid) -> Resources {
        let Some(state) = self.providers.get(provider) else {
            return Resources::new();
        };
        let used = self.usage(provider);
        state
            .inventory
            .iter()
            .map(|(rc, total)| {
                let free = total.saturating_sub(used.get(rc).copied().unwrap_or(0));
                (rc.clone(), free)
            })
            .collect()
    }

    /// `descendant` is `ancestor` or sits below it
    fn is_within(&self, descendant: Uuid, ancestor: Uuid) -> bool {
        let mut current = Some(descendant);
        while let Some(rp) = current {
            if rp == ancestor {
                return true;
            }
            current = self
                .providers
                .get(&rp)
                .and_then(|s| s.provider.parent_provider_uuid);
        }
        false
    }

    fn satisfies_traits(&self, provider: &Uuid, group: &RequestGroup) -> bool {
        let Some(state) = self.providers.get(provider) else {
            return false;
        };
        group.required_traits.is_subset(&state.traits)
            && group.forbidden_traits.is_disjoint(&state.traits)
    }

    fn fits(free: &Resources, wanted: &Resources) -> bool {
        wanted
            .iter()
            .all(|(rc, amount)| free.get(rc).map_or(false, |f| f >= amount))
    }

    fn candidates(&self, query: &CandidateQuery) -> Vec<AllocationCandidate> {
        if query.groups.is_empty() {
            return Vec::new();
        }

        let in_scope: Vec<Uuid> = self
            .providers
            .values()
            .filter(|s| match query.in_tree {
                Some(root) => s.provider.root_provider_uuid == Some(root),
                None => true,
            })
            .map(|s| s.provider.uuid)
            .collect();

        let options: Vec<Vec<Uuid>> = query
            .groups
            .iter()
            .map(|group| {
                in_scope
                    .iter()
                    .copied()
                    .filter(|rp| {
                        self.satisfies_traits(rp, group) && Self::fits(&self.free(rp), &group.resources)
                    })
                    .collect()
            })
            .collect();

        let mut found = Vec::new();
        let mut assignment = Vec::with_capacity(query.groups.len());
        self.assign(query, &options, &mut assignment, &mut found);
        found
    }

    fn assign(
        &self,
        query: &CandidateQuery,
        options: &[Vec<Uuid>],
        assignment: &mut Vec<Uuid>,
        found: &mut Vec<AllocationCandidate>,
    ) {
        let index = assignment.len();
        if index == query.groups.len() {
            if let Some(candidate) = self.build_candidate(query, assignment) {
                found.push(candidate);
            }
            return;
        }
        for rp in &options[index] {
            assignment.push(*rp);
            self.assign(query, options, assignment, found);
            assignment.pop();
        }
    }

    fn build_candidate(&self, query: &CandidateQuery, assignment: &[Uuid]) -> Option<AllocationCandidate> {
        let mut candidate = AllocationCandidate::default();
        for (group, rp) in query.groups.iter().zip(assignment) {
            add_resources(candidate.allocations.entry(*rp).or_default(), &group.resources);
            candidate.mappings.insert(group.requester_id.clone(), *rp);
        }

        for (rp, wanted) in &candidate.allocations {
            if !Self::fits(&self.free(rp), wanted) {
                return None;
            }
        }

        for subtree in &query.same_subtree {
            let members: Vec<Uuid> = subtree
                .iter()
                .filter_map(|id| candidate.mappings.get(id).copied())
                .collect();
            let shared_root = members
                .iter()
                .any(|top| members.iter().all(|rp| self.is_within(*rp, *top)));
            if !members.is_empty() && !shared_root {
                return None;
            }
        }

        Some(candidate)
    }
}

/// Resource ledger kept in memory
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    faults: FaultInjector,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            faults: FaultInjector::new(Service::Ledger),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Register a provider, under `parent` when given
    pub async fn add_provider(&self, name: &str, parent: Option<Uuid>) -> Uuid {
        let uuid = Uuid::new_v4();
        let mut state = self.state.write().await;
        let root = parent
            .and_then(|p| state.providers.get(&p))
            .and_then(|p| p.provider.root_provider_uuid)
            .unwrap_or(uuid);
        state.providers.insert(
            uuid,
            ProviderState {
                provider: ResourceProvider {
                    uuid,
                    name: name.to_string(),
                    generation: 0,
                    parent_provider_uuid: parent,
                    root_provider_uuid: Some(root),
                },
                inventory: Resources::new(),
                traits: BTreeSet::new(),
                aggregates: BTreeSet::new(),
            },
        );
        uuid
    }

    pub async fn set_inventory(&self, provider: Uuid, rclass: &str, total: u64) {
        if let Some(state) = self.state.write().await.providers.get_mut(&provider) {
            state.inventory.insert(rclass.to_string(), total);
        }
    }

    pub async fn add_trait(&self, provider: Uuid, name: &str) {
        if let Some(state) = self.state.write().await.providers.get_mut(&provider) {
            state.traits.insert(name.to_string());
        }
    }

    /// Store allocations directly, bypassing call counting and faults
    pub async fn seed_allocations(&self, consumer: Uuid, record: AllocationRecord) {
        self.state.write().await.consumers.insert(consumer, record);
    }

    /// Current allocations of a consumer, bypassing call counting and faults
    pub async fn allocations(&self, consumer: Uuid) -> Option<AllocationRecord> {
        self.state.read().await.consumers.get(&consumer).cloned()
    }

    /// Summed usage against a provider
    pub async fn usage(&self, provider: Uuid) -> Resources {
        self.state.read().await.usage(&provider)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerService for MemoryLedger {
    async fn get_allocations(&self, consumer: Uuid) -> PlacemendResult<Option<AllocationRecord>> {
        self.faults.check("get_allocations").await?;
        Ok(self.state.read().await.consumers.get(&consumer).cloned())
    }

    async fn get_allocation_candidates(
        &self,
        query: &CandidateQuery,
    ) -> PlacemendResult<AllocationCandidateSet> {
        self.faults.check("get_allocation_candidates").await?;
        let candidates = self.state.read().await.candidates(query);
        debug!(query = %query.describe(), found = candidates.len(), "Computed candidates");
        Ok(AllocationCandidateSet { candidates })
    }

    async fn put_allocations(
        &self,
        consumer: Uuid,
        record: &AllocationRecord,
    ) -> PlacemendResult<()> {
        self.faults.check("put_allocations").await?;
        let mut state = self.state.write().await;

        let current_generation = state.consumers.get(&consumer).and_then(|r| r.consumer_generation);
        if record.consumer_generation != current_generation {
            return Err(PlacemendError::Conflict(format!(
                "consumer generation conflict for {}: expected {:?}, got {:?}",
                consumer, current_generation, record.consumer_generation
            )));
        }
        if let Some(missing) = record
            .allocations
            .keys()
            .find(|rp| !state.providers.contains_key(rp))
        {
            return Err(PlacemendError::NotFound(format!("Resource provider {}", missing)));
        }

        let mut stored = record.clone();
        stored.consumer_generation = Some(current_generation.map_or(0, |g| g + 1));
        state.consumers.insert(consumer, stored);
        Ok(())
    }

    async fn delete_allocations(&self, consumer: Uuid) -> PlacemendResult<()> {
        self.faults.check("delete_allocations").await?;
        match self.state.write().await.consumers.remove(&consumer) {
            Some(_) => Ok(()),
            None => Err(PlacemendError::NotFound(format!("Consumer {}", consumer))),
        }
    }

    async fn list_providers(&self) -> PlacemendResult<Vec<ResourceProvider>> {
        self.faults.check("list_providers").await?;
        Ok(self
            .state
            .read()
            .await
            .providers
            .values()
            .map(|s| s.provider.clone())
            .collect())
    }

    async fn get_provider_allocations(
        &self,
        provider: Uuid,
    ) -> PlacemendResult<BTreeMap<Uuid, Resources>> {
        self.faults.check("get_provider_allocations").await?;
        let state = self.state.read().await;
        if !state.providers.contains_key(&provider) {
            return Err(PlacemendError::NotFound(format!("Resource provider {}", provider)));
        }
        Ok(state
            .consumers
            .iter()
            .filter_map(|(consumer, record)| {
                record
                    .provider_resources(&provider)
                    .map(|resources| (*consumer, resources.clone()))
            })
            .collect())
    }

    async fn get_provider_aggregates(&self, provider: Uuid) -> PlacemendResult<ProviderAggregates> {
        self.faults.check("get_provider_aggregates").await?;
        let state = self.state.read().await;
        let rp = state
            .providers
            .get(&provider)
            .ok_or_else(|| PlacemendError::NotFound(format!("Resource provider {}", provider)))?;
        Ok(ProviderAggregates {
            aggregates: rp.aggregates.clone(),
            generation: rp.provider.generation,
        })
    }

    async fn put_provider_aggregates(
        &self,
        provider: Uuid,
        aggregates: &ProviderAggregates,
    ) -> PlacemendResult<ProviderAggregates> {
        self.faults.check("put_provider_aggregates").await?;
        let mut state = self.state.write().await;
        let rp = state
            .providers
            .get_mut(&provider)
            .ok_or_else(|| PlacemendError::NotFound(format!("Resource provider {}", provider)))?;
        if rp.provider.generation != aggregates.generation {
            return Err(PlacemendError::Conflict(format!(
                "resource provider {} generation {} does not match {}",
                provider, rp.provider.generation, aggregates.generation
            )));
        }
        rp.aggregates = aggregates.aggregates.clone();
        rp.provider.generation += 1;
        Ok(ProviderAggregates {
            aggregates: rp.aggregates.clone(),
            generation: rp.provider.generation,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placemend_core::resource_class::*;
    use placemend_core::TraitPolicy;

    fn group(id: &str, pairs: &[(&str, u64)]) -> RequestGroup {
        let mut group = RequestGroup::new(id);
        for (rc, n) in pairs {
            group.add_resource(*rc, *n);
        }
        group
    }

    async fn node_with_bridges(ledger: &MemoryLedger, bridges: usize) -> (Uuid, Vec<Uuid>) {
        let node = ledger.add_provider("node1", None).await;
        ledger.set_inventory(node, VCPU, 8).await;
        let agent = ledger.add_provider("node1:agent", Some(node)).await;
        let mut out = Vec::new();
        for i in 0..bridges {
            let br = ledger.add_provider(&format!("node1:agent:br{}", i), Some(agent)).await;
            ledger.set_inventory(br, NET_BW_IGR_KILOBIT_PER_SEC, 100000).await;
            ledger.add_trait(br, "CUSTOM_PHYSNET_PHYSNET0").await;
            out.push(br);
        }
        (node, out)
    }

    #[tokio::test]
    async fn test_single_candidate_in_tree() {
        let ledger = MemoryLedger::new();
        let (node, bridges) = node_with_bridges(&ledger, 1).await;
        let (_other, _) = node_with_bridges(&ledger, 1).await;

        let query = CandidateQuery {
            groups: vec![group("port", &[(NET_BW_IGR_KILOBIT_PER_SEC, 1000)])],
            in_tree: Some(node),
            same_subtree: vec![],
        };
        let set = ledger.get_allocation_candidates(&query).await.unwrap();
        let candidate = set.exactly_one().unwrap();
        assert_eq!(candidate.mappings["port"], bridges[0]);
        assert_eq!(candidate.allocations[&bridges[0]][NET_BW_IGR_KILOBIT_PER_SEC], 1000);
    }

    #[tokio::test]
    async fn test_capacity_and_traits_filter() {
        let ledger = MemoryLedger::new();
        let (node, _) = node_with_bridges(&ledger, 1).await;

        let query = CandidateQuery {
            groups: vec![group("port", &[(NET_BW_IGR_KILOBIT_PER_SEC, 200000)])],
            in_tree: Some(node),
            same_subtree: vec![],
        };
        assert!(ledger.get_allocation_candidates(&query).await.unwrap().is_empty());

        let mut traited = group("port", &[(NET_BW_IGR_KILOBIT_PER_SEC, 10)]);
        traited.add_trait("CUSTOM_PHYSNET_OTHER", TraitPolicy::Required);
        let query = CandidateQuery {
            groups: vec![traited],
            in_tree: Some(node),
            same_subtree: vec![],
        };
        assert!(ledger.get_allocation_candidates(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_reduces_capacity() {
        let ledger = MemoryLedger::new();
        let (node, bridges) = node_with_bridges(&ledger, 1).await;
        let mut record = AllocationRecord::new("p", "u");
        record.add(
            bridges[0],
            &[(NET_BW_IGR_KILOBIT_PER_SEC.to_string(), 99600)].into_iter().collect(),
        );
        ledger.seed_allocations(Uuid::new_v4(), record).await;

        let query = CandidateQuery {
            groups: vec![group("port", &[(NET_BW_IGR_KILOBIT_PER_SEC, 1000)])],
            in_tree: Some(node),
            same_subtree: vec![],
        };
        assert!(ledger.get_allocation_candidates(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_bridges_are_ambiguous() {
        let ledger = MemoryLedger::new();
        let (node, _) = node_with_bridges(&ledger, 2).await;
        let query = CandidateQuery {
            groups: vec![group("port", &[(NET_BW_IGR_KILOBIT_PER_SEC, 1000)])],
            in_tree: Some(node),
            same_subtree: vec![],
        };
        assert_eq!(ledger.get_allocation_candidates(&query).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_same_subtree() {
        let ledger = MemoryLedger::new();
        let node = ledger.add_provider("node1", None).await;
        let agent_a = ledger.add_provider("agent-a", Some(node)).await;
        ledger.set_inventory(agent_a, NET_PACKET_RATE_KILOPACKET_PER_SEC, 1000).await;
        let br_a = ledger.add_provider("br-a", Some(agent_a)).await;
        ledger.set_inventory(br_a, NET_BW_IGR_KILOBIT_PER_SEC, 1000).await;
        let agent_b = ledger.add_provider("agent-b", Some(node)).await;
        let br_b = ledger.add_provider("br-b", Some(agent_b)).await;
        ledger.set_inventory(br_b, NET_BW_IGR_KILOBIT_PER_SEC, 1000).await;

        let groups = vec![
            group("pps", &[(NET_PACKET_RATE_KILOPACKET_PER_SEC, 10)]),
            group("bw", &[(NET_BW_IGR_KILOBIT_PER_SEC, 10)]),
        ];
        let loose = CandidateQuery {
            groups: groups.clone(),
            in_tree: Some(node),
            same_subtree: vec![],
        };
        assert_eq!(ledger.get_allocation_candidates(&loose).await.unwrap().len(), 2);

        let strict = CandidateQuery {
            groups,
            in_tree: Some(node),
            same_subtree: vec![vec!["pps".to_string(), "bw".to_string()]],
        };
        let candidate = ledger
            .get_allocation_candidates(&strict)
            .await
            .unwrap()
            .exactly_one()
            .unwrap();
        assert_eq!(candidate.mappings["bw"], br_a);
    }

    #[tokio::test]
    async fn test_put_checks_consumer_generation() {
        let ledger = MemoryLedger::new();
        let node = ledger.add_provider("node1", None).await;
        let consumer = Uuid::new_v4();
        let mut record = AllocationRecord::new("p", "u");
        record.add(node, &[(VCPU.to_string(), 1)].into_iter().collect());

        ledger.put_allocations(consumer, &record).await.unwrap();
        let stored = ledger.allocations(consumer).await.unwrap();
        assert_eq!(stored.consumer_generation, Some(0));

        assert!(matches!(
            ledger.put_allocations(consumer, &record).await,
            Err(PlacemendError::Conflict(_))
        ));
        ledger.put_allocations(consumer, &stored).await.unwrap();
        assert_eq!(ledger.faults().calls("put_allocations").await, 3);
    }

    #[tokio::test]
    async fn test_put_rejects_unknown_provider() {
        let ledger = MemoryLedger::new();
        let mut record = AllocationRecord::new("p", "u");
        record.add(Uuid::new_v4(), &[(VCPU.to_string(), 1)].into_iter().collect());
        assert!(matches!(
            ledger.put_allocations(Uuid::new_v4(), &record).await,
            Err(PlacemendError::NotFound(_))
        ));
    }
}
