//! Service trait definitions
//!
//! Each external collaborator is reached through one of these traits. The
//! engine only ever sees the traits, so the in-memory and HTTP backends are
//! interchangeable.

use async_trait::async_trait;
use placemend_core::{
    AcceleratorRequest, AllocationCandidateSet, AllocationRecord, ArqBinding, BindingProfile,
    CandidateQuery, ComputeNode, DeviceProfile, HostAggregate, Migration, PageMarker,
    PlacemendResult, Port, ProviderAggregates, ResourceProvider, Resources, Shard, ShardId,
    Workload, WorkloadFilter, WorkloadPage,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Resource accounting service (placement)
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Allocations held by a consumer; `None` when it holds nothing
    async fn get_allocations(&self, consumer: Uuid) -> PlacemendResult<Option<AllocationRecord>>;

    /// Viable ways to satisfy a request
    async fn get_allocation_candidates(
        &self,
        query: &CandidateQuery,
    ) -> PlacemendResult<AllocationCandidateSet>;

    /// Replace all allocations of a consumer. Atomic at the service boundary.
    async fn put_allocations(&self, consumer: Uuid, record: &AllocationRecord)
        -> PlacemendResult<()>;

    /// Remove every allocation of a consumer
    async fn delete_allocations(&self, consumer: Uuid) -> PlacemendResult<()>;

    /// All resource providers
    async fn list_providers(&self) -> PlacemendResult<Vec<ResourceProvider>>;

    /// Consumers holding allocations against a provider, with their amounts
    async fn get_provider_allocations(
        &self,
        provider: Uuid,
    ) -> PlacemendResult<BTreeMap<Uuid, Resources>>;

    async fn get_provider_aggregates(&self, provider: Uuid) -> PlacemendResult<ProviderAggregates>;

    /// Generation-checked replacement of a provider's aggregates
    async fn put_provider_aggregates(
        &self,
        provider: Uuid,
        aggregates: &ProviderAggregates,
    ) -> PlacemendResult<ProviderAggregates>;

    /// Backend name
    fn name(&self) -> &'static str;
}

/// Filter for listing ports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    /// Only ports bound to this device (workload)
    pub device_id: Option<Uuid>,
}

impl PortFilter {
    pub fn device(device_id: Uuid) -> Self {
        Self {
            device_id: Some(device_id),
        }
    }

    pub fn matches(&self, port: &Port) -> bool {
        self.device_id.map_or(true, |id| port.device_id == Some(id))
    }
}

/// Network port service
#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn list_ports(&self, filter: &PortFilter) -> PlacemendResult<Vec<Port>>;

    /// Replace a port's binding profile
    async fn update_binding_profile(
        &self,
        port_id: Uuid,
        profile: &BindingProfile,
    ) -> PlacemendResult<()>;

    fn name(&self) -> &'static str;
}

/// Accelerator request service
#[async_trait]
pub trait AcceleratorService: Send + Sync {
    async fn create_device_profile(&self, profile: &DeviceProfile) -> PlacemendResult<()>;

    /// Profiles with the given name
    async fn get_device_profiles(&self, name: &str) -> PlacemendResult<Vec<DeviceProfile>>;

    /// Create one request per device the profile asks for
    async fn create_requests(&self, profile_name: &str)
        -> PlacemendResult<Vec<AcceleratorRequest>>;

    async fn bind_requests(&self, bindings: &[ArqBinding]) -> PlacemendResult<()>;

    /// Requests of a workload, optionally only those whose binding resolved
    async fn list_requests(
        &self,
        instance: Uuid,
        only_resolved: bool,
    ) -> PlacemendResult<Vec<AcceleratorRequest>>;

    async fn get_request(&self, uuid: Uuid) -> PlacemendResult<Option<AcceleratorRequest>>;

    async fn delete_requests_for_instance(&self, instance: Uuid) -> PlacemendResult<()>;

    async fn delete_requests(&self, uuids: &[Uuid]) -> PlacemendResult<()>;

    fn name(&self) -> &'static str;
}

/// Sharded workload record store
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn list_shards(&self) -> PlacemendResult<Vec<Shard>>;

    /// One page of workloads in ascending creation order, after `after`
    async fn list_workloads(
        &self,
        shard: ShardId,
        filter: &WorkloadFilter,
        after: Option<PageMarker>,
        limit: usize,
    ) -> PlacemendResult<WorkloadPage>;

    /// Shard holding a workload, from the workload mapping table
    async fn locate_workload(&self, uuid: Uuid) -> PlacemendResult<Option<ShardId>>;

    async fn get_workload(&self, shard: ShardId, uuid: Uuid) -> PlacemendResult<Option<Workload>>;

    async fn migrations_in_progress(&self, shard: ShardId) -> PlacemendResult<Vec<Migration>>;

    async fn compute_node(
        &self,
        shard: ShardId,
        host: &str,
        node: &str,
    ) -> PlacemendResult<Option<ComputeNode>>;

    /// Compute nodes of a host across all shards
    async fn compute_nodes_for_host(&self, host: &str) -> PlacemendResult<Vec<ComputeNode>>;

    async fn host_aggregates(&self) -> PlacemendResult<Vec<HostAggregate>>;

    fn name(&self) -> &'static str;
}
