//! Typed client for the resource ledger

use placemend_core::{
    AllocationCandidateSet, AllocationRecord, CandidateQuery, PlacemendError, PlacemendResult,
    ResourceProvider, Resources,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::traits::LedgerService;

/// Attempts for a generation-checked aggregate write
const AGGREGATE_WRITE_ATTEMPTS: usize = 3;

/// Client for allocation reads/writes, candidate queries and aggregates
#[derive(Clone)]
pub struct ResourceLedgerClient {
    service: Arc<dyn LedgerService>,
}

impl ResourceLedgerClient {
    pub fn new(service: Arc<dyn LedgerService>) -> Self {
        Self { service }
    }

    pub async fn get_allocations(&self, consumer: Uuid) -> PlacemendResult<Option<AllocationRecord>> {
        let record = self.service.get_allocations(consumer).await?;
        Ok(record.filter(|r| !r.is_empty()))
    }

    pub async fn get_allocation_candidates(
        &self,
        query: &CandidateQuery,
    ) -> PlacemendResult<AllocationCandidateSet> {
        let candidates = self.service.get_allocation_candidates(query).await?;
        debug!(
            groups = query.groups.len(),
            candidates = candidates.len(),
            "Queried allocation candidates"
        );
        Ok(candidates)
    }

    pub async fn put_allocations(
        &self,
        consumer: Uuid,
        record: &AllocationRecord,
    ) -> PlacemendResult<()> {
        self.service.put_allocations(consumer, record).await?;
        info!(
            consumer = %consumer,
            providers = record.allocations.len(),
            "Wrote allocations"
        );
        Ok(())
    }

    pub async fn delete_allocations(&self, consumer: Uuid) -> PlacemendResult<()> {
        self.service.delete_allocations(consumer).await?;
        info!(consumer = %consumer, "Deleted allocations");
        Ok(())
    }

    /// Drop one provider's part of a consumer's allocations. The consumer is
    /// deleted outright when nothing else remains. Returns false when the
    /// consumer held nothing against the provider.
    pub async fn remove_provider_allocation(
        &self,
        consumer: Uuid,
        provider: Uuid,
    ) -> PlacemendResult<bool> {
        let Some(mut record) = self.get_allocations(consumer).await? else {
            return Ok(false);
        };
        if record.remove_provider(&provider).is_none() {
            return Ok(false);
        }

        if record.is_empty() {
            self.delete_allocations(consumer).await?;
        } else {
            self.put_allocations(consumer, &record).await?;
        }
        Ok(true)
    }

    pub async fn list_providers(&self) -> PlacemendResult<Vec<ResourceProvider>> {
        self.service.list_providers().await
    }

    /// Find a provider by uuid or by name
    pub async fn find_provider(&self, name_or_uuid: &str) -> PlacemendResult<ResourceProvider> {
        let wanted = Uuid::parse_str(name_or_uuid).ok();
        self.list_providers()
            .await?
            .into_iter()
            .find(|rp| Some(rp.uuid) == wanted || rp.name == name_or_uuid)
            .ok_or_else(|| {
                PlacemendError::NotFound(format!("Resource provider {}", name_or_uuid))
            })
    }

    /// Consumers with allocations against a provider
    pub async fn provider_consumers(
        &self,
        provider: Uuid,
    ) -> PlacemendResult<BTreeMap<Uuid, Resources>> {
        self.service.get_provider_allocations(provider).await
    }

    /// Make sure a provider is a member of the aggregate. Returns true when
    /// the membership was added, false when it was already there.
    pub async fn ensure_aggregate(&self, provider: Uuid, aggregate: Uuid) -> PlacemendResult<bool> {
        let mut last_conflict = None;
        for attempt in 1..=AGGREGATE_WRITE_ATTEMPTS {
            let mut current = self.service.get_provider_aggregates(provider).await?;
            if current.aggregates.contains(&aggregate) {
                return Ok(false);
            }
            current.aggregates.insert(aggregate);

            match self.service.put_provider_aggregates(provider, &current).await {
                Ok(_) => {
                    debug!(provider = %provider, aggregate = %aggregate, "Added provider aggregate");
                    return Ok(true);
                }
                Err(PlacemendError::Conflict(msg)) => {
                    warn!(
                        provider = %provider,
                        attempt = attempt,
                        error = %msg,
                        "Provider generation conflict, retrying"
                    );
                    last_conflict = Some(msg);
                }
                Err(e) => return Err(e),
            }
        }
        Err(PlacemendError::Conflict(last_conflict.unwrap_or_default()))
    }

    pub fn backend(&self) -> &'static str {
        self.service.name()
    }
}
