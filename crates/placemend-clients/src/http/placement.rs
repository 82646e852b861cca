//! Placement HTTP API backend for the ledger

use async_trait::async_trait;
use placemend_core::{
    AllocationCandidate, AllocationCandidateSet, AllocationRecord, CandidateQuery, LedgerConfig,
    PlacemendError, PlacemendResult, ProviderAggregates, ProviderAllocation, RequestGroup,
    ResourceProvider, Resources, Service,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

use super::{build_client, check_status, join, json, transport_error};
use crate::traits::LedgerService;

const VERSION_HEADER: &str = "OpenStack-API-Version";
const MAX_SUFFIX_LEN: usize = 63;

#[derive(Deserialize)]
struct WireResources {
    #[serde(default)]
    resources: Resources,
}

#[derive(Deserialize)]
struct AllocationsBody {
    #[serde(default)]
    allocations: BTreeMap<Uuid, WireResources>,
    #[serde(default)]
    consumer_generation: Option<u64>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct AllocationRequest {
    allocations: BTreeMap<Uuid, WireResources>,
    #[serde(default)]
    mappings: BTreeMap<String, Vec<Uuid>>,
}

#[derive(Deserialize)]
struct CandidatesBody {
    #[serde(default)]
    allocation_requests: Vec<AllocationRequest>,
}

#[derive(Deserialize)]
struct ProvidersBody {
    resource_providers: Vec<ResourceProvider>,
}

#[derive(Deserialize)]
struct AggregatesBody {
    aggregates: BTreeSet<Uuid>,
    resource_provider_generation: u64,
}

/// Ledger backed by the placement REST API
pub struct HttpPlacement {
    client: reqwest::Client,
    endpoint: String,
    microversion: String,
}

impl HttpPlacement {
    pub fn new(config: &LedgerConfig) -> PlacemendResult<Self> {
        Ok(Self {
            client: build_client(Service::Ledger, config.timeout_secs)?,
            endpoint: config.endpoint.clone(),
            microversion: config.microversion.clone(),
        })
    }

    fn version(&self) -> String {
        format!("placement {}", self.microversion)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, join(&self.endpoint, path))
            .header(VERSION_HEADER, self.version())
    }

    async fn send(
        &self,
        what: &str,
        builder: reqwest::RequestBuilder,
    ) -> PlacemendResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(Service::Ledger, e))?;
        check_status(Service::Ledger, what, response).await
    }
}

/// Granular group suffix for a requester id
fn group_suffix(requester_id: &str) -> String {
    let cleaned: String = requester_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_SUFFIX_LEN)
        .collect();
    format!("_{}", cleaned)
}

/// Unique suffix per requester id. Ids that clean or truncate to the same
/// suffix get a numeric tag, still within the length limit.
#[derive(Default)]
struct SuffixTable {
    by_requester: BTreeMap<String, String>,
    by_suffix: BTreeMap<String, String>,
}

impl SuffixTable {
    fn assign(&mut self, requester_id: &str) -> String {
        if let Some(suffix) = self.by_requester.get(requester_id) {
            return suffix.clone();
        }
        let base = group_suffix(requester_id);
        let mut suffix = base.clone();
        let mut tag = 1;
        while self.by_suffix.contains_key(&suffix) {
            let tag_str = tag.to_string();
            let keep = base.len().min(MAX_SUFFIX_LEN + 1 - tag_str.len());
            suffix = format!("{}{}", &base[..keep], tag_str);
            tag += 1;
        }
        self.by_requester.insert(requester_id.to_string(), suffix.clone());
        self.by_suffix.insert(suffix.clone(), requester_id.to_string());
        suffix
    }
}

fn join_resources(resources: &Resources) -> String {
    resources
        .iter()
        .map(|(rc, amount)| format!("{}:{}", rc, amount))
        .collect::<Vec<_>>()
        .join(",")
}

fn join_traits(group: &RequestGroup) -> String {
    group
        .required_traits
        .iter()
        .cloned()
        .chain(group.forbidden_traits.iter().map(|t| format!("!{}", t)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Query-string parameters for a candidate query, plus the suffix -> requester
/// id map needed to read the mappings back
fn candidate_params(query: &CandidateQuery) -> (Vec<(String, String)>, BTreeMap<String, String>) {
    let mut params = Vec::new();
    let mut table = SuffixTable::default();

    for group in &query.groups {
        let suffix = table.assign(&group.requester_id);
        params.push((format!("resources{}", suffix), join_resources(&group.resources)));
        let traits = join_traits(group);
        if !traits.is_empty() {
            params.push((format!("required{}", suffix), traits));
        }
        if let Some(root) = query.in_tree {
            params.push((format!("in_tree{}", suffix), root.to_string()));
        }
    }

    for subtree in &query.same_subtree {
        let members: Vec<String> = subtree.iter().map(|id| table.assign(id)).collect();
        params.push(("same_subtree".to_string(), members.join(",")));
    }
    if query.groups.len() > 1 {
        params.push(("group_policy".to_string(), "none".to_string()));
    }
    (params, table.by_suffix)
}

#[async_trait]
impl LedgerService for HttpPlacement {
    async fn get_allocations(&self, consumer: Uuid) -> PlacemendResult<Option<AllocationRecord>> {
        let path = format!("allocations/{}", consumer);
        let response = self
            .send("GET allocations", self.request(reqwest::Method::GET, &path))
            .await?;
        let body: AllocationsBody = json(Service::Ledger, response).await?;
        if body.allocations.is_empty() {
            return Ok(None);
        }

        let (Some(project_id), Some(user_id)) = (body.project_id, body.user_id) else {
            return Err(PlacemendError::InvalidResponse {
                service: Service::Ledger,
                message: format!("allocations for {} lack project/user", consumer),
            });
        };
        let mut record = AllocationRecord::new(project_id, user_id);
        record.consumer_generation = body.consumer_generation;
        record.allocations = body
            .allocations
            .into_iter()
            .map(|(rp, wire)| (rp, ProviderAllocation { resources: wire.resources }))
            .collect();
        Ok(Some(record))
    }

    async fn get_allocation_candidates(
        &self,
        query: &CandidateQuery,
    ) -> PlacemendResult<AllocationCandidateSet> {
        let (params, suffixes) = candidate_params(query);
        debug!(query = %query.describe(), "GET allocation_candidates");
        let response = self
            .send(
                "GET allocation_candidates",
                self.request(reqwest::Method::GET, "allocation_candidates")
                    .query(&params),
            )
            .await?;
        let body: CandidatesBody = json(Service::Ledger, response).await?;

        let candidates = body
            .allocation_requests
            .into_iter()
            .map(|req| AllocationCandidate {
                allocations: req
                    .allocations
                    .into_iter()
                    .map(|(rp, wire)| (rp, wire.resources))
                    .collect(),
                mappings: req
                    .mappings
                    .into_iter()
                    .filter_map(|(suffix, rps)| {
                        let requester = suffixes.get(&suffix)?;
                        rps.first().map(|rp| (requester.clone(), *rp))
                    })
                    .collect(),
            })
            .collect();
        Ok(AllocationCandidateSet { candidates })
    }

    async fn put_allocations(
        &self,
        consumer: Uuid,
        record: &AllocationRecord,
    ) -> PlacemendResult<()> {
        let allocations: BTreeMap<String, serde_json::Value> = record
            .allocations
            .iter()
            .map(|(rp, alloc)| (rp.to_string(), json!({ "resources": alloc.resources })))
            .collect();
        let body = json!({
            "allocations": allocations,
            "project_id": record.project_id,
            "user_id": record.user_id,
            "consumer_generation": record.consumer_generation,
        });
        let path = format!("allocations/{}", consumer);
        self.send(
            "PUT allocations",
            self.request(reqwest::Method::PUT, &path).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_allocations(&self, consumer: Uuid) -> PlacemendResult<()> {
        let path = format!("allocations/{}", consumer);
        self.send("DELETE allocations", self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }

    async fn list_providers(&self) -> PlacemendResult<Vec<ResourceProvider>> {
        let response = self
            .send(
                "GET resource_providers",
                self.request(reqwest::Method::GET, "resource_providers"),
            )
            .await?;
        let body: ProvidersBody = json(Service::Ledger, response).await?;
        Ok(body.resource_providers)
    }

    async fn get_provider_allocations(
        &self,
        provider: Uuid,
    ) -> PlacemendResult<BTreeMap<Uuid, Resources>> {
        let path = format!("resource_providers/{}/allocations", provider);
        let response = self
            .send(
                "GET provider allocations",
                self.request(reqwest::Method::GET, &path),
            )
            .await?;
        let body: AllocationsBody = json(Service::Ledger, response).await?;
        Ok(body
            .allocations
            .into_iter()
            .map(|(consumer, wire)| (consumer, wire.resources))
            .collect())
    }

    async fn get_provider_aggregates(&self, provider: Uuid) -> PlacemendResult<ProviderAggregates> {
        let path = format!("resource_providers/{}/aggregates", provider);
        let response = self
            .send(
                "GET provider aggregates",
                self.request(reqwest::Method::GET, &path),
            )
            .await?;
        let body: AggregatesBody = json(Service::Ledger, response).await?;
        Ok(ProviderAggregates {
            aggregates: body.aggregates,
            generation: body.resource_provider_generation,
        })
    }

    async fn put_provider_aggregates(
        &self,
        provider: Uuid,
        aggregates: &ProviderAggregates,
    ) -> PlacemendResult<ProviderAggregates> {
        let path = format!("resource_providers/{}/aggregates", provider);
        let body = json!({
            "aggregates": aggregates.aggregates,
            "resource_provider_generation": aggregates.generation,
        });
        let response = self
            .request(reqwest::Method::PUT, &path)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Service::Ledger, e))?;
        if response.status() == StatusCode::CONFLICT {
            return Err(PlacemendError::Conflict(format!(
                "resource provider {} generation {} is stale",
                provider, aggregates.generation
            )));
        }
        let response = check_status(Service::Ledger, "PUT provider aggregates", response).await?;
        let body: AggregatesBody = json(Service::Ledger, response).await?;
        Ok(ProviderAggregates {
            aggregates: body.aggregates,
            generation: body.resource_provider_generation,
        })
    }

    fn name(&self) -> &'static str {
        "placement"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placemend_core::resource_class::*;
    use placemend_core::TraitPolicy;

    #[test]
    fn test_group_suffix() {
        let port = Uuid::new_v4();
        assert_eq!(group_suffix(&port.to_string()), format!("_{}", port));
        assert_eq!(group_suffix("device profile.0"), "_device_profile_0");
        assert_eq!(group_suffix(&"x".repeat(80)).len(), 64);
    }

    #[test]
    fn test_colliding_suffixes_are_disambiguated() {
        let prefix = "p".repeat(70);
        let first = format!("{}-a", prefix);
        let second = format!("{}-b", prefix);
        let mut a = RequestGroup::new(first.clone());
        a.add_resource(NET_BW_IGR_KILOBIT_PER_SEC, 10);
        let mut b = RequestGroup::new(second.clone());
        b.add_resource(NET_BW_IGR_KILOBIT_PER_SEC, 20);
        let query = CandidateQuery {
            groups: vec![a, b],
            in_tree: None,
            same_subtree: vec![vec![first.clone(), second.clone()]],
        };

        let (params, suffixes) = candidate_params(&query);
        assert_eq!(suffixes.len(), 2);
        let names: Vec<&String> = suffixes.keys().collect();
        assert!(names.iter().all(|s| s.len() <= MAX_SUFFIX_LEN + 1));
        assert!(suffixes.values().any(|id| *id == first));
        assert!(suffixes.values().any(|id| *id == second));

        let resource_keys = params.iter().filter(|(k, _)| k.starts_with("resources")).count();
        assert_eq!(resource_keys, 2);
        let subtree = &params.iter().find(|(k, _)| k == "same_subtree").unwrap().1;
        let members: Vec<&str> = subtree.split(',').collect();
        assert_eq!(members.len(), 2);
        assert_ne!(members[0], members[1]);
    }

    #[test]
    fn test_candidate_params() {
        let root = Uuid::new_v4();
        let mut bw = RequestGroup::new("bw");
        bw.add_resource(NET_BW_IGR_KILOBIT_PER_SEC, 1000);
        bw.add_resource(NET_BW_EGR_KILOBIT_PER_SEC, 1000);
        bw.add_trait("CUSTOM_PHYSNET_PHYSNET0", TraitPolicy::Required);
        bw.add_trait("CUSTOM_SLOW", TraitPolicy::Forbidden);
        let mut pps = RequestGroup::new("pps");
        pps.add_resource(NET_PACKET_RATE_KILOPACKET_PER_SEC, 10);

        let query = CandidateQuery {
            groups: vec![bw, pps],
            in_tree: Some(root),
            same_subtree: vec![vec!["bw".to_string(), "pps".to_string()]],
        };
        let (params, suffixes) = candidate_params(&query);
        let lookup = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(
            lookup("resources_bw").unwrap(),
            "NET_BW_EGR_KILOBIT_PER_SEC:1000,NET_BW_IGR_KILOBIT_PER_SEC:1000"
        );
        assert_eq!(
            lookup("required_bw").unwrap(),
            "CUSTOM_PHYSNET_PHYSNET0,!CUSTOM_SLOW"
        );
        assert_eq!(lookup("in_tree_pps").unwrap(), root.to_string());
        assert!(lookup("required_pps").is_none());
        assert_eq!(lookup("same_subtree").unwrap(), "_bw,_pps");
        assert_eq!(lookup("group_policy").unwrap(), "none");
        assert_eq!(suffixes["_pps"], "pps");
    }

    #[test]
    fn test_parse_candidates_body() {
        let rp = Uuid::new_v4();
        let body: CandidatesBody = serde_json::from_value(json!({
            "allocation_requests": [{
                "allocations": {rp.to_string(): {"resources": {"NET_BW_IGR_KILOBIT_PER_SEC": 1000}}},
                "mappings": {"_bw": [rp.to_string()]}
            }],
            "provider_summaries": {}
        }))
        .unwrap();
        assert_eq!(body.allocation_requests.len(), 1);
        assert_eq!(body.allocation_requests[0].mappings["_bw"], vec![rp]);
    }

    #[test]
    fn test_new_from_config() {
        let placement = HttpPlacement::new(&LedgerConfig::default()).unwrap();
        assert_eq!(placement.version(), "placement 1.36");
    }
}
