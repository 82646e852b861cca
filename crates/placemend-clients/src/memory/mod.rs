//! In-memory service backends
//!
//! These back the test suites and dry local runs. Every backend carries a
//! [`FaultInjector`] so a test can make the N-th call of an operation fail, or
//! fail every call until cleared. Operations are named after the trait method
//! they belong to (`put_allocations`, `update_binding_profile`, ...), and the
//! injector also counts calls per operation.

mod accelerator;
mod ledger;
mod network;
mod store;

pub use accelerator::MemoryAccelerator;
pub use ledger::MemoryLedger;
pub use network::MemoryNetwork;
pub use store::{MemoryStore, ShardData, StoreSnapshot};

use placemend_core::{PlacemendError, PlacemendResult, Service};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Kind of failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The service cannot be reached
    Unavailable,
    /// A generation check fails
    Conflict,
}

#[derive(Debug, Default)]
struct FaultState {
    calls: HashMap<String, usize>,
    planned: HashMap<(String, usize), FaultKind>,
    always: HashMap<String, FaultKind>,
}

/// Per-operation call counting and failure injection
#[derive(Debug)]
pub struct FaultInjector {
    service: Service,
    state: RwLock<FaultState>,
}

impl FaultInjector {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            state: RwLock::new(FaultState::default()),
        }
    }

    /// Make the `nth` call (1-based, counted from the start) of `op` fail as unavailable
    pub async fn fail_on(&self, op: &str, nth: usize) {
        self.plan(op, nth, FaultKind::Unavailable).await;
    }

    /// Make the `nth` call of `op` fail with a generation conflict
    pub async fn conflict_on(&self, op: &str, nth: usize) {
        self.plan(op, nth, FaultKind::Conflict).await;
    }

    /// Make every call of `op` fail until [`FaultInjector::clear`]
    pub async fn fail_always(&self, op: &str) {
        self.state
            .write()
            .await
            .always
            .insert(op.to_string(), FaultKind::Unavailable);
    }

    /// Remove every planned failure of `op`
    pub async fn clear(&self, op: &str) {
        let mut state = self.state.write().await;
        state.always.remove(op);
        state.planned.retain(|(planned_op, _), _| planned_op != op);
    }

    /// Number of calls made to `op`, failed ones included
    pub async fn calls(&self, op: &str) -> usize {
        self.state.read().await.calls.get(op).copied().unwrap_or(0)
    }

    async fn plan(&self, op: &str, nth: usize, kind: FaultKind) {
        self.state
            .write()
            .await
            .planned
            .insert((op.to_string(), nth), kind);
    }

    /// Count a call and return the injected failure, if any
    pub(crate) async fn check(&self, op: &str) -> PlacemendResult<()> {
        let mut state = self.state.write().await;
        let count = state.calls.entry(op.to_string()).or_insert(0);
        *count += 1;
        let nth = *count;

        let fault = state
            .planned
            .remove(&(op.to_string(), nth))
            .or_else(|| state.always.get(op).copied());

        match fault {
            None => Ok(()),
            Some(FaultKind::Unavailable) => Err(PlacemendError::unavailable(
                self.service,
                format!("injected failure of {} (call {})", op, nth),
            )),
            Some(FaultKind::Conflict) => Err(PlacemendError::Conflict(format!(
                "injected generation conflict on {} (call {})",
                op, nth
            ))),
        }
    }
}
