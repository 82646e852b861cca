//! placemend-clients: Service clients for placemend
//!
//! This crate provides:
//! - Service traits for the ledger, network, accelerator and workload store
//! - Typed leaf clients (ResourceLedgerClient, PortBindingClient, DeviceBindingClient)
//! - In-memory backends with failure injection
//! - HTTP backends built on reqwest
//! - A JSON snapshot-backed workload store

pub mod devices;
pub mod http;
pub mod ledger;
pub mod memory;
pub mod ports;
pub mod snapshot;
pub mod traits;

pub use devices::DeviceBindingClient;
pub use ledger::ResourceLedgerClient;
pub use ports::{PortBindingClient, PortUpdate};
pub use traits::{AcceleratorService, LedgerService, NetworkService, PortFilter, WorkloadStore};
