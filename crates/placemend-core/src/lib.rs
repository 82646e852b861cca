//! placemend-core: Core types for the placemend reconciliation engine
//!
//! This crate provides the types shared by the clients and the engine:
//! - Workloads, flavors, shards and migrations
//! - Allocation records, request groups and allocation candidates
//! - Port resource requests and binding-profile allocation keys
//! - Accelerator device profiles and requests
//! - Configuration types
//! - Error handling

pub mod allocation;
pub mod config;
pub mod device;
pub mod error;
pub mod extra_specs;
pub mod model;
pub mod port;

pub use allocation::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use model::*;
pub use port::*;
