//! DCops IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the pool manager
//! controller and the per-node address allocator.

pub mod address_block;
pub mod address_pool;
pub mod block_request;
pub mod labels;

pub use address_block::*;
pub use address_pool::*;
pub use block_request::*;
pub use labels::*;
