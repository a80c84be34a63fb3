//! Block-based IP Address Management
//!
//! The engine behind the DCops container network plugin. Pools of subnets
//! are cut into fixed-size `AddressBlock`s that the cluster-side
//! [`PoolManager`] hands to nodes on request, and every node's [`NodeIpam`]
//! hands out single addresses from the blocks it owns.
//!
//! # Example
//!
//! ```no_run
//! use block_ipam::{KubeStore, NodeIpam, NodeIpamConfig, IpamMetrics};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = Arc::new(KubeStore::new(client));
//! let metrics = Arc::new(IpamMetrics::new(&prometheus::Registry::new())?);
//!
//! let ipam = NodeIpam::new(store, NodeIpamConfig::new("node1"), metrics);
//! ipam.gc().await?;
//!
//! let (ipv4, ipv6) = ipam.allocate("default", "container-id", "eth0").await?;
//! # let _ = (ipv4, ipv6);
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - **Bitset allocator**: [`AddressAllocator`] tracks the offsets used in one block
//! - **Pool manager**: [`PoolManager`] mints blocks from a pool's subnet list
//! - **Node allocator**: [`NodeIpam`] serves addresses and requests blocks via `BlockRequest`

pub mod allocator;
pub mod backoff;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod store;
pub mod subnet;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
#[cfg(test)]
mod test_utils;

pub use allocator::AddressAllocator;
pub use config::{NodeIpamConfig, RetryConfig};
pub use error::{IpamError, StoreError};
pub use metrics::IpamMetrics;
pub use node::{AllocInfo, FreeOutcome, NodeIpam};
pub use pool::{PoolManager, PoolPhase, PoolUsage};
pub use store::{IpamStore, KubeStore};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockStore;
