//! Resource store abstraction
//!
//! The cluster API is the single source of truth for which blocks exist and
//! who owns them. This trait abstracts it so the allocators can run against
//! the real API server ([`KubeStore`]) or an in-memory store in unit tests.

mod kube_store;
mod teardown;

pub use kube_store::KubeStore;
pub use teardown::{release_block, Teardown};

use crate::error::StoreError;
use crds::{AddressBlock, AddressPool, BlockRequest, BlockRequestStatus};
use k8s_openapi::api::core::v1::Node;

/// Trait for resource store operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// List filters are `(label, value)` pairs that must all match.
#[async_trait::async_trait]
pub trait IpamStore: Send + Sync {
    // AddressPool Operations
    async fn get_pool(&self, name: &str) -> Result<AddressPool, StoreError>;
    async fn replace_pool(&self, pool: &AddressPool) -> Result<AddressPool, StoreError>;

    // AddressBlock Operations
    async fn list_blocks(&self, filters: &[(&str, &str)]) -> Result<Vec<AddressBlock>, StoreError>;
    async fn get_block(&self, name: &str) -> Result<AddressBlock, StoreError>;
    async fn create_block(&self, block: &AddressBlock) -> Result<AddressBlock, StoreError>;
    /// Replaces a block; fails with `Conflict` when `metadata.resourceVersion` is stale.
    async fn replace_block(&self, block: &AddressBlock) -> Result<AddressBlock, StoreError>;
    async fn delete_block(&self, name: &str) -> Result<(), StoreError>;

    // BlockRequest Operations
    async fn get_block_request(&self, name: &str) -> Result<BlockRequest, StoreError>;
    async fn create_block_request(&self, request: &BlockRequest) -> Result<BlockRequest, StoreError>;
    async fn update_block_request_status(&self, name: &str, status: &BlockRequestStatus) -> Result<BlockRequest, StoreError>;
    async fn delete_block_request(&self, name: &str) -> Result<(), StoreError>;

    // Node Operations
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;
}
