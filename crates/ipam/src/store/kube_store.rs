//! Kubernetes-backed resource store.

use super::IpamStore;
use crate::error::StoreError;
use crds::{AddressBlock, AddressPool, BlockRequest, BlockRequestStatus};
use k8s_openapi::api::core::v1::Node;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

/// Resource store talking to the Kubernetes API server.
///
/// All IPAM kinds are cluster-scoped.
#[derive(Clone)]
pub struct KubeStore {
    pools: Api<AddressPool>,
    blocks: Api<AddressBlock>,
    requests: Api<BlockRequest>,
    nodes: Api<Node>,
}

impl KubeStore {
    /// Creates a store from a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self {
            pools: Api::all(client.clone()),
            blocks: Api::all(client.clone()),
            requests: Api::all(client.clone()),
            nodes: Api::all(client),
        }
    }
}

fn label_selector(filters: &[(&str, &str)]) -> String {
    filters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait::async_trait]
impl IpamStore for KubeStore {
    async fn get_pool(&self, name: &str) -> Result<AddressPool, StoreError> {
        Ok(self.pools.get(name).await?)
    }

    async fn replace_pool(&self, pool: &AddressPool) -> Result<AddressPool, StoreError> {
        Ok(self.pools.replace(&pool.name_any(), &PostParams::default(), pool).await?)
    }

    async fn list_blocks(&self, filters: &[(&str, &str)]) -> Result<Vec<AddressBlock>, StoreError> {
        let selector = label_selector(filters);
        debug!("Listing AddressBlocks with selector '{}'", selector);
        let lp = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&selector)
        };
        Ok(self.blocks.list(&lp).await?.items)
    }

    async fn get_block(&self, name: &str) -> Result<AddressBlock, StoreError> {
        Ok(self.blocks.get(name).await?)
    }

    async fn create_block(&self, block: &AddressBlock) -> Result<AddressBlock, StoreError> {
        Ok(self.blocks.create(&PostParams::default(), block).await?)
    }

    async fn replace_block(&self, block: &AddressBlock) -> Result<AddressBlock, StoreError> {
        Ok(self.blocks.replace(&block.name_any(), &PostParams::default(), block).await?)
    }

    async fn delete_block(&self, name: &str) -> Result<(), StoreError> {
        self.blocks.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_block_request(&self, name: &str) -> Result<BlockRequest, StoreError> {
        Ok(self.requests.get(name).await?)
    }

    async fn create_block_request(&self, request: &BlockRequest) -> Result<BlockRequest, StoreError> {
        Ok(self.requests.create(&PostParams::default(), request).await?)
    }

    async fn update_block_request_status(&self, name: &str, status: &BlockRequestStatus) -> Result<BlockRequest, StoreError> {
        // Patch the status using kube-rs status subresource API
        let status_patch = json!({
            "status": status
        });
        let pp = PatchParams::default();
        Ok(self
            .requests
            .patch_status(name, &pp, &Patch::Merge(&status_patch))
            .await?)
    }

    async fn delete_block_request(&self, name: &str) -> Result<(), StoreError> {
        self.requests.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        Ok(self.nodes.get(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        assert_eq!(label_selector(&[]), "");
        assert_eq!(
            label_selector(&[("dcops.microscaler.io/pool", "default"), ("dcops.microscaler.io/node", "node1")]),
            "dcops.microscaler.io/pool=default,dcops.microscaler.io/node=node1"
        );
    }
}
