//! Per-(node, pool) state: the blocks this node owns in one pool.

use crate::allocator::{AddressAllocator, Allocation};
use crate::error::IpamError;
use crate::metrics::IpamMetrics;
use crate::store::IpamStore;
use crds::{LABEL_NODE, LABEL_POOL};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Blocks owned by this node in one pool, guarded by [`NodePool::state`].
#[derive(Debug, Default)]
pub(crate) struct NodePoolState {
    pub(crate) blocks: BTreeMap<String, AddressAllocator>,
    /// Blocks reserved out-of-band; never allocated from nor released
    pub(crate) reserved: BTreeSet<String>,
    pub(crate) synced: bool,
}

impl NodePoolState {
    /// Allocates from the first block with room. No I/O.
    pub(crate) fn allocate_local(&mut self) -> Option<(String, Allocation)> {
        self.blocks
            .iter_mut()
            .filter(|(_, allocator)| !allocator.is_full())
            .find_map(|(name, allocator)| allocator.allocate().map(|a| (name.clone(), a)))
    }

    /// Total addresses in use across the owned blocks
    pub(crate) fn allocated(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|(name, _)| !self.reserved.contains(*name))
            .map(|(_, allocator)| allocator.allocated())
            .sum()
    }
}

#[derive(Debug)]
pub(crate) struct NodePool {
    pub(crate) pool_name: String,
    pub(crate) node_name: String,
    pub(crate) state: Mutex<NodePoolState>,
    pub(crate) wakeup: Notify,
}

impl NodePool {
    pub(crate) fn new(pool_name: &str, node_name: &str) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            node_name: node_name.to_string(),
            state: Mutex::new(NodePoolState::default()),
            wakeup: Notify::new(),
        }
    }

    /// Rebuilds the block map from the AddressBlocks labeled for this node
    /// and pool.
    ///
    /// Allocators of blocks that are still present are kept as they are, so
    /// bits set by in-flight allocations survive. Blocks being deleted are
    /// dropped; reserved blocks are loaded fully consumed.
    pub(crate) async fn sync(
        &self,
        store: &dyn IpamStore,
        metrics: &IpamMetrics,
        state: &mut NodePoolState,
    ) -> Result<(), IpamError> {
        let listed = store
            .list_blocks(&[(LABEL_POOL, self.pool_name.as_str()), (LABEL_NODE, self.node_name.as_str())])
            .await?;

        let mut previous = std::mem::take(&mut state.blocks);
        state.reserved.clear();
        for block in &listed {
            let name = block.name_any();
            if block.is_deleting() {
                debug!("Skipping AddressBlock {} pending deletion", name);
                continue;
            }

            let mut allocator = match previous.remove(&name) {
                Some(allocator) => allocator,
                None => match AddressAllocator::from_block(block) {
                    Ok(allocator) => allocator,
                    Err(e) => {
                        warn!("Ignoring unusable AddressBlock {}: {}", name, e);
                        continue;
                    }
                },
            };
            if block.is_reserved() {
                allocator.fill();
                state.reserved.insert(name.clone());
            }
            state.blocks.insert(name, allocator);
        }

        for (name, allocator) in &previous {
            if !allocator.is_empty() {
                warn!(
                    "AddressBlock {} disappeared with {} addresses still allocated on node {}",
                    name,
                    allocator.allocated(),
                    self.node_name
                );
            }
        }

        state.synced = true;
        self.report(metrics, state);
        debug!(
            "Synced node pool {}/{}: {} blocks",
            self.node_name,
            self.pool_name,
            state.blocks.len()
        );
        Ok(())
    }

    pub(crate) fn report(&self, metrics: &IpamMetrics, state: &NodePoolState) {
        metrics.set_node_usage(&self.pool_name, &self.node_name, state.blocks.len(), state.allocated());
    }
}
