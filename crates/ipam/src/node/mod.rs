//! Node allocator
//!
//! Serves single addresses to container attachments from the blocks this
//! node owns. When every owned block of a pool is full, a BlockRequest named
//! `<pool>-<node>` is issued and the allocation waits until the pool manager
//! answers it (or the deadline passes).
//!
//! Locking:
//! - `pools` and `alloc_info` are plain `std::sync::Mutex`es, never held
//!   across an await
//! - each node pool has one `tokio::sync::Mutex` ordering allocate, free and
//!   resync for that pool; it is held for the whole BlockRequest round trip so
//!   a node never has two requests in flight for the same pool

mod node_pool;

#[cfg(test)]
mod node_test;

use crate::allocator::AddressAllocator;
use crate::config::NodeIpamConfig;
use crate::error::{IpamError, StoreError};
use crate::metrics::IpamMetrics;
use crate::store::{release_block, IpamStore};
use crds::{block_request_name, BlockRequest, BlockRequestSpec, RequestOutcome, LABEL_NODE};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use node_pool::{NodePool, NodePoolState};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

/// Bookkeeping for one container attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocInfo {
    /// Pool the address came from
    pub pool_name: String,
    /// Block holding the address
    pub block_name: String,
    /// Offset of the address inside the block
    pub offset: u32,
    /// IPv4 address, when the pool is IPv4 or dual-stack
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address, when the pool is IPv6 or dual-stack
    pub ipv6: Option<Ipv6Addr>,
}

/// Result of [`NodeIpam::free`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeOutcome {
    /// The freed address was the last one of its block and the block was
    /// torn down. Routes exported for the block are stale.
    pub block_released: bool,
}

type AttachmentKey = (String, String);

/// Per-node address allocator
pub struct NodeIpam {
    store: Arc<dyn IpamStore>,
    config: NodeIpamConfig,
    metrics: Arc<IpamMetrics>,
    pools: Mutex<HashMap<String, Arc<NodePool>>>,
    alloc_info: Mutex<HashMap<AttachmentKey, AllocInfo>>,
}

impl std::fmt::Debug for NodeIpam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIpam")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn describe(ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> String {
    [ipv4.map(|a| a.to_string()), ipv6.map(|a| a.to_string())]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ")
}

impl NodeIpam {
    /// Creates the allocator for `config.node_name`.
    ///
    /// No state is loaded until a pool is first used; call [`NodeIpam::gc`]
    /// after re-registering running containers to reclaim leaked blocks.
    pub fn new(store: Arc<dyn IpamStore>, config: NodeIpamConfig, metrics: Arc<IpamMetrics>) -> Self {
        Self {
            store,
            config,
            metrics,
            pools: Mutex::new(HashMap::new()),
            alloc_info: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the node this allocator serves
    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    fn node_pool(&self, pool_name: &str) -> Result<Arc<NodePool>, IpamError> {
        let mut pools = self.pools.lock().map_err(|_| IpamError::LockPoisoned)?;
        Ok(Arc::clone(pools.entry(pool_name.to_string()).or_insert_with(|| {
            debug!("Tracking pool {} on node {}", pool_name, self.config.node_name);
            Arc::new(NodePool::new(pool_name, &self.config.node_name))
        })))
    }

    async fn lock_synced<'a>(&self, node_pool: &'a NodePool) -> Result<MutexGuard<'a, NodePoolState>, IpamError> {
        let mut state = node_pool.state.lock().await;
        if !state.synced {
            node_pool.sync(self.store.as_ref(), &self.metrics, &mut state).await?;
        }
        Ok(state)
    }

    fn lookup(&self, container_id: &str, iface: &str) -> Result<Option<AllocInfo>, IpamError> {
        let infos = self.alloc_info.lock().map_err(|_| IpamError::LockPoisoned)?;
        Ok(infos
            .get(&(container_id.to_string(), iface.to_string()))
            .cloned())
    }

    fn forget(&self, container_id: &str, iface: &str) -> Result<(), IpamError> {
        self.alloc_info
            .lock()
            .map_err(|_| IpamError::LockPoisoned)?
            .remove(&(container_id.to_string(), iface.to_string()));
        Ok(())
    }

    /// Snapshot of the live attachments
    pub fn allocations(&self) -> Result<HashMap<(String, String), AllocInfo>, IpamError> {
        Ok(self
            .alloc_info
            .lock()
            .map_err(|_| IpamError::LockPoisoned)?
            .clone())
    }

    /// Allocates an address from `pool_name` for an attachment, waiting at
    /// most the configured request timeout for a new block.
    pub async fn allocate(
        &self,
        pool_name: &str,
        container_id: &str,
        iface: &str,
    ) -> Result<(Option<Ipv4Addr>, Option<Ipv6Addr>), IpamError> {
        self.allocate_with_timeout(pool_name, container_id, iface, self.config.request_timeout)
            .await
    }

    /// Same as [`NodeIpam::allocate`] with an explicit block request deadline.
    ///
    /// Allocating an attachment that already holds an address returns that
    /// address without touching the store.
    pub async fn allocate_with_timeout(
        &self,
        pool_name: &str,
        container_id: &str,
        iface: &str,
        timeout: Duration,
    ) -> Result<(Option<Ipv4Addr>, Option<Ipv6Addr>), IpamError> {
        if let Some(info) = self.lookup(container_id, iface)? {
            debug!(
                "{}/{} already holds {} from AddressBlock {}",
                container_id,
                iface,
                describe(info.ipv4, info.ipv6),
                info.block_name
            );
            return Ok((info.ipv4, info.ipv6));
        }

        let node_pool = self.node_pool(pool_name)?;
        let mut state = self.lock_synced(&node_pool).await?;

        // A concurrent call for the same attachment may have won the lock
        if let Some(info) = self.lookup(container_id, iface)? {
            return Ok((info.ipv4, info.ipv6));
        }

        let local = match state.allocate_local() {
            Some(found) => Some(found),
            None => {
                // Blocks granted to a request that timed out show up here
                node_pool.sync(self.store.as_ref(), &self.metrics, &mut state).await?;
                state.allocate_local()
            }
        };
        let (block_name, allocation) = match local {
            Some(found) => found,
            None => {
                let block_name = self.request_block(&node_pool, &mut state, timeout).await?;
                let allocation = state
                    .blocks
                    .get_mut(&block_name)
                    .and_then(AddressAllocator::allocate)
                    .ok_or_else(|| {
                        IpamError::Invariant(format!(
                            "AddressBlock {} granted to node {} has no free address",
                            block_name, self.config.node_name
                        ))
                    })?;
                (block_name, allocation)
            }
        };

        let info = AllocInfo {
            pool_name: pool_name.to_string(),
            block_name,
            offset: allocation.offset,
            ipv4: allocation.ipv4,
            ipv6: allocation.ipv6,
        };
        let existing = match self.alloc_info.lock() {
            Ok(mut infos) => match infos.entry((container_id.to_string(), iface.to_string())) {
                Entry::Occupied(entry) => Some(entry.get().clone()),
                Entry::Vacant(entry) => {
                    entry.insert(info.clone());
                    None
                }
            },
            Err(_) => {
                if let Some(allocator) = state.blocks.get_mut(&info.block_name) {
                    allocator.free(info.offset);
                }
                return Err(IpamError::LockPoisoned);
            }
        };

        if let Some(existing) = existing {
            // Same attachment allocated concurrently through another pool
            self.undo_allocation(&mut state, &info).await;
            node_pool.report(&self.metrics, &state);
            return Ok((existing.ipv4, existing.ipv6));
        }

        node_pool.report(&self.metrics, &state);
        info!(
            "Allocated {} to {}/{} from AddressBlock {}",
            describe(info.ipv4, info.ipv6),
            container_id,
            iface,
            info.block_name
        );
        Ok((info.ipv4, info.ipv6))
    }

    /// Returns an address that lost the race for its attachment, tearing the
    /// block down when that leaves it empty. A failed teardown is left to `gc`.
    async fn undo_allocation(&self, state: &mut NodePoolState, info: &AllocInfo) {
        let emptied = match state.blocks.get_mut(&info.block_name) {
            Some(allocator) => {
                allocator.free(info.offset);
                allocator.is_empty()
            }
            None => false,
        };
        if !emptied {
            return;
        }
        match release_block(self.store.as_ref(), &info.block_name, &self.config.retry).await {
            Ok(()) => {
                state.blocks.remove(&info.block_name);
            }
            Err(e) => warn!("Failed to release unused AddressBlock {}: {}", info.block_name, e),
        }
    }

    /// Runs the BlockRequest round trip and returns the granted block name.
    ///
    /// A request that times out is left in place; the next attempt deletes
    /// and replaces it.
    async fn request_block(
        &self,
        node_pool: &NodePool,
        state: &mut NodePoolState,
        timeout: Duration,
    ) -> Result<String, IpamError> {
        let name = block_request_name(&node_pool.pool_name, &node_pool.node_name);

        let result = match tokio::time::timeout(timeout, self.await_block(node_pool, state, &name)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "BlockRequest {} not answered within {:?}",
                    name, timeout
                );
                self.metrics
                    .observe_block_request(&node_pool.pool_name, "timeout");
                return Err(IpamError::Timeout(node_pool.pool_name.clone()));
            }
        };

        match self.store.delete_block_request(&name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!("Failed to delete BlockRequest {}: {}", name, e),
        }
        result
    }

    async fn await_block(
        &self,
        node_pool: &NodePool,
        state: &mut NodePoolState,
        name: &str,
    ) -> Result<String, IpamError> {
        match self.store.delete_block_request(name).await {
            Ok(()) => debug!("Deleted stale BlockRequest {}", name),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let node = self.store.get_node(&node_pool.node_name).await?;
        let request = BlockRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                owner_references: node.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            spec: BlockRequestSpec {
                node_name: node_pool.node_name.clone(),
                pool_name: node_pool.pool_name.clone(),
            },
            status: None,
        };

        // Armed before the request exists so an early answer is not missed
        let notified = node_pool.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.store.create_block_request(&request).await?;
        info!(
            "Requested a block from pool {} for node {}",
            node_pool.pool_name, node_pool.node_name
        );

        loop {
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            notified.set(node_pool.wakeup.notified());
            notified.as_mut().enable();

            match self.store.get_block_request(name).await?.outcome() {
                RequestOutcome::Pending => continue,
                RequestOutcome::Failed(message) => {
                    warn!("BlockRequest {} failed: {}", name, message);
                    return Err(IpamError::ExhaustedPool(node_pool.pool_name.clone()));
                }
                RequestOutcome::Complete(block_name) => {
                    node_pool.sync(self.store.as_ref(), &self.metrics, state).await?;
                    info!(
                        "Node {} was granted AddressBlock {}",
                        node_pool.node_name, block_name
                    );
                    return Ok(block_name);
                }
            }
        }
    }

    /// Releases the address held by an attachment.
    ///
    /// When it was the last address of its block, the block is torn down
    /// first; if that fails the address stays allocated and the call can be
    /// retried. Freeing an unknown attachment succeeds without effect; an
    /// attachment whose block this node no longer owns is an
    /// [`IpamError::Invariant`] and stays recorded.
    pub async fn free(&self, container_id: &str, iface: &str) -> Result<FreeOutcome, IpamError> {
        let Some(info) = self.lookup(container_id, iface)? else {
            debug!("No address held by {}/{}, nothing to free", container_id, iface);
            return Ok(FreeOutcome::default());
        };

        let node_pool = self.node_pool(&info.pool_name)?;
        let mut state = self.lock_synced(&node_pool).await?;

        let last = state
            .blocks
            .get(&info.block_name)
            .map(|allocator| allocator.allocated() == 1 && allocator.is_used(info.offset));
        let block_released = match last {
            None => {
                return Err(IpamError::Invariant(format!(
                    "AddressBlock {} of {}/{} is not owned by node {}",
                    info.block_name, container_id, iface, self.config.node_name
                )));
            }
            Some(true) => {
                release_block(self.store.as_ref(), &info.block_name, &self.config.retry).await?;
                state.blocks.remove(&info.block_name);
                true
            }
            Some(false) => {
                if let Some(allocator) = state.blocks.get_mut(&info.block_name) {
                    allocator.free(info.offset);
                }
                false
            }
        };

        self.forget(container_id, iface)?;
        node_pool.report(&self.metrics, &state);
        info!(
            "Freed {} of {}/{} in AddressBlock {}",
            describe(info.ipv4, info.ipv6),
            container_id,
            iface,
            info.block_name
        );
        Ok(FreeOutcome { block_released })
    }

    /// Records an address an already-running container reports, without
    /// allocating. Used to rebuild bookkeeping after a restart.
    pub async fn register(
        &self,
        pool_name: &str,
        container_id: &str,
        iface: &str,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Result<(), IpamError> {
        if let Some(info) = self.lookup(container_id, iface)? {
            if info.ipv4 == ipv4 && info.ipv6 == ipv6 {
                return Ok(());
            }
            return Err(IpamError::Invariant(format!(
                "{}/{} is already registered with {}",
                container_id,
                iface,
                describe(info.ipv4, info.ipv6)
            )));
        }

        let node_pool = self.node_pool(pool_name)?;
        let mut guard = self.lock_synced(&node_pool).await?;
        let state = &mut *guard;

        let found = state
            .blocks
            .iter_mut()
            .filter(|(name, _)| !state.reserved.contains(*name))
            .find_map(|(name, allocator)| allocator.register(ipv4, ipv6).map(|offset| (name.clone(), offset)));
        let Some((block_name, offset)) = found else {
            return Err(IpamError::Invariant(format!(
                "{} is not in any block of pool {} owned by node {}",
                describe(ipv4, ipv6),
                pool_name,
                self.config.node_name
            )));
        };

        self.alloc_info
            .lock()
            .map_err(|_| IpamError::LockPoisoned)?
            .insert(
                (container_id.to_string(), iface.to_string()),
                AllocInfo {
                    pool_name: pool_name.to_string(),
                    block_name: block_name.clone(),
                    offset,
                    ipv4,
                    ipv6,
                },
            );
        node_pool.report(&self.metrics, state);
        debug!(
            "Registered {} of {}/{} in AddressBlock {}",
            describe(ipv4, ipv6),
            container_id,
            iface,
            block_name
        );
        Ok(())
    }

    /// Tears down every block owned by this node that holds no address.
    ///
    /// Pools with blocks labeled for this node are loaded first, so blocks
    /// left behind by containers that vanished while the agent was down are
    /// reclaimed too. Register running containers before calling this.
    pub async fn gc(&self) -> Result<(), IpamError> {
        let node_name = self.config.node_name.as_str();
        let blocks = self.store.list_blocks(&[(LABEL_NODE, node_name)]).await?;

        let mut pool_names = BTreeSet::new();
        for block in &blocks {
            if block.is_deleting() {
                // Interrupted teardown
                release_block(self.store.as_ref(), &block.name_any(), &self.config.retry).await?;
                continue;
            }
            if let Some(pool) = block.pool_name() {
                pool_names.insert(pool.to_string());
            }
        }
        for pool_name in &pool_names {
            self.node_pool(pool_name)?;
        }

        let node_pools: Vec<Arc<NodePool>> = self
            .pools
            .lock()
            .map_err(|_| IpamError::LockPoisoned)?
            .values()
            .cloned()
            .collect();

        for node_pool in node_pools {
            let mut state = node_pool.state.lock().await;
            node_pool.sync(self.store.as_ref(), &self.metrics, &mut state).await?;

            let empty: Vec<String> = state
                .blocks
                .iter()
                .filter(|(_, allocator)| allocator.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            for name in empty {
                release_block(self.store.as_ref(), &name, &self.config.retry).await?;
                state.blocks.remove(&name);
                info!("Reclaimed empty AddressBlock {} on node {}", name, node_name);
            }
            node_pool.report(&self.metrics, &state);
        }
        Ok(())
    }

    /// Wakes an allocation waiting on `request`, if any.
    ///
    /// Never blocks. A notification nobody waits for is dropped.
    pub fn notify(&self, request: &BlockRequest) {
        if request.spec.node_name != self.config.node_name {
            return;
        }
        let node_pool = match self.pools.lock() {
            Ok(pools) => pools.get(&request.spec.pool_name).cloned(),
            Err(_) => return,
        };
        if let Some(node_pool) = node_pool {
            debug!("Waking waiters of BlockRequest {}", request.name_any());
            node_pool.wakeup.notify_waiters();
        }
    }
}
