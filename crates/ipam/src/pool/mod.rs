//! Pool manager
//!
//! Cluster-side authority over which block indices of a pool are in use.
//! Runs inside the single-replica pool manager controller, so
//! in-process locking is enough to keep index assignment race free:
//!
//! - one `std::sync::Mutex` over the pool-name map
//! - one `tokio::sync::Mutex` per pool, held across the list/create calls so
//!   "find the lowest free index, then create the block" is atomic
//!
//! The per-pool bitmap is a cache. It is rebuilt from the AddressBlock list
//! on first use and whenever the controller sees blocks come and go.

mod request;


pub use request::PoolPhase;

use crate::bitmap::Bitmap;
use crate::config::RetryConfig;
use crate::error::{IpamError, StoreError};
use crate::metrics::IpamMetrics;
use crate::store::IpamStore;
use crate::subnet::PoolLayout;
use crds::{
    block_name, AddressBlock, AddressBlockSpec, AddressPool, BLOCK_FINALIZER, LABEL_NODE, LABEL_POOL,
};
use ipnet::{Ipv4Net, Ipv6Net};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Block usage of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    /// Blocks currently allocated
    pub allocated: u32,
    /// Blocks the pool can hold
    pub capacity: u32,
}

#[derive(Debug)]
struct PoolState {
    allocated: Bitmap,
    synced: bool,
}

impl PoolState {
    fn new() -> Self {
        Self {
            allocated: Bitmap::new(0),
            synced: false,
        }
    }
}

/// Mints AddressBlocks out of AddressPools.
pub struct PoolManager {
    store: Arc<dyn IpamStore>,
    metrics: Arc<IpamMetrics>,
    retry: RetryConfig,
    pools: Mutex<HashMap<String, Arc<tokio::sync::Mutex<PoolState>>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager").finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Creates a pool manager.
    pub fn new(store: Arc<dyn IpamStore>, metrics: Arc<IpamMetrics>) -> Self {
        Self {
            store,
            metrics,
            retry: RetryConfig::default(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the retry policy used when tearing blocks down
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn pool_state(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<PoolState>>, IpamError> {
        let mut pools = self.pools.lock().map_err(|_| IpamError::LockPoisoned)?;
        Ok(Arc::clone(
            pools
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(PoolState::new()))),
        ))
    }

    /// Rebuilds the pool's allocation bitmap from the existing AddressBlocks.
    ///
    /// Safe to call at any time; serialized with allocations on the same pool.
    /// A pool that no longer exists has its state dropped.
    pub async fn sync_pool(&self, name: &str) -> Result<(), IpamError> {
        let state = self.pool_state(name)?;
        let mut state = state.lock().await;
        self.sync_locked(name, &mut state).await
    }

    async fn sync_locked(&self, name: &str, state: &mut PoolState) -> Result<(), IpamError> {
        let pool = match self.store.get_pool(name).await {
            Ok(pool) => pool,
            Err(StoreError::NotFound(_)) => {
                debug!("AddressPool {} not found, dropping its state", name);
                state.synced = false;
                return self.drop_pool(name);
            }
            Err(e) => return Err(e.into()),
        };
        let layout = PoolLayout::from_spec(&pool.spec)?;
        let blocks = self.store.list_blocks(&[(LABEL_POOL, name)]).await?;

        let mut allocated = Bitmap::new(layout.capacity());
        for block in &blocks {
            let index = u32::try_from(block.spec.index).ok();
            if !index.is_some_and(|i| allocated.set(i)) {
                warn!(
                    "AddressBlock {} has index {} outside of pool {}",
                    block.name_any(),
                    block.spec.index,
                    name
                );
            }
        }

        state.allocated = allocated;
        state.synced = true;
        self.metrics
            .set_pool_usage(name, state.allocated.count_ones(), state.allocated.len());
        debug!(
            "Synced AddressPool {}: {}/{} blocks allocated",
            name,
            state.allocated.count_ones(),
            state.allocated.len()
        );
        Ok(())
    }

    /// Forgets the in-memory state of a pool. Idempotent.
    pub fn drop_pool(&self, name: &str) -> Result<(), IpamError> {
        let removed = self
            .pools
            .lock()
            .map_err(|_| IpamError::LockPoisoned)?
            .remove(name)
            .is_some();
        if removed {
            info!("Dropped state of AddressPool {}", name);
            self.metrics.forget_pool(name);
        }
        Ok(())
    }

    /// Allocates a new AddressBlock from `pool_name` for `node_name`.
    ///
    /// Fails with [`IpamError::ExhaustedPool`] when the pool is full or
    /// being deleted.
    pub async fn allocate_block(&self, pool_name: &str, node_name: &str) -> Result<AddressBlock, IpamError> {
        let state = self.pool_state(pool_name)?;
        let mut state = state.lock().await;
        if !state.synced {
            self.sync_locked(pool_name, &mut state).await?;
        }

        let pool = self.store.get_pool(pool_name).await?;
        if pool.metadata.deletion_timestamp.is_some() {
            return Err(IpamError::ExhaustedPool(pool_name.to_string()));
        }

        let layout = PoolLayout::from_spec(&pool.spec)?;
        if state.allocated.len() != layout.capacity() {
            state.allocated.resize(layout.capacity());
        }

        loop {
            let Some(index) = state.allocated.first_clear() else {
                return Err(IpamError::ExhaustedPool(pool_name.to_string()));
            };
            let Some((ipv4, ipv6)) = layout.block_at(index) else {
                return Err(IpamError::ExhaustedPool(pool_name.to_string()));
            };

            let block = new_block(&pool, index, node_name, ipv4, ipv6)?;
            match self.store.create_block(&block).await {
                Ok(created) => {
                    // Marked now, ahead of the resync triggered by the create event
                    state.allocated.set(index);
                    self.metrics
                        .set_pool_usage(pool_name, state.allocated.count_ones(), state.allocated.len());
                    info!(
                        "Allocated AddressBlock {} ({}) from pool {} to node {}",
                        created.name_any(),
                        describe(ipv4, ipv6),
                        pool_name,
                        node_name
                    );
                    return Ok(created);
                }
                Err(StoreError::AlreadyExists(_)) => {
                    // Missed the create event for this index; skip past it
                    warn!(
                        "AddressBlock {} already exists, marking index {} of pool {} as used",
                        block.name_any(),
                        index,
                        pool_name
                    );
                    state.allocated.set(index);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block usage of a pool, syncing it first if needed.
    pub async fn usage(&self, name: &str) -> Result<PoolUsage, IpamError> {
        let state = self.pool_state(name)?;
        let mut state = state.lock().await;
        if !state.synced {
            self.sync_locked(name, &mut state).await?;
        }
        Ok(PoolUsage {
            allocated: state.allocated.count_ones(),
            capacity: state.allocated.len(),
        })
    }
}

fn describe(ipv4: Option<Ipv4Net>, ipv6: Option<Ipv6Net>) -> String {
    [ipv4.map(|n| n.to_string()), ipv6.map(|n| n.to_string())]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ")
}

fn new_block(
    pool: &AddressPool,
    index: u32,
    node_name: &str,
    ipv4: Option<Ipv4Net>,
    ipv6: Option<Ipv6Net>,
) -> Result<AddressBlock, IpamError> {
    let pool_name = pool.name_any();
    let owner = pool
        .controller_owner_ref(&())
        .ok_or_else(|| IpamError::InvalidPool(format!("AddressPool {} has no uid", pool_name)))?;
    let index_value = i32::try_from(index)
        .map_err(|_| IpamError::InvalidPool(format!("block index {} of pool {} overflows", index, pool_name)))?;

    Ok(AddressBlock {
        metadata: ObjectMeta {
            name: Some(block_name(&pool_name, index)),
            labels: Some(BTreeMap::from([
                (LABEL_POOL.to_string(), pool_name.clone()),
                (LABEL_NODE.to_string(), node_name.to_string()),
            ])),
            finalizers: Some(vec![BLOCK_FINALIZER.to_string()]),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: AddressBlockSpec {
            index: index_value,
            ipv4: ipv4.map(|n| n.to_string()),
            ipv6: ipv6.map(|n| n.to_string()),
        },
    })
}
