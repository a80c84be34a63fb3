//! Controller-facing pool operations: answering BlockRequests, pool
//! lifecycle, and orphan block reclamation.

use super::PoolManager;
use crate::error::{IpamError, StoreError};
use crate::store::release_block;
use crds::{
    AddressPool, BlockRequest, BlockRequestConditionType, ConditionStatus, RequestOutcome, LABEL_POOL,
    POOL_FINALIZER,
};
use kube::ResourceExt;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a pool after reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// Pool is live and its finalizer is in place
    Ready,
    /// Pool is being deleted but still has this many blocks
    Draining(usize),
    /// Pool is being deleted and its finalizer has been removed
    Released,
}

impl PoolManager {
    /// Answers a BlockRequest by allocating a block and writing the outcome
    /// into the request status.
    ///
    /// Requests that already carry a decided outcome are left untouched.
    /// Pool exhaustion and invalid or missing pools are reported through the
    /// `Failed` condition; any other error is returned for the caller to retry.
    pub async fn handle_block_request(&self, request: &BlockRequest) -> Result<RequestOutcome, IpamError> {
        let name = request.name_any();
        let outcome = request.outcome();
        if outcome.is_decided() {
            debug!("BlockRequest {} already answered: {:?}", name, outcome);
            return Ok(outcome);
        }
        if request.metadata.deletion_timestamp.is_some() {
            debug!("BlockRequest {} is being deleted, skipping", name);
            return Ok(RequestOutcome::Pending);
        }

        let pool_name = &request.spec.pool_name;
        let node_name = &request.spec.node_name;
        let mut status = request.status.clone().unwrap_or_default();

        let outcome = match self.allocate_block(pool_name, node_name).await {
            Ok(block) => {
                let block_name = block.name_any();
                status.address_block_name = Some(block_name.clone());
                status.set_condition(BlockRequestConditionType::Complete, ConditionStatus::True, "", "");
                RequestOutcome::Complete(block_name)
            }
            Err(e) => {
                let reason = match &e {
                    IpamError::ExhaustedPool(_) => "PoolExhausted",
                    IpamError::InvalidPool(_) => "InvalidPool",
                    IpamError::Store(StoreError::NotFound(_)) => "PoolNotFound",
                    _ => {
                        error!("Failed to allocate block from pool {} for node {}: {}", pool_name, node_name, e);
                        return Err(e);
                    }
                };
                warn!("BlockRequest {} failed: {}", name, e);
                let message = e.to_string();
                status.set_condition(BlockRequestConditionType::Failed, ConditionStatus::True, reason, &message);
                RequestOutcome::Failed(message)
            }
        };

        match self.store.update_block_request_status(&name, &status).await {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                // The node gave up on the request; it finds any new block by label
                warn!("BlockRequest {} disappeared before its status could be written", name);
            }
            Err(e) => return Err(e.into()),
        }

        let label = if matches!(outcome, RequestOutcome::Complete(_)) {
            "complete"
        } else {
            "failed"
        };
        self.metrics.observe_block_request(pool_name, label);
        Ok(outcome)
    }

    /// Reconciles the lifecycle of a pool.
    ///
    /// A live pool gets the pool finalizer and a fresh bitmap. A deleting
    /// pool keeps its finalizer until no AddressBlock references it; then the
    /// finalizer is removed and its in-memory state dropped.
    pub async fn reconcile_pool(&self, pool: &AddressPool) -> Result<PoolPhase, IpamError> {
        let name = pool.name_any();
        let has_finalizer = pool.finalizers().iter().any(|f| f == POOL_FINALIZER);

        if pool.metadata.deletion_timestamp.is_none() {
            if !has_finalizer {
                let mut updated = pool.clone();
                updated.finalizers_mut().push(POOL_FINALIZER.to_string());
                self.store.replace_pool(&updated).await?;
                info!("Added finalizer to AddressPool {}", name);
            }
            self.sync_pool(&name).await?;
            return Ok(PoolPhase::Ready);
        }

        let blocks = self.store.list_blocks(&[(LABEL_POOL, name.as_str())]).await?;
        if !blocks.is_empty() {
            info!(
                "AddressPool {} is being deleted, waiting for {} blocks to be released",
                name,
                blocks.len()
            );
            return Ok(PoolPhase::Draining(blocks.len()));
        }

        if has_finalizer {
            let mut updated = pool.clone();
            updated.finalizers_mut().retain(|f| f != POOL_FINALIZER);
            match self.store.replace_pool(&updated).await {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            info!("Removed finalizer from AddressPool {}", name);
        }
        self.drop_pool(&name)?;
        Ok(PoolPhase::Released)
    }

    /// Releases blocks owned by nodes that no longer exist.
    ///
    /// Reserved blocks are left alone. Returns the names of the blocks released.
    pub async fn reclaim_orphan_blocks(&self) -> Result<Vec<String>, IpamError> {
        let blocks = self.store.list_blocks(&[]).await?;
        let mut node_exists: HashMap<String, bool> = HashMap::new();
        let mut touched = BTreeSet::new();
        let mut reclaimed = Vec::new();

        for block in &blocks {
            if block.is_reserved() {
                continue;
            }
            let Some(node) = block.node_name() else {
                continue;
            };

            let exists = match node_exists.get(node) {
                Some(exists) => *exists,
                None => {
                    let exists = match self.store.get_node(node).await {
                        Ok(_) => true,
                        Err(StoreError::NotFound(_)) => false,
                        Err(e) => return Err(e.into()),
                    };
                    node_exists.insert(node.to_string(), exists);
                    exists
                }
            };
            if exists {
                continue;
            }

            let name = block.name_any();
            info!("Reclaiming AddressBlock {} of deleted node {}", name, node);
            release_block(self.store.as_ref(), &name, &self.retry).await?;
            if let Some(pool) = block.pool_name() {
                touched.insert(pool.to_string());
            }
            reclaimed.push(name);
        }

        for pool in &touched {
            self.sync_pool(pool).await?;
        }
        Ok(reclaimed)
    }
}
