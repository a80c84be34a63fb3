//! Kubernetes resource watchers.
//!
//! This module handles watching Kubernetes resources for changes
//! and triggering reconciliation using kube_runtime::Controller.
//!
//! - AddressPool, owning AddressBlock: pool lifecycle and bitmap resync on
//!   every block change (including deletions)
//! - BlockRequest: allocates blocks for nodes

use crate::error::ControllerError;
use block_ipam::{PoolManager, PoolPhase};
use crds::{AddressBlock, AddressPool, BlockRequest};
use futures::StreamExt;
use kube::Api;
use kube_runtime::{
    controller::{Action, Config as ControllerConfig},
    watcher, Controller,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often a draining pool is rechecked when no block event arrives
const DRAINING_RECHECK: Duration = Duration::from_secs(30);

/// Reconciliation tuning of one watcher
#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Concurrent reconciliations
    pub concurrency: u16,
    /// Quiet period after the last event before reconciling
    pub debounce: Duration,
    /// Requeue delay after a failed reconciliation
    pub requeue_after: Duration,
}

/// Generic watcher helper that drives a kube_runtime::Controller.
///
/// The Controller handles reconnection and retries; this only wires the
/// reconcile function, the error policy and the tuning in.
async fn watch_resource<K, F>(
    controller: Controller<K>,
    pools: Arc<PoolManager>,
    reconcile_fn: F,
    resource_name: &str,
    config: WatchConfig,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<PoolManager>, Arc<K>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Action, ControllerError>> + Send>> + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let requeue_after = config.requeue_after;
    let error_policy = move |obj: Arc<K>, error: &ControllerError, _ctx: Arc<PoolManager>| {
        error!("Reconciliation error for {} {:?}: {}", resource_name, obj, error);
        Action::requeue(requeue_after)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<PoolManager>| {
        let reconcile_fn = reconcile_fn.clone();
        let resource_name = resource_name.to_string();
        async move {
            debug!("Reconciling {} {:?}", resource_name, obj);
            reconcile_fn(ctx, obj).await
        }
    };

    let controller_config = ControllerConfig::default()
        .debounce(config.debounce)
        .concurrency(config.concurrency);

    controller
        .with_config(controller_config)
        .run(reconcile, error_policy, pools)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    Ok(())
}

/// Requeue decision for a reconciled pool
pub fn pool_action(phase: PoolPhase) -> Action {
    match phase {
        PoolPhase::Ready | PoolPhase::Released => Action::await_change(),
        PoolPhase::Draining(_) => Action::requeue(DRAINING_RECHECK),
    }
}

/// Watches AddressPools and the AddressBlocks they own.
pub async fn watch_pools(
    pool_api: Api<AddressPool>,
    block_api: Api<AddressBlock>,
    pools: Arc<PoolManager>,
    config: WatchConfig,
) -> Result<(), ControllerError> {
    let controller = Controller::new(pool_api, watcher::Config::default())
        .owns(block_api, watcher::Config::default());

    watch_resource(
        controller,
        pools,
        |pools, pool: Arc<AddressPool>| {
            Box::pin(async move {
                let phase = pools.reconcile_pool(&pool).await?;
                Ok(pool_action(phase))
            })
        },
        "AddressPool",
        config,
    )
    .await
}

/// Watches BlockRequests and answers the undecided ones.
pub async fn watch_block_requests(
    request_api: Api<BlockRequest>,
    pools: Arc<PoolManager>,
    config: WatchConfig,
) -> Result<(), ControllerError> {
    let controller = Controller::new(request_api, watcher::Config::default());

    watch_resource(
        controller,
        pools,
        |pools, request: Arc<BlockRequest>| {
            Box::pin(async move {
                let outcome = pools.handle_block_request(&request).await?;
                debug!("BlockRequest outcome: {:?}", outcome);
                Ok(Action::await_change())
            })
        },
        "BlockRequest",
        config,
    )
    .await
}

/// Periodically releases blocks held by nodes that no longer exist.
pub async fn sweep_orphan_blocks(pools: Arc<PoolManager>, interval: Duration) -> Result<(), ControllerError> {
    info!("Starting orphan block sweep every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match pools.reclaim_orphan_blocks().await {
            Ok(reclaimed) if reclaimed.is_empty() => debug!("No orphan blocks found"),
            Ok(reclaimed) => info!("Reclaimed {} orphan blocks: {:?}", reclaimed.len(), reclaimed),
            Err(e) => warn!("Orphan block sweep failed: {}", e),
        }
    }
}
