//! Main controller implementation.
//!
//! This module contains the `Controller` struct that orchestrates
//! reconciliation, the orphan block sweep and the metrics endpoint.
//!
//! All state is in-process, so the controller must run as a single replica.

use crate::config::Config;
use crate::error::ControllerError;
use crate::metrics_server;
use crate::watcher::{self, WatchConfig};
use block_ipam::{IpamMetrics, IpamStore, KubeStore, PoolManager};
use crds::{AddressBlock, AddressPool, BlockRequest};
use kube::{Api, Client};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for block allocation.
pub struct Controller {
    pool_watcher: JoinHandle<Result<(), ControllerError>>,
    block_request_watcher: JoinHandle<Result<(), ControllerError>>,
    orphan_sweeper: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Pool Manager Controller");

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;

        let registry = Registry::new();
        let metrics = IpamMetrics::new(&registry)
            .map_err(|e| ControllerError::Metrics(format!("failed to register metrics: {}", e)))?;
        let store: Arc<dyn IpamStore> = Arc::new(KubeStore::new(kube_client.clone()));
        let pools = Arc::new(PoolManager::new(store, Arc::new(metrics)));

        // All IPAM resources are cluster-scoped
        let pool_api: Api<AddressPool> = Api::all(kube_client.clone());
        let block_api: Api<AddressBlock> = Api::all(kube_client.clone());
        let request_api: Api<BlockRequest> = Api::all(kube_client);

        let pool_watch = WatchConfig {
            concurrency: config.reconcile_concurrency,
            debounce: Duration::from_secs(5),
            requeue_after: Duration::from_secs(60),
        };
        // Nodes are blocked on these, so no debounce and quick retries
        let request_watch = WatchConfig {
            concurrency: config.reconcile_concurrency,
            debounce: Duration::ZERO,
            requeue_after: Duration::from_secs(2),
        };

        let pool_watcher = tokio::spawn(watcher::watch_pools(
            pool_api,
            block_api,
            Arc::clone(&pools),
            pool_watch,
        ));
        let block_request_watcher = tokio::spawn(watcher::watch_block_requests(
            request_api,
            Arc::clone(&pools),
            request_watch,
        ));
        let orphan_sweeper = tokio::spawn(watcher::sweep_orphan_blocks(
            pools,
            config.orphan_sweep_interval,
        ));
        let metrics_server = tokio::spawn(metrics_server::serve(config.metrics_addr, registry));

        Ok(Self {
            pool_watcher,
            block_request_watcher,
            orphan_sweeper,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Pool Manager Controller running");

        // Wait for any task to exit (they should run forever)
        tokio::select! {
            result = &mut self.pool_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("AddressPool watcher panicked: {}", e)))??;
            }
            result = &mut self.block_request_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("BlockRequest watcher panicked: {}", e)))??;
            }
            result = &mut self.orphan_sweeper => {
                result.map_err(|e| ControllerError::Watch(format!("Orphan block sweep panicked: {}", e)))??;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Metrics(format!("Metrics server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
