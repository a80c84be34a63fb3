//! Pool Manager Controller
//!
//! Cluster-side half of the block IPAM:
//! - AddressPool: lifecycle (finalizer) and block bitmap
//! - BlockRequest: answered by minting an AddressBlock for the requesting node
//! - AddressBlock: blocks of deleted nodes are reclaimed periodically

mod config;
mod controller;
mod error;
mod metrics_server;
mod watcher;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls client needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Pool Manager Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Reconcile concurrency: {}", config.reconcile_concurrency);
    info!("  Orphan sweep interval: {:?}", config.orphan_sweep_interval);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
