//! Test utilities for the pool and node allocators
//!
//! This module provides helpers for creating test resources and a stand-in
//! for the controller that answers BlockRequests.

use crate::metrics::IpamMetrics;
use crate::mock::{MockStore, RequestEvent};
use crate::node::NodeIpam;
use crate::pool::PoolManager;
use crds::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use prometheus::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Helper to create a test AddressPool
pub fn create_test_pool(name: &str, block_size_bits: u32, subnets: Vec<SubnetSet>) -> AddressPool {
    AddressPool {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: AddressPoolSpec {
            block_size_bits,
            subnets,
        },
    }
}

/// Dual-stack pool "default" with blocks of 2 addresses
///
/// Yields exactly 6 blocks: 10.2.0.0/31 .. 10.2.0.6/31, 10.3.0.0/31, 10.3.0.2/31.
pub fn default_pool() -> AddressPool {
    create_test_pool(
        "default",
        1,
        vec![
            SubnetSet::dual("10.2.0.0/29", "fd02::0200/125"),
            SubnetSet::dual("10.3.0.0/30", "fd02::0300/126"),
        ],
    )
}

/// Helper to create a test AddressBlock owned by `node`
pub fn create_test_block(pool: &str, node: &str, index: u32, ipv4: Option<&str>, ipv6: Option<&str>) -> AddressBlock {
    AddressBlock {
        metadata: ObjectMeta {
            name: Some(block_name(pool, index)),
            labels: Some(BTreeMap::from([
                (LABEL_POOL.to_string(), pool.to_string()),
                (LABEL_NODE.to_string(), node.to_string()),
            ])),
            finalizers: Some(vec![BLOCK_FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: AddressBlockSpec {
            index: index as i32,
            ipv4: ipv4.map(str::to_string),
            ipv6: ipv6.map(str::to_string),
        },
    }
}

/// Fresh metrics on a private registry
pub fn test_metrics() -> Arc<IpamMetrics> {
    Arc::new(IpamMetrics::new(&Registry::new()).unwrap())
}

/// Plays the controller: answers created requests with `pools` and feeds
/// status updates back to `nodes`.
pub fn spawn_controller(store: &MockStore, pools: Arc<PoolManager>, nodes: Vec<Arc<NodeIpam>>) -> JoinHandle<()> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RequestEvent::Created(request)) => {
                    let _ = pools.handle_block_request(&request).await;
                }
                Ok(RequestEvent::StatusUpdated(request)) => {
                    for node in &nodes {
                        node.notify(&request);
                    }
                }
                Ok(RequestEvent::Deleted(_)) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}
