//! Unit tests for the node allocator

#[cfg(test)]
mod tests {
    use super::super::{FreeOutcome, NodeIpam};
    use crate::error::IpamError;
    use crate::mock::MockStore;
    use crate::pool::PoolManager;
    use crate::store::{release_block, IpamStore};
    use crate::test_utils::*;
    use crate::{NodeIpamConfig, RetryConfig};
    use crds::*;
    use kube::ResourceExt;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::task::JoinHandle;

    struct Harness {
        store: MockStore,
        pools: Arc<PoolManager>,
        node: Arc<NodeIpam>,
        controller: JoinHandle<()>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.controller.abort();
        }
    }

    fn config() -> NodeIpamConfig {
        NodeIpamConfig::new("node1")
            .with_request_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(50))
    }

    fn harness_with(pool: AddressPool) -> Harness {
        harness_with_config(pool, config())
    }

    fn harness_with_config(pool: AddressPool, config: NodeIpamConfig) -> Harness {
        let store = MockStore::new();
        store.add_pool(pool);
        store.add_node("node1");

        let metrics = test_metrics();
        let pools = Arc::new(PoolManager::new(Arc::new(store.clone()), Arc::clone(&metrics)));
        let node = Arc::new(NodeIpam::new(Arc::new(store.clone()), config, metrics));
        let controller = spawn_controller(&store, Arc::clone(&pools), vec![Arc::clone(&node)]);
        Harness {
            store,
            pools,
            node,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(default_pool())
    }

    fn v4(s: &str) -> Option<Ipv4Addr> {
        Some(s.parse().unwrap())
    }

    fn v6(s: &str) -> Option<Ipv6Addr> {
        Some(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_allocate_requests_a_block() {
        let h = harness();

        let (ipv4, ipv6) = h.node.allocate("default", "c0", "eth0").await.unwrap();
        assert_eq!(ipv4, v4("10.2.0.0"));
        assert_eq!(ipv6, v6("fd02::200"));

        let block = h.store.block("default-0").unwrap();
        assert_eq!(block.node_name(), Some("node1"));
        // The satisfied request is cleaned up
        assert!(h.store.block_request("default-node1").is_none());

        let allocations = h.node.allocations().unwrap();
        let info = &allocations[&("c0".to_string(), "eth0".to_string())];
        assert_eq!(info.block_name, "default-0");
        assert_eq!(info.offset, 0);
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent_per_attachment() {
        let h = harness();

        let first = h.node.allocate("default", "c0", "eth0").await.unwrap();
        let calls = h.store.call_count();
        let second = h.node.allocate("default", "c0", "eth0").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.store.call_count(), calls, "cached answer must not touch the store");
        assert_eq!(h.node.allocations().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_allocate_times_out_without_controller() {
        let h = harness();
        h.controller.abort();

        let start = Instant::now();
        let err = h
            .node
            .allocate_with_timeout("default", "c0", "eth0", Duration::from_millis(100))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout(), "Expected Timeout, got {:?}", err);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        // Nothing was reserved
        assert!(h.node.allocations().unwrap().is_empty());
        assert!(h.store.block_names().is_empty());
    }

    #[tokio::test]
    async fn test_late_grant_is_picked_up_by_next_allocate() {
        let h = harness();
        h.controller.abort();

        let err = h
            .node
            .allocate_with_timeout("default", "c0", "eth0", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // The controller answers after the node gave up
        let stale = h.store.block_request("default-node1").unwrap();
        h.pools.handle_block_request(&stale).await.unwrap();

        let (ipv4, _) = h
            .node
            .allocate_with_timeout("default", "c0", "eth0", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(ipv4, v4("10.2.0.0"));
        assert_eq!(h.store.block_names(), vec!["default-0".to_string()]);
    }

    #[tokio::test]
    async fn test_freed_address_is_reused_before_new_block() {
        let h = harness();

        let (a, _) = h.node.allocate("default", "c0", "eth0").await.unwrap();
        let (b, _) = h.node.allocate("default", "c0", "eth1").await.unwrap();
        assert_eq!(a, v4("10.2.0.0"));
        assert_eq!(b, v4("10.2.0.1"));

        let outcome = h.node.free("c0", "eth0").await.unwrap();
        assert_eq!(outcome, FreeOutcome { block_released: false });

        let (c, _) = h.node.allocate("default", "c0", "eth2").await.unwrap();
        assert_eq!(c, a);
        assert_eq!(h.store.block_names(), vec!["default-0".to_string()]);
    }

    #[tokio::test]
    async fn test_full_blocks_trigger_new_request() {
        let h = harness();

        for iface in ["eth0", "eth1", "eth2"] {
            h.node.allocate("default", "c0", iface).await.unwrap();
        }
        assert_eq!(
            h.store.block_names(),
            vec!["default-0".to_string(), "default-1".to_string()]
        );
        let allocations = h.node.allocations().unwrap();
        let info = &allocations[&("c0".to_string(), "eth2".to_string())];
        assert_eq!(info.block_name, "default-1");
        assert_eq!(info.ipv4, v4("10.2.0.2"));
    }

    #[tokio::test]
    async fn test_freeing_last_address_releases_block() {
        let h = harness();
        h.node.allocate("default", "c0", "eth0").await.unwrap();

        let outcome = h.node.free("c0", "eth0").await.unwrap();
        assert!(outcome.block_released);
        assert!(h.store.block("default-0").is_none());
        assert!(h.node.allocations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_free_unknown_attachment_is_noop() {
        let h = harness();
        let outcome = h.node.free("missing", "eth0").await.unwrap();
        assert_eq!(outcome, FreeOutcome::default());
    }

    #[tokio::test]
    async fn test_free_in_unowned_block_is_invariant_violation() {
        let h = harness();
        h.node.allocate("default", "c0", "eth0").await.unwrap();
        h.node.allocate("default", "c0", "eth1").await.unwrap();

        // The block goes away behind the node's back
        release_block(&h.store, "default-0", &RetryConfig::default())
            .await
            .unwrap();
        h.node.gc().await.unwrap();

        let err = h.node.free("c0", "eth0").await.unwrap_err();
        assert!(matches!(err, IpamError::Invariant(_)), "got {:?}", err);
        assert!(h
            .node
            .allocations()
            .unwrap()
            .contains_key(&("c0".to_string(), "eth0".to_string())));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_address() {
        let h = harness();
        h.node.allocate("default", "c0", "eth0").await.unwrap();

        h.store.inject_delete_failures(1);
        assert!(h.node.free("c0", "eth0").await.is_err());
        assert!(h.store.block("default-0").is_some());
        assert!(h
            .node
            .allocations()
            .unwrap()
            .contains_key(&("c0".to_string(), "eth0".to_string())));

        // Retrying completes the teardown
        let outcome = h.node.free("c0", "eth0").await.unwrap();
        assert!(outcome.block_released);
        assert!(h.store.block("default-0").is_none());
    }

    #[tokio::test]
    async fn test_finalizer_removal_retries_conflicts() {
        let h = harness();
        h.node.allocate("default", "c0", "eth0").await.unwrap();

        h.store.inject_conflicts(2);
        let outcome = h.node.free("c0", "eth0").await.unwrap();
        assert!(outcome.block_released);
        assert!(h.store.block("default-0").is_none());
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_reported() {
        let h = harness_with(create_test_pool("tiny", 1, vec![SubnetSet::v4("10.9.0.0/31")]));

        h.node.allocate("tiny", "c0", "eth0").await.unwrap();
        h.node.allocate("tiny", "c1", "eth0").await.unwrap();
        let err = h.node.allocate("tiny", "c2", "eth0").await.unwrap_err();

        assert!(matches!(err, IpamError::ExhaustedPool(_)), "got {:?}", err);
        let request = h.store.block_request("tiny-node1");
        assert!(request.is_none(), "failed request should be deleted");
    }

    #[tokio::test]
    async fn test_concurrent_allocations_share_one_block() {
        let h = harness();

        let a = {
            let node = Arc::clone(&h.node);
            tokio::spawn(async move { node.allocate("default", "c0", "eth0").await })
        };
        let b = {
            let node = Arc::clone(&h.node);
            tokio::spawn(async move { node.allocate("default", "c1", "eth0").await })
        };
        let (a, _) = a.await.unwrap().unwrap();
        let (b, _) = b.await.unwrap().unwrap();

        assert_ne!(a, b);
        assert_eq!(h.store.block_names(), vec!["default-0".to_string()]);
    }

    #[tokio::test]
    async fn test_parked_allocation_is_woken_by_notify() {
        // The fallback tick never fires within the deadline
        let config = NodeIpamConfig::new("node1")
            .with_request_timeout(Duration::from_secs(2))
            .with_poll_interval(Duration::from_secs(30));
        let h = harness_with_config(default_pool(), config);

        let start = Instant::now();
        let (ipv4, _) = h.node.allocate("default", "c0", "eth0").await.unwrap();

        assert_eq!(ipv4, v4("10.2.0.0"));
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_same_attachment_allocated_concurrently() {
        let h = harness();

        let a = {
            let node = Arc::clone(&h.node);
            tokio::spawn(async move { node.allocate("default", "c0", "eth0").await })
        };
        let b = {
            let node = Arc::clone(&h.node);
            tokio::spawn(async move { node.allocate("default", "c0", "eth0").await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a, b);
        assert_eq!(h.node.allocations().unwrap().len(), 1);
        // Only one offset was consumed
        let (next, _) = h.node.allocate("default", "c1", "eth0").await.unwrap();
        assert_eq!(next, v4("10.2.0.1"));
        assert_eq!(h.store.block_names(), vec!["default-0".to_string()]);
    }

    #[tokio::test]
    async fn test_losing_pool_releases_its_new_block() {
        let h = harness();
        h.store
            .add_pool(create_test_pool("other", 1, vec![SubnetSet::v4("10.9.0.0/30")]));

        let a = {
            let node = Arc::clone(&h.node);
            tokio::spawn(async move { node.allocate("default", "c0", "eth0").await })
        };
        let b = {
            let node = Arc::clone(&h.node);
            tokio::spawn(async move { node.allocate("other", "c0", "eth0").await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a, b);
        let allocations = h.node.allocations().unwrap();
        assert_eq!(allocations.len(), 1);
        let info = &allocations[&("c0".to_string(), "eth0".to_string())];
        // The block requested by the losing call is torn down, not left empty
        assert_eq!(h.store.block_names(), vec![info.block_name.clone()]);
    }

    #[tokio::test]
    async fn test_gc_releases_only_empty_blocks() {
        let store = MockStore::new();
        store.add_pool(default_pool());
        store.add_node("node1");
        store.add_block(create_test_block("default", "node1", 0, Some("10.2.0.0/31"), None));
        store.add_block(create_test_block("default", "node1", 1, Some("10.2.0.2/31"), None));
        store.add_block(create_test_block("default", "node2", 2, Some("10.2.0.4/31"), None));

        let node = NodeIpam::new(Arc::new(store.clone()), config(), test_metrics());
        node.register("default", "c0", "eth0", v4("10.2.0.2"), None)
            .await
            .unwrap();
        node.gc().await.unwrap();

        assert_eq!(
            store.block_names(),
            vec!["default-1".to_string(), "default-2".to_string()]
        );
        let allocations = node.allocations().unwrap();
        let info = &allocations[&("c0".to_string(), "eth0".to_string())];
        assert_eq!(info.block_name, "default-1");
        assert_eq!(info.offset, 0);

        // Registered bit survived, so the next address is the other one
        let (ipv4, _) = node.allocate("default", "c1", "eth0").await.unwrap();
        assert_eq!(ipv4, v4("10.2.0.3"));
    }

    #[tokio::test]
    async fn test_gc_finishes_interrupted_teardown() {
        let store = MockStore::new();
        store.add_pool(default_pool());
        store.add_block(create_test_block("default", "node1", 0, Some("10.2.0.0/31"), None));
        store.delete_block("default-0").await.unwrap();
        assert!(store.block("default-0").unwrap().is_deleting());

        let node = NodeIpam::new(Arc::new(store.clone()), config(), test_metrics());
        node.gc().await.unwrap();
        assert!(store.block_names().is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_foreign_address() {
        let store = MockStore::new();
        store.add_pool(default_pool());
        store.add_block(create_test_block("default", "node1", 0, Some("10.2.0.0/31"), None));

        let node = NodeIpam::new(Arc::new(store.clone()), config(), test_metrics());
        let err = node
            .register("default", "c0", "eth0", v4("192.168.0.1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::Invariant(_)));
        assert!(node.allocations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_block_is_never_used() {
        let store = MockStore::new();
        store.add_pool(default_pool());
        store.add_node("node1");
        let mut reserved = create_test_block("default", "node1", 0, Some("10.2.0.0/31"), None);
        reserved
            .labels_mut()
            .insert(LABEL_RESERVED.to_string(), "true".to_string());
        store.add_block(reserved);

        let metrics = test_metrics();
        let pools = Arc::new(PoolManager::new(Arc::new(store.clone()), Arc::clone(&metrics)));
        let node = Arc::new(NodeIpam::new(Arc::new(store.clone()), config(), metrics));
        let controller = spawn_controller(&store, pools, vec![Arc::clone(&node)]);

        let (ipv4, _) = node.allocate("default", "c0", "eth0").await.unwrap();
        assert_eq!(ipv4, v4("10.2.0.2"));

        node.gc().await.unwrap();
        assert!(store.block("default-0").is_some());
        controller.abort();
    }

    #[tokio::test]
    async fn test_notify_for_other_node_is_ignored() {
        let h = harness();
        let request = BlockRequest::new(
            "default-node2",
            BlockRequestSpec {
                node_name: "node2".to_string(),
                pool_name: "default".to_string(),
            },
        );
        // No waiter and no tracked pool; must not block or panic
        h.node.notify(&request);
        h.node.allocate("default", "c0", "eth0").await.unwrap();
        h.node.notify(&request);
    }

    #[tokio::test]
    async fn test_node_usage_is_reported() {
        let store = MockStore::new();
        store.add_pool(default_pool());
        store.add_node("node1");
        let metrics = test_metrics();
        let pools = Arc::new(PoolManager::new(Arc::new(store.clone()), Arc::clone(&metrics)));
        let node = Arc::new(NodeIpam::new(Arc::new(store.clone()), config(), Arc::clone(&metrics)));
        let controller = spawn_controller(&store, pools, vec![Arc::clone(&node)]);

        node.allocate("default", "c0", "eth0").await.unwrap();
        node.allocate("default", "c0", "eth1").await.unwrap();
        assert_eq!(metrics.node_allocated("default", "node1"), 2);
        assert_eq!(metrics.pool_allocated("default"), 1);

        node.free("c0", "eth1").await.unwrap();
        assert_eq!(metrics.node_allocated("default", "node1"), 1);
        controller.abort();
    }
}
