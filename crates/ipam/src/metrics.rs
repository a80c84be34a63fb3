//! Prometheus metrics for the IPAM components.
//!
//! Metrics are process-lifetime state: build one [`IpamMetrics`] against a
//! registry at start-up and hand it to the components that report into it.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// IPAM metric handles
#[derive(Debug, Clone)]
pub struct IpamMetrics {
    pool_allocated_blocks: IntGaugeVec,
    pool_capacity_blocks: IntGaugeVec,
    node_blocks: IntGaugeVec,
    node_allocated_addresses: IntGaugeVec,
    block_requests: IntCounterVec,
}

impl IpamMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pool_allocated_blocks = IntGaugeVec::new(
            Opts::new("ipam_pool_allocated_blocks", "Number of blocks allocated from the pool"),
            &["pool"],
        )?;
        let pool_capacity_blocks = IntGaugeVec::new(
            Opts::new("ipam_pool_capacity_blocks", "Number of blocks the pool can hold"),
            &["pool"],
        )?;
        let node_blocks = IntGaugeVec::new(
            Opts::new("ipam_node_blocks", "Number of blocks owned by the node"),
            &["pool", "node"],
        )?;
        let node_allocated_addresses = IntGaugeVec::new(
            Opts::new("ipam_node_allocated_addresses", "Number of addresses allocated on the node"),
            &["pool", "node"],
        )?;
        let block_requests = IntCounterVec::new(
            Opts::new("ipam_block_requests_total", "Block requests by outcome"),
            &["pool", "outcome"],
        )?;

        registry.register(Box::new(pool_allocated_blocks.clone()))?;
        registry.register(Box::new(pool_capacity_blocks.clone()))?;
        registry.register(Box::new(node_blocks.clone()))?;
        registry.register(Box::new(node_allocated_addresses.clone()))?;
        registry.register(Box::new(block_requests.clone()))?;

        Ok(Self {
            pool_allocated_blocks,
            pool_capacity_blocks,
            node_blocks,
            node_allocated_addresses,
            block_requests,
        })
    }

    /// Records pool-level block usage
    pub fn set_pool_usage(&self, pool: &str, allocated: u32, capacity: u32) {
        self.pool_allocated_blocks
            .with_label_values(&[pool])
            .set(i64::from(allocated));
        self.pool_capacity_blocks
            .with_label_values(&[pool])
            .set(i64::from(capacity));
    }

    /// Drops the series of a deleted pool
    pub fn forget_pool(&self, pool: &str) {
        let _ = self.pool_allocated_blocks.remove_label_values(&[pool]);
        let _ = self.pool_capacity_blocks.remove_label_values(&[pool]);
    }

    /// Records node-level usage of one pool
    pub fn set_node_usage(&self, pool: &str, node: &str, blocks: usize, addresses: u32) {
        self.node_blocks
            .with_label_values(&[pool, node])
            .set(i64::try_from(blocks).unwrap_or(i64::MAX));
        self.node_allocated_addresses
            .with_label_values(&[pool, node])
            .set(i64::from(addresses));
    }

    /// Counts a block request outcome ("complete", "failed", "timeout")
    pub fn observe_block_request(&self, pool: &str, outcome: &str) {
        self.block_requests.with_label_values(&[pool, outcome]).inc();
    }

    /// Value of the pool allocation gauge (for tests and status output)
    pub fn pool_allocated(&self, pool: &str) -> i64 {
        self.pool_allocated_blocks.with_label_values(&[pool]).get()
    }

    /// Value of the node address gauge (for tests and status output)
    pub fn node_allocated(&self, pool: &str, node: &str) -> i64 {
        self.node_allocated_addresses.with_label_values(&[pool, node]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = IpamMetrics::new(&registry).unwrap();
        metrics.set_pool_usage("default", 2, 6);
        metrics.set_node_usage("default", "node1", 1, 3);
        metrics.observe_block_request("default", "complete");

        assert_eq!(metrics.pool_allocated("default"), 2);
        assert_eq!(metrics.node_allocated("default", "node1"), 3);
        assert!(!registry.gather().is_empty());

        // Registering the same names twice is rejected
        assert!(IpamMetrics::new(&registry).is_err());
    }
}
