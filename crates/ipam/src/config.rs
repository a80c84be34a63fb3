//! Tunables for the IPAM components.

use crate::backoff::FibonacciBackoff;
use std::time::Duration;

/// Default time a node waits for its BlockRequest to be answered
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval at which a waiting node re-reads its BlockRequest
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of a [`NodeIpam`](crate::NodeIpam)
#[derive(Debug, Clone)]
pub struct NodeIpamConfig {
    /// Name of the node this allocator serves
    pub node_name: String,

    /// Deadline for a block request round trip
    pub request_timeout: Duration,

    /// Fallback tick used when a wake-up notification is missed
    pub poll_interval: Duration,

    /// Retry policy for finalizer removal
    pub retry: RetryConfig,
}

impl NodeIpamConfig {
    /// Configuration with defaults for the given node
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryConfig::default(),
        }
    }

    /// Overrides the block request deadline
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the fallback poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Bounded retry policy for optimistic-concurrency conflicts
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub attempts: u32,
    /// First delay
    pub min_backoff: Duration,
    /// Delay cap
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            min_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Fresh backoff sequence for one retry loop
    pub fn backoff(&self) -> FibonacciBackoff {
        FibonacciBackoff::new(self.min_backoff, self.max_backoff)
    }
}
