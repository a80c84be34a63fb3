//! Well-known labels, finalizers and naming rules.
//!
//! Blocks are looked up by label selector, so the label keys here are part
//! of the on-cluster contract between the pool manager and node agents.

/// Label carrying the owning AddressPool name on an AddressBlock
pub const LABEL_POOL: &str = "dcops.microscaler.io/pool";

/// Label carrying the owning node name on an AddressBlock
pub const LABEL_NODE: &str = "dcops.microscaler.io/node";

/// Label marking an AddressBlock reserved out-of-band.
///
/// Node agents treat reserved blocks as fully consumed.
pub const LABEL_RESERVED: &str = "dcops.microscaler.io/reserved";

/// Finalizer placed on every AddressBlock the pool manager creates
pub const BLOCK_FINALIZER: &str = "dcops.microscaler.io/block";

/// Finalizer keeping an AddressPool alive while blocks still reference it
pub const POOL_FINALIZER: &str = "dcops.microscaler.io/pool";

/// Name of the AddressBlock holding `index` of `pool`.
pub fn block_name(pool: &str, index: u32) -> String {
    format!("{}-{}", pool, index)
}

/// Name of the BlockRequest a node issues against a pool.
///
/// The name is reused on every attempt so that a retry replaces the
/// previous request instead of piling up new ones.
pub fn block_request_name(pool: &str, node: &str) -> String {
    format!("{}-{}", pool, node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(block_name("default", 0), "default-0");
        assert_eq!(block_name("default", 17), "default-17");
        assert_eq!(block_request_name("default", "node1"), "default-node1");
        assert_eq!(
            block_request_name("default", "node1"),
            block_request_name("default", "node1")
        );
    }
}
