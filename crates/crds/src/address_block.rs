//! AddressBlock CRD
//!
//! A contiguous slice of a pool's address space owned by a single node.
//! Ownership is carried by the `dcops.microscaler.io/node` label.

use crate::labels::{LABEL_NODE, LABEL_POOL, LABEL_RESERVED};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "AddressBlock"
)]
#[serde(rename_all = "camelCase")]
pub struct AddressBlockSpec {
    /// Position of the block in the pool's concatenated subnet space
    pub index: i32,

    /// IPv4 range of the block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    /// IPv6 range of the block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

impl AddressBlock {
    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Name of the pool the block was carved from
    pub fn pool_name(&self) -> Option<&str> {
        self.label(LABEL_POOL)
    }

    /// Name of the node owning the block
    pub fn node_name(&self) -> Option<&str> {
        self.label(LABEL_NODE)
    }

    /// Whether the block was reserved out-of-band
    pub fn is_reserved(&self) -> bool {
        self.label(LABEL_RESERVED).is_some()
    }

    /// Whether the block has been asked to go away
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
