//! AddressPool CRD
//!
//! Declares the subnets a pool carves blocks from and the size of each block.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_block_size_bits() -> u32 {
    5
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "AddressPool"
)]
#[serde(rename_all = "camelCase")]
pub struct AddressPoolSpec {
    /// Block size as a power of two (a block holds `2^blockSizeBits` addresses)
    #[serde(default = "default_block_size_bits")]
    pub block_size_bits: u32,

    /// Ordered subnet list; block indices run across the entries in order
    pub subnets: Vec<SubnetSet>,
}

/// One entry of a pool's subnet list.
///
/// Dual-stack entries must declare IPv4 and IPv6 subnets with the same
/// number of host bits, so both families share one offset space.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSet {
    /// IPv4 subnet in CIDR notation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    /// IPv6 subnet in CIDR notation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

impl SubnetSet {
    /// IPv4-only subnet entry
    pub fn v4(cidr: &str) -> Self {
        Self {
            ipv4: Some(cidr.to_string()),
            ipv6: None,
        }
    }

    /// Dual-stack subnet entry
    pub fn dual(ipv4: &str, ipv6: &str) -> Self {
        Self {
            ipv4: Some(ipv4.to_string()),
            ipv6: Some(ipv6.to_string()),
        }
    }
}
