//! Subnet parsing and block-index arithmetic.
//!
//! A pool concatenates its subnets into one index space: the first entry
//! contributes `2^(hostBits - blockSizeBits)` block indices, the next entry
//! continues where it stopped, and so on. Dual-stack entries contribute one
//! index range shared by both families.

use crate::error::IpamError;
use crds::{AddressPoolSpec, SubnetSet};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Largest supported block, in host bits
pub const MAX_BLOCK_SIZE_BITS: u32 = 24;

/// Largest supported number of blocks per subnet entry, in bits
pub const MAX_BLOCK_INDEX_BITS: u32 = 24;

/// Adds `offset` to an IPv4 address; `None` on overflow.
pub fn add_v4(base: Ipv4Addr, offset: u32) -> Option<Ipv4Addr> {
    u32::from(base).checked_add(offset).map(Ipv4Addr::from)
}

/// Adds `offset` to an IPv6 address; `None` on overflow.
pub fn add_v6(base: Ipv6Addr, offset: u128) -> Option<Ipv6Addr> {
    u128::from(base).checked_add(offset).map(Ipv6Addr::from)
}

/// Parses an optional IPv4 CIDR, normalising it to its network address.
pub fn parse_v4(cidr: Option<&str>) -> Result<Option<Ipv4Net>, IpamError> {
    cidr.map(|s| {
        s.parse::<Ipv4Net>()
            .map(|n| n.trunc())
            .map_err(|e| IpamError::InvalidPool(format!("invalid IPv4 subnet {}: {}", s, e)))
    })
    .transpose()
}

/// Parses an optional IPv6 CIDR, normalising it to its network address.
pub fn parse_v6(cidr: Option<&str>) -> Result<Option<Ipv6Net>, IpamError> {
    cidr.map(|s| {
        s.parse::<Ipv6Net>()
            .map(|n| n.trunc())
            .map_err(|e| IpamError::InvalidPool(format!("invalid IPv6 subnet {}: {}", s, e)))
    })
    .transpose()
}

/// A validated subnet list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    /// IPv4 part
    pub ipv4: Option<Ipv4Net>,
    /// IPv6 part
    pub ipv6: Option<Ipv6Net>,
    /// Host bits shared by both families
    pub host_bits: u32,
}

impl Subnet {
    /// Parses one subnet entry.
    ///
    /// Dual-stack entries must have the same number of host bits in both
    /// families.
    pub fn parse(set: &SubnetSet) -> Result<Self, IpamError> {
        let ipv4 = parse_v4(set.ipv4.as_deref())?;
        let ipv6 = parse_v6(set.ipv6.as_deref())?;

        let v4_bits = ipv4.map(|n| 32 - u32::from(n.prefix_len()));
        let v6_bits = ipv6.map(|n| 128 - u32::from(n.prefix_len()));

        let host_bits = match (v4_bits, v6_bits) {
            (Some(a), Some(b)) if a != b => {
                return Err(IpamError::InvalidPool(format!(
                    "subnet sizes differ: {} has {} host bits, {} has {}",
                    set.ipv4.as_deref().unwrap_or_default(),
                    a,
                    set.ipv6.as_deref().unwrap_or_default(),
                    b
                )));
            }
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(IpamError::InvalidPool(
                    "subnet entry has neither ipv4 nor ipv6".to_string(),
                ));
            }
        };

        Ok(Self { ipv4, ipv6, host_bits })
    }

    /// Number of blocks of `2^block_size_bits` addresses in this entry
    pub fn block_count(&self, block_size_bits: u32) -> u32 {
        1u32 << (self.host_bits - block_size_bits)
    }

    /// CIDRs of the `local_index`-th block of this entry.
    pub fn block(&self, local_index: u32, block_size_bits: u32) -> Option<(Option<Ipv4Net>, Option<Ipv6Net>)> {
        if local_index >= self.block_count(block_size_bits) {
            return None;
        }

        let ipv4 = match self.ipv4 {
            Some(net) => {
                let offset = local_index.checked_mul(1u32 << block_size_bits)?;
                let addr = add_v4(net.network(), offset)?;
                let prefix = u8::try_from(32 - block_size_bits).ok()?;
                Some(Ipv4Net::new(addr, prefix).ok()?)
            }
            None => None,
        };
        let ipv6 = match self.ipv6 {
            Some(net) => {
                let offset = u128::from(local_index).checked_mul(1u128 << block_size_bits)?;
                let addr = add_v6(net.network(), offset)?;
                let prefix = u8::try_from(128 - block_size_bits).ok()?;
                Some(Ipv6Net::new(addr, prefix).ok()?)
            }
            None => None,
        };

        Some((ipv4, ipv6))
    }
}

/// A validated pool definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    /// Block size in host bits
    pub block_size_bits: u32,
    /// Subnet entries in declaration order
    pub subnets: Vec<Subnet>,
}

impl PoolLayout {
    /// Parses and validates a pool spec.
    pub fn from_spec(spec: &AddressPoolSpec) -> Result<Self, IpamError> {
        if spec.subnets.is_empty() {
            return Err(IpamError::InvalidPool("pool declares no subnets".to_string()));
        }
        if spec.block_size_bits > MAX_BLOCK_SIZE_BITS {
            return Err(IpamError::InvalidPool(format!(
                "blockSizeBits {} exceeds {}",
                spec.block_size_bits, MAX_BLOCK_SIZE_BITS
            )));
        }

        let subnets = spec
            .subnets
            .iter()
            .map(Subnet::parse)
            .collect::<Result<Vec<_>, _>>()?;

        for subnet in &subnets {
            if subnet.host_bits < spec.block_size_bits {
                return Err(IpamError::InvalidPool(format!(
                    "subnet with {} host bits is smaller than a block of {} bits",
                    subnet.host_bits, spec.block_size_bits
                )));
            }
            if subnet.host_bits - spec.block_size_bits > MAX_BLOCK_INDEX_BITS {
                return Err(IpamError::InvalidPool(format!(
                    "subnet with {} host bits holds more than 2^{} blocks",
                    subnet.host_bits, MAX_BLOCK_INDEX_BITS
                )));
            }
        }

        Ok(Self {
            block_size_bits: spec.block_size_bits,
            subnets,
        })
    }

    /// Total number of block indices across all subnets
    pub fn capacity(&self) -> u32 {
        self.subnets
            .iter()
            .fold(0u32, |acc, s| acc.saturating_add(s.block_count(self.block_size_bits)))
    }

    /// Locates the subnet holding `index` and derives the block CIDRs.
    ///
    /// Walks the subnet list accumulating block counts; returns `None` when
    /// `index` lies past the last subnet.
    pub fn block_at(&self, index: u32) -> Option<(Option<Ipv4Net>, Option<Ipv6Net>)> {
        let mut start = 0u32;
        for subnet in &self.subnets {
            let count = subnet.block_count(self.block_size_bits);
            let end = start.saturating_add(count);
            if index < end {
                return subnet.block(index - start, self.block_size_bits);
            }
            start = end;
        }
        None
    }
}
