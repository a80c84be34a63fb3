//! Per-block address allocator.
//!
//! An [`AddressAllocator`] covers one AddressBlock. Dual-stack blocks carry
//! an IPv4 and an IPv6 range of the same size, so one offset names one
//! address in each family.

use crate::bitmap::Bitmap;
use crate::error::IpamError;
use crate::subnet::{add_v4, add_v6, parse_v4, parse_v6};
use crds::AddressBlock;
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Largest block an allocator accepts, in host bits
const MAX_HOST_BITS: u32 = 24;

/// Addresses handed out by [`AddressAllocator::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// IPv4 address, for blocks with an IPv4 range
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address, for blocks with an IPv6 range
    pub ipv6: Option<Ipv6Addr>,
    /// Offset inside the block
    pub offset: u32,
}

/// Tracks used and free offsets of one block.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    ipv4: Option<Ipv4Net>,
    ipv6: Option<Ipv6Net>,
    used: Bitmap,
}

impl AddressAllocator {
    /// Creates an allocator for the given range(s).
    ///
    /// The size comes from the IPv4 range when present, otherwise from the
    /// IPv6 range. For dual-stack blocks both ranges are expected to have
    /// the same size; pool validation guarantees it for blocks the pool
    /// manager mints.
    pub fn new(ipv4: Option<Ipv4Net>, ipv6: Option<Ipv6Net>) -> Result<Self, IpamError> {
        let host_bits = match (ipv4, ipv6) {
            (Some(n), _) => 32 - u32::from(n.prefix_len()),
            (None, Some(n)) => 128 - u32::from(n.prefix_len()),
            (None, None) => {
                return Err(IpamError::InvalidPool("block has neither ipv4 nor ipv6".to_string()));
            }
        };
        if host_bits > MAX_HOST_BITS {
            return Err(IpamError::InvalidPool(format!(
                "block of {} host bits is too large",
                host_bits
            )));
        }

        Ok(Self {
            ipv4: ipv4.map(|n| n.trunc()),
            ipv6: ipv6.map(|n| n.trunc()),
            used: Bitmap::new(1u32 << host_bits),
        })
    }

    /// Creates an allocator for an AddressBlock resource.
    pub fn from_block(block: &AddressBlock) -> Result<Self, IpamError> {
        let ipv4 = parse_v4(block.spec.ipv4.as_deref())?;
        let ipv6 = parse_v6(block.spec.ipv6.as_deref())?;
        Self::new(ipv4, ipv6)
    }

    /// IPv4 range of the block
    pub fn ipv4(&self) -> Option<Ipv4Net> {
        self.ipv4
    }

    /// IPv6 range of the block
    pub fn ipv6(&self) -> Option<Ipv6Net> {
        self.ipv6
    }

    fn offset_v4(&self, addr: Ipv4Addr) -> Option<u32> {
        let net = self.ipv4?;
        net.contains(&addr)
            .then(|| u32::from(addr) - u32::from(net.network()))
    }

    fn offset_v6(&self, addr: Ipv6Addr) -> Option<u32> {
        let net = self.ipv6?;
        if !net.contains(&addr) {
            return None;
        }
        u32::try_from(u128::from(addr) - u128::from(net.network())).ok()
    }

    /// Marks an already-live address as used and returns its offset.
    ///
    /// Returns `None` when the address does not belong to this block, or
    /// when the two families point at different offsets.
    pub fn register(&mut self, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Option<u32> {
        let v4 = match ipv4 {
            Some(addr) => Some(self.offset_v4(addr)?),
            None => None,
        };
        let v6 = match ipv6 {
            Some(addr) => Some(self.offset_v6(addr)?),
            None => None,
        };

        let offset = match (v4, v6) {
            (Some(a), Some(b)) if a != b => return None,
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => return None,
        };

        self.used.set(offset).then_some(offset)
    }

    /// Allocates the lowest free offset.
    ///
    /// Returns `None` when the block is full.
    pub fn allocate(&mut self) -> Option<Allocation> {
        let offset = self.used.first_clear()?;

        let ipv4 = match self.ipv4 {
            Some(net) => Some(add_v4(net.network(), offset)?),
            None => None,
        };
        let ipv6 = match self.ipv6 {
            Some(net) => Some(add_v6(net.network(), u128::from(offset))?),
            None => None,
        };

        self.used.set(offset);
        Some(Allocation { ipv4, ipv6, offset })
    }

    /// Releases an offset. Releasing a free offset is a no-op.
    pub fn free(&mut self, offset: u32) {
        self.used.clear(offset);
    }

    /// Whether `offset` is in use
    pub fn is_used(&self, offset: u32) -> bool {
        self.used.test(offset)
    }

    /// Whether every offset is in use
    pub fn is_full(&self) -> bool {
        self.used.is_full()
    }

    /// Whether no offset is in use
    pub fn is_empty(&self) -> bool {
        self.used.is_clear()
    }

    /// Marks every offset as used.
    ///
    /// Applied to blocks reserved out-of-band so nothing is allocated from them.
    pub fn fill(&mut self) {
        self.used.fill();
    }

    /// Number of offsets in use
    pub fn allocated(&self) -> u32 {
        self.used.count_ones()
    }

    /// Number of offsets in the block
    pub fn capacity(&self) -> u32 {
        self.used.len()
    }
}
