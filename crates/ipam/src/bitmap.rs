//! Fixed-size bitmap with lowest-clear-bit search.
//!
//! Backs both the per-pool block index map and the per-block offset map.
//! A thin `u32`-indexed wrapper over [`FixedBitSet`]; out-of-range indices
//! are rejected instead of panicking.

use fixedbitset::FixedBitSet;

/// Fixed-length bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: FixedBitSet,
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl Bitmap {
    /// Creates a bitmap of `len` clear bits.
    pub fn new(len: u32) -> Self {
        Self {
            bits: FixedBitSet::with_capacity(len as usize),
        }
    }

    /// Number of bits
    pub fn len(&self) -> u32 {
        to_u32(self.bits.len())
    }

    /// Number of set bits
    pub fn count_ones(&self) -> u32 {
        to_u32(self.bits.count_ones(..))
    }

    /// Whether no bit is set
    pub fn is_clear(&self) -> bool {
        self.bits.count_ones(..) == 0
    }

    /// Whether every bit is set
    pub fn is_full(&self) -> bool {
        self.bits.count_ones(..) == self.bits.len()
    }

    /// Tests bit `idx`; out-of-range bits read as clear.
    pub fn test(&self, idx: u32) -> bool {
        self.bits.contains(idx as usize)
    }

    /// Sets bit `idx`. Returns false if it is out of range.
    pub fn set(&mut self, idx: u32) -> bool {
        if idx >= self.len() {
            return false;
        }
        self.bits.insert(idx as usize);
        true
    }

    /// Clears bit `idx`. Clearing a clear or out-of-range bit is a no-op.
    pub fn clear(&mut self, idx: u32) {
        if idx < self.len() {
            self.bits.set(idx as usize, false);
        }
    }

    /// Returns the lowest clear bit without setting it.
    pub fn first_clear(&self) -> Option<u32> {
        self.bits.zeroes().next().map(to_u32)
    }

    /// Finds, sets and returns the lowest clear bit.
    pub fn set_first_clear(&mut self) -> Option<u32> {
        let bit = self.first_clear()?;
        self.set(bit);
        Some(bit)
    }

    /// Sets every bit.
    pub fn fill(&mut self) {
        self.bits.insert_range(..);
    }

    /// Changes the length, keeping the bits that still fit.
    pub fn resize(&mut self, len: u32) {
        let len = len as usize;
        if len >= self.bits.len() {
            self.bits.grow(len);
            return;
        }
        let mut resized = FixedBitSet::with_capacity(len);
        resized.extend(self.bits.ones().take_while(|&idx| idx < len));
        self.bits = resized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut bitmap = Bitmap::new(3);
        assert_eq!(bitmap.set_first_clear(), Some(0));
        assert_eq!(bitmap.set_first_clear(), Some(1));
        assert_eq!(bitmap.set_first_clear(), Some(2));
        assert_eq!(bitmap.set_first_clear(), None);
        assert!(bitmap.is_full());
    }

    #[test]
    fn test_free_enables_reuse_from_earlier_word() {
        let mut bitmap = Bitmap::new(130);
        for _ in 0..129 {
            bitmap.set_first_clear();
        }
        bitmap.clear(3);
        assert_eq!(bitmap.set_first_clear(), Some(3));
        assert_eq!(bitmap.set_first_clear(), Some(129));
        assert_eq!(bitmap.set_first_clear(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut bitmap = Bitmap::new(8);
        bitmap.set(5);
        bitmap.clear(5);
        bitmap.clear(5);
        bitmap.clear(100);
        assert!(bitmap.is_clear());
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    fn test_out_of_range() {
        let mut bitmap = Bitmap::new(2);
        assert!(!bitmap.set(2));
        assert!(!bitmap.test(2));
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    fn test_fill_then_clear_one() {
        let mut bitmap = Bitmap::new(70);
        bitmap.fill();
        assert!(bitmap.is_full());
        assert_eq!(bitmap.count_ones(), 70);
        bitmap.clear(66);
        assert_eq!(bitmap.set_first_clear(), Some(66));
        assert_eq!(bitmap.set_first_clear(), None);
    }

    #[test]
    fn test_resize_keeps_bits() {
        let mut bitmap = Bitmap::new(4);
        bitmap.set(1);
        bitmap.set(3);
        bitmap.resize(6);
        assert_eq!(bitmap.len(), 6);
        assert!(bitmap.test(1));
        assert!(bitmap.test(3));
        assert_eq!(bitmap.first_clear(), Some(0));

        bitmap.resize(2);
        assert_eq!(bitmap.len(), 2);
        assert!(bitmap.test(1));
        assert_eq!(bitmap.count_ones(), 1);
    }

    #[test]
    fn test_zero_length() {
        let mut bitmap = Bitmap::new(0);
        assert!(bitmap.is_full());
        assert!(bitmap.is_clear());
        assert_eq!(bitmap.set_first_clear(), None);
    }
}
