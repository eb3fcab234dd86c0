//! 256-bit binary ORB descriptor.

use std::fmt;

/// Descriptor length in bytes.
pub const DESCRIPTOR_BYTES: usize = 32;

/// A 256-bit rBRIEF descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn from_bytes(bytes: [u8; DESCRIPTOR_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DESCRIPTOR_BYTES] {
        &self.0
    }

    /// Value of bit `i` (0..256).
    #[inline]
    pub fn bit(&self, i: usize) -> bool {
        (self.0[i / 8] >> (i % 8)) & 1 == 1
    }

    #[inline]
    pub fn set_bit(&mut self, i: usize) {
        self.0[i / 8] |= 1 << (i % 8);
    }

    /// Hamming distance to another descriptor.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        hamming(self, other)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Number of differing bits between two descriptors.
#[inline]
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.0.chunks_exact(8)
        .zip(b.0.chunks_exact(8))
        .map(|(x, y)| {
            let mut xa = [0u8; 8];
            let mut ya = [0u8; 8];
            xa.copy_from_slice(x);
            ya.copy_from_slice(y);
            (u64::from_le_bytes(xa) ^ u64::from_le_bytes(ya)).count_ones()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_counts_bits() {
        let a = Descriptor::default();
        let mut b = Descriptor::default();
        assert_eq!(hamming(&a, &b), 0);
        b.set_bit(0);
        b.set_bit(100);
        b.set_bit(255);
        assert_eq!(hamming(&a, &b), 3);
        assert!(b.bit(100));
        assert!(!b.bit(101));
        assert_eq!(Descriptor([0xff; 32]).distance(&a), 256);
    }
}
