//! Bloom filter used by existence filters.
//!
//! Bit positions come from double hashing: the SHA-256 digest of the value
//! is split into two little-endian 64-bit halves `h1` and `h2`, and the
//! `i`-th position is `(h1 + i * h2) mod bit_count` with wrapping 64-bit
//! arithmetic.

use crate::error::{ProtocolError, ProtocolResult};
use crate::watch_change::BloomFilterParams;
use sha2::{Digest, Sha256};

/// A fixed-size bit array with `hash_count` positions per value.
///
/// Membership tests never give false negatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    /// Validates and wraps filter parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidBloomFilter`] if the padding is not
    /// in `0..8`, a non-empty bitmap has no hash functions, or an empty
    /// bitmap declares padding.
    pub fn new(bitmap: Vec<u8>, padding: u8, hash_count: u32) -> ProtocolResult<Self> {
        if padding >= 8 {
            return Err(ProtocolError::InvalidBloomFilter(format!(
                "padding {padding} is not in 0..8"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(ProtocolError::InvalidBloomFilter(
                "hash count is zero for a non-empty bitmap".into(),
            ));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(ProtocolError::InvalidBloomFilter(
                "padding is set for an empty bitmap".into(),
            ));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            hash_count,
            bit_count,
        })
    }

    /// Builds a filter from wire parameters.
    ///
    /// # Errors
    ///
    /// See [`BloomFilter::new`].
    pub fn from_params(params: &BloomFilterParams) -> ProtocolResult<Self> {
        Self::new(params.bitmap.clone(), params.padding, params.hash_count)
    }

    /// Builds a filter of `bit_count` bits containing `values`.
    ///
    /// # Errors
    ///
    /// See [`BloomFilter::new`].
    pub fn with_values<'a, I>(bit_count: u64, hash_count: u32, values: I) -> ProtocolResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let bytes = bit_count.div_ceil(8) as usize;
        let padding = (bytes as u64 * 8 - bit_count) as u8;
        let mut filter = Self::new(vec![0; bytes], padding, hash_count)?;
        for value in values {
            filter.insert(value);
        }
        Ok(filter)
    }

    /// Number of usable bits.
    #[must_use]
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Number of hash positions per value.
    #[must_use]
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Converts back into wire parameters.
    #[must_use]
    pub fn to_params(&self) -> BloomFilterParams {
        BloomFilterParams {
            bitmap: self.bitmap.clone(),
            padding: (self.bitmap.len() as u64 * 8 - self.bit_count) as u8,
            hash_count: self.hash_count,
        }
    }

    /// Returns false if `value` is definitely absent.
    #[must_use]
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(h1, h2, i)))
    }

    /// Adds `value` to the filter.
    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = hash_halves(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(u64::from(i))) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_invalid_parameters() {
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0], 0, 0).is_err());
        assert!(BloomFilter::new(vec![], 1, 1).is_err());
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain("anything"));
    }

    #[test]
    fn padding_reduces_bit_count() {
        let filter = BloomFilter::new(vec![0, 0], 3, 2).unwrap();
        assert_eq!(filter.bit_count(), 13);
        assert_eq!(filter.to_params().padding, 3);
    }

    #[test]
    fn sparse_filter_rejects_most_absent_values() {
        let filter = BloomFilter::with_values(1024, 7, ["a", "b", "c"]).unwrap();
        let false_positives = (0..200)
            .filter(|i| filter.might_contain(&format!("absent-{i}")))
            .count();
        assert!(false_positives < 10, "{false_positives} false positives");
    }

    proptest! {
        #[test]
        fn no_false_negatives(values in proptest::collection::vec("[a-z/]{1,24}", 1..40), bits in 8u64..512, hashes in 1u32..10) {
            let filter = BloomFilter::with_values(bits, hashes, values.iter().map(String::as_str)).unwrap();
            for value in &values {
                prop_assert!(filter.might_contain(value));
            }
        }
    }
}
