use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Bloom filter sent by the backend with an existence filter, holding the
/// fully qualified names of the documents that still match a target.
///
/// Bits are probed with double hashing: the SHA-256 digest of a name is split
/// into two little-endian 64-bit halves `h1` and `h2`, and the `i`-th probe
/// tests bit `(h1 + i * h2) mod bit_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }

        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// False means `value` was definitely not inserted.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        probe_indexes(value, self.hash_count, self.bit_count).all(|index| self.is_bit_set(index))
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

fn probe_indexes(value: &str, hash_count: u32, bit_count: u64) -> impl Iterator<Item = u64> {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    let h1 = u64::from_le_bytes(first);
    let h2 = u64::from_le_bytes(second);

    (0..hash_count as u64).map(move |i| h1.wrapping_add(h2.wrapping_mul(i)) % bit_count)
}

/// Builds a bitmap containing `values`, for feeding existence filters to tests.
#[cfg(test)]
pub(crate) fn bitmap_for<'a>(values: impl IntoIterator<Item = &'a str>, byte_len: usize, hash_count: u32) -> Vec<u8> {
    let mut bitmap = vec![0u8; byte_len];
    let bit_count = byte_len as u64 * 8;
    for value in values {
        for index in probe_indexes(value, hash_count, bit_count) {
            bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
    bitmap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_parameters() {
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0], -1, 1).is_err());
        assert!(BloomFilter::new(vec![0], 0, -1).is_err());
        assert!(BloomFilter::new(vec![0], 0, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain("a"));
    }

    #[test]
    fn padding_shrinks_bit_count() {
        let filter = BloomFilter::new(vec![0xff, 0x01], 5, 1).unwrap();
        assert_eq!(filter.bit_count(), 11);
    }

    #[test]
    fn inserted_names_are_found() {
        let names: Vec<String> = (0..50)
            .map(|i| format!("projects/p/databases/(default)/documents/rooms/{i}"))
            .collect();
        let bitmap = bitmap_for(names.iter().map(String::as_str), 64, 7);
        let filter = BloomFilter::new(bitmap, 0, 7).unwrap();

        for name in &names {
            assert!(filter.might_contain(name));
        }
        let false_positives = (50..550)
            .filter(|i| filter.might_contain(&format!("projects/p/databases/(default)/documents/rooms/{i}")))
            .count();
        assert!(false_positives < 50, "too many false positives: {false_positives}");
    }

    #[test]
    fn probe_order_is_stable() {
        let first: Vec<u64> = probe_indexes("doc", 3, 1000).collect();
        let second: Vec<u64> = probe_indexes("doc", 3, 1000).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|index| *index < 1000));
    }
}
