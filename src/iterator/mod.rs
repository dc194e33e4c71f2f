//! Sequential access to closed hash tables.
//!
//! [`ClosedHashTableIterator`] walks a mounted bucket array in memory.
//! The two file iterators read a persisted table through a [`FileReader`]:
//! the buffered one streams buckets with constant memory and cannot sort,
//! the materializing one loads every non-empty bucket so it can sort by
//! key or by value.
//!
//! [`FileReader`]: crate::io::FileReader

pub mod buffered;
pub mod file;
pub mod memory;

use std::cmp::Ordering;

use crate::codec::{HashKey, HashValue};
use crate::error::Result;

pub use buffered::ClosedHashTableBufferedFileIterator;
pub use file::ClosedHashTableFileIterator;
pub use memory::ClosedHashTableIterator;

/// Default read buffer of the buffered file iterator.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// One non-empty bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
    pub deleted: bool,
}

pub fn compare_by_key<K: Ord, V>(a: &Entry<K, V>, b: &Entry<K, V>) -> Ordering {
    a.key.cmp(&b.key)
}

/// Value order used by merge writers: every tombstone first, ordered by
/// key, then live entries by value with ties broken by key.
pub fn compare_by_value<K: Ord, V: Ord>(a: &Entry<K, V>, b: &Entry<K, V>) -> Ordering {
    match (a.deleted, b.deleted) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => a.key.cmp(&b.key),
        (false, false) => a.value.cmp(&b.value).then_with(|| a.key.cmp(&b.key)),
    }
}

/// Cursor over a persisted table.
pub trait HashTableFileIterator {
    type Key: HashKey;
    type Value: HashValue;

    fn is_valid(&self) -> bool;

    fn move_to_next(&mut self) -> Result<()>;

    fn key(&self) -> Self::Key;

    fn value(&self) -> Self::Value;

    fn is_deleted(&self) -> bool;

    fn sort_by_key(&mut self) -> Result<()>;

    fn sort_by_value(&mut self) -> Result<()>;

    /// Position the cursor at an offset previously returned by `offset`.
    fn seek(&mut self, offset: u64) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn offset(&self) -> u64;

    /// Key count recorded in the table header.
    fn key_count(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: u64, value: u32, deleted: bool) -> Entry<u64, u32> {
        Entry {
            key,
            value,
            deleted,
        }
    }

    #[test]
    fn test_value_order_puts_tombstones_first() {
        let mut entries = vec![
            entry(1, 5, false),
            entry(9, 0, true),
            entry(2, 3, false),
            entry(4, 7, true),
            entry(0, 5, false),
        ];
        entries.sort_by(compare_by_value);
        assert_eq!(
            entries,
            vec![
                entry(4, 7, true),
                entry(9, 0, true),
                entry(2, 3, false),
                entry(0, 5, false),
                entry(1, 5, false),
            ]
        );
    }

    #[test]
    fn test_key_order() {
        let mut entries = vec![entry(3, 0, false), entry(1, 0, true), entry(2, 0, false)];
        entries.sort_by(compare_by_key);
        let keys: Vec<u64> = entries.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_value_order_law_on_random_entries() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut entries: Vec<Entry<u64, u32>> = (0..500)
            .map(|_| entry(rng.gen_range(0..100), rng.gen_range(0..10), rng.gen_bool(0.3)))
            .collect();
        entries.sort_by(compare_by_value);

        for pair in entries.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(!(!a.deleted && b.deleted), "tombstone after a live entry");
            if a.deleted == b.deleted && (a.deleted || a.value == b.value) {
                assert!(a.key <= b.key);
            }
        }
    }
}
