//! Bucket formats.
//!
//! A bucket is a fixed-size cell holding one key, one value and a state
//! that is one of empty, live or deleted. Two families share one contract:
//!
//! - [`SpecialKeyBucket`] marks empty cells with the reserved `EMPTY_KEY`
//!   and keeps a one-byte tombstone tag. User keys equal to `EMPTY_KEY` or
//!   `DELETE_KEY` never enter the main array; tables park them in two
//!   out-of-band *special buckets* placed right after it.
//! - [`SpecialValueBucket`] lets the value sentinels carry the state, so
//!   every key is storable in place and no special buckets exist.
//!
//! ```text
//! SpecialKeyBucket<K, V>     +-------+---------+--------+
//!                            | key K | value V | tag u8 |
//!                            +-------+---------+--------+
//! SpecialValueBucket<K, V>   +-------+---------+
//!                            | key K | value V |
//!                            +-------+---------+
//! ```
//!
//! The tag byte is a deliberate format choice: a pure two-sentinel-key
//! layout would overwrite the key with `DELETE_KEY` on delete, while the
//! tag lets a tombstone keep its key and value so lookups can report
//! `Deleted(value)`. Images written with the tag are not readable by a
//! tagless reader and vice versa.

use std::fmt::Debug;

use crate::codec::{FixedCodec, HashKey, HashValue, OffsetValue, ShortOffset, SpecialValue};

/// Number of out-of-band buckets kept by key-sentinel tables.
pub const SPECIAL_BUCKET_COUNT: usize = 2;

const TAG_LIVE: u8 = 0;
const TAG_DELETED: u8 = 1;

/// The capability set placement and probing algorithms need from a cell.
pub trait Bucket: Copy + Debug {
    type Key: HashKey;
    type Value: HashValue;

    /// Encoded size in bytes.
    const SIZE: usize;
    /// Byte position of the value inside the encoded bucket.
    const VALUE_OFFSET: usize;
    /// Whether the format reserves key values and therefore needs special
    /// buckets.
    const HAS_SPECIAL_KEY: bool;

    fn empty() -> Self;

    fn decode(buf: &[u8]) -> Self;

    fn encode(&self, buf: &mut [u8]);

    fn is_empty(&self) -> bool;

    fn is_deleted(&self) -> bool;

    /// True on an exact key match, deleted or not.
    fn is_equal(&self, key: Self::Key) -> bool;

    fn key(&self) -> Self::Key;

    fn value(&self) -> Self::Value;

    fn set(&mut self, key: Self::Key, value: Self::Value);

    fn set_delete(&mut self, key: Self::Key, value: Self::Value);

    fn set_empty(&mut self);

    /// Index of the special bucket that stores `key`, if `key` is reserved.
    fn special_slot(key: Self::Key) -> Option<usize> {
        if !Self::HAS_SPECIAL_KEY {
            None
        } else if key == <Self::Key as HashKey>::EMPTY_KEY {
            Some(0)
        } else if key == <Self::Key as HashKey>::DELETE_KEY {
            Some(1)
        } else {
            None
        }
    }

    /// The user key a special bucket stands for.
    fn special_key(slot: usize) -> Self::Key {
        debug_assert!(slot < SPECIAL_BUCKET_COUNT);
        if slot == 0 {
            <Self::Key as HashKey>::EMPTY_KEY
        } else {
            <Self::Key as HashKey>::DELETE_KEY
        }
    }
}

/// Number of special buckets that follow the main array for format `B`.
pub fn special_bucket_count<B: Bucket>() -> usize {
    if B::HAS_SPECIAL_KEY {
        SPECIAL_BUCKET_COUNT
    } else {
        0
    }
}

/// Write a live or deleted entry into a special bucket. The key field only
/// has to differ from `EMPTY_KEY`; the slot index identifies the user key.
pub(crate) fn set_special<B: Bucket>(bucket: &mut B, value: B::Value, deleted: bool) {
    if deleted {
        bucket.set_delete(<B::Key as HashKey>::DELETE_KEY, value);
    } else {
        bucket.set(<B::Key as HashKey>::DELETE_KEY, value);
    }
}

/// Bucket whose empty state is the `EMPTY_KEY` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialKeyBucket<K: HashKey, V: HashValue> {
    key: K,
    value: V,
    deleted: bool,
}

impl<K: HashKey, V: HashValue> Default for SpecialKeyBucket<K, V> {
    fn default() -> Self {
        Self {
            key: K::EMPTY_KEY,
            value: V::default(),
            deleted: false,
        }
    }
}

impl<K: HashKey, V: HashValue> Bucket for SpecialKeyBucket<K, V> {
    type Key = K;
    type Value = V;

    const SIZE: usize = K::SIZE + V::SIZE + 1;
    const VALUE_OFFSET: usize = K::SIZE;
    const HAS_SPECIAL_KEY: bool = true;

    fn empty() -> Self {
        Self::default()
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            key: K::decode(buf),
            value: V::decode(&buf[K::SIZE..]),
            deleted: buf[K::SIZE + V::SIZE] == TAG_DELETED,
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        self.key.encode(buf);
        self.value.encode(&mut buf[K::SIZE..]);
        buf[K::SIZE + V::SIZE] = if self.deleted { TAG_DELETED } else { TAG_LIVE };
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.key == K::EMPTY_KEY
    }

    #[inline]
    fn is_deleted(&self) -> bool {
        !self.is_empty() && self.deleted
    }

    #[inline]
    fn is_equal(&self, key: K) -> bool {
        self.key == key
    }

    fn key(&self) -> K {
        self.key
    }

    fn value(&self) -> V {
        self.value
    }

    fn set(&mut self, key: K, value: V) {
        self.key = key;
        self.value = value;
        self.deleted = false;
    }

    fn set_delete(&mut self, key: K, value: V) {
        self.key = key;
        self.value = value;
        self.deleted = true;
    }

    fn set_empty(&mut self) {
        *self = Self::default();
    }
}

/// Bucket whose state lives in the value's empty/delete sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialValueBucket<K: HashKey, V: SpecialValue> {
    key: K,
    value: V,
}

impl<K: HashKey, V: SpecialValue> Default for SpecialValueBucket<K, V> {
    fn default() -> Self {
        Self {
            key: K::default(),
            value: V::empty(),
        }
    }
}

impl<K: HashKey, V: SpecialValue> Bucket for SpecialValueBucket<K, V> {
    type Key = K;
    type Value = V;

    const SIZE: usize = K::SIZE + V::SIZE;
    const VALUE_OFFSET: usize = K::SIZE;
    const HAS_SPECIAL_KEY: bool = false;

    fn empty() -> Self {
        Self::default()
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            key: K::decode(buf),
            value: V::decode(&buf[K::SIZE..]),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        self.key.encode(buf);
        self.value.encode(&mut buf[K::SIZE..]);
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    #[inline]
    fn is_deleted(&self) -> bool {
        self.value.is_deleted()
    }

    #[inline]
    fn is_equal(&self, key: K) -> bool {
        self.key == key
    }

    fn key(&self) -> K {
        self.key
    }

    fn value(&self) -> V {
        self.value
    }

    /// A `value` equal to one of the sentinels leaves the bucket empty or
    /// deleted; tables check the resulting state before committing.
    fn set(&mut self, key: K, value: V) {
        self.key = key;
        self.value = value;
    }

    fn set_delete(&mut self, key: K, value: V) {
        self.key = key;
        self.value = value.deleted();
    }

    fn set_empty(&mut self) {
        *self = Self::default();
    }
}

/// Offset bucket narrowed to [`ShortOffset`] by an offset compressor. Never
/// produced by insertion, only by compressing a finished table.
pub type CompactBucket<K> = SpecialValueBucket<K, OffsetValue<ShortOffset>>;

/// Decode bucket `index` of an array that starts at `base`.
#[inline]
pub(crate) fn read_bucket<B: Bucket>(data: &[u8], base: usize, index: u64) -> B {
    let start = base + index as usize * B::SIZE;
    B::decode(&data[start..start + B::SIZE])
}

#[inline]
pub(crate) fn write_bucket<B: Bucket>(data: &mut [u8], base: usize, index: u64, bucket: &B) {
    let start = base + index as usize * B::SIZE;
    bucket.encode(&mut data[start..start + B::SIZE]);
}

/// Fill `count` consecutive buckets starting at `index` with the empty cell.
pub(crate) fn fill_empty<B: Bucket>(data: &mut [u8], base: usize, index: u64, count: u64) {
    let mut cell = vec![0u8; B::SIZE];
    B::empty().encode(&mut cell);
    let start = base + index as usize * B::SIZE;
    let end = start + count as usize * B::SIZE;
    for chunk in data[start..end].chunks_exact_mut(B::SIZE) {
        chunk.copy_from_slice(&cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TimestampValue;

    type KeyBucket = SpecialKeyBucket<u64, u32>;
    type OffsetBucket = SpecialValueBucket<u64, OffsetValue<u64>>;

    #[test]
    fn test_special_key_bucket_states() {
        let mut bucket = KeyBucket::empty();
        assert!(bucket.is_empty());
        assert!(!bucket.is_deleted());

        bucket.set(7, 70);
        assert!(!bucket.is_empty());
        assert!(!bucket.is_deleted());
        assert!(bucket.is_equal(7));
        assert_eq!(bucket.value(), 70);

        bucket.set_delete(7, 0);
        assert!(bucket.is_deleted());
        assert!(bucket.is_equal(7), "deleted bucket still owns its key");
        assert_eq!(bucket.value(), 0);

        bucket.set_empty();
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_special_key_bucket_encoding() {
        assert_eq!(KeyBucket::SIZE, 13);
        let mut bucket = KeyBucket::empty();
        bucket.set_delete(0xABCD, 5);

        let mut buf = vec![0u8; KeyBucket::SIZE];
        bucket.encode(&mut buf);
        assert_eq!(buf[12], 1);
        assert_eq!(KeyBucket::decode(&buf), bucket);
    }

    #[test]
    fn test_special_slots() {
        assert_eq!(KeyBucket::special_slot(u64::MAX), Some(0));
        assert_eq!(KeyBucket::special_slot(u64::MAX - 1), Some(1));
        assert_eq!(KeyBucket::special_slot(3), None);
        assert_eq!(KeyBucket::special_key(1), u64::MAX - 1);

        assert_eq!(OffsetBucket::special_slot(u64::MAX), None);
        assert_eq!(special_bucket_count::<KeyBucket>(), 2);
        assert_eq!(special_bucket_count::<OffsetBucket>(), 0);
    }

    #[test]
    fn test_special_value_bucket_states() {
        let mut bucket = OffsetBucket::empty();
        assert!(bucket.is_empty());

        bucket.set(u64::MAX, OffsetValue::new(128));
        assert!(!bucket.is_empty());
        assert!(bucket.is_equal(u64::MAX), "all keys are storable in place");

        bucket.set_delete(u64::MAX, OffsetValue::new(128));
        assert!(bucket.is_deleted());
        assert!(bucket.is_equal(u64::MAX));
        assert_eq!(bucket.value().offset(), u64::MAX - 1);
    }

    #[test]
    fn test_timestamp_bucket_tombstone_keeps_timestamp() {
        let mut bucket = SpecialValueBucket::<u64, TimestampValue<u32>>::empty();
        bucket.set_delete(5, TimestampValue::new(1234, 9));
        assert!(bucket.is_deleted());
        assert_eq!(bucket.value().timestamp(), 1234);
    }

    #[test]
    fn test_fill_and_rw_helpers() {
        let base = 3;
        let mut data = vec![0u8; base + 4 * OffsetBucket::SIZE];
        fill_empty::<OffsetBucket>(&mut data, base, 0, 4);
        for i in 0..4 {
            assert!(read_bucket::<OffsetBucket>(&data, base, i).is_empty());
        }

        let mut bucket = OffsetBucket::empty();
        bucket.set(11, OffsetValue::new(1));
        write_bucket(&mut data, base, 2, &bucket);
        assert_eq!(read_bucket::<OffsetBucket>(&data, base, 2), bucket);
        assert!(read_bucket::<OffsetBucket>(&data, base, 1).is_empty());
    }
}
