//! Closed hash tables mounted over caller-owned byte regions.
//!
//! A table is a header followed by a flat bucket array (and, for
//! key-sentinel formats, two special buckets). Tables never own the bytes:
//! `S: AsRef<[u8]>` covers heap buffers, borrowed slices and memory maps
//! alike, and `AsMut<[u8]>` is only required for writing.

pub mod capacity;
pub mod chain;
pub mod concurrent;
pub mod cuckoo;
pub mod dense;
pub mod header;

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};

use crate::bucket::{read_bucket, set_special, special_bucket_count, write_bucket, Bucket};
use crate::codec::{HashKey, HashValue};
use crate::compress::BucketCompressor;
use crate::config::HashTableOptions;
use crate::error::Result;
use crate::Error;

pub use chain::ChainHashTable;
pub use concurrent::ReadWriteDenseTable;
pub use cuckoo::CuckooHashTable;
pub use dense::DenseHashTable;
pub use header::{CuckooHeader, DenseHeader, TableHeader};

use capacity::*;

/// Lookup status without the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotFound,
    Ok,
    Deleted,
}

/// Outcome of a lookup. A deleted key still reports the value stored with
/// its tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult<V> {
    NotFound,
    Found(V),
    Deleted(V),
}

impl<V> FindResult<V> {
    pub fn status(&self) -> Status {
        match self {
            FindResult::NotFound => Status::NotFound,
            FindResult::Found(_) => Status::Ok,
            FindResult::Deleted(_) => Status::Deleted,
        }
    }

    pub fn value(self) -> Option<V> {
        match self {
            FindResult::NotFound => None,
            FindResult::Found(v) | FindResult::Deleted(v) => Some(v),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, FindResult::Found(_))
    }
}

/// The read half of a mounted table.
pub trait HashTableReader {
    type Key: HashKey;
    type Value: HashValue;

    fn find(&self, key: Self::Key) -> FindResult<Self::Value>;

    /// Non-empty buckets, tombstones included.
    fn key_count(&self) -> u64;

    fn bucket_count(&self) -> u64;

    fn occupancy_pct(&self) -> u32;

    /// Bytes of the mounted region the table spans.
    fn memory_use(&self) -> u64;
}

/// The write half. Capacity exhaustion is reported as `false` and leaves
/// the table unchanged.
pub trait HashTable: HashTableReader {
    fn insert(&mut self, key: Self::Key, value: Self::Value) -> bool;

    /// Record a tombstone for `key`, whether or not it was present.
    fn delete(&mut self, key: Self::Key, value: Self::Value) -> bool;

    /// Rebuild into the fewest buckets that hold the current keys at
    /// `occupancy_pct` (0 keeps the current target). All or nothing.
    fn shrink(&mut self, occupancy_pct: u32) -> bool;

    /// Grow once into the headroom reserved at mount time.
    fn stretch(&mut self) -> bool;

    fn capacity(&self) -> u64;

    fn is_full(&self) -> bool {
        self.key_count() >= self.capacity()
    }

    fn delete_count(&self) -> u64;

    /// Heap memory held beside the mounted region while building.
    fn build_assistant_memory_use(&self) -> u64;

    /// Rewrite every bucket through `compressor`, returning the new table
    /// size in bytes. The table only answers `find` for the compressed
    /// format afterwards, so it is left unusable.
    fn compress(&mut self, compressor: &dyn BucketCompressor) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountMode {
    Read,
    Write,
    Compressed,
}

/// Which closed hashing scheme a table uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Dense,
    Cuckoo,
}

impl TableKind {
    pub fn default_occupancy(self) -> u32 {
        match self {
            TableKind::Dense => DENSE_DEFAULT_OCCUPANCY,
            TableKind::Cuckoo => CUCKOO_DEFAULT_OCCUPANCY,
        }
    }

    pub fn max_occupancy(self) -> u32 {
        match self {
            TableKind::Dense => DENSE_MAX_OCCUPANCY,
            TableKind::Cuckoo => CUCKOO_MAX_OCCUPANCY,
        }
    }

    /// Occupancy worth using for `pct`: 0 picks the default, and targets
    /// with poor probe behaviour are capped.
    pub fn recommended_occupancy(self, pct: u32) -> u32 {
        if pct == 0 {
            return self.default_occupancy();
        }
        match self {
            TableKind::Dense => pct.min(DENSE_RECOMMENDED_MAX_OCCUPANCY),
            TableKind::Cuckoo => pct.min(CUCKOO_MAX_OCCUPANCY),
        }
    }

    fn effective_pct(self, options: &HashTableOptions) -> u32 {
        if options.occupancy_pct == 0 {
            self.default_occupancy()
        } else {
            options.occupancy_pct.min(self.max_occupancy())
        }
    }

    pub fn capacity_to_table_memory<B: Bucket>(self, capacity: u64, options: &HashTableOptions) -> u64 {
        let pct = self.effective_pct(options);
        match self {
            TableKind::Dense => dense_capacity_to_table_memory::<B>(capacity, pct),
            TableKind::Cuckoo => {
                cuckoo_capacity_to_table_memory::<B>(capacity, pct, options.may_stretch)
            }
        }
    }

    pub fn capacity_to_build_memory<B: Bucket>(self, capacity: u64, options: &HashTableOptions) -> u64 {
        let table = self.capacity_to_table_memory::<B>(capacity, options);
        match self {
            TableKind::Dense => table,
            TableKind::Cuckoo => cuckoo_table_memory_to_build_memory::<B>(table),
        }
    }

    pub fn table_memory_to_capacity<B: Bucket>(self, memory: u64, options: &HashTableOptions) -> u64 {
        let pct = self.effective_pct(options);
        match self {
            TableKind::Dense => dense_table_memory_to_capacity::<B>(memory, pct),
            TableKind::Cuckoo => {
                cuckoo_table_memory_to_capacity::<B>(memory, pct, options.may_stretch)
            }
        }
    }

    pub fn build_memory_to_table_memory<B: Bucket>(self, build_memory: u64) -> u64 {
        match self {
            TableKind::Dense => build_memory,
            TableKind::Cuckoo => cuckoo_build_memory_to_table_memory::<B>(build_memory),
        }
    }

    pub fn build_memory_to_capacity<B: Bucket>(self, build_memory: u64, options: &HashTableOptions) -> u64 {
        let table = self.build_memory_to_table_memory::<B>(build_memory);
        self.table_memory_to_capacity::<B>(table, options)
    }

    pub fn mount_for_write<'a, B, S>(
        self,
        data: S,
        options: &HashTableOptions,
    ) -> Result<Box<dyn HashTable<Key = B::Key, Value = B::Value> + 'a>>
    where
        B: Bucket + 'a,
        S: AsRef<[u8]> + AsMut<[u8]> + 'a,
    {
        Ok(match self {
            TableKind::Dense => Box::new(DenseHashTable::<B, S>::mount_for_write(data, options)?),
            TableKind::Cuckoo => Box::new(CuckooHashTable::<B, S>::mount_for_write(data, options)?),
        })
    }

    pub fn mount_for_read<'a, B, S>(
        self,
        data: S,
    ) -> Result<Box<dyn HashTableReader<Key = B::Key, Value = B::Value> + 'a>>
    where
        B: Bucket + 'a,
        S: AsRef<[u8]> + 'a,
    {
        Ok(match self {
            TableKind::Dense => Box::new(DenseHashTable::<B, S>::mount_for_read(data)?),
            TableKind::Cuckoo => Box::new(CuckooHashTable::<B, S>::mount_for_read(data)?),
        })
    }
}

/// Fixed-size bit set over bucket indexes.
#[derive(Debug, Clone)]
pub(crate) struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    pub(crate) fn new(bits: u64) -> Self {
        Bitmap {
            words: vec![0; ((bits + 63) / 64) as usize],
        }
    }

    #[inline]
    pub(crate) fn get(&self, index: u64) -> bool {
        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    #[inline]
    pub(crate) fn set(&mut self, index: u64) {
        self.words[(index / 64) as usize] |= 1 << (index % 64);
    }
}

/// Bytes spanned by `bucket_count` buckets plus the special buckets. Only
/// for counts already checked by [`table_len`].
pub(crate) fn bucket_region_len<B: Bucket>(bucket_count: u64) -> usize {
    (bucket_count as usize + special_bucket_count::<B>()) * B::SIZE
}

/// Header plus bucket region size for a count read from storage. A count
/// whose size overflows is corruption, not a short region.
pub(crate) fn table_len<B: Bucket>(header_size: usize, bucket_count: u64) -> Result<u64> {
    bucket_count
        .checked_add(special_bucket_count::<B>() as u64)
        .and_then(|buckets| buckets.checked_mul(B::SIZE as u64))
        .and_then(|bytes| bytes.checked_add(header_size as u64))
        .filter(|&len| usize::try_from(len).is_ok())
        .ok_or_else(|| {
            tracing::error!(bucket_count = bucket_count, "Bucket count overflows the table size");
            Error::IndexCorruption(format!("bucket count {} overflows the table size", bucket_count))
        })
}

pub(crate) fn check_region<B: Bucket>(
    actual: usize,
    header_size: usize,
    bucket_count: u64,
) -> Result<()> {
    let needed = table_len::<B>(header_size, bucket_count)?;
    if (actual as u64) < needed {
        tracing::error!(
            needed = needed,
            actual = actual,
            bucket_count = bucket_count,
            "Mounted region is smaller than the table it holds"
        );
        return Err(Error::BufferTooSmall {
            needed,
            actual: actual as u64,
        });
    }
    Ok(())
}

/// Occupancy implied by a persisted header.
pub(crate) fn header_occupancy(key_count: u64, bucket_count: u64) -> u32 {
    (key_count.saturating_mul(100) / bucket_count.max(1)).clamp(1, u32::MAX as u64) as u32
}

pub(crate) fn to_find_result<B: Bucket>(bucket: &B) -> FindResult<B::Value> {
    if bucket.is_empty() {
        FindResult::NotFound
    } else if bucket.is_deleted() {
        FindResult::Deleted(bucket.value())
    } else {
        FindResult::Found(bucket.value())
    }
}

/// State of a bucket before a write overwrote it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteOutcome {
    is_new: bool,
    was_deleted: bool,
}

impl WriteOutcome {
    /// Fold this write into the key and tombstone counters.
    pub(crate) fn apply(&self, deleted: bool, key_count: &mut u64, delete_count: &mut u64) {
        if self.is_new {
            *key_count += 1;
            if deleted {
                *delete_count += 1;
            }
        } else if deleted && !self.was_deleted {
            *delete_count += 1;
        } else if !deleted && self.was_deleted {
            *delete_count = delete_count.saturating_sub(1);
        }
    }
}

/// Store `key`/`value` into bucket `index`. Returns `None`, leaving the
/// bucket untouched, when the value collides with a value sentinel.
pub(crate) fn write_entry<B: Bucket>(
    data: &mut [u8],
    base: usize,
    index: u64,
    key: B::Key,
    value: B::Value,
    special: bool,
    deleted: bool,
) -> Option<WriteOutcome> {
    let mut bucket: B = read_bucket(data, base, index);
    let outcome = WriteOutcome {
        is_new: bucket.is_empty(),
        was_deleted: bucket.is_deleted(),
    };
    if special {
        set_special(&mut bucket, value, deleted);
    } else if deleted {
        bucket.set_delete(key, value);
    } else {
        bucket.set(key, value);
    }
    if bucket.is_empty() || bucket.is_deleted() != deleted {
        return None;
    }
    write_bucket(data, base, index, &bucket);
    Some(outcome)
}

pub(crate) fn count_deleted<B: Bucket>(data: &[u8], base: usize, bucket_count: u64) -> u64 {
    let total = bucket_count + special_bucket_count::<B>() as u64;
    (0..total)
        .filter(|&i| read_bucket::<B>(data, base, i).is_deleted())
        .count() as u64
}

pub(crate) fn save_specials<B: Bucket>(data: &[u8], base: usize, bucket_count: u64) -> Vec<B> {
    (0..special_bucket_count::<B>() as u64)
        .map(|slot| read_bucket(data, base, bucket_count + slot))
        .collect()
}

pub(crate) fn restore_specials<B: Bucket>(data: &mut [u8], base: usize, bucket_count: u64, specials: &[B]) {
    for (slot, bucket) in specials.iter().enumerate() {
        write_bucket(data, base, bucket_count + slot as u64, bucket);
    }
}

/// Compress `count` buckets in place. Every bucket is validated before
/// the first byte is rewritten, so a failure leaves the region intact.
pub(crate) fn compress_region(
    data: &mut [u8],
    base: usize,
    bucket_size: usize,
    count: u64,
    compressor: &dyn BucketCompressor,
) -> Result<u64> {
    let compressed_size = compressor.compressed_size(bucket_size);
    if compressed_size > bucket_size {
        return Err(Error::InvalidOperation(format!(
            "compressor grows buckets from {} to {} bytes",
            bucket_size, compressed_size
        )));
    }

    let mut scratch = vec![0u8; compressed_size];
    for i in 0..count as usize {
        let start = base + i * bucket_size;
        compressor.compress(&data[start..start + bucket_size], &mut scratch)?;
    }

    let mut input = vec![0u8; bucket_size];
    for i in 0..count as usize {
        let start = base + i * bucket_size;
        input.copy_from_slice(&data[start..start + bucket_size]);
        let out = base + i * compressed_size;
        compressor.compress(&input, &mut data[out..out + compressed_size])?;
    }
    Ok(count * compressed_size as u64)
}

/// Render every non-empty bucket, special buckets last.
pub(crate) fn dump_buckets<B: Bucket>(data: &[u8], base: usize, bucket_count: u64) -> String {
    let total = bucket_count + special_bucket_count::<B>() as u64;
    let lines = (0..total)
        .map(|i| (i, read_bucket::<B>(data, base, i)))
        .filter(|(_, bucket)| !bucket.is_empty())
        .map(|(i, bucket)| {
            let key = if i >= bucket_count {
                B::special_key((i - bucket_count) as usize)
            } else {
                bucket.key()
            };
            format!(
                "[{}] key={:?} value={:?}{}",
                i,
                key,
                bucket.value(),
                if bucket.is_deleted() { " deleted" } else { "" }
            )
        })
        .join("\n");
    if lines.is_empty() {
        lines
    } else {
        lines + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{SpecialKeyBucket, SpecialValueBucket};
    use crate::codec::{OffsetValue, SpecialValue};

    type KeyBucket = SpecialKeyBucket<u64, u32>;
    type ValueBucket = SpecialValueBucket<u64, OffsetValue<u32>>;

    #[test]
    fn test_find_result_status() {
        assert_eq!(FindResult::<u32>::NotFound.status(), Status::NotFound);
        assert_eq!(FindResult::Found(3u32).status(), Status::Ok);
        assert_eq!(FindResult::Deleted(0u32).value(), Some(0));
        assert!(!FindResult::Deleted(0u32).is_found());
    }

    #[test]
    fn test_bitmap() {
        let mut bitmap = Bitmap::new(130);
        assert!(!bitmap.get(129));
        bitmap.set(129);
        bitmap.set(0);
        assert!(bitmap.get(129));
        assert!(bitmap.get(0));
        assert!(!bitmap.get(64));
    }

    #[test]
    fn test_write_outcome_counters() {
        let mut data = vec![0u8; 4 * KeyBucket::SIZE];
        crate::bucket::fill_empty::<KeyBucket>(&mut data, 0, 0, 4);
        let (mut keys, mut deletes) = (0, 0);

        let out = write_entry::<KeyBucket>(&mut data, 0, 1, 5, 50, false, true).unwrap();
        out.apply(true, &mut keys, &mut deletes);
        assert_eq!((keys, deletes), (1, 1));

        let out = write_entry::<KeyBucket>(&mut data, 0, 1, 5, 51, false, false).unwrap();
        out.apply(false, &mut keys, &mut deletes);
        assert_eq!((keys, deletes), (1, 0));

        let out = write_entry::<KeyBucket>(&mut data, 0, 1, 5, 0, false, true).unwrap();
        out.apply(true, &mut keys, &mut deletes);
        let out = write_entry::<KeyBucket>(&mut data, 0, 1, 5, 0, false, true).unwrap();
        out.apply(true, &mut keys, &mut deletes);
        assert_eq!((keys, deletes), (1, 1), "double delete counts once");
    }

    #[test]
    fn test_sentinel_value_is_rejected() {
        let mut data = vec![0u8; 2 * ValueBucket::SIZE];
        crate::bucket::fill_empty::<ValueBucket>(&mut data, 0, 0, 2);
        assert!(write_entry::<ValueBucket>(&mut data, 0, 0, 1, OffsetValue::empty(), false, false).is_none());
        assert!(read_bucket::<ValueBucket>(&data, 0, 0).is_empty());
    }

    #[test]
    fn test_table_kind_capacity_dispatch() {
        let options = HashTableOptions::default();
        let dense = TableKind::Dense.capacity_to_table_memory::<KeyBucket>(100, &options);
        assert_eq!(dense, 16 + (200 + 2) * 13);
        assert_eq!(TableKind::Dense.table_memory_to_capacity::<KeyBucket>(dense, &options), 100);

        let cuckoo = TableKind::Cuckoo.capacity_to_build_memory::<KeyBucket>(100, &options);
        assert!(TableKind::Cuckoo.build_memory_to_capacity::<KeyBucket>(cuckoo, &options) >= 100);
    }

    #[test]
    fn test_recommended_occupancy() {
        assert_eq!(TableKind::Dense.recommended_occupancy(0), 50);
        assert_eq!(TableKind::Dense.recommended_occupancy(95), 80);
        assert_eq!(TableKind::Cuckoo.recommended_occupancy(0), 80);
        assert_eq!(TableKind::Cuckoo.recommended_occupancy(99), 97);
    }

    #[test]
    fn test_mount_through_kind() {
        let options = HashTableOptions::default();
        for kind in [TableKind::Dense, TableKind::Cuckoo] {
            let size = kind.capacity_to_table_memory::<KeyBucket>(32, &options) as usize;
            let mut buf = vec![0u8; size];
            {
                let mut table = kind
                    .mount_for_write::<KeyBucket, _>(&mut buf[..], &options)
                    .expect("Failed to mount for write");
                for key in 0..32u64 {
                    assert!(table.insert(key, key as u32 * 2), "{:?} insert {}", kind, key);
                }
                assert!(table.delete(7, 0));
            }
            let table = kind
                .mount_for_read::<KeyBucket, _>(&buf[..])
                .expect("Failed to mount for read");
            assert_eq!(table.key_count(), 32);
            assert_eq!(table.find(3), FindResult::Found(6));
            assert_eq!(table.find(7), FindResult::Deleted(0));
            assert_eq!(table.find(99), FindResult::NotFound);
        }
    }

    #[test]
    fn test_compress_region_is_all_or_nothing() {
        use crate::compress::OffsetBucketCompressor;
        type Wide = SpecialValueBucket<u64, OffsetValue<u64>>;

        let mut data = vec![0u8; 3 * Wide::SIZE];
        crate::bucket::fill_empty::<Wide>(&mut data, 0, 0, 3);
        let mut bucket = Wide::empty();
        bucket.set(1, OffsetValue::new(1 << 40));
        write_bucket(&mut data, 0, 2, &bucket);
        let before = data.clone();

        let compressor = OffsetBucketCompressor::new::<Wide>(2).unwrap();
        assert!(compress_region(&mut data, 0, Wide::SIZE, 3, &compressor).is_err());
        assert_eq!(data, before);
    }
}
