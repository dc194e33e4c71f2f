//! Open addressing with linear probing.
//!
//! ```text
//! +-------------+----------------------------+----------------------+
//! | DenseHeader | Bucket * bucket_count      | special buckets (0/2)|
//! +-------------+----------------------------+----------------------+
//! ```
//!
//! Probing starts at `key % bucket_count` and advances one bucket at a
//! time. Deleted buckets keep their key, so a probe stops either at an
//! empty bucket or at the key's own bucket, and re-inserting a deleted key
//! reuses its slot.

use std::marker::PhantomData;

use crate::bucket::{fill_empty, read_bucket, special_bucket_count, write_bucket, Bucket};
use crate::codec::Word;
use crate::compress::BucketCompressor;
use crate::config::HashTableOptions;
use crate::error::Result;
use crate::iterator::ClosedHashTableIterator;
use crate::table::capacity::{
    bucket_count_to_capacity, dense_bucket_count, dense_memory_to_bucket_count,
    dense_table_memory, DENSE_DEFAULT_OCCUPANCY, DENSE_MAX_OCCUPANCY,
};
use crate::table::header::{DenseHeader, TableHeader};
use crate::table::{
    bucket_region_len, check_region, compress_region, count_deleted, dump_buckets, header_occupancy,
    restore_specials, save_specials, to_find_result, write_entry, Bitmap, FindResult, HashTable,
    HashTableReader, MountMode,
};
use crate::Error;

const BASE: usize = DenseHeader::SIZE;

pub struct DenseHashTable<B: Bucket, S> {
    data: S,
    header: DenseHeader,
    occupancy_pct: u32,
    delete_count: u64,
    mode: MountMode,
    _bucket: PhantomData<B>,
}

impl<B: Bucket, S: AsRef<[u8]>> DenseHashTable<B, S> {
    /// Mount an existing table read-only. The delete count is not
    /// persisted, so a read mount reports zero.
    pub fn mount_for_read(data: S) -> Result<Self> {
        let header = DenseHeader::decode(data.as_ref()).map_err(|e| {
            tracing::error!(size = data.as_ref().len(), "Failed to decode dense header: {}", e);
            e
        })?;
        if header.bucket_count == 0 {
            return Err(Error::IndexCorruption("dense table with no buckets".into()));
        }
        check_region::<B>(data.as_ref().len(), BASE, header.bucket_count)?;

        Ok(DenseHashTable {
            occupancy_pct: header_occupancy(header.key_count, header.bucket_count),
            data,
            header,
            delete_count: 0,
            mode: MountMode::Read,
            _bucket: PhantomData,
        })
    }

    pub fn header(&self) -> &DenseHeader {
        &self.header
    }

    #[inline]
    fn bucket(&self, index: u64) -> B {
        read_bucket(self.data.as_ref(), BASE, index)
    }

    /// Probe for `key`, stopping at the first empty bucket.
    fn find_bucket(&self, key: B::Key) -> FindResult<B::Value> {
        let bucket_count = self.header.bucket_count;
        if let Some(slot) = B::special_slot(key) {
            return to_find_result(&self.bucket(bucket_count + slot as u64));
        }

        let mut index = key.to_u64() % bucket_count;
        for _ in 0..bucket_count {
            let bucket = self.bucket(index);
            if bucket.is_empty() {
                return FindResult::NotFound;
            }
            if bucket.is_equal(key) {
                return to_find_result(&bucket);
            }
            index += 1;
            if index == bucket_count {
                index = 0;
            }
        }
        FindResult::NotFound
    }

    /// Index of the bucket `key` owns or would own, if any is reachable.
    fn find_bucket_for_write(&self, key: B::Key) -> Option<u64> {
        let bucket_count = self.header.bucket_count;
        let mut index = key.to_u64() % bucket_count;
        for _ in 0..bucket_count {
            let bucket = self.bucket(index);
            if bucket.is_empty() || bucket.is_equal(key) {
                return Some(index);
            }
            index += 1;
            if index == bucket_count {
                index = 0;
            }
        }
        None
    }

    fn region(&self) -> &[u8] {
        let len = bucket_region_len::<B>(self.header.bucket_count);
        &self.data.as_ref()[BASE..BASE + len]
    }

    /// Cursor over the bucket array, special buckets last.
    pub fn iter(&self) -> ClosedHashTableIterator<B, &[u8]> {
        ClosedHashTableIterator::new(self.region(), self.header.bucket_count)
    }

    /// Human-readable listing of every non-empty bucket.
    pub fn dump(&self) -> String {
        dump_buckets::<B>(self.data.as_ref(), BASE, self.header.bucket_count)
    }

    pub fn into_inner(self) -> S {
        self.data
    }
}

impl<B: Bucket, S: AsRef<[u8]> + AsMut<[u8]>> DenseHashTable<B, S> {
    /// Mount over `data` for building. Every bucket is reset to empty.
    pub fn mount_for_write(mut data: S, options: &HashTableOptions) -> Result<Self> {
        let occupancy_pct = options.resolve_occupancy(DENSE_DEFAULT_OCCUPANCY, DENSE_MAX_OCCUPANCY)?;
        let size = data.as_ref().len();
        let bucket_count = dense_memory_to_bucket_count::<B>(size as u64);
        if bucket_count == 0 {
            let needed = dense_table_memory::<B>(1);
            tracing::error!(needed = needed, actual = size, "Region too small for a dense table");
            return Err(Error::BufferTooSmall {
                needed,
                actual: size as u64,
            });
        }

        let header = DenseHeader {
            bucket_count,
            key_count: 0,
        };
        let bytes = data.as_mut();
        fill_empty::<B>(bytes, BASE, 0, bucket_count + special_bucket_count::<B>() as u64);
        header.encode(bytes);

        tracing::debug!(
            bucket_count = bucket_count,
            occupancy_pct = occupancy_pct,
            "Mounted dense table for write"
        );

        Ok(DenseHashTable {
            data,
            header,
            occupancy_pct,
            delete_count: 0,
            mode: MountMode::Write,
            _bucket: PhantomData,
        })
    }

    /// Cursor that may reorder the bucket array. Sorting destroys the probe
    /// layout, so the table must not serve lookups afterwards.
    pub fn iter_mut(&mut self) -> ClosedHashTableIterator<B, &mut [u8]> {
        let len = bucket_region_len::<B>(self.header.bucket_count);
        let bucket_count = self.header.bucket_count;
        ClosedHashTableIterator::new(&mut self.data.as_mut()[BASE..BASE + len], bucket_count)
    }

    fn sync_header(&mut self) {
        self.header.encode(self.data.as_mut());
    }

    fn upsert(&mut self, key: B::Key, value: B::Value, deleted: bool) -> bool {
        if self.mode != MountMode::Write {
            debug_assert!(false, "write to a table not mounted for write");
            return false;
        }

        let special = B::special_slot(key);
        let index = match special {
            Some(slot) => self.header.bucket_count + slot as u64,
            None => match self.find_bucket_for_write(key) {
                Some(index) => index,
                None => {
                    tracing::warn!(
                        bucket_count = self.header.bucket_count,
                        key_count = self.header.key_count,
                        "Dense table is full"
                    );
                    return false;
                }
            },
        };

        let outcome = match write_entry::<B>(
            self.data.as_mut(),
            BASE,
            index,
            key,
            value,
            special.is_some(),
            deleted,
        ) {
            Some(outcome) => outcome,
            None => {
                tracing::warn!(key = ?key, "Value collides with a bucket sentinel");
                return false;
            }
        };
        outcome.apply(deleted, &mut self.header.key_count, &mut self.delete_count);
        self.sync_header();
        true
    }

    /// Move `bucket` into `[0, bucket_count)`, displacing any bucket that
    /// has not been placed yet and carrying it along the chain.
    fn eviction_insert(&mut self, mut bucket: B, bucket_count: u64, placed: &mut Bitmap) -> bool {
        loop {
            let mut index = bucket.key().to_u64() % bucket_count;
            let mut probes = 0;
            while placed.get(index) {
                probes += 1;
                if probes == bucket_count {
                    return false;
                }
                index += 1;
                if index == bucket_count {
                    index = 0;
                }
            }
            let displaced: B = self.bucket(index);
            write_bucket(self.data.as_mut(), BASE, index, &bucket);
            placed.set(index);
            if displaced.is_empty() {
                return true;
            }
            bucket = displaced;
        }
    }

    /// In-place rebuild into `new_count` buckets.
    fn rebuild(&mut self, new_count: u64) -> bool {
        let old_count = self.header.bucket_count;
        let mut placed = Bitmap::new(new_count);

        for index in 0..new_count {
            if placed.get(index) {
                continue;
            }
            let bucket: B = self.bucket(index);
            if bucket.is_empty() {
                continue;
            }
            write_bucket(self.data.as_mut(), BASE, index, &B::empty());
            if !self.eviction_insert(bucket, new_count, &mut placed) {
                return false;
            }
        }

        for index in new_count..old_count {
            let bucket: B = self.bucket(index);
            if bucket.is_empty() {
                continue;
            }
            if !self.eviction_insert(bucket, new_count, &mut placed) {
                return false;
            }
        }
        true
    }
}

impl<B: Bucket, S: AsRef<[u8]>> HashTableReader for DenseHashTable<B, S> {
    type Key = B::Key;
    type Value = B::Value;

    fn find(&self, key: B::Key) -> FindResult<B::Value> {
        if self.mode == MountMode::Compressed {
            debug_assert!(false, "lookup in a compressed table");
            return FindResult::NotFound;
        }
        self.find_bucket(key)
    }

    fn key_count(&self) -> u64 {
        self.header.key_count
    }

    fn bucket_count(&self) -> u64 {
        self.header.bucket_count
    }

    fn occupancy_pct(&self) -> u32 {
        self.occupancy_pct
    }

    fn memory_use(&self) -> u64 {
        dense_table_memory::<B>(self.header.bucket_count)
    }
}

impl<B: Bucket, S: AsRef<[u8]> + AsMut<[u8]>> HashTable for DenseHashTable<B, S> {
    fn insert(&mut self, key: B::Key, value: B::Value) -> bool {
        self.upsert(key, value, false)
    }

    fn delete(&mut self, key: B::Key, value: B::Value) -> bool {
        self.upsert(key, value, true)
    }

    fn shrink(&mut self, occupancy_pct: u32) -> bool {
        if self.mode != MountMode::Write {
            return false;
        }
        let pct = if occupancy_pct == 0 {
            self.occupancy_pct
        } else {
            occupancy_pct
        };
        if pct > DENSE_MAX_OCCUPANCY {
            tracing::warn!(occupancy_pct = pct, "Shrink target out of range");
            return false;
        }

        let old_count = self.header.bucket_count;
        let new_count = dense_bucket_count(self.header.key_count, pct);
        if new_count >= old_count {
            tracing::debug!(
                bucket_count = old_count,
                target = new_count,
                "Shrink is a no-op"
            );
            return true;
        }

        let snapshot_len = BASE + bucket_region_len::<B>(old_count);
        let snapshot = self.data.as_ref()[..snapshot_len].to_vec();
        let specials = save_specials::<B>(self.data.as_ref(), BASE, old_count);

        if !self.rebuild(new_count) {
            self.data.as_mut()[..snapshot_len].copy_from_slice(&snapshot);
            tracing::warn!(
                bucket_count = old_count,
                target = new_count,
                key_count = self.header.key_count,
                "Dense shrink failed, rolled back"
            );
            return false;
        }

        restore_specials(self.data.as_mut(), BASE, new_count, &specials);
        self.header.bucket_count = new_count;
        self.sync_header();
        self.delete_count = count_deleted::<B>(self.data.as_ref(), BASE, new_count);
        self.occupancy_pct = pct;

        tracing::debug!(
            from = old_count,
            to = new_count,
            key_count = self.header.key_count,
            "Shrunk dense table"
        );
        true
    }

    fn stretch(&mut self) -> bool {
        tracing::debug!("Dense tables reserve no stretch space");
        false
    }

    fn capacity(&self) -> u64 {
        bucket_count_to_capacity(self.header.bucket_count, self.occupancy_pct)
    }

    fn delete_count(&self) -> u64 {
        self.delete_count
    }

    fn build_assistant_memory_use(&self) -> u64 {
        0
    }

    fn compress(&mut self, compressor: &dyn BucketCompressor) -> Result<u64> {
        let count = self.header.bucket_count + special_bucket_count::<B>() as u64;
        let region = compress_region(self.data.as_mut(), BASE, B::SIZE, count, compressor)?;
        self.mode = MountMode::Compressed;
        Ok(BASE as u64 + region)
    }
}
