//! Dense table serving lookups while a single writer keeps inserting.
//!
//! Keys and values live in separate atomic cells. A writer claims an empty
//! bucket by storing the key (relaxed) and then publishing the value
//! (release); readers acquire the value before looking at the key. A
//! reader that sees the bucket change between its first read and its
//! validation starts the lookup over.
//!
//! The bucket array never moves, so there is no shrink or stretch here.
//! Build with [`DenseHashTable`](crate::table::DenseHashTable) for those.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::bucket::{read_bucket, write_bucket, Bucket, SpecialValueBucket};
use crate::codec::{AtomicValue, SpecialValue};
use crate::config::HashTableOptions;
use crate::error::Result;
use crate::table::capacity::{
    bucket_count_to_capacity, dense_bucket_count, dense_table_memory, DENSE_DEFAULT_OCCUPANCY,
    DENSE_MAX_OCCUPANCY,
};
use crate::table::header::{DenseHeader, TableHeader};
use crate::table::{check_region, header_occupancy, FindResult, HashTableReader};
use crate::Error;

/// On-disk bucket format shared with the dense table.
pub type ReadWriteBucket<V> = SpecialValueBucket<u64, V>;

const BASE: usize = DenseHeader::SIZE;

pub struct ReadWriteDenseTable<V: AtomicValue> {
    keys: Box<[AtomicU64]>,
    values: Box<[V::Cell]>,
    bucket_count: u64,
    occupancy_pct: u32,
    key_count: AtomicU64,
    delete_count: AtomicU64,
    writer: Mutex<()>,
}

impl<V: AtomicValue> ReadWriteDenseTable<V> {
    /// Empty table sized for `capacity` keys at the configured occupancy.
    pub fn new(capacity: u64, options: &HashTableOptions) -> Result<Self> {
        let occupancy_pct = options.resolve_occupancy(DENSE_DEFAULT_OCCUPANCY, DENSE_MAX_OCCUPANCY)?;
        let bucket_count = dense_bucket_count(capacity.max(1), occupancy_pct);
        Ok(Self::with_buckets(bucket_count, occupancy_pct))
    }

    fn with_buckets(bucket_count: u64, occupancy_pct: u32) -> Self {
        let keys = (0..bucket_count).map(|_| AtomicU64::new(0)).collect();
        let values = (0..bucket_count).map(|_| V::cell(V::empty())).collect();
        ReadWriteDenseTable {
            keys,
            values,
            bucket_count,
            occupancy_pct,
            key_count: AtomicU64::new(0),
            delete_count: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Copy a serialized dense table into atomic cells.
    pub fn load(data: &[u8]) -> Result<Self> {
        let header = DenseHeader::decode(data)?;
        if header.bucket_count == 0 {
            return Err(Error::IndexCorruption("dense table with no buckets".into()));
        }
        check_region::<ReadWriteBucket<V>>(data.len(), BASE, header.bucket_count)?;

        let occupancy_pct = header_occupancy(header.key_count, header.bucket_count);
        let table = Self::with_buckets(header.bucket_count, occupancy_pct);
        let mut key_count = 0;
        let mut delete_count = 0;
        for index in 0..header.bucket_count {
            let bucket: ReadWriteBucket<V> = read_bucket(data, BASE, index);
            if bucket.is_empty() {
                continue;
            }
            key_count += 1;
            if bucket.is_deleted() {
                delete_count += 1;
            }
            table.keys[index as usize].store(bucket.key(), Ordering::Relaxed);
            V::store(&table.values[index as usize], bucket.value(), Ordering::Relaxed);
        }
        if key_count != header.key_count {
            tracing::error!(
                header = header.key_count,
                counted = key_count,
                "Dense table key count disagrees with its buckets"
            );
            return Err(Error::IndexCorruption(format!(
                "header records {} keys but {} buckets are occupied",
                header.key_count, key_count
            )));
        }
        table.key_count.store(key_count, Ordering::Relaxed);
        table.delete_count.store(delete_count, Ordering::Relaxed);
        Ok(table)
    }

    /// Serialize into the dense table format. Returns the bytes written.
    pub fn write_to(&self, out: &mut [u8]) -> Result<u64> {
        let _guard = self.lock_writer();
        let needed = dense_table_memory::<ReadWriteBucket<V>>(self.bucket_count);
        if (out.len() as u64) < needed {
            return Err(Error::BufferTooSmall {
                needed,
                actual: out.len() as u64,
            });
        }
        let header = DenseHeader {
            bucket_count: self.bucket_count,
            key_count: self.key_count.load(Ordering::Relaxed),
        };
        header.encode(out);
        for index in 0..self.bucket_count {
            let mut bucket = ReadWriteBucket::<V>::empty();
            bucket.set(
                self.keys[index as usize].load(Ordering::Relaxed),
                V::load(&self.values[index as usize], Ordering::Acquire),
            );
            write_bucket(out, BASE, index, &bucket);
        }
        Ok(needed)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look `key` up while a writer may be running. A bucket that changes
    /// between the read and its validation restarts the probe.
    pub fn find_for_read_write(&self, key: u64) -> FindResult<V> {
        'retry: loop {
            let mut index = key % self.bucket_count;
            for _ in 0..self.bucket_count {
                let cell = &self.values[index as usize];
                let value = V::load(cell, Ordering::Acquire);
                if value.is_empty() {
                    return FindResult::NotFound;
                }
                if self.keys[index as usize].load(Ordering::Relaxed) == key {
                    let again = V::load(cell, Ordering::Acquire);
                    if again.is_empty()
                        || again != value
                        || self.keys[index as usize].load(Ordering::Relaxed) != key
                    {
                        continue 'retry;
                    }
                    return if value.is_deleted() {
                        FindResult::Deleted(value)
                    } else {
                        FindResult::Found(value)
                    };
                }
                index += 1;
                if index == self.bucket_count {
                    index = 0;
                }
            }
            return FindResult::NotFound;
        }
    }

    pub fn insert(&self, key: u64, value: V) -> bool {
        if value.is_empty() || value.is_deleted() {
            tracing::warn!(key = key, "Value collides with a bucket sentinel");
            return false;
        }
        self.upsert(key, value)
    }

    /// Write a tombstone for `key`, keeping the key's bucket.
    pub fn delete(&self, key: u64, value: V) -> bool {
        self.upsert(key, value.deleted())
    }

    fn upsert(&self, key: u64, value: V) -> bool {
        let _guard = self.lock_writer();
        let mut index = key % self.bucket_count;
        for _ in 0..self.bucket_count {
            let cell = &self.values[index as usize];
            let current = V::load(cell, Ordering::Relaxed);
            if current.is_empty() {
                self.keys[index as usize].store(key, Ordering::Relaxed);
                V::store(cell, value, Ordering::Release);
                self.key_count.fetch_add(1, Ordering::Relaxed);
                if value.is_deleted() {
                    self.delete_count.fetch_add(1, Ordering::Relaxed);
                }
                return true;
            }
            if self.keys[index as usize].load(Ordering::Relaxed) == key {
                V::store(cell, value, Ordering::Release);
                match (current.is_deleted(), value.is_deleted()) {
                    (false, true) => {
                        self.delete_count.fetch_add(1, Ordering::Relaxed);
                    }
                    (true, false) => {
                        self.delete_count.fetch_sub(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                return true;
            }
            index += 1;
            if index == self.bucket_count {
                index = 0;
            }
        }
        tracing::warn!(
            bucket_count = self.bucket_count,
            key_count = self.key_count.load(Ordering::Relaxed),
            "Read-write dense table is full"
        );
        false
    }

    pub fn capacity(&self) -> u64 {
        bucket_count_to_capacity(self.bucket_count, self.occupancy_pct)
    }

    pub fn delete_count(&self) -> u64 {
        self.delete_count.load(Ordering::Relaxed)
    }
}

impl<V: AtomicValue> HashTableReader for ReadWriteDenseTable<V> {
    type Key = u64;
    type Value = V;

    fn find(&self, key: u64) -> FindResult<V> {
        self.find_for_read_write(key)
    }

    fn key_count(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    fn occupancy_pct(&self) -> u32 {
        self.occupancy_pct
    }

    fn memory_use(&self) -> u64 {
        dense_table_memory::<ReadWriteBucket<V>>(self.bucket_count)
    }
}
