//! Separate chaining, materialized once.
//!
//! Inserts accumulate in per-slot vectors keyed by `key % item_count`.
//! `finish` sorts each chain by key and lays all chains out contiguously in
//! a bucket arena, recording each slot's run in an [`Item`]. After that the
//! table is read-only and lookups binary-search a single run.
//!
//! ```text
//! +-------------+-------------------+-----------------------------+
//! | ChainHeader | Item * item_count | Bucket * bucket_capacity    |
//! +-------------+-------------------+-----------------------------+
//! ```

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::marker::PhantomData;

use crate::bucket::{read_bucket, write_bucket, Bucket};
use crate::codec::Word;
use crate::error::Result;
use crate::table::{to_find_result, FindResult, HashTableReader};
use crate::Error;

pub const CHAIN_HEADER_SIZE: usize = 24;

const OFFSET_BITS: u32 = 40;
const MAX_ITEM_OFFSET: u64 = (1 << OFFSET_BITS) - 1;
const MAX_ITEM_COUNT: u64 = (1 << 24) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainHeader {
    pub item_count: u64,
    pub bucket_capacity: u64,
    pub key_count: u64,
}

impl ChainHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHAIN_HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }
        let mut reader = bytes;
        let item_count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("item_count", e))?;
        let bucket_capacity = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("bucket_capacity", e))?;
        let key_count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("key_count", e))?;
        Ok(ChainHeader {
            item_count,
            bucket_capacity,
            key_count,
        })
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        LittleEndian::write_u64(&mut bytes[0..8], self.item_count);
        LittleEndian::write_u64(&mut bytes[8..16], self.bucket_capacity);
        LittleEndian::write_u64(&mut bytes[16..24], self.key_count);
    }
}

/// A chain's run in the arena: offset in the low 40 bits, length in the
/// high 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Item(u64);

impl Item {
    pub fn new(offset: u64, count: u64) -> Option<Self> {
        if offset > MAX_ITEM_OFFSET || count > MAX_ITEM_COUNT {
            return None;
        }
        Some(Item(offset | count << OFFSET_BITS))
    }

    pub fn offset(&self) -> u64 {
        self.0 & MAX_ITEM_OFFSET
    }

    pub fn count(&self) -> u64 {
        self.0 >> OFFSET_BITS
    }
}

pub struct ChainHashTable<B: Bucket, S> {
    data: S,
    header: ChainHeader,
    chains: Vec<Vec<B>>,
    finished: bool,
    _bucket: PhantomData<B>,
}

impl<B: Bucket, S: AsRef<[u8]>> ChainHashTable<B, S> {
    /// Mount a finished table.
    pub fn mount_for_read(data: S) -> Result<Self> {
        let header = ChainHeader::decode(data.as_ref())?;
        if header.item_count == 0 {
            return Err(Error::IndexCorruption("chain table with no items".into()));
        }
        let needed = header
            .item_count
            .checked_mul(8)
            .zip(header.bucket_capacity.checked_mul(B::SIZE as u64))
            .and_then(|(items, buckets)| items.checked_add(buckets))
            .and_then(|len| len.checked_add(CHAIN_HEADER_SIZE as u64))
            .ok_or_else(|| Error::IndexCorruption("chain table size overflows".into()))?;
        let actual = data.as_ref().len() as u64;
        if actual < needed {
            tracing::error!(needed = needed, actual = actual, "Chain table region is truncated");
            return Err(Error::BufferTooSmall { needed, actual });
        }

        let table = ChainHashTable {
            data,
            header,
            chains: Vec::new(),
            finished: true,
            _bucket: PhantomData,
        };
        for slot in 0..header.item_count {
            let item = table.item(slot);
            if item.offset() + item.count() > header.bucket_capacity {
                tracing::error!(
                    slot = slot,
                    offset = item.offset(),
                    count = item.count(),
                    bucket_capacity = header.bucket_capacity,
                    "Chain runs past the bucket arena"
                );
                return Err(Error::IndexCorruption(format!(
                    "chain {} at {}+{} exceeds {} buckets",
                    slot,
                    item.offset(),
                    item.count(),
                    header.bucket_capacity
                )));
            }
        }
        Ok(table)
    }

    pub fn table_memory(item_count: u64, bucket_capacity: u64) -> u64 {
        CHAIN_HEADER_SIZE as u64 + item_count * 8 + bucket_capacity * B::SIZE as u64
    }

    fn arena_base(&self) -> usize {
        CHAIN_HEADER_SIZE + self.header.item_count as usize * 8
    }

    fn item(&self, slot: u64) -> Item {
        let start = CHAIN_HEADER_SIZE + slot as usize * 8;
        Item(LittleEndian::read_u64(&self.data.as_ref()[start..start + 8]))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<B: Bucket, S: AsRef<[u8]> + AsMut<[u8]>> ChainHashTable<B, S> {
    /// Split `data` evenly between items and arena buckets.
    pub fn mount_for_write(mut data: S) -> Result<Self> {
        let size = data.as_ref().len() as u64;
        let slots = size.saturating_sub(CHAIN_HEADER_SIZE as u64) / (8 + B::SIZE as u64);
        if slots == 0 {
            return Err(Error::BufferTooSmall {
                needed: Self::table_memory(1, 1),
                actual: size,
            });
        }
        let header = ChainHeader {
            item_count: slots,
            bucket_capacity: slots,
            key_count: 0,
        };
        header.encode(data.as_mut());

        Ok(ChainHashTable {
            data,
            header,
            chains: vec![Vec::new(); slots as usize],
            finished: false,
            _bucket: PhantomData,
        })
    }

    /// Append to the key's chain. Nothing is deduplicated; the last entry
    /// for a key wins on lookup.
    pub fn insert(&mut self, key: B::Key, value: B::Value) -> bool {
        if self.finished {
            return false;
        }
        let mut bucket = B::empty();
        bucket.set(key, value);
        if bucket.is_empty() || bucket.is_deleted() {
            tracing::warn!(key = ?key, "Entry is not storable in a chain bucket");
            return false;
        }
        let slot = key.to_u64() % self.header.item_count;
        self.chains[slot as usize].push(bucket);
        self.header.key_count += 1;
        true
    }

    /// Chains keep no tombstones.
    pub fn delete(&mut self, _key: B::Key, _value: B::Value) -> bool {
        true
    }

    /// Flatten every chain into the arena. Fails, leaving the chains in
    /// place, when the arena or the item encoding is too small.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let total: u64 = self.chains.iter().map(|chain| chain.len() as u64).sum();
        if total > self.header.bucket_capacity {
            return Err(Error::BufferTooSmall {
                needed: Self::table_memory(self.header.item_count, total),
                actual: self.data.as_ref().len() as u64,
            });
        }

        let mut items = Vec::with_capacity(self.chains.len());
        let mut offset = 0u64;
        for chain in &self.chains {
            let item = Item::new(offset, chain.len() as u64).ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "chain of {} at offset {} exceeds the item encoding",
                    chain.len(),
                    offset
                ))
            })?;
            items.push(item);
            offset += chain.len() as u64;
        }

        let base = self.arena_base();
        let mut chains = std::mem::take(&mut self.chains);
        let bytes = self.data.as_mut();
        for (slot, (chain, item)) in chains.iter_mut().zip(&items).enumerate() {
            let start = CHAIN_HEADER_SIZE + slot * 8;
            LittleEndian::write_u64(&mut bytes[start..start + 8], item.0);
            chain.sort_by_key(|bucket| bucket.key());
            for (i, bucket) in chain.iter().enumerate() {
                write_bucket(bytes, base, item.offset() + i as u64, bucket);
            }
        }
        self.header.encode(bytes);
        self.finished = true;

        tracing::debug!(
            item_count = self.header.item_count,
            key_count = self.header.key_count,
            "Finished chain table"
        );
        Ok(())
    }
}

impl<B: Bucket, S: AsRef<[u8]>> HashTableReader for ChainHashTable<B, S> {
    type Key = B::Key;
    type Value = B::Value;

    fn find(&self, key: B::Key) -> FindResult<B::Value> {
        let slot = key.to_u64() % self.header.item_count;
        if !self.finished {
            return self.chains[slot as usize]
                .iter()
                .rev()
                .find(|bucket| bucket.is_equal(key))
                .map_or(FindResult::NotFound, to_find_result);
        }

        let item = self.item(slot);
        let base = self.arena_base();
        let data = self.data.as_ref();
        let run: Vec<B> = (item.offset()..item.offset() + item.count())
            .map(|index| read_bucket(data, base, index))
            .collect();
        let upper = run.partition_point(|bucket| bucket.key() <= key);
        match upper.checked_sub(1).map(|i| &run[i]) {
            Some(bucket) if bucket.is_equal(key) => to_find_result(bucket),
            _ => FindResult::NotFound,
        }
    }

    fn key_count(&self) -> u64 {
        self.header.key_count
    }

    fn bucket_count(&self) -> u64 {
        self.header.bucket_capacity
    }

    fn occupancy_pct(&self) -> u32 {
        (self.header.key_count.saturating_mul(100) / self.header.bucket_capacity.max(1)).min(u32::MAX as u64) as u32
    }

    fn memory_use(&self) -> u64 {
        Self::table_memory(self.header.item_count, self.header.bucket_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{SpecialKeyBucket, SpecialValueBucket};
    use crate::codec::OffsetValue;

    type KeyBucket = SpecialKeyBucket<u64, u32>;

    fn buffer(slots: u64) -> Vec<u8> {
        vec![0u8; ChainHashTable::<KeyBucket, Vec<u8>>::table_memory(slots, slots) as usize]
    }

    #[test]
    fn test_item_packing() {
        let item = Item::new(0xAB_CDEF_0123, 77).unwrap();
        assert_eq!(item.offset(), 0xAB_CDEF_0123);
        assert_eq!(item.count(), 77);
        assert!(Item::new(1 << 40, 1).is_none());
        assert!(Item::new(0, 1 << 24).is_none());
    }

    #[test]
    fn test_build_and_find() {
        let mut buf = buffer(8);
        {
            let mut table = ChainHashTable::<KeyBucket, _>::mount_for_write(&mut buf[..]).unwrap();
            assert_eq!(table.bucket_count(), 8);
            for key in [3u64, 11, 19, 4, 0] {
                assert!(table.insert(key, key as u32 * 10));
            }
            assert_eq!(table.find(11), FindResult::Found(110), "lookup before finish");
            table.finish().expect("Failed to finish");
            assert!(!table.insert(5, 5), "finished tables are read-only");
            assert_eq!(table.find(19), FindResult::Found(190));
        }

        let table = ChainHashTable::<KeyBucket, _>::mount_for_read(&buf[..]).unwrap();
        assert_eq!(table.key_count(), 5);
        for key in [3u64, 11, 19, 4, 0] {
            assert_eq!(table.find(key), FindResult::Found(key as u32 * 10));
        }
        assert_eq!(table.find(27), FindResult::NotFound);
        assert_eq!(table.find(1), FindResult::NotFound);
    }

    #[test]
    fn test_last_duplicate_wins() {
        let mut buf = buffer(4);
        let mut table = ChainHashTable::<KeyBucket, _>::mount_for_write(&mut buf[..]).unwrap();
        assert!(table.insert(2, 1));
        assert!(table.insert(6, 5));
        assert!(table.insert(2, 2));
        assert_eq!(table.find(2), FindResult::Found(2));
        table.finish().unwrap();
        assert_eq!(table.find(2), FindResult::Found(2));
        assert_eq!(table.find(6), FindResult::Found(5));
    }

    #[test]
    fn test_undersized_arena() {
        let mut buf = buffer(2);
        let mut table = ChainHashTable::<KeyBucket, _>::mount_for_write(&mut buf[..]).unwrap();
        for key in 0..3u64 {
            assert!(table.insert(key, 0));
        }
        assert!(matches!(table.finish(), Err(Error::BufferTooSmall { .. })));
        assert!(!table.is_finished());
        assert_eq!(table.find(2), FindResult::Found(0));
    }

    #[test]
    fn test_delete_is_a_no_op() {
        let mut buf = buffer(4);
        let mut table = ChainHashTable::<KeyBucket, _>::mount_for_write(&mut buf[..]).unwrap();
        assert!(table.insert(1, 1));
        assert!(table.delete(1, 0));
        assert_eq!(table.find(1), FindResult::Found(1));
    }

    #[test]
    fn test_value_bucket_chain() {
        type OffsetBucket = SpecialValueBucket<u32, OffsetValue<u32>>;
        let size = ChainHashTable::<OffsetBucket, Vec<u8>>::table_memory(16, 16);
        let mut buf = vec![0u8; size as usize];
        let mut table = ChainHashTable::<OffsetBucket, _>::mount_for_write(&mut buf[..]).unwrap();
        assert!(table.insert(u32::MAX, OffsetValue::new(9)));
        assert!(!table.insert(1, OffsetValue::new(u32::MAX)));
        table.finish().unwrap();
        assert_eq!(table.find(u32::MAX), FindResult::Found(OffsetValue::new(9)));
    }

    #[test]
    fn test_read_mount_rejects_runs_past_the_arena() {
        let mut buf = buffer(4);
        {
            let mut table = ChainHashTable::<KeyBucket, _>::mount_for_write(&mut buf[..]).unwrap();
            assert!(table.insert(1, 10));
            table.finish().unwrap();
        }
        let slot = CHAIN_HEADER_SIZE + 8;
        let item = Item::new(3, 2).unwrap();
        LittleEndian::write_u64(&mut buf[slot..slot + 8], item.0);
        assert!(matches!(
            ChainHashTable::<KeyBucket, _>::mount_for_read(&buf[..]),
            Err(Error::IndexCorruption(_))
        ));

        let header = ChainHeader {
            item_count: u64::MAX / 4,
            bucket_capacity: 4,
            key_count: 1,
        };
        header.encode(&mut buf);
        assert!(matches!(
            ChainHashTable::<KeyBucket, _>::mount_for_read(&buf[..]),
            Err(Error::IndexCorruption(_))
        ));
    }
}
