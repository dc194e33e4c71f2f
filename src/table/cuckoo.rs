//! Bucketized cuckoo hashing.
//!
//! Buckets are grouped into blocks of [`BLOCK_SIZE`]. A key may live in any
//! bucket of the blocks chosen by its first `num_hash_func` hash functions.
//! When every candidate block is full, a breadth-first search over the
//! blocks reachable by moving resident keys to one of their other blocks
//! finds a vacancy, and the chain of moves back to a candidate block is
//! replayed. If the search fails the table enables one more hash function,
//! up to `max_num_hash_func`.
//!
//! ```text
//! +--------------+---------------------------+-----------------+---------------+
//! | CuckooHeader | Bucket * bucket_count     | special buckets | stretch space |
//! +--------------+---------------------------+-----------------+---------------+
//! ```

use std::marker::PhantomData;

use crate::bucket::{fill_empty, read_bucket, special_bucket_count, write_bucket, Bucket};
use crate::codec::Word;
use crate::compress::BucketCompressor;
use crate::config::{HashTableOptions, DEFAULT_BFS_DEPTH};
use crate::error::Result;
use crate::hash::cuckoo_hash;
use crate::iterator::ClosedHashTableIterator;
use crate::table::capacity::{
    bucket_count_to_capacity, cuckoo_bucket_count, cuckoo_capacity_to_table_memory, cuckoo_layout,
    BLOCK_SIZE, CUCKOO_DEFAULT_OCCUPANCY, CUCKOO_MAX_OCCUPANCY,
};
use crate::table::header::{CuckooHeader, TableHeader, CUCKOO_HEADER_VERSION};
use crate::table::{
    bucket_region_len, check_region, compress_region, count_deleted, dump_buckets, header_occupancy,
    restore_specials, save_specials, to_find_result, write_entry, FindResult, HashTable,
    HashTableReader, MountMode,
};
use crate::Error;

/// Upper bound on blocks visited by one eviction search.
pub const MAX_NUM_BFS_TREE_NODE: usize = 1 << 20;

const BASE: usize = CuckooHeader::SIZE;
const NO_PARENT: usize = usize::MAX;

/// Block chosen by `hash`. Tables addressable in 32 bits use the cheaper
/// 32-bit modulo; persisted tables depend on this exact mapping.
#[inline]
pub(crate) fn block_index(hash: u64, block_count: u64) -> u64 {
    if block_count <= u32::MAX as u64 {
        ((hash as u32) % (block_count as u32)) as u64
    } else {
        hash % block_count
    }
}

#[inline]
pub(crate) fn candidate_block(key: u64, hash_func_id: u8, block_count: u64) -> u64 {
    block_index(cuckoo_hash(key, hash_func_id), block_count)
}

#[derive(Debug, Clone, Copy)]
struct BfsNode {
    block: u64,
    parent: usize,
    /// Position, inside the parent block, of the bucket that moves here
    slot: u8,
    depth: u32,
}

enum Placement {
    Existing(u64),
    Vacant(u64),
    Full,
}

pub struct CuckooHashTable<B: Bucket, S> {
    data: S,
    header: CuckooHeader,
    block_count: u64,
    occupancy_pct: u32,
    delete_count: u64,
    bfs_depth: u32,
    call_ids: Vec<u32>,
    call_id: u32,
    eviction_count: u64,
    mode: MountMode,
    _bucket: PhantomData<B>,
}

impl<B: Bucket, S: AsRef<[u8]>> CuckooHashTable<B, S> {
    pub fn mount_for_read(data: S) -> Result<Self> {
        let header = CuckooHeader::decode(data.as_ref()).map_err(|e| {
            tracing::error!(size = data.as_ref().len(), "Failed to decode cuckoo header: {}", e);
            e
        })?;
        if header.bucket_count == 0 || header.bucket_count % BLOCK_SIZE != 0 {
            return Err(Error::IndexCorruption(format!(
                "cuckoo bucket count {} is not a positive multiple of {}",
                header.bucket_count, BLOCK_SIZE
            )));
        }
        check_region::<B>(data.as_ref().len(), BASE, header.bucket_count)?;

        Ok(CuckooHashTable {
            block_count: header.bucket_count / BLOCK_SIZE,
            occupancy_pct: header_occupancy(header.key_count, header.bucket_count),
            data,
            header,
            delete_count: 0,
            bfs_depth: DEFAULT_BFS_DEPTH,
            call_ids: Vec::new(),
            call_id: 0,
            eviction_count: 0,
            mode: MountMode::Read,
            _bucket: PhantomData,
        })
    }

    pub fn header(&self) -> &CuckooHeader {
        &self.header
    }

    pub fn num_hash_func(&self) -> u8 {
        self.header.num_hash_func
    }

    /// Bucket moves performed by kick chains since mounting.
    pub fn eviction_count(&self) -> u64 {
        self.eviction_count
    }

    #[inline]
    fn bucket(&self, index: u64) -> B {
        read_bucket(self.data.as_ref(), BASE, index)
    }

    #[inline]
    fn find_in_block(&self, key: B::Key, block: u64) -> Option<B> {
        let start = block * BLOCK_SIZE;
        (start..start + BLOCK_SIZE)
            .map(|index| self.bucket(index))
            .find(|bucket| !bucket.is_empty() && bucket.is_equal(key))
    }

    fn find_bucket(&self, key: B::Key) -> FindResult<B::Value> {
        if let Some(slot) = B::special_slot(key) {
            return to_find_result(&self.bucket(self.header.bucket_count + slot as u64));
        }

        // most keys sit in one of the first two blocks
        let hashed = key.to_u64();
        let first = self
            .find_in_block(key, candidate_block(hashed, 0, self.block_count))
            .or_else(|| self.find_in_block(key, candidate_block(hashed, 1, self.block_count)));
        if let Some(bucket) = first {
            return to_find_result(&bucket);
        }
        for hash_func_id in 2..self.header.num_hash_func {
            let block = candidate_block(hashed, hash_func_id, self.block_count);
            if let Some(bucket) = self.find_in_block(key, block) {
                return to_find_result(&bucket);
            }
        }
        FindResult::NotFound
    }

    fn do_find_bucket(&self, key: B::Key) -> Placement {
        let hashed = key.to_u64();
        let mut vacant = None;
        for hash_func_id in 0..self.header.num_hash_func {
            let start = candidate_block(hashed, hash_func_id, self.block_count) * BLOCK_SIZE;
            for index in start..start + BLOCK_SIZE {
                let bucket = self.bucket(index);
                if bucket.is_empty() {
                    vacant.get_or_insert(index);
                } else if bucket.is_equal(key) {
                    return Placement::Existing(index);
                }
            }
        }
        vacant.map_or(Placement::Full, Placement::Vacant)
    }

    fn vacancy_in_block(&self, block: u64) -> Option<u64> {
        let start = block * BLOCK_SIZE;
        (start..start + BLOCK_SIZE).find(|&index| self.bucket(index).is_empty())
    }

    fn region(&self) -> &[u8] {
        let len = bucket_region_len::<B>(self.header.bucket_count);
        &self.data.as_ref()[BASE..BASE + len]
    }

    pub fn iter(&self) -> ClosedHashTableIterator<B, &[u8]> {
        ClosedHashTableIterator::new(self.region(), self.header.bucket_count)
    }

    pub fn dump(&self) -> String {
        dump_buckets::<B>(self.data.as_ref(), BASE, self.header.bucket_count)
    }

    pub fn into_inner(self) -> S {
        self.data
    }
}

impl<B: Bucket, S: AsRef<[u8]> + AsMut<[u8]>> CuckooHashTable<B, S> {
    /// Mount over `data` for building. With `may_stretch`, part of the
    /// region is held back for one later `stretch`.
    pub fn mount_for_write(mut data: S, options: &HashTableOptions) -> Result<Self> {
        let occupancy_pct =
            options.resolve_occupancy(CUCKOO_DEFAULT_OCCUPANCY, CUCKOO_MAX_OCCUPANCY)?;
        options.validate_hash_funcs()?;

        let size = data.as_ref().len();
        let (bucket_count, stretch_size) = cuckoo_layout::<B>(size as u64, options.may_stretch);
        if bucket_count == 0 {
            let needed = cuckoo_capacity_to_table_memory::<B>(1, occupancy_pct, options.may_stretch);
            tracing::error!(needed = needed, actual = size, "Region too small for a cuckoo table");
            return Err(Error::BufferTooSmall {
                needed,
                actual: size as u64,
            });
        }

        let header = CuckooHeader {
            version: CUCKOO_HEADER_VERSION,
            num_hash_func: 2,
            max_num_hash_func: options.max_num_hash_func,
            stretch_size,
            bucket_count,
            key_count: 0,
        };
        let bytes = data.as_mut();
        fill_empty::<B>(bytes, BASE, 0, bucket_count + special_bucket_count::<B>() as u64);
        header.encode(bytes);

        let block_count = bucket_count / BLOCK_SIZE;
        tracing::debug!(
            bucket_count = bucket_count,
            stretch_size = stretch_size,
            occupancy_pct = occupancy_pct,
            "Mounted cuckoo table for write"
        );

        Ok(CuckooHashTable {
            data,
            header,
            block_count,
            occupancy_pct,
            delete_count: 0,
            bfs_depth: options.bfs_depth,
            call_ids: vec![0; block_count as usize],
            call_id: 0,
            eviction_count: 0,
            mode: MountMode::Write,
            _bucket: PhantomData,
        })
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
                None => return false,
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

    /// Bucket for `key`: its current bucket, a vacancy in a candidate
    /// block, or one freed by a kick chain. Escalates the hash function
    /// count when the search fails.
    fn find_bucket_for_write(&mut self, key: B::Key) -> Option<u64> {
        loop {
            match self.do_find_bucket(key) {
                Placement::Existing(index) | Placement::Vacant(index) => return Some(index),
                Placement::Full => {}
            }
            if let Some(index) = self.bfs_find_bucket(key) {
                return Some(index);
            }
            if self.header.num_hash_func < self.header.max_num_hash_func {
                self.header.num_hash_func += 1;
                self.sync_header();
                tracing::info!(
                    num_hash_func = self.header.num_hash_func,
                    key_count = self.header.key_count,
                    bucket_count = self.header.bucket_count,
                    "Increased cuckoo hash function count"
                );
                continue;
            }
            tracing::warn!(
                num_hash_func = self.header.num_hash_func,
                key_count = self.header.key_count,
                bucket_count = self.header.bucket_count,
                "Cuckoo table is full"
            );
            return None;
        }
    }

    fn next_call_id(&mut self) -> u32 {
        self.call_id = self.call_id.wrapping_add(1);
        if self.call_id == 0 {
            self.call_ids.fill(0);
            self.call_id = 1;
        }
        self.call_id
    }

    /// Breadth-first search from the candidate blocks of `key` for a block
    /// with a vacancy. On success the kick chain has been applied and the
    /// returned bucket, inside a candidate block, is empty.
    fn bfs_find_bucket(&mut self, key: B::Key) -> Option<u64> {
        let call_id = self.next_call_id();
        let num_hash_func = self.header.num_hash_func;
        let block_count = self.block_count;

        let mut tree: Vec<BfsNode> = Vec::new();
        for hash_func_id in 0..num_hash_func {
            let block = candidate_block(key.to_u64(), hash_func_id, block_count);
            if self.call_ids[block as usize] != call_id {
                self.call_ids[block as usize] = call_id;
                tree.push(BfsNode {
                    block,
                    parent: NO_PARENT,
                    slot: 0,
                    depth: 0,
                });
            }
        }

        let mut head = 0;
        while head < tree.len() {
            let node = tree[head];
            if node.depth >= self.bfs_depth {
                break;
            }
            for slot in 0..BLOCK_SIZE {
                let resident = self.bucket(node.block * BLOCK_SIZE + slot).key().to_u64();
                for hash_func_id in 0..num_hash_func {
                    let block = candidate_block(resident, hash_func_id, block_count);
                    if self.call_ids[block as usize] == call_id {
                        continue;
                    }
                    self.call_ids[block as usize] = call_id;
                    tree.push(BfsNode {
                        block,
                        parent: head,
                        slot: slot as u8,
                        depth: node.depth + 1,
                    });
                    if let Some(vacancy) = self.vacancy_in_block(block) {
                        return Some(self.cuckoo_kick(&tree, tree.len() - 1, vacancy));
                    }
                    if tree.len() >= MAX_NUM_BFS_TREE_NODE {
                        tracing::debug!(nodes = tree.len(), "Eviction search hit the node cap");
                        return None;
                    }
                }
            }
            head += 1;
        }
        None
    }

    /// Shift buckets one hop along the path from `leaf` to its root, filling
    /// `vacancy` first. Returns the emptied bucket in the root block.
    fn cuckoo_kick(&mut self, tree: &[BfsNode], leaf: usize, vacancy: u64) -> u64 {
        let mut hole = vacancy;
        let mut current = leaf;
        while tree[current].parent != NO_PARENT {
            let node = tree[current];
            let from = tree[node.parent].block * BLOCK_SIZE + node.slot as u64;
            let moving: B = self.bucket(from);
            write_bucket(self.data.as_mut(), BASE, hole, &moving);
            self.eviction_count += 1;
            hole = from;
            current = node.parent;
        }
        write_bucket(self.data.as_mut(), BASE, hole, &B::empty());
        hole
    }

    /// Rebuild into `new_bucket_count` buckets with two hash functions,
    /// replaying every occupied bucket. Any placement failure restores the
    /// table as it was.
    fn rehash(&mut self, new_bucket_count: u64) -> bool {
        let old_header = self.header;
        let old_count = old_header.bucket_count;
        let span = BASE + bucket_region_len::<B>(old_count.max(new_bucket_count));
        if self.data.as_ref().len() < span {
            tracing::warn!(needed = span, "Rehash target exceeds the mounted region");
            return false;
        }

        let snapshot = self.data.as_ref()[..span].to_vec();
        let specials = save_specials::<B>(self.data.as_ref(), BASE, old_count);
        let entries: Vec<B> = (0..old_count)
            .map(|index| self.bucket(index))
            .filter(|bucket| !bucket.is_empty())
            .collect();

        self.reset_layout(new_bucket_count);
        self.header.num_hash_func = 2;
        fill_empty::<B>(self.data.as_mut(), BASE, 0, new_bucket_count);

        for bucket in &entries {
            match self.find_bucket_for_write(bucket.key()) {
                Some(index) => write_bucket(self.data.as_mut(), BASE, index, bucket),
                None => {
                    self.data.as_mut()[..span].copy_from_slice(&snapshot);
                    self.header = old_header;
                    self.reset_layout(old_count);
                    tracing::warn!(
                        bucket_count = old_count,
                        target = new_bucket_count,
                        key_count = old_header.key_count,
                        "Cuckoo rehash failed, rolled back"
                    );
                    return false;
                }
            }
        }

        restore_specials(self.data.as_mut(), BASE, new_bucket_count, &specials);
        self.sync_header();
        self.delete_count = count_deleted::<B>(self.data.as_ref(), BASE, new_bucket_count);
        true
    }

    fn reset_layout(&mut self, bucket_count: u64) {
        self.header.bucket_count = bucket_count;
        self.block_count = bucket_count / BLOCK_SIZE;
        self.call_ids = vec![0; self.block_count as usize];
        self.call_id = 0;
    }
}

impl<B: Bucket, S: AsRef<[u8]>> HashTableReader for CuckooHashTable<B, S> {
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
        (BASE + bucket_region_len::<B>(self.header.bucket_count)) as u64 + self.header.stretch_size
    }
}

impl<B: Bucket, S: AsRef<[u8]> + AsMut<[u8]>> HashTable for CuckooHashTable<B, S> {
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
        if pct > CUCKOO_MAX_OCCUPANCY {
            tracing::warn!(occupancy_pct = pct, "Shrink target out of range");
            return false;
        }

        let old_count = self.header.bucket_count;
        let new_count = cuckoo_bucket_count(self.header.key_count, pct);
        if new_count >= old_count {
            tracing::debug!(
                bucket_count = old_count,
                target = new_count,
                "Shrink is a no-op"
            );
            return true;
        }
        if !self.rehash(new_count) {
            return false;
        }
        self.occupancy_pct = pct;
        tracing::debug!(from = old_count, to = new_count, "Shrunk cuckoo table");
        true
    }

    fn stretch(&mut self) -> bool {
        if self.mode != MountMode::Write {
            return false;
        }
        let stretch_size = self.header.stretch_size;
        if stretch_size == 0 {
            tracing::debug!("No stretch space left");
            return false;
        }

        let old_count = self.header.bucket_count;
        let block_bytes = BLOCK_SIZE * B::SIZE as u64;
        let new_count = (old_count * B::SIZE as u64 + stretch_size) / block_bytes * BLOCK_SIZE;
        if new_count <= old_count || !self.rehash(new_count) {
            return false;
        }

        self.header.stretch_size = 0;
        self.sync_header();
        tracing::info!(from = old_count, to = new_count, "Stretched cuckoo table");
        true
    }

    fn capacity(&self) -> u64 {
        bucket_count_to_capacity(self.header.bucket_count, self.occupancy_pct)
    }

    fn delete_count(&self) -> u64 {
        self.delete_count
    }

    fn build_assistant_memory_use(&self) -> u64 {
        (self.call_ids.len() * std::mem::size_of::<u32>()) as u64
    }

    fn compress(&mut self, compressor: &dyn BucketCompressor) -> Result<u64> {
        let count = self.header.bucket_count + special_bucket_count::<B>() as u64;
        let region = compress_region(self.data.as_mut(), BASE, B::SIZE, count, compressor)?;
        self.header.stretch_size = 0;
        self.sync_header();
        self.mode = MountMode::Compressed;
        Ok(BASE as u64 + region)
    }
}
