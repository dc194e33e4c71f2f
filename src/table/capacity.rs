//! Mapping between key capacity, bucket counts and byte budgets.
//!
//! Every function here is pure. Mount code derives the bucket layout from a
//! byte size with the same formulas, so `capacity_to_table_memory` followed
//! by a mount always yields at least the requested capacity.

use crate::bucket::{special_bucket_count, Bucket};
use crate::table::header::{CuckooHeader, DenseHeader, TableHeader};

pub const DENSE_DEFAULT_OCCUPANCY: u32 = 50;
pub const DENSE_MAX_OCCUPANCY: u32 = 100;
pub const DENSE_RECOMMENDED_MAX_OCCUPANCY: u32 = 80;

pub const CUCKOO_DEFAULT_OCCUPANCY: u32 = 80;
pub const CUCKOO_MAX_OCCUPANCY: u32 = 97;

/// Buckets per cuckoo block.
pub const BLOCK_SIZE: u64 = 4;

/// Percent of the bucket region reserved for one stretch.
pub const STRETCH_MEM_RATIO: u64 = 1;

fn special_bytes<B: Bucket>() -> u64 {
    (special_bucket_count::<B>() * B::SIZE) as u64
}

/// Live keys a table of `bucket_count` buckets accepts at `pct`.
pub fn bucket_count_to_capacity(bucket_count: u64, pct: u32) -> u64 {
    bucket_count * pct as u64 / 100
}

/// Smallest dense bucket count holding `capacity` keys at `pct`. One bucket
/// always stays empty so a failed probe terminates.
pub fn dense_bucket_count(capacity: u64, pct: u32) -> u64 {
    let pct = pct.max(1) as u64;
    let by_pct = (capacity * 100 + pct - 1) / pct;
    by_pct.max(capacity + 1)
}

pub fn dense_table_memory<B: Bucket>(bucket_count: u64) -> u64 {
    DenseHeader::SIZE as u64 + bucket_count * B::SIZE as u64 + special_bytes::<B>()
}

pub fn dense_capacity_to_table_memory<B: Bucket>(capacity: u64, pct: u32) -> u64 {
    dense_table_memory::<B>(dense_bucket_count(capacity, pct))
}

/// Bucket count a dense mount carves out of `memory` bytes.
pub fn dense_memory_to_bucket_count<B: Bucket>(memory: u64) -> u64 {
    memory
        .saturating_sub(DenseHeader::SIZE as u64 + special_bytes::<B>())
        / B::SIZE as u64
}

pub fn dense_table_memory_to_capacity<B: Bucket>(memory: u64, pct: u32) -> u64 {
    bucket_count_to_capacity(dense_memory_to_bucket_count::<B>(memory), pct)
}

/// Round `capacity` at `pct` up to whole cuckoo blocks.
pub fn cuckoo_bucket_count(capacity: u64, pct: u32) -> u64 {
    let pct = pct.max(1) as u64;
    let buckets = (capacity * 100 + pct - 1) / pct;
    let blocks = ((buckets + BLOCK_SIZE - 1) / BLOCK_SIZE).max(1);
    blocks * BLOCK_SIZE
}

fn cuckoo_block_bytes<B: Bucket>() -> u64 {
    BLOCK_SIZE * B::SIZE as u64
}

/// Cuckoo layout derived from a byte budget: `(bucket_count, stretch_size)`.
///
/// With `may_stretch`, the region after the fixed parts is split so that the
/// bucket array plus one percent plus one block fits, and the remainder is
/// kept as the stretch reservation.
pub fn cuckoo_layout<B: Bucket>(memory: u64, may_stretch: bool) -> (u64, u64) {
    let block_bytes = cuckoo_block_bytes::<B>();
    let available = memory.saturating_sub(CuckooHeader::SIZE as u64 + special_bytes::<B>());
    let bucket_bytes = if may_stretch {
        available.saturating_sub(block_bytes) * 100 / (100 + STRETCH_MEM_RATIO)
    } else {
        available
    };
    let block_count = bucket_bytes / block_bytes;
    let used = block_count * block_bytes;
    let stretch_size = if may_stretch { available - used } else { 0 };
    (block_count * BLOCK_SIZE, stretch_size)
}

pub fn cuckoo_capacity_to_table_memory<B: Bucket>(capacity: u64, pct: u32, may_stretch: bool) -> u64 {
    let bucket_bytes = cuckoo_bucket_count(capacity, pct) * B::SIZE as u64;
    let region = if may_stretch {
        let scaled = bucket_bytes * (100 + STRETCH_MEM_RATIO);
        (scaled + 99) / 100 + cuckoo_block_bytes::<B>()
    } else {
        bucket_bytes
    };
    CuckooHeader::SIZE as u64 + special_bytes::<B>() + region
}

pub fn cuckoo_table_memory_to_capacity<B: Bucket>(memory: u64, pct: u32, may_stretch: bool) -> u64 {
    let (bucket_count, _) = cuckoo_layout::<B>(memory, may_stretch);
    bucket_count_to_capacity(bucket_count, pct)
}

/// Blocks a cuckoo table can ever span inside `memory`, stretch included.
fn cuckoo_max_block_count<B: Bucket>(memory: u64) -> u64 {
    memory.saturating_sub(CuckooHeader::SIZE as u64 + special_bytes::<B>())
        / cuckoo_block_bytes::<B>()
}

/// Table bytes plus the per-block BFS call-id arena.
pub fn cuckoo_table_memory_to_build_memory<B: Bucket>(memory: u64) -> u64 {
    memory + cuckoo_max_block_count::<B>(memory) * std::mem::size_of::<u32>() as u64
}

pub fn cuckoo_build_memory_to_table_memory<B: Bucket>(build_memory: u64) -> u64 {
    let fixed = CuckooHeader::SIZE as u64 + special_bytes::<B>();
    let per_block = cuckoo_block_bytes::<B>() + std::mem::size_of::<u32>() as u64;
    let blocks = build_memory.saturating_sub(fixed) / per_block;
    fixed + blocks * cuckoo_block_bytes::<B>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{SpecialKeyBucket, SpecialValueBucket};
    use crate::codec::OffsetValue;

    type KeyBucket = SpecialKeyBucket<u64, u32>;
    type ValueBucket = SpecialValueBucket<u64, OffsetValue<u64>>;

    #[test]
    fn test_dense_sizing_roundtrip() {
        for capacity in [1u64, 4, 100, 9999] {
            for pct in [10u32, 50, 80, 100] {
                let memory = dense_capacity_to_table_memory::<KeyBucket>(capacity, pct);
                assert_eq!(
                    dense_memory_to_bucket_count::<KeyBucket>(memory),
                    dense_bucket_count(capacity, pct)
                );
                assert!(
                    dense_table_memory_to_capacity::<KeyBucket>(memory, pct) >= capacity,
                    "capacity {} at {}% lost in sizing",
                    capacity,
                    pct
                );
            }
        }
    }

    #[test]
    fn test_dense_memory_counts_special_buckets() {
        assert_eq!(dense_table_memory::<KeyBucket>(8), 16 + 10 * 13);
        assert_eq!(dense_table_memory::<ValueBucket>(8), 16 + 8 * 16);
        assert_eq!(dense_memory_to_bucket_count::<KeyBucket>(16 + 10 * 13), 8);
    }

    #[test]
    fn test_full_occupancy_keeps_one_empty_bucket() {
        assert_eq!(dense_bucket_count(10, 100), 11);
        assert_eq!(dense_bucket_count(4, 50), 8);
    }

    #[test]
    fn test_cuckoo_bucket_count_rounds_to_blocks() {
        assert_eq!(cuckoo_bucket_count(0, 80), 4);
        assert_eq!(cuckoo_bucket_count(5, 80), 8);
        assert_eq!(cuckoo_bucket_count(80, 80), 100);
    }

    #[test]
    fn test_cuckoo_sizing_roundtrip() {
        for may_stretch in [false, true] {
            for capacity in [1u64, 7, 1000, 123_457] {
                let memory = cuckoo_capacity_to_table_memory::<ValueBucket>(capacity, 80, may_stretch);
                let (bucket_count, stretch_size) = cuckoo_layout::<ValueBucket>(memory, may_stretch);
                assert!(bucket_count >= cuckoo_bucket_count(capacity, 80));
                assert_eq!(bucket_count % BLOCK_SIZE, 0);
                if may_stretch {
                    assert!(stretch_size >= cuckoo_block_bytes::<ValueBucket>());
                } else {
                    assert_eq!(stretch_size, 0);
                }
            }
        }
    }

    #[test]
    fn test_cuckoo_build_memory_inverse() {
        let table = cuckoo_capacity_to_table_memory::<KeyBucket>(5000, 90, true);
        let build = cuckoo_table_memory_to_build_memory::<KeyBucket>(table);
        assert!(build > table);

        let inverse = cuckoo_build_memory_to_table_memory::<KeyBucket>(build);
        assert!(inverse <= table);
        assert!(table - inverse < cuckoo_block_bytes::<KeyBucket>());
    }
}
