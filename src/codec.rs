//! Fixed-width little-endian codecs for the keys and values stored in
//! buckets.
//!
//! Every type that lands in a bucket has a constant encoded size, so a
//! bucket array can be addressed by index over raw bytes. Values come in
//! two flavours: plain integers, which carry no state of their own, and
//! *special values* ([`OffsetValue`], [`TimestampValue`]) that reserve the
//! two largest values of their payload word as empty/delete sentinels.

use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{self, AtomicU32, AtomicU64};

/// Offset width used by compacted offset buckets.
pub type ShortOffset = u16;

pub trait FixedCodec: Copy + Debug {
    const SIZE: usize;

    fn decode(buf: &[u8]) -> Self;

    fn encode(&self, buf: &mut [u8]);
}

/// Unsigned machine word usable as a key or as an offset payload.
pub trait Word: FixedCodec + Eq + Ord + Hash + Default {
    const MAX: Self;

    fn to_u64(self) -> u64;

    /// Truncating conversion.
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_word {
    ($t:ty, $size:expr, $read:ident, $write:ident) => {
        impl FixedCodec for $t {
            const SIZE: usize = $size;

            #[inline]
            fn decode(buf: &[u8]) -> Self {
                LittleEndian::$read(buf)
            }

            #[inline]
            fn encode(&self, buf: &mut [u8]) {
                LittleEndian::$write(buf, *self)
            }
        }

        impl Word for $t {
            const MAX: Self = <$t>::MAX;

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[inline]
            fn from_u64(value: u64) -> Self {
                value as $t
            }
        }
    };
}

impl_word!(u16, 2, read_u16, write_u16);
impl_word!(u32, 4, read_u32, write_u32);
impl_word!(u64, 8, read_u64, write_u64);

macro_rules! impl_signed {
    ($t:ty, $size:expr, $read:ident, $write:ident) => {
        impl FixedCodec for $t {
            const SIZE: usize = $size;

            #[inline]
            fn decode(buf: &[u8]) -> Self {
                LittleEndian::$read(buf)
            }

            #[inline]
            fn encode(&self, buf: &mut [u8]) {
                LittleEndian::$write(buf, *self)
            }
        }
    };
}

impl_signed!(i32, 4, read_i32, write_i32);
impl_signed!(i64, 8, read_i64, write_i64);

/// Key stored in a hash table. The two largest values are reserved as the
/// empty and delete sentinels of key-sentinel buckets.
pub trait HashKey: Word {
    const EMPTY_KEY: Self;
    const DELETE_KEY: Self;
}

impl HashKey for u32 {
    const EMPTY_KEY: Self = u32::MAX;
    const DELETE_KEY: Self = u32::MAX - 1;
}

impl HashKey for u64 {
    const EMPTY_KEY: Self = u64::MAX;
    const DELETE_KEY: Self = u64::MAX - 1;
}

/// Value stored in a hash table. Tables only compare values for equality;
/// the ordering exists so iterators can emit entries in value order.
pub trait HashValue: FixedCodec + Ord + Default {}

impl<T: FixedCodec + Ord + Default> HashValue for T {}

/// A value type that encodes the empty and deleted bucket states itself.
pub trait SpecialValue: HashValue {
    fn empty() -> Self;

    fn is_empty(&self) -> bool;

    fn is_deleted(&self) -> bool;

    /// The tombstone written when this value is deleted.
    fn deleted(self) -> Self;
}

/// A special value whose writes are a single atomic word store, so a
/// reader racing a writer sees either the old or the new value, never a
/// torn mix. Only 4- and 8-byte encodings qualify.
pub trait AtomicValue: SpecialValue + Send + Sync {
    type Cell: Send + Sync;

    fn cell(value: Self) -> Self::Cell;

    fn load(cell: &Self::Cell, order: atomic::Ordering) -> Self;

    fn store(cell: &Self::Cell, value: Self, order: atomic::Ordering);
}

fn delete_sentinel<W: Word>() -> W {
    W::from_u64(W::MAX.to_u64() - 1)
}

/// Offset into a value file; `MAX` marks an empty bucket and `MAX - 1` a
/// deleted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OffsetValue<W: Word> {
    offset: W,
}

impl<W: Word> OffsetValue<W> {
    pub fn new(offset: W) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> W {
        self.offset
    }
}

impl<W: Word> FixedCodec for OffsetValue<W> {
    const SIZE: usize = W::SIZE;

    fn decode(buf: &[u8]) -> Self {
        Self {
            offset: W::decode(buf),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        self.offset.encode(buf)
    }
}

impl<W: Word> SpecialValue for OffsetValue<W> {
    fn empty() -> Self {
        Self { offset: W::MAX }
    }

    fn is_empty(&self) -> bool {
        self.offset == W::MAX
    }

    fn is_deleted(&self) -> bool {
        self.offset == delete_sentinel::<W>()
    }

    fn deleted(self) -> Self {
        Self {
            offset: delete_sentinel::<W>(),
        }
    }
}

impl AtomicValue for OffsetValue<u32> {
    type Cell = AtomicU32;

    fn cell(value: Self) -> AtomicU32 {
        AtomicU32::new(value.offset)
    }

    fn load(cell: &AtomicU32, order: atomic::Ordering) -> Self {
        Self::new(cell.load(order))
    }

    fn store(cell: &AtomicU32, value: Self, order: atomic::Ordering) {
        cell.store(value.offset, order)
    }
}

impl AtomicValue for OffsetValue<u64> {
    type Cell = AtomicU64;

    fn cell(value: Self) -> AtomicU64 {
        AtomicU64::new(value.offset)
    }

    fn load(cell: &AtomicU64, order: atomic::Ordering) -> Self {
        Self::new(cell.load(order))
    }

    fn store(cell: &AtomicU64, value: Self, order: atomic::Ordering) {
        cell.store(value.offset, order)
    }
}

/// A payload word stamped with a write timestamp (seconds). The payload's
/// `MAX` / `MAX - 1` mark empty and deleted; a tombstone keeps its
/// timestamp so TTL decisions still work on deleted keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimestampValue<W: Word> {
    timestamp: u32,
    value: W,
}

impl<W: Word> TimestampValue<W> {
    pub fn new(timestamp: u32, value: W) -> Self {
        Self { timestamp, value }
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn value(&self) -> W {
        self.value
    }
}

impl<W: Word> PartialOrd for TimestampValue<W> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<W: Word> Ord for TimestampValue<W> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then(self.timestamp.cmp(&other.timestamp))
    }
}

impl<W: Word> FixedCodec for TimestampValue<W> {
    const SIZE: usize = 4 + W::SIZE;

    fn decode(buf: &[u8]) -> Self {
        Self {
            timestamp: LittleEndian::read_u32(buf),
            value: W::decode(&buf[4..]),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.timestamp);
        self.value.encode(&mut buf[4..]);
    }
}

impl<W: Word> SpecialValue for TimestampValue<W> {
    fn empty() -> Self {
        Self {
            timestamp: 0,
            value: W::MAX,
        }
    }

    fn is_empty(&self) -> bool {
        self.value == W::MAX
    }

    fn is_deleted(&self) -> bool {
        self.value == delete_sentinel::<W>()
    }

    fn deleted(self) -> Self {
        Self {
            timestamp: self.timestamp,
            value: delete_sentinel::<W>(),
        }
    }
}

impl AtomicValue for TimestampValue<u32> {
    type Cell = AtomicU64;

    fn cell(value: Self) -> AtomicU64 {
        AtomicU64::new(pack_timestamp(value))
    }

    fn load(cell: &AtomicU64, order: atomic::Ordering) -> Self {
        let packed = cell.load(order);
        Self::new(packed as u32, (packed >> 32) as u32)
    }

    fn store(cell: &AtomicU64, value: Self, order: atomic::Ordering) {
        cell.store(pack_timestamp(value), order)
    }
}

fn pack_timestamp(value: TimestampValue<u32>) -> u64 {
    ((value.value as u64) << 32) | value.timestamp as u64
}

/// Payload position inside a value whose trailing word is an offset that
/// can be narrowed by a bucket compressor.
pub trait NarrowableOffset: HashValue {
    /// Byte position of the offset word within the encoded value.
    const OFFSET_POS: usize;
    /// Width of the offset word in bytes.
    const OFFSET_WIDTH: usize;
    /// Whether the word's `MAX` and `MAX - 1` are empty/delete sentinels
    /// rather than stored values.
    const HAS_SENTINELS: bool;
}

impl<W: Word> NarrowableOffset for OffsetValue<W> {
    const OFFSET_POS: usize = 0;
    const OFFSET_WIDTH: usize = W::SIZE;
    const HAS_SENTINELS: bool = true;
}

impl<W: Word> NarrowableOffset for TimestampValue<W> {
    const OFFSET_POS: usize = 4;
    const OFFSET_WIDTH: usize = W::SIZE;
    const HAS_SENTINELS: bool = true;
}

impl NarrowableOffset for u64 {
    const OFFSET_POS: usize = 0;
    const OFFSET_WIDTH: usize = 8;
    const HAS_SENTINELS: bool = false;
}

impl NarrowableOffset for u32 {
    const OFFSET_POS: usize = 0;
    const OFFSET_WIDTH: usize = 4;
    const HAS_SENTINELS: bool = false;
}
