use std::marker::PhantomData;

use crate::bucket::{read_bucket, special_bucket_count, Bucket};
use crate::error::Result;
use crate::io::{read_exact_at, FileReader};
use crate::iterator::{HashTableFileIterator, DEFAULT_BUFFER_SIZE};
use crate::table::{table_len, TableHeader};
use crate::Error;

/// Streams the buckets of a persisted table through a fixed read buffer.
/// Memory use does not depend on the table size, and sorting is refused.
pub struct ClosedHashTableBufferedFileIterator<H, B: Bucket, R> {
    reader: R,
    header: H,
    buffer: Vec<u8>,
    /// Bucket index held at the start of `buffer`
    buffer_index: u64,
    /// Buckets currently held in `buffer`
    buffered: u64,
    position: u64,
    total: u64,
    current: Option<B>,
    _bucket: PhantomData<B>,
}

impl<H: TableHeader, B: Bucket, R: FileReader> ClosedHashTableBufferedFileIterator<H, B, R> {
    pub fn open(reader: R) -> Result<Self> {
        Self::with_buffer_size(reader, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(reader: R, buffer_size: usize) -> Result<Self> {
        let mut bytes = vec![0u8; H::SIZE];
        read_exact_at(&reader, &mut bytes, 0, "header")?;
        let header = H::decode(&bytes)?;

        let needed = table_len::<B>(H::SIZE, header.bucket_count())?;
        let actual = reader.len()?;
        if actual < needed {
            tracing::error!(
                needed = needed,
                actual = actual,
                bucket_count = header.bucket_count(),
                "Table file is shorter than its header claims"
            );
            return Err(Error::BufferTooSmall { needed, actual });
        }
        let total = header.bucket_count() + special_bucket_count::<B>() as u64;

        let buckets_per_read = (buffer_size / B::SIZE).max(1);
        let mut iter = ClosedHashTableBufferedFileIterator {
            reader,
            header,
            buffer: vec![0u8; buckets_per_read * B::SIZE],
            buffer_index: 0,
            buffered: 0,
            position: 0,
            total,
            current: None,
            _bucket: PhantomData,
        };
        iter.advance_from(0)?;
        Ok(iter)
    }

    pub fn header(&self) -> &H {
        &self.header
    }

    fn load(&mut self, index: u64) -> Result<B> {
        if index < self.buffer_index || index >= self.buffer_index + self.buffered {
            let capacity = (self.buffer.len() / B::SIZE) as u64;
            let count = capacity.min(self.total - index);
            let len = count as usize * B::SIZE;
            let offset = H::SIZE as u64 + index * B::SIZE as u64;
            read_exact_at(&self.reader, &mut self.buffer[..len], offset, "bucket")?;
            self.buffer_index = index;
            self.buffered = count;
        }
        Ok(read_bucket(&self.buffer, 0, index - self.buffer_index))
    }

    /// Settle on the first non-empty bucket at or after `index`.
    fn advance_from(&mut self, mut index: u64) -> Result<()> {
        while index < self.total {
            let bucket = self.load(index)?;
            if !bucket.is_empty() {
                self.position = index;
                self.current = Some(bucket);
                return Ok(());
            }
            index += 1;
        }
        self.position = self.total;
        self.current = None;
        Ok(())
    }

    fn bucket(&self) -> &B {
        self.current
            .as_ref()
            .unwrap_or_else(|| panic!("iterator read past position {}", self.position))
    }
}

impl<H: TableHeader, B: Bucket, R: FileReader> HashTableFileIterator
    for ClosedHashTableBufferedFileIterator<H, B, R>
{
    type Key = B::Key;
    type Value = B::Value;

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn move_to_next(&mut self) -> Result<()> {
        debug_assert!(self.is_valid());
        self.advance_from(self.position + 1)
    }

    fn key(&self) -> B::Key {
        let bucket_count = self.header.bucket_count();
        if self.position >= bucket_count {
            B::special_key((self.position - bucket_count) as usize)
        } else {
            self.bucket().key()
        }
    }

    fn value(&self) -> B::Value {
        self.bucket().value()
    }

    fn is_deleted(&self) -> bool {
        self.bucket().is_deleted()
    }

    fn sort_by_key(&mut self) -> Result<()> {
        Err(Error::InvalidOperation(
            "buffered iterator cannot sort; use the materializing iterator".into(),
        ))
    }

    fn sort_by_value(&mut self) -> Result<()> {
        self.sort_by_key()
    }

    /// `offset` is a byte position in the table file.
    fn seek(&mut self, offset: u64) -> Result<()> {
        let relative = offset.checked_sub(H::SIZE as u64);
        match relative {
            Some(relative) if relative % B::SIZE as u64 == 0 => {
                self.advance_from(relative / B::SIZE as u64)
            }
            _ => Err(Error::InvalidOperation(format!(
                "offset {} is not a bucket boundary",
                offset
            ))),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.advance_from(0)
    }

    fn offset(&self) -> u64 {
        H::SIZE as u64 + self.position * B::SIZE as u64
    }

    fn key_count(&self) -> u64 {
        self.header.key_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::SpecialKeyBucket;
    use byteorder::{ByteOrder, LittleEndian};
    use crate::config::HashTableOptions;
    use crate::table::capacity::dense_table_memory;
    use crate::table::{CuckooHashTable, CuckooHeader, DenseHashTable, DenseHeader, HashTable};
    use std::io::Write;

    type KeyBucket = SpecialKeyBucket<u64, u32>;
    type DenseIter<R> = ClosedHashTableBufferedFileIterator<DenseHeader, KeyBucket, R>;

    fn dense_table() -> Vec<u8> {
        let mut buf = vec![0u8; dense_table_memory::<KeyBucket>(64) as usize];
        let mut table =
            DenseHashTable::<KeyBucket, _>::mount_for_write(&mut buf[..], &HashTableOptions::new(50)).unwrap();
        for key in 0..20u64 {
            assert!(table.insert(key * 3, key as u32));
        }
        assert!(table.delete(9, 0));
        assert!(table.insert(u64::MAX, 77));
        buf
    }

    fn drain<I: HashTableFileIterator<Key = u64, Value = u32>>(iter: &mut I) -> Vec<(u64, u32, bool)> {
        let mut out = Vec::new();
        while iter.is_valid() {
            out.push((iter.key(), iter.value(), iter.is_deleted()));
            iter.move_to_next().expect("Failed to advance");
        }
        out
    }

    #[test]
    fn test_streams_every_bucket_with_small_buffer() {
        let buf = dense_table();
        let mut expected = {
            let mut iter = DenseIter::open(buf.clone()).unwrap();
            drain(&mut iter)
        };
        // one bucket per read forces a refill on every step
        let mut iter = DenseIter::with_buffer_size(&buf, 1).unwrap();
        let mut seen = drain(&mut iter);
        assert_eq!(seen.len(), 21);
        assert_eq!(iter.key_count(), 21);
        assert_eq!(seen.last(), Some(&(u64::MAX, 77, false)));
        assert!(seen.contains(&(9, 0, true)));

        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_reads_from_file() {
        let buf = dense_table();
        let mut file = tempfile::tempfile().expect("Failed to create temp file");
        file.write_all(&buf).unwrap();
        file.flush().unwrap();

        let mut iter = DenseIter::open(file).expect("Failed to open iterator");
        assert_eq!(drain(&mut iter).len(), 21);
    }

    #[test]
    fn test_seek_and_reset() {
        let buf = dense_table();
        let mut iter = DenseIter::open(&buf).unwrap();
        let first = iter.key();
        iter.move_to_next().unwrap();
        let offset = iter.offset();
        let second = iter.key();

        iter.reset().unwrap();
        assert_eq!(iter.key(), first);
        iter.seek(offset).unwrap();
        assert_eq!(iter.key(), second);
        assert!(iter.seek(offset + 1).is_err());
        assert!(iter.seek(3).is_err());
    }

    #[test]
    fn test_sorting_is_refused() {
        let buf = dense_table();
        let mut iter = DenseIter::open(&buf).unwrap();
        assert!(matches!(iter.sort_by_key(), Err(Error::InvalidOperation(_))));
        assert!(matches!(iter.sort_by_value(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let mut buf = dense_table();
        buf.truncate(buf.len() - 5);
        assert!(matches!(DenseIter::open(&buf), Err(Error::BufferTooSmall { .. })));
        assert!(matches!(DenseIter::open(&buf[..10]), Err(Error::ShortRead { .. })));
    }

    #[test]
    fn test_overflowing_bucket_count_is_corruption() {
        let mut buf = dense_table();
        LittleEndian::write_u64(&mut buf[0..8], u64::MAX / 4);
        assert!(matches!(DenseIter::open(&buf), Err(Error::IndexCorruption(_))));
    }

    #[test]
    fn test_cuckoo_table_file() {
        let size = crate::table::capacity::cuckoo_capacity_to_table_memory::<KeyBucket>(50, 80, false);
        let mut buf = vec![0u8; size as usize];
        {
            let mut table =
                CuckooHashTable::<KeyBucket, _>::mount_for_write(&mut buf[..], &HashTableOptions::default())
                    .unwrap();
            for key in 100..150u64 {
                assert!(table.insert(key, key as u32));
            }
        }
        let mut iter =
            ClosedHashTableBufferedFileIterator::<CuckooHeader, KeyBucket, _>::open(&buf).unwrap();
        let mut keys: Vec<u64> = drain(&mut iter).into_iter().map(|e| e.0).collect();
        keys.sort_unstable();
        assert_eq!(keys, (100..150).collect::<Vec<_>>());
    }
}
