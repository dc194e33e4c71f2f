use crate::bucket::Bucket;
use crate::error::Result;
use crate::io::FileReader;
use crate::iterator::{
    compare_by_key, compare_by_value, ClosedHashTableBufferedFileIterator, Entry,
    HashTableFileIterator,
};
use crate::table::TableHeader;
use crate::Error;

/// Loads every non-empty bucket of a persisted table so the entries can be
/// sorted. Offsets are entry indexes.
pub struct ClosedHashTableFileIterator<H, B: Bucket> {
    header: H,
    entries: Vec<Entry<B::Key, B::Value>>,
    cursor: usize,
}

impl<H: TableHeader, B: Bucket> ClosedHashTableFileIterator<H, B> {
    pub fn open<R: FileReader>(reader: R) -> Result<Self> {
        let mut stream = ClosedHashTableBufferedFileIterator::<H, B, R>::open(reader)?;
        let mut entries = Vec::new();
        while stream.is_valid() {
            entries.push(Entry {
                key: stream.key(),
                value: stream.value(),
                deleted: stream.is_deleted(),
            });
            stream.move_to_next()?;
        }

        if entries.len() as u64 != stream.key_count() {
            tracing::error!(
                header_key_count = stream.key_count(),
                loaded = entries.len(),
                "Key count differs from the buckets found"
            );
            return Err(Error::IndexCorruption(format!(
                "header records {} keys but {} buckets are occupied",
                stream.key_count(),
                entries.len()
            )));
        }

        Ok(ClosedHashTableFileIterator {
            header: *stream.header(),
            entries,
            cursor: 0,
        })
    }

    pub fn entries(&self) -> &[Entry<B::Key, B::Value>] {
        &self.entries
    }

    fn entry(&self) -> &Entry<B::Key, B::Value> {
        &self.entries[self.cursor]
    }
}

impl<H: TableHeader, B: Bucket> HashTableFileIterator for ClosedHashTableFileIterator<H, B> {
    type Key = B::Key;
    type Value = B::Value;

    fn is_valid(&self) -> bool {
        self.cursor < self.entries.len()
    }

    fn move_to_next(&mut self) -> Result<()> {
        debug_assert!(self.is_valid());
        self.cursor += 1;
        Ok(())
    }

    fn key(&self) -> B::Key {
        self.entry().key
    }

    fn value(&self) -> B::Value {
        self.entry().value
    }

    fn is_deleted(&self) -> bool {
        self.entry().deleted
    }

    fn sort_by_key(&mut self) -> Result<()> {
        self.entries.sort_by(compare_by_key);
        self.cursor = 0;
        Ok(())
    }

    fn sort_by_value(&mut self) -> Result<()> {
        self.entries.sort_by(compare_by_value);
        self.cursor = 0;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.entries.len() as u64 {
            return Err(Error::InvalidOperation(format!(
                "seek to {} past {} entries",
                offset,
                self.entries.len()
            )));
        }
        self.cursor = offset as usize;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.cursor as u64
    }

    fn key_count(&self) -> u64 {
        self.header.key_count()
    }
}
