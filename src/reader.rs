//! Point lookups straight from storage.
//!
//! The readers decode only the header at open time and then fetch just the
//! buckets a lookup touches, so a table much larger than memory can be
//! queried through any [`FileReader`].

use std::marker::PhantomData;

use crate::bucket::Bucket;
use crate::codec::Word;
use crate::error::Result;
use crate::io::{read_exact_at, FileReader};
use crate::table::capacity::BLOCK_SIZE;
use crate::table::cuckoo::candidate_block;
use crate::table::header::{CuckooHeader, DenseHeader, TableHeader};
use crate::table::{table_len, to_find_result, FindResult};
use crate::Error;

/// Buckets fetched per read while walking a dense probe sequence.
const PROBE_WINDOW: u64 = 16;

fn read_header<H: TableHeader, R: FileReader>(reader: &R, what: &'static str) -> Result<H> {
    let mut buf = vec![0u8; H::SIZE];
    read_exact_at(reader, &mut buf, 0, what)?;
    H::decode(&buf)
}

fn check_length<B: Bucket, R: FileReader>(reader: &R, header_size: usize, bucket_count: u64) -> Result<()> {
    let needed = table_len::<B>(header_size, bucket_count)?;
    let actual = reader.len()?;
    if actual < needed {
        tracing::error!(needed = needed, actual = actual, "Table file is truncated");
        return Err(Error::BufferTooSmall { needed, actual });
    }
    Ok(())
}

/// Decode the buckets that fill `buf`, starting at bucket `index`.
fn read_buckets<B: Bucket, R: FileReader>(reader: &R, base: usize, index: u64, buf: &mut [u8]) -> Result<Vec<B>> {
    let offset = base as u64 + index * B::SIZE as u64;
    read_exact_at(reader, buf, offset, "bucket")?;
    Ok(buf.chunks_exact(B::SIZE).map(B::decode).collect())
}

/// Lookups against a dense table image.
pub struct DenseFileReader<B: Bucket, R> {
    reader: R,
    header: DenseHeader,
    _bucket: PhantomData<B>,
}

impl<B: Bucket, R: FileReader> DenseFileReader<B, R> {
    pub fn open(reader: R) -> Result<Self> {
        let header: DenseHeader = read_header(&reader, "dense header")?;
        if header.bucket_count == 0 {
            return Err(Error::IndexCorruption("dense table with no buckets".into()));
        }
        check_length::<B, R>(&reader, DenseHeader::SIZE, header.bucket_count)?;
        Ok(DenseFileReader {
            reader,
            header,
            _bucket: PhantomData,
        })
    }

    pub fn header(&self) -> &DenseHeader {
        &self.header
    }

    pub fn find(&self, key: B::Key) -> Result<FindResult<B::Value>> {
        let bucket_count = self.header.bucket_count;
        let mut cell = vec![0u8; B::SIZE];
        if let Some(slot) = B::special_slot(key) {
            let buckets = read_buckets::<B, R>(&self.reader, DenseHeader::SIZE, bucket_count + slot as u64, &mut cell)?;
            return Ok(buckets.first().map_or(FindResult::NotFound, to_find_result));
        }

        let mut window = vec![0u8; (PROBE_WINDOW as usize) * B::SIZE];
        let mut index = key.to_u64() % bucket_count;
        let mut probed = 0;
        while probed < bucket_count {
            let len = PROBE_WINDOW.min(bucket_count - index).min(bucket_count - probed);
            let buf = &mut window[..len as usize * B::SIZE];
            for bucket in read_buckets::<B, R>(&self.reader, DenseHeader::SIZE, index, buf)? {
                if bucket.is_empty() {
                    return Ok(FindResult::NotFound);
                }
                if bucket.is_equal(key) {
                    return Ok(to_find_result(&bucket));
                }
            }
            probed += len;
            index = (index + len) % bucket_count;
        }
        Ok(FindResult::NotFound)
    }
}

/// Lookups against a cuckoo table image. Each probe reads one block.
pub struct CuckooFileReader<B: Bucket, R> {
    reader: R,
    header: CuckooHeader,
    block_count: u64,
    _bucket: PhantomData<B>,
}

impl<B: Bucket, R: FileReader> CuckooFileReader<B, R> {
    pub fn open(reader: R) -> Result<Self> {
        let header: CuckooHeader = read_header(&reader, "cuckoo header")?;
        if header.bucket_count == 0 || header.bucket_count % BLOCK_SIZE != 0 {
            return Err(Error::IndexCorruption(format!(
                "cuckoo bucket count {} is not a positive multiple of {}",
                header.bucket_count, BLOCK_SIZE
            )));
        }
        check_length::<B, R>(&reader, CuckooHeader::SIZE, header.bucket_count)?;
        Ok(CuckooFileReader {
            reader,
            block_count: header.bucket_count / BLOCK_SIZE,
            header,
            _bucket: PhantomData,
        })
    }

    pub fn header(&self) -> &CuckooHeader {
        &self.header
    }

    pub fn find(&self, key: B::Key) -> Result<FindResult<B::Value>> {
        if let Some(slot) = B::special_slot(key) {
            let mut cell = vec![0u8; B::SIZE];
            let index = self.header.bucket_count + slot as u64;
            let buckets = read_buckets::<B, R>(&self.reader, CuckooHeader::SIZE, index, &mut cell)?;
            return Ok(buckets.first().map_or(FindResult::NotFound, to_find_result));
        }

        let mut block = vec![0u8; BLOCK_SIZE as usize * B::SIZE];
        for hash_func_id in 0..self.header.num_hash_func {
            let start = candidate_block(key.to_u64(), hash_func_id, self.block_count) * BLOCK_SIZE;
            let found = read_buckets::<B, R>(&self.reader, CuckooHeader::SIZE, start, &mut block)?
                .into_iter()
                .find(|bucket| !bucket.is_empty() && bucket.is_equal(key));
            if let Some(bucket) = found {
                return Ok(to_find_result(&bucket));
            }
        }
        Ok(FindResult::NotFound)
    }
}
