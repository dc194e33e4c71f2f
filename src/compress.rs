//! Post-processing bucket compression.
//!
//! Once a table is finalized, a [`BucketCompressor`] can rewrite every
//! bucket into a narrower layout. [`OffsetBucketCompressor`] narrows the
//! offset word of offset-carrying values (for example `u64` offsets down to
//! [`ShortOffset`](crate::codec::ShortOffset)) when the value file is small
//! enough; the result reads back as a [`CompactBucket`](crate::bucket::CompactBucket).

use byteorder::{ByteOrder, LittleEndian};

use crate::bucket::Bucket;
use crate::codec::NarrowableOffset;
use crate::error::Result;
use crate::Error;

pub trait BucketCompressor {
    /// Encoded size of one bucket after compression.
    fn compressed_size(&self, bucket_size: usize) -> usize;

    /// Compress one bucket from `input` into `output`, returning the bytes
    /// written.
    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

/// Narrows the offset word of every bucket, keeping the surrounding bytes.
#[derive(Debug, Clone, Copy)]
pub struct OffsetBucketCompressor {
    offset_pos: usize,
    from_width: usize,
    to_width: usize,
    sentinels: bool,
}

impl OffsetBucketCompressor {
    /// Compressor for buckets of format `B` whose offset word is narrowed to
    /// `to_width` bytes.
    pub fn new<B>(to_width: usize) -> Result<Self>
    where
        B: Bucket,
        B::Value: NarrowableOffset,
    {
        let from_width = <B::Value as NarrowableOffset>::OFFSET_WIDTH;
        if !matches!(to_width, 2 | 4 | 8) || to_width > from_width {
            return Err(Error::InvalidOptions(format!(
                "cannot narrow a {}-byte offset to {} bytes",
                from_width, to_width
            )));
        }
        Ok(OffsetBucketCompressor {
            offset_pos: B::VALUE_OFFSET + <B::Value as NarrowableOffset>::OFFSET_POS,
            from_width,
            to_width,
            sentinels: <B::Value as NarrowableOffset>::HAS_SENTINELS,
        })
    }

    fn narrow(&self, offset: u64) -> Result<u64> {
        let from_max = width_max(self.from_width);
        let to_max = width_max(self.to_width);
        // plain integers have no sentinels, every value must fit as is
        let limit = if self.sentinels {
            // empty and delete sentinels map onto the narrower ones
            if offset == from_max {
                return Ok(to_max);
            }
            if offset == from_max - 1 {
                return Ok(to_max - 1);
            }
            to_max - 2
        } else {
            to_max
        };
        if offset > limit {
            return Err(Error::InvalidOperation(format!(
                "offset {} does not fit in {} bytes",
                offset, self.to_width
            )));
        }
        Ok(offset)
    }
}

fn width_max(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

impl BucketCompressor for OffsetBucketCompressor {
    fn compressed_size(&self, bucket_size: usize) -> usize {
        bucket_size - self.from_width + self.to_width
    }

    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let size = self.compressed_size(input.len());
        if output.len() < size {
            return Err(Error::BufferTooSmall {
                needed: size as u64,
                actual: output.len() as u64,
            });
        }

        let pos = self.offset_pos;
        let offset = LittleEndian::read_uint(&input[pos..], self.from_width);
        let narrowed = self.narrow(offset)?;

        output[..pos].copy_from_slice(&input[..pos]);
        LittleEndian::write_uint(&mut output[pos..], narrowed, self.to_width);
        let tail = pos + self.from_width;
        output[pos + self.to_width..size].copy_from_slice(&input[tail..]);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{CompactBucket, SpecialKeyBucket, SpecialValueBucket};
    use crate::codec::{OffsetValue, SpecialValue};

    type WideBucket = SpecialValueBucket<u64, OffsetValue<u64>>;

    fn encode(bucket: &WideBucket) -> Vec<u8> {
        let mut buf = vec![0u8; WideBucket::SIZE];
        bucket.encode(&mut buf);
        buf
    }

    #[test]
    fn test_narrow_live_bucket() {
        let compressor = OffsetBucketCompressor::new::<WideBucket>(2).unwrap();
        assert_eq!(compressor.compressed_size(WideBucket::SIZE), CompactBucket::<u64>::SIZE);

        let mut bucket = WideBucket::empty();
        bucket.set(77, OffsetValue::new(1234));
        let mut out = vec![0u8; 10];
        assert_eq!(compressor.compress(&encode(&bucket), &mut out).unwrap(), 10);

        let compact = CompactBucket::<u64>::decode(&out);
        assert_eq!(compact.key(), 77);
        assert_eq!(compact.value().offset(), 1234);
    }

    #[test]
    fn test_sentinels_are_remapped() {
        let compressor = OffsetBucketCompressor::new::<WideBucket>(2).unwrap();
        let mut out = vec![0u8; 10];

        compressor.compress(&encode(&WideBucket::empty()), &mut out).unwrap();
        assert!(CompactBucket::<u64>::decode(&out).is_empty());

        let mut bucket = WideBucket::empty();
        bucket.set_delete(5, OffsetValue::new(9));
        compressor.compress(&encode(&bucket), &mut out).unwrap();
        let compact = CompactBucket::<u64>::decode(&out);
        assert!(compact.is_deleted());
        assert!(compact.value().is_deleted());
        assert_eq!(compact.key(), 5);
    }

    #[test]
    fn test_overflowing_offset_is_rejected() {
        let compressor = OffsetBucketCompressor::new::<WideBucket>(2).unwrap();
        let mut bucket = WideBucket::empty();
        bucket.set(1, OffsetValue::new(70_000));
        let mut out = vec![0u8; 10];
        assert!(matches!(
            compressor.compress(&encode(&bucket), &mut out),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_plain_values_are_never_remapped() {
        type PlainBucket = SpecialKeyBucket<u64, u64>;
        let compressor = OffsetBucketCompressor::new::<PlainBucket>(2).unwrap();
        let mut input = vec![0u8; PlainBucket::SIZE];
        let mut out = vec![0u8; compressor.compressed_size(PlainBucket::SIZE)];

        let mut bucket = PlainBucket::empty();
        bucket.set(3, u64::MAX - 1);
        bucket.encode(&mut input);
        assert!(matches!(
            compressor.compress(&input, &mut out),
            Err(Error::InvalidOperation(_))
        ));

        bucket.set(3, u16::MAX as u64);
        bucket.encode(&mut input);
        compressor.compress(&input, &mut out).unwrap();
        let narrow = SpecialKeyBucket::<u64, u16>::decode(&out);
        assert_eq!(narrow.key(), 3);
        assert_eq!(narrow.value(), u16::MAX);
        assert!(!narrow.is_deleted());
    }

    #[test]
    fn test_invalid_widths() {
        assert!(OffsetBucketCompressor::new::<WideBucket>(3).is_err());
        assert!(OffsetBucketCompressor::new::<SpecialValueBucket<u64, OffsetValue<u32>>>(8).is_err());
    }
}
