//! Table headers. Each table kind writes a fixed-size little-endian header
//! immediately before its bucket array.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Read;

use crate::error::Result;
use crate::Error;

/// 16 bytes: bucket_count, key_count
pub const DENSE_HEADER_SIZE: usize = 16;

/// 32 bytes: version, num_hash_func, max_num_hash_func, 5 pad, stretch_size,
/// bucket_count, key_count
pub const CUCKOO_HEADER_SIZE: usize = 32;

pub const CUCKOO_HEADER_VERSION: u8 = 1;

/// Common view over the header of any closed hash table.
pub trait TableHeader: Copy + std::fmt::Debug {
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Write the header into the first `SIZE` bytes of `bytes`. Mount code
    /// checks the region size up front, so this cannot fail.
    fn encode(&self, bytes: &mut [u8]);

    fn bucket_count(&self) -> u64;

    fn key_count(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DenseHeader {
    pub bucket_count: u64,
    pub key_count: u64,
}

impl TableHeader for DenseHeader {
    const SIZE: usize = DENSE_HEADER_SIZE;

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidHeader);
        }
        let mut reader = bytes;
        let bucket_count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("bucket_count", e))?;
        let key_count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("key_count", e))?;
        Ok(DenseHeader {
            bucket_count,
            key_count,
        })
    }

    fn encode(&self, bytes: &mut [u8]) {
        LittleEndian::write_u64(&mut bytes[0..8], self.bucket_count);
        LittleEndian::write_u64(&mut bytes[8..16], self.key_count);
    }

    fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    fn key_count(&self) -> u64 {
        self.key_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuckooHeader {
    pub version: u8,
    pub num_hash_func: u8,
    pub max_num_hash_func: u8,
    /// Bytes reserved after the bucket array for one `stretch`
    pub stretch_size: u64,
    pub bucket_count: u64,
    pub key_count: u64,
}

impl Default for CuckooHeader {
    fn default() -> Self {
        CuckooHeader {
            version: CUCKOO_HEADER_VERSION,
            num_hash_func: 2,
            max_num_hash_func: crate::config::DEFAULT_MAX_NUM_HASH_FUNC,
            stretch_size: 0,
            bucket_count: 0,
            key_count: 0,
        }
    }
}

impl TableHeader for CuckooHeader {
    const SIZE: usize = CUCKOO_HEADER_SIZE;

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidHeader);
        }
        let mut reader = bytes;
        let version = reader.read_u8().map_err(|e| Error::Decode("version", e))?;
        let num_hash_func = reader
            .read_u8()
            .map_err(|e| Error::Decode("num_hash_func", e))?;
        let max_num_hash_func = reader
            .read_u8()
            .map_err(|e| Error::Decode("max_num_hash_func", e))?;
        let mut padding = [0u8; 5];
        reader
            .read_exact(&mut padding)
            .map_err(|e| Error::Decode("padding", e))?;
        let stretch_size = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("stretch_size", e))?;
        let bucket_count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("bucket_count", e))?;
        let key_count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("key_count", e))?;

        if num_hash_func < 2 || num_hash_func > max_num_hash_func {
            return Err(Error::IndexCorruption(format!(
                "num_hash_func {} outside [2, {}]",
                num_hash_func, max_num_hash_func
            )));
        }

        Ok(CuckooHeader {
            version,
            num_hash_func,
            max_num_hash_func,
            stretch_size,
            bucket_count,
            key_count,
        })
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[0] = self.version;
        bytes[1] = self.num_hash_func;
        bytes[2] = self.max_num_hash_func;
        bytes[3..8].fill(0);
        LittleEndian::write_u64(&mut bytes[8..16], self.stretch_size);
        LittleEndian::write_u64(&mut bytes[16..24], self.bucket_count);
        LittleEndian::write_u64(&mut bytes[24..32], self.key_count);
    }

    fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    fn key_count(&self) -> u64 {
        self.key_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_header_layout() {
        let header = DenseHeader {
            bucket_count: 8,
            key_count: 3,
        };
        let mut buf = vec![0u8; DENSE_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(&buf[..8], &8u64.to_le_bytes());
        assert_eq!(&buf[8..], &3u64.to_le_bytes());
        assert_eq!(DenseHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_cuckoo_header_layout() {
        let header = CuckooHeader {
            num_hash_func: 3,
            stretch_size: 1024,
            bucket_count: 64,
            key_count: 40,
            ..Default::default()
        };
        let mut buf = vec![0xFFu8; CUCKOO_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(buf[0], CUCKOO_HEADER_VERSION);
        assert_eq!(buf[1], 3);
        assert_eq!(buf[2], 8);
        assert_eq!(&buf[3..8], &[0u8; 5], "padding must be zeroed");
        assert_eq!(CuckooHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_short_header_is_rejected() {
        assert!(matches!(
            DenseHeader::decode(&[0u8; 15]),
            Err(Error::InvalidHeader)
        ));
        assert!(matches!(
            CuckooHeader::decode(&[0u8; 31]),
            Err(Error::InvalidHeader)
        ));
    }

    #[test]
    fn test_cuckoo_header_rejects_bad_hash_func_count() {
        let header = CuckooHeader {
            num_hash_func: 9,
            ..Default::default()
        };
        let mut buf = vec![0u8; CUCKOO_HEADER_SIZE];
        header.encode(&mut buf);
        assert!(matches!(
            CuckooHeader::decode(&buf),
            Err(Error::IndexCorruption(_))
        ));
    }
}
