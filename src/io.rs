//! Byte-addressable storage regions consumed by the file iterators and
//! file readers.

use std::fs::File;

use crate::error::Result;
use crate::Error;

/// Positional reads over an immutable storage region.
pub trait FileReader {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were
    /// read. Zero means end of region.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Size of the region. Fails when the size cannot be determined.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl FileReader for [u8] {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn len(&self) -> Result<u64> {
        Ok(<[u8]>::len(self) as u64)
    }
}

impl FileReader for Vec<u8> {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.as_slice().read(buf, offset)
    }

    fn len(&self) -> Result<u64> {
        Ok(Vec::len(self) as u64)
    }
}

impl FileReader for File {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.read_at(buf, offset)?)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            Ok(self.seek_read(buf, offset)?)
        }
    }

    fn len(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<T: FileReader + ?Sized> FileReader for &T {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read(buf, offset)
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }
}

/// Fill `buf` from `offset`, failing with `ShortRead` when the region ends
/// first.
pub(crate) fn read_exact_at<R: FileReader + ?Sized>(
    reader: &R,
    buf: &mut [u8],
    offset: u64,
    what: &'static str,
) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = reader.read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(Error::ShortRead {
                what,
                offset,
                expected: buf.len(),
                actual: done,
            });
        }
        done += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_slice_reader() {
        let data: Vec<u8> = (0..10).collect();
        let mut buf = [0u8; 4];
        assert_eq!(data.read(&mut buf, 8).unwrap(), 2);
        assert_eq!(&buf[..2], &[8, 9]);
        assert_eq!(data.read(&mut buf, 10).unwrap(), 0);
        assert_eq!(FileReader::len(&data).unwrap(), 10);
        assert!(!FileReader::is_empty(&data).unwrap());
    }

    #[test]
    fn test_read_exact_at_short_read() {
        let data = vec![1u8, 2, 3];
        let mut buf = [0u8; 4];
        match read_exact_at(&data, &mut buf, 0, "bucket") {
            Err(Error::ShortRead {
                what,
                expected,
                actual,
                ..
            }) => {
                assert_eq!(what, "bucket");
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected ShortRead, got {:?}", other),
        }
    }

    #[test]
    fn test_file_reader() {
        let mut file = tempfile::tempfile().expect("Failed to create temp file");
        file.write_all(b"hello world").expect("Failed to write");
        file.flush().expect("Failed to flush");

        let mut buf = [0u8; 5];
        read_exact_at(&file, &mut buf, 6, "tail").expect("Failed to read");
        assert_eq!(&buf, b"world");
        assert_eq!(FileReader::len(&file).unwrap(), 11);
    }
}
