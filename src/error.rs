use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    Decode(&'static str, io::Error),
    BufferTooSmall { needed: u64, actual: u64 },
    ShortRead {
        what: &'static str,
        offset: u64,
        expected: usize,
        actual: usize,
    },
    IndexCorruption(String),
    InvalidOperation(String),
    InvalidOptions(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::BufferTooSmall { needed, actual } => write!(
                f,
                "Buffer too small: need {} bytes, got {}",
                needed, actual
            ),
            Error::ShortRead {
                what,
                offset,
                expected,
                actual,
            } => write!(
                f,
                "Short read of {} at offset {}: expected {} bytes, got {}",
                what, offset, expected, actual
            ),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidOptions(msg) => write!(f, "Invalid options: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
