pub mod bucket;
pub mod codec;
pub mod compress;
pub mod config;
pub mod error;
pub mod hash;
pub mod io;
pub mod iterator;
pub mod reader;
pub mod table;

pub use bucket::{Bucket, CompactBucket, SpecialKeyBucket, SpecialValueBucket};
pub use codec::{HashKey, HashValue, OffsetValue, SpecialValue, TimestampValue};
pub use compress::{BucketCompressor, OffsetBucketCompressor};
pub use config::HashTableOptions;
pub use error::{Error, Result};
pub use io::FileReader;
pub use iterator::{
    ClosedHashTableBufferedFileIterator, ClosedHashTableFileIterator, ClosedHashTableIterator,
    HashTableFileIterator,
};
pub use reader::{CuckooFileReader, DenseFileReader};
pub use table::{
    ChainHashTable, CuckooHashTable, DenseHashTable, FindResult, HashTable, HashTableReader,
    ReadWriteDenseTable, Status, TableKind,
};
