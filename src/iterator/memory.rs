use crate::bucket::{fill_empty, read_bucket, special_bucket_count, write_bucket, Bucket};
use crate::iterator::{compare_by_key, compare_by_value, Entry};

/// Cursor over a mounted bucket region: `bucket_count` buckets followed by
/// the special buckets, which appear as extra positions past the array.
pub struct ClosedHashTableIterator<B: Bucket, R> {
    region: R,
    bucket_count: u64,
    total: u64,
    position: u64,
    current: Option<B>,
}

impl<B: Bucket, R: AsRef<[u8]>> ClosedHashTableIterator<B, R> {
    pub fn new(region: R, bucket_count: u64) -> Self {
        let total = bucket_count + special_bucket_count::<B>() as u64;
        debug_assert!(region.as_ref().len() >= total as usize * B::SIZE);
        let mut iter = ClosedHashTableIterator {
            region,
            bucket_count,
            total,
            position: 0,
            current: None,
        };
        iter.skip_empty();
        iter
    }

    fn skip_empty(&mut self) {
        while self.position < self.total {
            let bucket: B = read_bucket(self.region.as_ref(), 0, self.position);
            if !bucket.is_empty() {
                self.current = Some(bucket);
                return;
            }
            self.position += 1;
        }
        self.current = None;
    }

    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn move_to_next(&mut self) {
        debug_assert!(self.is_valid());
        self.position += 1;
        self.skip_empty();
    }

    fn bucket(&self) -> &B {
        self.current
            .as_ref()
            .unwrap_or_else(|| panic!("iterator read past position {}", self.position))
    }

    pub fn key(&self) -> B::Key {
        if self.position >= self.bucket_count {
            B::special_key((self.position - self.bucket_count) as usize)
        } else {
            self.bucket().key()
        }
    }

    pub fn value(&self) -> B::Value {
        self.bucket().value()
    }

    pub fn is_deleted(&self) -> bool {
        self.bucket().is_deleted()
    }

    pub fn entry(&self) -> Entry<B::Key, B::Value> {
        Entry {
            key: self.key(),
            value: self.value(),
            deleted: self.is_deleted(),
        }
    }

    /// Bucket index of the cursor.
    pub fn offset(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
        self.skip_empty();
    }

    pub fn reset(&mut self) {
        self.seek(0);
    }
}

impl<B: Bucket, R: AsRef<[u8]> + AsMut<[u8]>> ClosedHashTableIterator<B, R> {
    pub fn sort_by_key(&mut self) {
        self.sort_with(compare_by_key);
    }

    pub fn sort_by_value(&mut self) {
        self.sort_with(compare_by_value);
    }

    /// Pack the non-empty main buckets to the front of the array in the
    /// given order. Special buckets keep their positions.
    fn sort_with<F>(&mut self, compare: F)
    where
        F: Fn(&Entry<B::Key, B::Value>, &Entry<B::Key, B::Value>) -> std::cmp::Ordering,
    {
        let region = self.region.as_mut();
        let mut buckets: Vec<(Entry<B::Key, B::Value>, B)> = (0..self.bucket_count)
            .map(|i| read_bucket::<B>(region, 0, i))
            .filter(|b| !b.is_empty())
            .map(|b| {
                let entry = Entry {
                    key: b.key(),
                    value: b.value(),
                    deleted: b.is_deleted(),
                };
                (entry, b)
            })
            .collect();
        buckets.sort_by(|a, b| compare(&a.0, &b.0));

        for (i, (_, bucket)) in buckets.iter().enumerate() {
            write_bucket(region, 0, i as u64, bucket);
        }
        let packed = buckets.len() as u64;
        fill_empty::<B>(region, 0, packed, self.bucket_count - packed);
        self.reset();
    }
}
