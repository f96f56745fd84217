use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One cached attribute blob.
///
/// `generation` tags the WAL rotation epoch the item was last mutated in;
/// `processed` asserts that the item's latest state has been durably written
/// to the attribute store and is the precondition for eviction. Items are
/// replaced wholesale on update, so only the bookkeeping fields are mutable.
#[derive(Debug)]
pub struct CacheItem {
    pub key: u64,
    data: Bytes,
    ttl: Option<Duration>,
    generation: u64,
    born: Instant,
    last_update: Instant,
    last_access_ms: AtomicU64,
    access_count: AtomicU64,
    tombstoned: AtomicBool,
    processed: AtomicBool,
}

impl CacheItem {
    pub fn new(key: u64, data: Bytes, generation: u64, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            key,
            data,
            ttl,
            generation,
            born: now,
            last_update: now,
            last_access_ms: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
            tombstoned: AtomicBool::new(false),
            processed: AtomicBool::new(false),
        }
    }

    /// Rebuild an item from a replayed WAL record. Replayed items are never
    /// pre-marked processed: the segment they came from has not been dumped.
    pub fn from_replay(key: u64, data: Bytes, tombstoned: bool, generation: u64) -> Self {
        let item = Self::new(key, data, generation, None);
        item.tombstoned.store(tombstoned, Ordering::Relaxed);
        item
    }

    pub fn data(&self) -> Bytes {
        self.data.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    pub fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms
            .store(self.born.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => {
                let since_access = (self.born.elapsed().as_millis() as u64)
                    .saturating_sub(self.last_access_ms.load(Ordering::Relaxed));
                Duration::from_millis(since_access) > ttl
            }
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Relaxed)
    }

    pub fn set_tombstoned(&self, tombstoned: bool) {
        self.tombstoned.store(tombstoned, Ordering::Relaxed);
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn set_processed(&self, processed: bool) {
        self.processed.store(processed, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_counts_accesses() {
        let item = CacheItem::new(1, Bytes::from_static(b"x"), 0, None);
        assert_eq!(item.access_count(), 0);
        item.touch();
        item.touch();
        assert_eq!(item.access_count(), 2);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let item = CacheItem::new(1, Bytes::from_static(b"x"), 0, None);
        assert!(!item.expired());
    }

    #[test]
    fn test_ttl_expiry() {
        let item = CacheItem::new(1, Bytes::from_static(b"x"), 0, Some(Duration::from_millis(5)));
        assert!(!item.expired());
        std::thread::sleep(Duration::from_millis(20));
        assert!(item.expired());
        // A fresh access resets the clock.
        item.touch();
        assert!(!item.expired());
    }

    #[test]
    fn test_replayed_item_is_unprocessed() {
        let item = CacheItem::from_replay(9, Bytes::from_static(b"v"), true, 3);
        assert!(item.is_tombstoned());
        assert!(!item.is_processed());
        assert_eq!(item.generation(), 3);
    }
}
