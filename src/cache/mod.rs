//! Generation-swept write-back cache for inode attributes.
//!
//! Every mutation is mirrored into the WAL through the observer before the
//! caller sees success. A 1 Hz sweeper rotates the generation and fires the
//! full-callback (WAL rotation + dump) once the table outgrows its threshold,
//! marks items processed as the dump reports flushed keys, expires TTLs, and
//! evicts processed items from old generations whose access count is at or
//! below the mean. The table lock is never held across observer calls or
//! disk I/O.

pub mod item;

use crate::fs::errors::FsError;
use crate::task::spawn_named;
use async_trait::async_trait;
use bytes::Bytes;
use item::CacheItem;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// How the engine hears about cache activity. `on_add`/`on_del` must make the
/// mutation durable (WAL append) before returning; `on_full` rotates the WAL
/// and streams flushed keys back on `output`.
#[async_trait]
pub trait CacheObserver: Send + Sync + 'static {
    fn on_add(&self, key: u64, data: &Bytes) -> Result<(), FsError>;
    fn on_del(&self, key: u64, data: &Bytes) -> Result<(), FsError>;
    async fn on_full(&self, output: mpsc::UnboundedSender<u64>) -> Result<(), FsError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum CacheGet {
    Hit(Bytes),
    Deleted,
    Miss,
}

#[derive(Default)]
struct CacheInner {
    table: HashMap<u64, Arc<CacheItem>>,
    mutations: usize,
}

pub struct AttrCache {
    inner: RwLock<CacheInner>,
    generation: AtomicU64,
    threshold: usize,
    min_size: usize,
    full_running: AtomicBool,
    observer: Arc<dyn CacheObserver>,
    shutdown: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AttrCache {
    pub fn new(threshold: usize, observer: Arc<dyn CacheObserver>) -> Arc<Self> {
        let cache = Arc::new(Self {
            inner: RwLock::new(CacheInner::default()),
            generation: AtomicU64::new(0),
            threshold,
            min_size: threshold / 2,
            full_running: AtomicBool::new(false),
            observer,
            shutdown: CancellationToken::new(),
            sweeper: std::sync::Mutex::new(None),
        });

        let sweeper = {
            let cache = Arc::clone(&cache);
            spawn_named("attr-cache-sweeper", async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cache.shutdown.cancelled() => return,
                        _ = ticker.tick() => AttrCache::sweep(&cache).await,
                    }
                }
            })
        };
        *cache.sweeper.lock().unwrap() = Some(sweeper);
        cache
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.table.len()
    }

    /// Insert a fresh item at the current generation and log it to the WAL.
    pub async fn add(&self, key: u64, data: Bytes, ttl: Option<Duration>) -> Result<(), FsError> {
        let generation = self.generation();
        {
            let mut inner = self.inner.write().await;
            inner
                .table
                .insert(key, Arc::new(CacheItem::new(key, data.clone(), generation, ttl)));
            inner.mutations += 1;
        }
        self.observer.on_add(key, &data)
    }

    /// Install a fully-formed item without notifying the observer. WAL replay
    /// only: the record is already on disk.
    pub async fn set(&self, item: CacheItem) {
        let mut inner = self.inner.write().await;
        inner.table.insert(item.key, Arc::new(item));
        inner.mutations += 1;
    }

    /// Tombstone `key` and log the delete. Returns false when the key is not
    /// cached at all; the caller must then delete from the attribute store
    /// directly.
    pub async fn del(&self, key: u64) -> Result<bool, FsError> {
        let data = {
            let mut inner = self.inner.write().await;
            let Some(item) = inner.table.get(&key) else {
                return Ok(false);
            };
            item.set_tombstoned(true);
            let data = item.data();
            inner.mutations += 1;
            data
        };
        self.observer.on_del(key, &data)?;
        Ok(true)
    }

    pub async fn get(&self, key: u64) -> CacheGet {
        let expired = {
            let inner = self.inner.read().await;
            let Some(item) = inner.table.get(&key) else {
                return CacheGet::Miss;
            };
            if !item.expired() {
                if item.is_tombstoned() {
                    return CacheGet::Deleted;
                }
                item.touch();
                return CacheGet::Hit(item.data());
            }
            true
        };
        if expired {
            let mut inner = self.inner.write().await;
            if let Some(item) = inner.table.get(&key) {
                if item.expired() {
                    inner.table.remove(&key);
                }
            }
        }
        CacheGet::Miss
    }

    async fn sweep(self: &Arc<Self>) {
        self.maybe_fire_full().await;

        let current = self.generation();
        let mut inner = self.inner.write().await;

        let expired: Vec<u64> = inner
            .table
            .values()
            .filter(|item| item.expired())
            .map(|item| item.key)
            .collect();
        for key in expired {
            inner.table.remove(&key);
        }

        let mut mean = 0f64;
        let mut old_generation_count = 0usize;
        for item in inner.table.values() {
            if item.generation() != current {
                mean += item.access_count() as f64;
                old_generation_count += 1;
            }
        }
        if old_generation_count == 0 {
            return;
        }
        mean /= old_generation_count as f64;

        if inner.mutations > self.threshold {
            let candidates: Vec<u64> = inner
                .table
                .values()
                .filter(|item| {
                    item.is_processed()
                        && item.access_count() as f64 <= mean
                        && item.generation() != current
                })
                .map(|item| item.key)
                .collect();
            for key in candidates {
                inner.table.remove(&key);
                inner.mutations = inner.mutations.saturating_sub(1);
                if inner.mutations <= self.min_size {
                    break;
                }
            }
        }
    }

    /// When the table outgrows its threshold, rotate the generation and fire
    /// the full-callback. Keys coming back on the channel mark their items
    /// processed, but only items still tagged with the pre-rotation
    /// generation: anything mutated after the rotation is in the new WAL
    /// segment and not yet durable.
    async fn maybe_fire_full(self: &Arc<Self>) {
        if self.inner.read().await.table.len() <= self.threshold {
            return;
        }
        if self.full_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let old_generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.observer.on_full(tx).await;
        self.full_running.store(false, Ordering::SeqCst);
        match result {
            Err(e) => error!("cache full-callback failed: {e}"),
            Ok(()) => {
                debug!("cache rotated to generation {}", old_generation + 1);
                // The dump streams keys until the drained segment is fully
                // applied; marking runs on its own task so a slow dump does
                // not stall the sweeper.
                let cache = Arc::clone(self);
                spawn_named("cache-processed-marker", async move {
                    while let Some(key) = rx.recv().await {
                        let inner = cache.inner.read().await;
                        if let Some(item) = inner.table.get(&key) {
                            if item.generation() == old_generation {
                                item.set_processed(true);
                            }
                        }
                    }
                });
            }
        }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records calls and, on full, reports every added key as
    /// flushed.
    #[derive(Default)]
    struct RecordingObserver {
        added: Mutex<Vec<u64>>,
        deleted: Mutex<Vec<u64>>,
        fulls: AtomicU64,
    }

    #[async_trait]
    impl CacheObserver for RecordingObserver {
        fn on_add(&self, key: u64, _data: &Bytes) -> Result<(), FsError> {
            self.added.lock().unwrap().push(key);
            Ok(())
        }

        fn on_del(&self, key: u64, _data: &Bytes) -> Result<(), FsError> {
            self.deleted.lock().unwrap().push(key);
            Ok(())
        }

        async fn on_full(&self, output: mpsc::UnboundedSender<u64>) -> Result<(), FsError> {
            self.fulls.fetch_add(1, Ordering::SeqCst);
            for key in self.added.lock().unwrap().iter() {
                let _ = output.send(*key);
            }
            Ok(())
        }
    }

    fn value(n: u64) -> Bytes {
        Bytes::from(format!("value-{n}"))
    }

    #[tokio::test]
    async fn test_add_get_del() {
        let observer = Arc::new(RecordingObserver::default());
        let cache = AttrCache::new(100, observer.clone());

        cache.add(1, value(1), None).await.unwrap();
        assert_eq!(cache.get(1).await, CacheGet::Hit(value(1)));
        assert_eq!(cache.get(2).await, CacheGet::Miss);

        assert!(cache.del(1).await.unwrap());
        assert_eq!(cache.get(1).await, CacheGet::Deleted);
        assert!(!cache.del(2).await.unwrap());

        assert_eq!(*observer.added.lock().unwrap(), vec![1]);
        assert_eq!(*observer.deleted.lock().unwrap(), vec![1]);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_set_skips_observer() {
        let observer = Arc::new(RecordingObserver::default());
        let cache = AttrCache::new(100, observer.clone());

        cache
            .set(CacheItem::from_replay(7, value(7), false, 0))
            .await;
        assert_eq!(cache.get(7).await, CacheGet::Hit(value(7)));
        assert!(observer.added.lock().unwrap().is_empty());
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_ttl_expires_to_miss() {
        let cache = AttrCache::new(100, Arc::new(RecordingObserver::default()));
        cache
            .add(5, value(5), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(5).await, CacheGet::Miss);
        assert_eq!(cache.len().await, 0);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_generation_sweep_evicts_processed_items() {
        let observer = Arc::new(RecordingObserver::default());
        let cache = AttrCache::new(10, observer.clone());

        for key in 0..22u64 {
            cache.add(key, value(key), None).await.unwrap();
        }
        assert_eq!(cache.len().await, 22);

        // Sweeper ticks at 1 Hz: one tick to rotate and mark, another to
        // evict. Poll rather than assume exact timing.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if cache.len().await <= cache.min_size && cache.generation() >= 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "sweep never evicted: len={}",
                cache.len().await
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(observer.fulls.load(Ordering::SeqCst) >= 1);
        cache.stop().await;
    }

    /// Observer that always reports the same key set, standing in for a dump
    /// of the first segment only.
    struct FrozenObserver {
        keys: Vec<u64>,
    }

    #[async_trait]
    impl CacheObserver for FrozenObserver {
        fn on_add(&self, _key: u64, _data: &Bytes) -> Result<(), FsError> {
            Ok(())
        }

        fn on_del(&self, _key: u64, _data: &Bytes) -> Result<(), FsError> {
            Ok(())
        }

        async fn on_full(&self, output: mpsc::UnboundedSender<u64>) -> Result<(), FsError> {
            for key in &self.keys {
                let _ = output.send(*key);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unreported_items_stay_unprocessed_and_cached() {
        // The dump only ever covers keys 0..8; key 99 is mutated after the
        // rotation and must neither be marked processed nor evicted.
        let cache = AttrCache::new(
            5,
            Arc::new(FrozenObserver {
                keys: (0..8).collect(),
            }),
        );

        for key in 0..8u64 {
            cache.add(key, value(key), None).await.unwrap();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while cache.generation() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "no rotation");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cache.add(99, value(99), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(cache.get(99).await, CacheGet::Hit(value(99)));
        let inner = cache.inner.read().await;
        assert!(!inner.table.get(&99).unwrap().is_processed());
        drop(inner);
        cache.stop().await;
    }
}
