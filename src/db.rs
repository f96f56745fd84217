//! Ordered KV store handle.
//!
//! Both metadata stores, the snapshot registry, and snapshot data stores are
//! SlateDB instances over a local-filesystem object store. This wrapper owns
//! the handle, fixes the read/write durability options, and adapts range
//! scans to streams. Background compaction is delegated to the store's own
//! compactor.

use crate::fs::errors::FsError;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::Stream;
use slatedb::config::{
    CompactorOptions, DurabilityLevel, PutOptions, ReadOptions, ScanOptions, Settings,
    WriteOptions,
};
use slatedb::object_store::path::Path as StorePath;
use slatedb::object_store::{ObjectStore, local::LocalFileSystem};
use slatedb::{DbBuilder, WriteBatch};
use std::ops::RangeBounds;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

pub struct MetaStore {
    db: Arc<slatedb::Db>,
}

impl MetaStore {
    /// Open (creating if absent) the store named `name` under `root`.
    pub async fn open(root: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(root.join(name))
            .with_context(|| format!("creating store directory {:?}", root.join(name)))?;

        let object_store: Arc<dyn ObjectStore> = Arc::new(
            LocalFileSystem::new_with_prefix(root)
                .with_context(|| format!("opening object store at {root:?}"))?,
        );

        let settings = Settings {
            compactor_options: Some(CompactorOptions {
                ..Default::default()
            }),
            ..Default::default()
        };

        let db = DbBuilder::new(StorePath::from(name), object_store)
            .with_settings(settings)
            .build()
            .await
            .with_context(|| format!("opening store {name:?} under {root:?}"))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_options() -> ReadOptions {
        ReadOptions {
            durability_filter: DurabilityLevel::Memory,
            ..Default::default()
        }
    }

    fn write_options() -> WriteOptions {
        WriteOptions {
            await_durable: false,
        }
    }

    pub async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, FsError> {
        self.db
            .get_with_options(key, &Self::read_options())
            .await
            .map_err(|e| FsError::Failed(e.to_string()))
    }

    pub async fn put(&self, key: &Bytes, value: &[u8]) -> Result<(), FsError> {
        self.db
            .put_with_options(key, value, &PutOptions::default(), &Self::write_options())
            .await
            .map_err(|e| FsError::Failed(e.to_string()))
    }

    pub async fn delete(&self, key: &Bytes) -> Result<(), FsError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch).await
    }

    pub fn new_batch(&self) -> WriteBatch {
        WriteBatch::new()
    }

    pub async fn write(&self, batch: WriteBatch) -> Result<(), FsError> {
        self.db
            .write_with_options(batch, &Self::write_options())
            .await
            .map_err(|e| FsError::Failed(e.to_string()))
    }

    /// Ordered scan over `range`, yielding decoded key/value pairs.
    pub async fn scan<R>(
        &self,
        range: R,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<(Bytes, Bytes), FsError>> + Send + '_>>, FsError>
    where
        R: RangeBounds<Bytes> + Clone + Send + Sync + 'static,
    {
        let scan_options = ScanOptions {
            durability_filter: DurabilityLevel::Memory,
            cache_blocks: true,
            ..Default::default()
        };
        let iter = self
            .db
            .scan_with_options(range, &scan_options)
            .await
            .map_err(|e| FsError::Failed(e.to_string()))?;

        Ok(Box::pin(futures::stream::unfold(iter, |mut iter| async {
            match iter.next().await {
                Ok(Some(kv)) => Some((Ok((kv.key, kv.value)), iter)),
                Ok(None) => None,
                Err(e) => Some((Err(FsError::Failed(e.to_string())), iter)),
            }
        })))
    }

    pub async fn flush(&self) -> Result<(), FsError> {
        self.db
            .flush()
            .await
            .map_err(|e| FsError::Failed(e.to_string()))
    }

    pub async fn close(&self) -> Result<(), FsError> {
        self.db
            .close()
            .await
            .map_err(|e| FsError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path(), "kv").await.unwrap();

        let key = Bytes::from_static(b"alpha");
        assert!(store.get(&key).await.unwrap().is_none());

        store.put(&key, b"one").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap().as_ref(), b"one");

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path(), "kv").await.unwrap();

        for name in ["b", "a", "c"] {
            store
                .put(&Bytes::from(format!("k:{name}")), name.as_bytes())
                .await
                .unwrap();
        }

        let mut stream = store
            .scan(Bytes::from_static(b"k:")..Bytes::from_static(b"k;"))
            .await
            .unwrap();
        let mut keys = Vec::new();
        while let Some(kv) = stream.next().await {
            let (key, _) = kv.unwrap();
            keys.push(String::from_utf8(key.to_vec()).unwrap());
        }
        assert_eq!(keys, vec!["k:a", "k:b", "k:c"]);
        drop(stream);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path(), "kv").await.unwrap();

        store.put(&Bytes::from_static(b"gone"), b"x").await.unwrap();

        let mut batch = store.new_batch();
        batch.put(&Bytes::from_static(b"one"), b"1");
        batch.put(&Bytes::from_static(b"two"), b"2");
        batch.delete(&Bytes::from_static(b"gone"));
        store.write(batch).await.unwrap();

        assert!(store.get(&Bytes::from_static(b"one")).await.unwrap().is_some());
        assert!(store.get(&Bytes::from_static(b"two")).await.unwrap().is_some());
        assert!(store.get(&Bytes::from_static(b"gone")).await.unwrap().is_none());
        store.close().await.unwrap();
    }
}
