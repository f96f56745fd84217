//! Content-addressed snapshots of the metadata stores.
//!
//! A snapshot is a full copy of the name-index and attribute stores into
//! fresh stores under `data/<sha256(name)>/`. The registry store at `db/`
//! maps `"current"` and each snapshot name to its hash. Consistency comes
//! from draining in-flight WAL dumps before the copy and installing the
//! snapshot attribute store as the WAL dump mirror for its duration, so
//! records flushed mid-copy land on both sides.

use crate::db::MetaStore;
use crate::fs::errors::FsError;
use crate::wal::Wal;
use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub const CURRENT_SNAPSHOT_KEY: &str = "current";
const DATA_DIR: &str = "data";
const COPY_BATCH_MAX: usize = 500;

pub struct SnapshotEngine {
    root: PathBuf,
    registry: Arc<MetaStore>,
    names: Arc<MetaStore>,
    attrs: Arc<MetaStore>,
    wal: Arc<Wal>,
    /// Name of the most recently created snapshot, cached for lookups.
    current: RwLock<Option<String>>,
}

impl SnapshotEngine {
    pub async fn open(
        root: impl Into<PathBuf>,
        names: Arc<MetaStore>,
        attrs: Arc<MetaStore>,
        wal: Arc<Wal>,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        let registry = Arc::new(MetaStore::open(&root, "db").await?);
        std::fs::create_dir_all(root.join(DATA_DIR))?;
        Ok(Self {
            root,
            registry,
            names,
            attrs,
            wal,
            current: RwLock::new(None),
        })
    }

    /// Copy both stores into `data/<hash>/` and register the snapshot.
    /// Rejects a name whose hash is already the current snapshot.
    pub async fn create_sync_snapshot(&self, name: &str) -> Result<String, FsError> {
        if name.is_empty() {
            return Err(FsError::InvalidName(name.to_string()));
        }
        let hash = hex::encode(Sha256::digest(name.as_bytes()));

        let current_key = Bytes::from_static(CURRENT_SNAPSHOT_KEY.as_bytes());
        if let Some(current) = self.registry.get(&current_key).await? {
            if current.as_ref() == hash.as_bytes() {
                return Err(FsError::AlreadyExists);
            }
        }

        // Everything already handed to the dumper must be on disk before the
        // copy begins; anything dumped after that is mirrored.
        self.wal.wait().await?;

        let snap_root = self.root.join(DATA_DIR).join(&hash);
        let snap_names = Arc::new(
            MetaStore::open(&snap_root, "inode")
                .await
                .map_err(|e| FsError::Failed(e.to_string()))?,
        );
        let snap_attrs = Arc::new(
            MetaStore::open(&snap_root, "attrs")
                .await
                .map_err(|e| FsError::Failed(e.to_string()))?,
        );

        self.wal.set_mirror(Arc::clone(&snap_attrs));
        let copied = async {
            copy_store(&self.names, &snap_names).await?;
            copy_store(&self.attrs, &snap_attrs).await?;
            self.wal.wait().await
        }
        .await;
        self.wal.clear_mirror();
        copied?;

        snap_names.flush().await?;
        snap_attrs.flush().await?;
        snap_names.close().await?;
        snap_attrs.close().await?;

        self.registry.put(&current_key, hash.as_bytes()).await?;
        self.registry
            .put(&Bytes::from(name.to_string()), hash.as_bytes())
            .await?;
        *self.current.write().await = Some(name.to_string());
        info!("snapshot {name:?} created as {hash}");
        Ok(hash)
    }

    /// The cached name of the last snapshot created by this process, or the
    /// registered current hash.
    pub async fn current(&self) -> Result<Option<String>, FsError> {
        if let Some(name) = self.current.read().await.clone() {
            return Ok(Some(name));
        }
        let current_key = Bytes::from_static(CURRENT_SNAPSHOT_KEY.as_bytes());
        match self.registry.get(&current_key).await? {
            None => Ok(None),
            Some(hash) => {
                let hash = String::from_utf8(hash.to_vec())
                    .map_err(|e| FsError::Decode(e.to_string()))?;
                *self.current.write().await = Some(hash.clone());
                Ok(Some(hash))
            }
        }
    }

    /// Every key in the registry, including `"current"`.
    pub async fn list(&self) -> Result<Vec<String>, FsError> {
        let mut stream = self.registry.scan::<std::ops::RangeFull>(..).await?;
        let mut names = Vec::new();
        while let Some(kv) = stream.next().await {
            let (key, _) = kv?;
            names.push(
                String::from_utf8(key.to_vec()).map_err(|e| FsError::Decode(e.to_string()))?,
            );
        }
        Ok(names)
    }

    pub async fn delete(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported("snapshot delete"))
    }

    pub async fn close(&self) -> Result<(), FsError> {
        self.registry.flush().await?;
        self.registry.close().await
    }
}

async fn copy_store(src: &MetaStore, dst: &MetaStore) -> Result<(), FsError> {
    let mut stream = src.scan::<std::ops::RangeFull>(..).await?;
    let mut batch = dst.new_batch();
    let mut pending = 0usize;
    while let Some(kv) = stream.next().await {
        let (key, value) = kv?;
        batch.put(&key, &value);
        pending += 1;
        if pending == COPY_BATCH_MAX {
            dst.write(std::mem::replace(&mut batch, dst.new_batch())).await?;
            pending = 0;
        }
    }
    if pending > 0 {
        dst.write(batch).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::key_codec::KeyCodec;
    use std::path::Path;

    async fn engine(dir: &Path) -> (SnapshotEngine, Arc<MetaStore>, Arc<MetaStore>) {
        let names = Arc::new(MetaStore::open(dir, "inodes").await.unwrap());
        let attrs = Arc::new(MetaStore::open(dir, "attrs").await.unwrap());
        let wal = Arc::new(Wal::open(dir.join("wal"), Arc::clone(&attrs)).unwrap());
        let engine = SnapshotEngine::open(dir, Arc::clone(&names), Arc::clone(&attrs), wal)
            .await
            .unwrap();
        (engine, names, attrs)
    }

    #[tokio::test]
    async fn test_snapshot_copies_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, names, attrs) = engine(dir.path()).await;

        names
            .put(&KeyCodec::name_key(1, "file"), &KeyCodec::inode_value(2))
            .await
            .unwrap();
        attrs.put(&KeyCodec::attr_key(2), b"blob").await.unwrap();

        let hash = engine.create_sync_snapshot("nightly").await.unwrap();
        assert_eq!(hash, hex::encode(Sha256::digest(b"nightly")));

        let snap_root = dir.path().join("data").join(&hash);
        let snap_names = MetaStore::open(&snap_root, "inode").await.unwrap();
        let snap_attrs = MetaStore::open(&snap_root, "attrs").await.unwrap();
        assert!(
            snap_names
                .get(&KeyCodec::name_key(1, "file"))
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(
            snap_attrs
                .get(&KeyCodec::attr_key(2))
                .await
                .unwrap()
                .unwrap()
                .as_ref(),
            b"blob"
        );

        assert_eq!(engine.current().await.unwrap(), Some("nightly".to_string()));
        let listed = engine.list().await.unwrap();
        assert!(listed.contains(&"current".to_string()));
        assert!(listed.contains(&"nightly".to_string()));
    }

    #[tokio::test]
    async fn test_repeated_snapshot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _names, _attrs) = engine(dir.path()).await;

        engine.create_sync_snapshot("v1").await.unwrap();
        assert!(matches!(
            engine.create_sync_snapshot("v1").await,
            Err(FsError::AlreadyExists)
        ));
        // A different name is a different hash and goes through.
        engine.create_sync_snapshot("v2").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _names, _attrs) = engine(dir.path()).await;
        assert!(matches!(
            engine.create_sync_snapshot("").await,
            Err(FsError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unimplemented() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _names, _attrs) = engine(dir.path()).await;
        assert!(matches!(
            engine.delete("x").await,
            Err(FsError::Unsupported(_))
        ));
    }
}
