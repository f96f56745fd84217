//! Durable monotonic inode-id allocator.
//!
//! The last allocated id is kept in a small text file rewritten in place by a
//! single worker draining a bounded channel. A `lastinode.lock` file marks an
//! unclean shutdown: when it is present at startup, the text file cannot be
//! trusted and the counter is rebuilt by scanning the name index for the
//! highest referenced id.

use crate::fs::errors::FsError;
use crate::fs::inode::InodeId;
use crate::fs::store::NameIndexStore;
use crate::task::spawn_named;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const LAST_INODE_FILE: &str = "lastinode";
const LOCK_FILE: &str = "lastinode.lock";

pub struct LastInodeEngine {
    dir: PathBuf,
    last: Arc<AtomicU64>,
    queue: std::sync::Mutex<Option<mpsc::Sender<InodeId>>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LastInodeEngine {
    /// Recover the counter and start the writer worker. The lock file is
    /// created here and removed only by a clean `close`.
    pub async fn init(
        dir: impl Into<PathBuf>,
        names: &NameIndexStore,
        queue_depth: usize,
    ) -> Result<Self, FsError> {
        let dir = dir.into();
        let last = Self::recover(&dir, names).await?;
        info!("last inode recovered as {last}");

        std::fs::File::create(dir.join(LOCK_FILE)).map_err(|e| FsError::Failed(e.to_string()))?;

        let last = Arc::new(AtomicU64::new(last));
        let (tx, mut rx) = mpsc::channel::<InodeId>(queue_depth.max(1));
        // Prime the writer with the recovered value so even an allocation-free
        // run leaves a fresh file behind on clean shutdown.
        let _ = tx.try_send(last.load(Ordering::SeqCst));
        let file_path = dir.join(LAST_INODE_FILE);
        let worker = spawn_named("last-inode-writer", async move {
            let mut file = match std::fs::File::create(&file_path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("cannot open {file_path:?}: {e}");
                    return;
                }
            };
            while let Some(id) = rx.recv().await {
                if let Err(e) = write_in_place(&mut file, id) {
                    warn!("writing last inode {id}: {e}");
                }
            }
            let _ = file.sync_all();
        });

        Ok(Self {
            dir,
            last,
            queue: std::sync::Mutex::new(Some(tx)),
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    async fn recover(dir: &Path, names: &NameIndexStore) -> Result<InodeId, FsError> {
        if dir.join(LOCK_FILE).exists() {
            warn!("previous run did not shut down cleanly, rebuilding last inode from the name index");
            return names.max_inode_id().await;
        }
        match std::fs::read_to_string(dir.join(LAST_INODE_FILE)) {
            Ok(text) => text
                .trim()
                .parse::<InodeId>()
                .map_err(|e| FsError::Decode(format!("corrupt lastinode file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => names.max_inode_id().await,
            Err(e) => Err(FsError::Failed(e.to_string())),
        }
    }

    /// Allocate the next id and enqueue it for the writer.
    pub async fn next(&self) -> InodeId {
        let id = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        let queue = self.queue.lock().unwrap().clone();
        if let Some(queue) = queue {
            if queue.send(id).await.is_err() {
                warn!("last inode writer is gone, id {id} not persisted");
            }
        }
        id
    }

    pub fn last(&self) -> InodeId {
        self.last.load(Ordering::SeqCst)
    }

    /// Stop the writer the way a crash would: queue dropped, lock file left
    /// in place.
    #[cfg(test)]
    pub(crate) async fn abandon(&self) {
        drop(self.queue.lock().unwrap().take());
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Drain the writer, sync the file, and drop the lock file.
    pub async fn close(&self) -> Result<(), FsError> {
        drop(self.queue.lock().unwrap().take());
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        let lock = self.dir.join(LOCK_FILE);
        if lock.exists() {
            std::fs::remove_file(&lock).map_err(|e| FsError::Failed(e.to_string()))?;
        }
        Ok(())
    }
}

fn write_in_place(file: &mut std::fs::File, id: InodeId) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(id.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetaStore;

    async fn name_store(dir: &Path) -> NameIndexStore {
        NameIndexStore::new(Arc::new(MetaStore::open(dir, "inodes").await.unwrap()))
    }

    #[tokio::test]
    async fn test_allocation_is_monotonic_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let names = name_store(dir.path()).await;

        let engine = LastInodeEngine::init(dir.path(), &names, 64).await.unwrap();
        assert_eq!(engine.last(), 0);
        assert_eq!(engine.next().await, 1);
        assert_eq!(engine.next().await, 2);
        assert_eq!(engine.next().await, 3);
        engine.close().await.unwrap();

        assert!(!dir.path().join(LOCK_FILE).exists());
        let text = std::fs::read_to_string(dir.path().join(LAST_INODE_FILE)).unwrap();
        assert_eq!(text.trim(), "3");

        // A clean restart resumes from the file.
        let engine = LastInodeEngine::init(dir.path(), &names, 64).await.unwrap();
        assert_eq!(engine.last(), 3);
        assert_eq!(engine.next().await, 4);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dirty_shutdown_falls_back_to_db_scan() {
        let dir = tempfile::tempdir().unwrap();
        let names = name_store(dir.path()).await;
        names.insert(1, "a", 17).await.unwrap();
        names.insert(1, "b", 9).await.unwrap();

        // Stale file plus a lock file: the scan must win.
        std::fs::write(dir.path().join(LAST_INODE_FILE), "2").unwrap();
        std::fs::File::create(dir.path().join(LOCK_FILE)).unwrap();

        let engine = LastInodeEngine::init(dir.path(), &names, 64).await.unwrap();
        assert_eq!(engine.last(), 17);
        assert_eq!(engine.next().await, 18);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_scans_db() {
        let dir = tempfile::tempdir().unwrap();
        let names = name_store(dir.path()).await;
        names.insert(1, "only", 5).await.unwrap();

        let engine = LastInodeEngine::init(dir.path(), &names, 64).await.unwrap();
        assert_eq!(engine.last(), 5);
        engine.close().await.unwrap();
    }
}
