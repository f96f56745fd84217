//! The metadata engine.
//!
//! `MetaFs` owns the two ordered KV stores, the WAL, the attribute cache,
//! the striped lock, and the inode-id allocator, and exposes the operation
//! surface a mount adapter consumes. Name entries go straight to the name
//! index; attribute mutations go to the cache, which mirrors them into the
//! WAL before acknowledging, and reach the attribute store asynchronously
//! when the cache sweeper rotates and dumps the log.

pub mod errors;
pub mod inode;
pub mod key_codec;
pub mod lastinode;
pub mod ops;
pub mod store;

use crate::cache::{AttrCache, CacheGet, CacheObserver};
use crate::config::Settings;
use crate::db::MetaStore;
use crate::fs::errors::{FsError, FsResult};
use crate::fs::inode::{Inode, InodeAttributes, InodeId, ROOT_ID, Timestamp};
use crate::fs::key_codec::KeyCodec;
use crate::fs::lastinode::LastInodeEngine;
use crate::fs::store::{AttrStore, NameIndexStore};
use crate::snapshot::SnapshotEngine;
use crate::stat::StatClient;
use crate::stripe::{StripedLock, nofile_limit};
use crate::wal::{Wal, WalEntry};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

const BROKEN_MARKER: &str = "broken.marker";

/// One page of directory children plus the cursor for the next page. The
/// cursor is the last returned name; `None` means the listing is complete.
#[derive(Debug)]
pub struct DirPage {
    pub entries: Vec<Inode>,
    pub cursor: Option<String>,
}

/// Mirrors cache mutations into the WAL. Values are the serialized attribute
/// blob for live and tombstone records alike; the dump path turns tombstones
/// into store deletes.
struct WalObserver {
    wal: Arc<Wal>,
}

#[async_trait]
impl CacheObserver for WalObserver {
    fn on_add(&self, key: u64, data: &Bytes) -> Result<(), FsError> {
        self.wal.append(&WalEntry {
            key: KeyCodec::attr_key(key),
            value: data.clone(),
            tombstoned: false,
        })
    }

    fn on_del(&self, key: u64, data: &Bytes) -> Result<(), FsError> {
        self.wal.append(&WalEntry {
            key: KeyCodec::attr_key(key),
            value: data.clone(),
            tombstoned: true,
        })
    }

    async fn on_full(&self, output: UnboundedSender<u64>) -> Result<(), FsError> {
        self.wal.dump(output).await
    }
}

pub struct MetaFs {
    root: PathBuf,
    pub(crate) fs_name: String,
    read_only: bool,
    pub(crate) names: NameIndexStore,
    pub(crate) attrs: AttrStore,
    name_db: Arc<MetaStore>,
    attr_db: Arc<MetaStore>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) cache: Arc<AttrCache>,
    pub(crate) locks: StripedLock,
    pub(crate) alloc: LastInodeEngine,
    pub(crate) snapshots: Arc<SnapshotEngine>,
    pub(crate) stat: Option<StatClient>,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
}

impl MetaFs {
    pub async fn open(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let root = settings.root.clone();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating engine root {root:?}"))?;

        if root.join(BROKEN_MARKER).exists() {
            fsck(&root).with_context(|| {
                format!("{BROKEN_MARKER} present under {root:?}, refusing to start")
            })?;
        }

        let name_db = Arc::new(MetaStore::open(&root, "inodes").await?);
        let attr_db = Arc::new(MetaStore::open(&root, "attrs").await?);
        let names = NameIndexStore::new(Arc::clone(&name_db));
        let attrs = AttrStore::new(Arc::clone(&attr_db));

        let wal = Arc::new(Wal::open(root.join("wal"), Arc::clone(&attr_db))?);
        let cache = AttrCache::new(
            settings.cache_size,
            Arc::new(WalObserver {
                wal: Arc::clone(&wal),
            }),
        );

        // Segments a crashed dump left behind are applied straight to the
        // store; the active segment replays into the cache. Both are
        // idempotent: replayed items come back unprocessed, so the next dump
        // writes them to the attribute store again.
        let recovered = wal
            .recover_stale()
            .await
            .context("recovering stale WAL segments")?;
        if recovered > 0 {
            warn!("recovered {recovered} stale WAL segments");
        }
        let replayed = wal.replay().await.context("replaying WAL")?;
        let replay_count = replayed.len();
        for entry in replayed {
            let key = KeyCodec::decode_attr_key(&entry.key).context("replaying WAL entry key")?;
            cache
                .set(crate::cache::item::CacheItem::from_replay(
                    key,
                    entry.value,
                    entry.tombstoned,
                    cache.generation(),
                ))
                .await;
        }
        if replay_count > 0 {
            info!("replayed {replay_count} WAL entries into the attribute cache");
        }

        let alloc = LastInodeEngine::init(&root, &names, nofile_limit()).await?;

        let snapshots = Arc::new(
            SnapshotEngine::open(
                &root,
                Arc::clone(&name_db),
                Arc::clone(&attr_db),
                Arc::clone(&wal),
            )
            .await?,
        );

        let stat = match settings.stat_address {
            Some(addr) => match StatClient::connect(addr).await {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("stat backend {addr} unreachable, statfs will synthesize: {e}");
                    None
                }
            },
            None => None,
        };

        let fs = Arc::new(Self {
            root,
            fs_name: settings.fs_name,
            read_only: settings.read_only,
            names,
            attrs,
            name_db,
            attr_db,
            wal,
            cache,
            locks: StripedLock::with_default_width(),
            alloc,
            snapshots,
            stat,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        });

        fs.ensure_root().await?;
        info!(
            "metadata engine ready, last inode {}, current snapshot {:?}",
            fs.alloc.last(),
            fs.snapshots.current().await.unwrap_or(None)
        );
        Ok(fs)
    }

    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    pub fn snapshots(&self) -> Arc<SnapshotEngine> {
        Arc::clone(&self.snapshots)
    }

    async fn ensure_root(&self) -> FsResult<()> {
        match self.get_inode(0, "", true).await {
            Ok(_) => Ok(()),
            Err(FsError::NoSuchInode) => {
                if self.read_only {
                    return Err(FsError::ReadOnly);
                }
                let now = Timestamp::now();
                let root = Inode::new(
                    ROOT_ID,
                    0,
                    "",
                    InodeAttributes {
                        size: 4096,
                        nlink: 1,
                        mode: libc::S_IFDIR as u32 | 0o755,
                        rdev: 0,
                        uid: self.uid,
                        gid: self.gid,
                        atime: now,
                        mtime: now,
                        ctime: now,
                        hash: None,
                        parent: 0,
                    },
                );
                self.add_inode(&root, true).await
            }
            Err(e) => Err(e),
        }
    }

    fn validate_name(&self, parent: InodeId, name: &str) -> FsResult<()> {
        if name.contains(':') {
            return Err(FsError::InvalidName(name.to_string()));
        }
        if name.is_empty() && parent != 0 {
            // The empty name is reserved for the root self-entry.
            return Err(FsError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> FsResult<()> {
        if self.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Write `(parent, name) → id`, and with `attr` also push the serialized
    /// attributes through the cache (which logs them to the WAL).
    pub async fn add_inode(&self, inode: &Inode, attr: bool) -> FsResult<()> {
        self.validate_name(inode.parent, &inode.name)?;
        if self.names.get(inode.parent, &inode.name).await?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        debug!("add inode {}:{:?} -> {}", inode.parent, inode.name, inode.id);
        if let Err(e) = self.names.insert(inode.parent, &inode.name, inode.id).await {
            return Err(self.mark_failed(e));
        }
        if attr {
            let blob = inode.attrs.marshal()?;
            if let Err(e) = self.cache.add(inode.id, blob, None).await {
                return Err(self.mark_failed(e));
            }
        }
        Ok(())
    }

    /// Resolve `(parent, name)`, optionally pulling attributes from the
    /// cache, falling back to the attribute store on a miss.
    pub async fn get_inode(&self, parent: InodeId, name: &str, attr: bool) -> FsResult<Inode> {
        let id = self
            .names
            .get(parent, name)
            .await?
            .ok_or(FsError::NoSuchInode)?;
        let mut inode = Inode::new(id, parent, name, InodeAttributes::default());
        if attr {
            inode.attrs = self.get_inode_attrs(id).await?;
        }
        Ok(inode)
    }

    /// Remove the name entry; with `attr`, tombstone the cache entry (direct
    /// store delete when the cache has never seen the key).
    pub async fn delete_inode(&self, inode: &Inode, attr: bool) -> FsResult<()> {
        if self.names.get(inode.parent, &inode.name).await?.is_none() {
            return Err(FsError::NoSuchInode);
        }
        debug!(
            "delete inode {}:{:?} ({})",
            inode.parent, inode.name, inode.id
        );
        if let Err(e) = self.names.remove(inode.parent, &inode.name).await {
            return Err(self.mark_failed(e));
        }
        if attr {
            match self.cache.del(inode.id).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = self.attrs.delete(inode.id).await {
                        return Err(self.mark_failed(e));
                    }
                }
                Err(e) => return Err(self.mark_failed(e)),
            }
        }
        Ok(())
    }

    pub async fn create_inode_attrs(&self, inode: &Inode) -> FsResult<()> {
        let blob = inode.attrs.marshal()?;
        self.cache
            .add(inode.id, blob, None)
            .await
            .map_err(|e| self.mark_failed(e))
    }

    pub async fn get_inode_attrs(&self, id: InodeId) -> FsResult<InodeAttributes> {
        match self.cache.get(id).await {
            CacheGet::Hit(blob) => InodeAttributes::unmarshal(&blob),
            CacheGet::Deleted => Err(FsError::NoSuchInode),
            CacheGet::Miss => self.attrs.get(id).await?.ok_or(FsError::NoSuchInode),
        }
    }

    /// Read-modify-write: pull the current attributes, overwrite the mutable
    /// fields, and push the new blob through the cache.
    pub async fn update_inode_attrs(&self, id: InodeId, attrs: &InodeAttributes) -> FsResult<()> {
        let mut current = self.get_inode_attrs(id).await?;
        current.size = attrs.size;
        current.mode = attrs.mode;
        current.nlink = attrs.nlink;
        current.uid = attrs.uid;
        current.gid = attrs.gid;
        current.atime = attrs.atime;
        current.mtime = attrs.mtime;
        let blob = current.marshal()?;
        self.cache
            .add(id, blob, None)
            .await
            .map_err(|e| self.mark_failed(e))
    }

    pub async fn delete_inode_attrs(&self, id: InodeId) -> FsResult<()> {
        match self.cache.del(id).await {
            Ok(true) => Ok(()),
            Ok(false) => self.attrs.delete(id).await.map_err(|e| self.mark_failed(e)),
            Err(e) => Err(self.mark_failed(e)),
        }
    }

    /// Page through the children of `parent`. The first page (cursor `None`)
    /// synthesizes `.` and `..`, both counted against `limit`; `..` of the
    /// root is the root itself. The returned cursor is the last name yielded
    /// (including the synthetic ones) and `None` once the listing is done.
    pub async fn get_children(
        &self,
        parent: InodeId,
        cursor: Option<&str>,
        limit: usize,
    ) -> FsResult<DirPage> {
        let mut entries: Vec<Inode> = Vec::new();
        if limit == 0 {
            return Ok(DirPage {
                entries,
                cursor: cursor.map(str::to_string),
            });
        }
        let mut budget = limit;

        // The synthetic names double as cursor positions: a page that ended
        // at "." resumes by emitting "..".
        let at_origin = cursor.is_none();
        if at_origin || cursor == Some(".") {
            let attrs = self.get_inode_attrs(parent).await?;
            let parent_of = if attrs.parent == 0 { parent } else { attrs.parent };
            if at_origin {
                entries.push(Inode::new(parent, attrs.parent, ".", attrs));
                budget -= 1;
                if budget == 0 {
                    return Ok(DirPage {
                        entries,
                        cursor: Some(".".to_string()),
                    });
                }
            }
            let parent_attrs = self.get_inode_attrs(parent_of).await?;
            entries.push(Inode::new(parent_of, parent_attrs.parent, "..", parent_attrs));
            budget -= 1;
            if budget == 0 {
                return Ok(DirPage {
                    entries,
                    cursor: Some("..".to_string()),
                });
            }
        }

        let mut start_after = match cursor {
            Some(".") | Some("..") | None => None,
            Some(name) => Some(name.to_string()),
        };

        loop {
            let page = self
                .names
                .children(parent, start_after.as_deref(), budget)
                .await?;
            let truncated = page.truncated;
            let mut last_name = None;
            for (name, id) in page.entries {
                last_name = Some(name.clone());
                match self.get_inode_attrs(id).await {
                    Ok(attrs) => {
                        entries.push(Inode::new(id, parent, name, attrs));
                        budget -= 1;
                    }
                    // Tombstoned or vanished between the name scan and the
                    // attribute read; skip the entry.
                    Err(FsError::NoSuchInode) => {
                        warn!("child {parent}:{name:?} (inode {id}) has no attributes, skipping");
                    }
                    Err(e) => return Err(e),
                }
                if budget == 0 {
                    break;
                }
            }
            if budget == 0 {
                // The scan already peeked one row past the limit, so
                // `truncated` answers whether anything follows this page.
                return Ok(DirPage {
                    cursor: if truncated { last_name } else { None },
                    entries,
                });
            }
            if !truncated {
                return Ok(DirPage {
                    entries,
                    cursor: None,
                });
            }
            start_after = last_name;
        }
    }

    /// Full prefix scan counting child entries.
    pub async fn get_children_count(&self, parent: InodeId) -> FsResult<usize> {
        self.names.count_children(parent).await
    }

    /// Write the sticky broken marker and wrap the error. The marker survives
    /// restarts; startup refuses to open until an fsck clears it.
    pub(crate) fn mark_failed(&self, err: FsError) -> FsError {
        error!("durability failure, writing {BROKEN_MARKER}: {err}");
        let path = self.root.join(BROKEN_MARKER);
        if let Err(marker_err) = std::fs::write(&path, format!("Error: {err}")) {
            error!("failed to write {path:?}: {marker_err}");
        }
        FsError::Failed(err.to_string())
    }

    pub fn check_failed(&self) -> bool {
        self.root.join(BROKEN_MARKER).exists()
    }

    /// Ordered shutdown: sweeper, WAL dumps, stores, allocator, lock file.
    pub async fn close(&self) -> FsResult<()> {
        self.cache.stop().await;
        self.wal.close().await?;
        self.snapshots.close().await?;
        self.name_db.flush().await?;
        self.attr_db.flush().await?;
        self.name_db.close().await?;
        self.attr_db.close().await?;
        self.alloc.close().await?;
        info!("metadata engine closed");
        Ok(())
    }

    /// Close the stores without draining the WAL or releasing the dirty-
    /// shutdown lock, leaving exactly what a crash leaves behind.
    #[cfg(test)]
    pub(crate) async fn simulate_crash(&self) -> FsResult<()> {
        self.cache.stop().await;
        self.alloc.abandon().await;
        self.name_db.flush().await?;
        self.attr_db.flush().await?;
        self.name_db.close().await?;
        self.attr_db.close().await?;
        Ok(())
    }
}

fn fsck(root: &std::path::Path) -> anyhow::Result<()> {
    anyhow::bail!("fsck for {root:?} is not implemented")
}
