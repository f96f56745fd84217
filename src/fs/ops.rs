//! Filesystem-facing operations.
//!
//! Each operation serializes on the striped lock before touching the engine:
//! write mode keyed by the namespace parent for mutators, read mode keyed by
//! the target inode for lookups. Rename is the only two-stripe operation and
//! takes both parents in stripe order.

use crate::fs::errors::{FsError, FsResult};
use crate::fs::inode::{Inode, InodeAttributes, InodeId, Timestamp};
use crate::fs::{DirPage, MetaFs};
use crate::stat::FsStat;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Attribute changes applied by `setattr`. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct SetAttrs {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
}

impl MetaFs {
    /// Allocate a fresh id and bind it to `(parent, name)`.
    pub async fn new_inode(
        &self,
        parent: InodeId,
        name: &str,
        attrs: InodeAttributes,
    ) -> Inode {
        let id = self.alloc.next().await;
        Inode::new(id, parent, name, attrs)
    }

    fn base_attrs(&self, mode: u32, size: u64) -> InodeAttributes {
        let now = Timestamp::now();
        InodeAttributes {
            size,
            nlink: 1,
            mode,
            rdev: 0,
            uid: self.uid,
            gid: self.gid,
            atime: now,
            mtime: now,
            ctime: now,
            hash: None,
            parent: 0,
        }
    }

    /// Content address for a new file: a salted digest of the name, tagged
    /// with the snapshot lineage it was born into.
    async fn content_hash(&self, name: &str) -> String {
        let salt: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let mut digest = Sha256::new();
        digest.update(name.as_bytes());
        digest.update(Timestamp::now().secs.to_string().as_bytes());
        digest.update(salt.as_bytes());
        let snapshot = self
            .snapshots
            .current()
            .await
            .unwrap_or(None)
            .unwrap_or_default();
        format!("{}.{}", hex::encode(digest.finalize()), snapshot)
    }

    pub async fn mkdir(&self, parent: InodeId, name: &str, perm: u32) -> FsResult<Inode> {
        self.ensure_writable()?;
        let _guard = self.locks.write(parent).await;
        debug!("mkdir {parent}:{name:?}");
        if self.get_inode(parent, name, false).await.is_ok() {
            return Err(FsError::AlreadyExists);
        }
        let mode = libc::S_IFDIR as u32 | (perm & 0o7777);
        let inode = self
            .new_inode(parent, name, self.base_attrs(mode, 4096))
            .await;
        self.add_inode(&inode, true).await?;
        Ok(inode)
    }

    /// Create a node of arbitrary mode under `parent`.
    pub async fn mknode(&self, parent: InodeId, name: &str, mode: u32) -> FsResult<Inode> {
        self.ensure_writable()?;
        let _guard = self.locks.write(parent).await;
        debug!("mknode {parent}:{name:?} mode {mode:o}");
        let mut attrs = self.base_attrs(mode, 4096);
        attrs.hash = Some(self.content_hash(name).await);
        let inode = self.new_inode(parent, name, attrs).await;
        self.add_inode(&inode, true).await?;
        Ok(inode)
    }

    /// Create a regular file. An existing live name is returned as-is, the
    /// open-existing half of an exclusive-less create.
    pub async fn create_file(&self, parent: InodeId, name: &str, perm: u32) -> FsResult<Inode> {
        self.ensure_writable()?;
        let _guard = self.locks.write(parent).await;
        debug!("create {parent}:{name:?}");
        if let Ok(existing) = self.get_inode(parent, name, true).await {
            return Ok(existing);
        }
        let mode = libc::S_IFREG as u32 | (perm & 0o7777);
        let mut attrs = self.base_attrs(mode, 0);
        attrs.hash = Some(self.content_hash(name).await);
        let inode = self.new_inode(parent, name, attrs).await;
        self.add_inode(&inode, true).await?;
        Ok(inode)
    }

    /// Hard link: a second name for `target`, bumping its link count.
    pub async fn create_link(
        &self,
        parent: InodeId,
        name: &str,
        target: InodeId,
    ) -> FsResult<Inode> {
        self.ensure_writable()?;
        let _guard = self.locks.write(parent).await;
        debug!("link {parent}:{name:?} -> {target}");
        let mut attrs = self.get_inode_attrs(target).await?;
        attrs.nlink += 1;
        let inode = Inode::new(target, parent, name, attrs);
        self.add_inode(&inode, true).await?;
        Ok(inode)
    }

    /// Symlink: the target path rides in the attribute hash field.
    pub async fn create_symlink(
        &self,
        parent: InodeId,
        name: &str,
        target: &str,
    ) -> FsResult<Inode> {
        self.ensure_writable()?;
        let _guard = self.locks.write(parent).await;
        debug!("symlink {parent}:{name:?} -> {target:?}");
        let mode = libc::S_IFLNK as u32 | 0o777;
        let mut attrs = self.base_attrs(mode, 0);
        attrs.hash = Some(target.to_string());
        let inode = self.new_inode(parent, name, attrs).await;
        self.add_inode(&inode, true).await?;
        Ok(inode)
    }

    pub async fn read_symlink(&self, id: InodeId) -> FsResult<String> {
        let _guard = self.locks.read(id).await;
        let attrs = self.get_inode_attrs(id).await?;
        if !attrs.is_symlink() {
            return Err(FsError::WrongType);
        }
        Ok(attrs.hash.unwrap_or_default())
    }

    pub async fn lookup(&self, parent: InodeId, name: &str) -> FsResult<Inode> {
        let _guard = self.locks.read(parent).await;
        self.get_inode(parent, name, true).await
    }

    pub async fn getattr(&self, id: InodeId) -> FsResult<InodeAttributes> {
        let _guard = self.locks.read(id).await;
        self.get_inode_attrs(id).await
    }

    pub async fn setattr(&self, id: InodeId, changes: &SetAttrs) -> FsResult<InodeAttributes> {
        self.ensure_writable()?;
        let _guard = self.locks.write(id).await;
        let mut attrs = self.get_inode_attrs(id).await?;
        if let Some(size) = changes.size {
            attrs.size = size;
        }
        if let Some(mode) = changes.mode {
            attrs.mode = mode;
        }
        if let Some(uid) = changes.uid {
            attrs.uid = uid;
        }
        if let Some(gid) = changes.gid {
            attrs.gid = gid;
        }
        if let Some(atime) = changes.atime {
            attrs.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            attrs.mtime = mtime;
        }
        self.update_inode_attrs(id, &attrs).await?;
        Ok(attrs)
    }

    /// Move `(old_parent, old_name)` to `(new_parent, new_name)`: the name
    /// entry moves, the id stays. Both parent stripes are held, acquired in
    /// stripe order.
    pub async fn rename(
        &self,
        old_parent: InodeId,
        old_name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> FsResult<()> {
        self.ensure_writable()?;
        let _guard = self.locks.write_pair(old_parent, new_parent).await;
        debug!("rename {old_parent}:{old_name:?} -> {new_parent}:{new_name:?}");
        let inode = self.get_inode(old_parent, old_name, true).await?;
        self.delete_inode(&inode, false).await?;

        let now = Timestamp::now();
        let mut attrs = inode.attrs;
        attrs.atime = now;
        attrs.mtime = now;
        let moved = Inode::new(inode.id, new_parent, new_name, attrs);
        self.add_inode(&moved, true).await
    }

    pub async fn unlink(&self, parent: InodeId, name: &str) -> FsResult<()> {
        self.ensure_writable()?;
        let _guard = self.locks.write(parent).await;
        debug!("unlink {parent}:{name:?}");
        let mut inode = self.get_inode(parent, name, true).await?;
        self.delete_inode(&inode, false).await?;
        if inode.attrs.nlink > 1 {
            inode.attrs.nlink -= 1;
            self.create_inode_attrs(&inode).await
        } else {
            self.delete_inode_attrs(inode.id).await
        }
    }

    pub async fn rmdir(&self, parent: InodeId, name: &str) -> FsResult<()> {
        self.ensure_writable()?;
        let _guard = self.locks.write(parent).await;
        debug!("rmdir {parent}:{name:?}");
        let inode = self.get_inode(parent, name, true).await?;
        if !inode.attrs.is_directory() {
            return Err(FsError::WrongType);
        }
        if self.get_children_count(inode.id).await? > 0 {
            return Err(FsError::NotEmpty);
        }
        self.delete_inode(&inode, true).await
    }

    pub async fn readdir(
        &self,
        parent: InodeId,
        cursor: Option<&str>,
        limit: usize,
    ) -> FsResult<DirPage> {
        let _guard = self.locks.read(parent).await;
        self.get_children(parent, cursor, limit).await
    }

    /// Filesystem geometry from the stat backend; synthetic values when it
    /// does not answer within the deadline. Never fails.
    pub async fn statfs(&self) -> FsStat {
        if let Some(client) = &self.stat {
            if let Some(stat) = client.stat(&self.fs_name).await {
                return stat;
            }
            debug!("stat backend did not answer, synthesizing");
        }
        FsStat::synthetic()
    }

    /// The kernel dropping its reference count has no persistent effect on
    /// the engine.
    pub async fn forget_inode(&self, _id: InodeId) -> FsResult<()> {
        Ok(())
    }
}
