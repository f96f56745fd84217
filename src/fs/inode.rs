use crate::fs::errors::FsError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type InodeId = u64;

/// The root inode. Its parent is 0 and its name-index self-entry lives under
/// the empty name.
pub const ROOT_ID: InodeId = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InodeAttributes {
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
    pub rdev: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// Content address for file payloads; symlinks carry their target here.
    pub hash: Option<String>,
    pub parent: InodeId,
}

impl InodeAttributes {
    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }

    pub fn marshal(&self) -> Result<Bytes, FsError> {
        let data = bincode::serialize(self).map_err(|e| FsError::Decode(e.to_string()))?;
        Ok(Bytes::from(data))
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, FsError> {
        bincode::deserialize(data).map_err(|e| FsError::Decode(e.to_string()))
    }
}

/// An inode as the engine's callers see it: a numeric id bound to one name
/// under one parent, plus its attributes. Renames move the (parent, name)
/// pair; the id never changes and is never reused.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inode {
    pub id: InodeId,
    pub parent: InodeId,
    pub name: String,
    pub attrs: InodeAttributes,
}

impl Inode {
    pub fn new(
        id: InodeId,
        parent: InodeId,
        name: impl Into<String>,
        mut attrs: InodeAttributes,
    ) -> Self {
        attrs.parent = parent;
        Self {
            id,
            parent,
            name: name.into(),
            attrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attrs() -> InodeAttributes {
        InodeAttributes {
            size: 4096,
            nlink: 1,
            mode: libc::S_IFDIR as u32 | 0o755,
            rdev: 0,
            uid: 1000,
            gid: 1000,
            atime: Timestamp {
                secs: 1_234_567_890,
                nanos: 42,
            },
            mtime: Timestamp {
                secs: 1_234_567_891,
                nanos: 43,
            },
            ctime: Timestamp {
                secs: 1_234_567_892,
                nanos: 44,
            },
            hash: Some("abc123".to_string()),
            parent: 1,
        }
    }

    #[test]
    fn test_attrs_marshal_round_trip() {
        let attrs = sample_attrs();
        let blob = attrs.marshal().unwrap();
        let back = InodeAttributes::unmarshal(&blob).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn test_unmarshal_garbage_fails() {
        assert!(InodeAttributes::unmarshal(b"definitely not bincode").is_err());
    }

    #[test]
    fn test_mode_classification() {
        let mut attrs = sample_attrs();
        assert!(attrs.is_directory());
        assert!(!attrs.is_symlink());
        attrs.mode = libc::S_IFLNK as u32 | 0o777;
        assert!(attrs.is_symlink());
        attrs.mode = libc::S_IFREG as u32 | 0o644;
        assert!(!attrs.is_directory());
        assert!(!attrs.is_symlink());
    }

    #[test]
    fn test_inode_new_copies_parent_into_attrs() {
        let inode = Inode::new(10, 3, "file.txt", sample_attrs());
        assert_eq!(inode.parent, 3);
        assert_eq!(inode.attrs.parent, 3);
    }
}
