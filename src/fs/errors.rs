use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FsError {
    #[error("no such inode")]
    NoSuchInode,
    #[error("inode already exists")]
    AlreadyExists,
    #[error("wrong inode type")]
    WrongType,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("not supported: {0}")]
    Unsupported(&'static str),
    /// A put/commit path failed; the broken marker has been written and the
    /// engine must not be trusted without an fsck.
    #[error("durability failure: {0}")]
    Failed(String),
    #[error("decode failure: {0}")]
    Decode(String),
    #[error("wal replay failed: {0}")]
    Replay(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NoSuchInode => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::WrongType => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::InvalidName(_) => libc::EINVAL,
            FsError::ReadOnly => libc::EROFS,
            FsError::Unsupported(_) => libc::ENOSYS,
            FsError::Failed(_) | FsError::Decode(_) | FsError::Replay(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NoSuchInode.to_errno(), libc::ENOENT);
        assert_eq!(FsError::AlreadyExists.to_errno(), libc::EEXIST);
        assert_eq!(FsError::WrongType.to_errno(), libc::ENOTDIR);
        assert_eq!(FsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::Failed("boom".into()).to_errno(), libc::EIO);
    }
}
