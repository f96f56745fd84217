//! Canonical key encodings for the two metadata stores.
//!
//! Name-index keys are UTF-8 `"<parent_id_decimal>:<name>"`; attribute keys
//! are the 8-byte big-endian inode id. The same serialization is used for
//! writes, lookups, and iteration seeks.

use crate::codec;
use crate::fs::errors::FsError;
use crate::fs::inode::InodeId;
use bytes::Bytes;

pub const NAME_SEPARATOR: u8 = b':';

pub struct KeyCodec;

impl KeyCodec {
    /// `"<parent>:<name>"`. The empty name is the root self-entry.
    pub fn name_key(parent: InodeId, name: &str) -> Bytes {
        Bytes::from(format!("{parent}:{name}"))
    }

    /// `"<parent>:"`, the prefix every child of `parent` sorts under.
    pub fn name_prefix(parent: InodeId) -> Bytes {
        Bytes::from(format!("{parent}:"))
    }

    /// Half-open scan range covering every name under `parent`. The upper
    /// bound replaces the trailing separator with its successor byte.
    pub fn name_range(parent: InodeId) -> (Bytes, Bytes) {
        let start = Self::name_prefix(parent);
        let mut end = start.to_vec();
        *end.last_mut().expect("prefix is never empty") = NAME_SEPARATOR + 1;
        (start, Bytes::from(end))
    }

    pub fn split_name_key(key: &[u8]) -> Result<(InodeId, String), FsError> {
        let text = std::str::from_utf8(key)
            .map_err(|e| FsError::Decode(format!("non-utf8 name key: {e}")))?;
        let (parent, name) = text
            .split_once(NAME_SEPARATOR as char)
            .ok_or_else(|| FsError::Decode(format!("name key without separator: {text:?}")))?;
        let parent = parent
            .parse::<InodeId>()
            .map_err(|e| FsError::Decode(format!("bad parent in name key {text:?}: {e}")))?;
        Ok((parent, name.to_string()))
    }

    pub fn attr_key(id: InodeId) -> Bytes {
        Bytes::copy_from_slice(&codec::u64_to_bytes(id))
    }

    pub fn decode_attr_key(key: &[u8]) -> Result<InodeId, FsError> {
        codec::bytes_to_u64(key)
    }

    /// Name-index value: the inode id, 8 bytes big-endian.
    pub fn inode_value(id: InodeId) -> Bytes {
        Self::attr_key(id)
    }

    pub fn decode_inode_value(value: &[u8]) -> Result<InodeId, FsError> {
        codec::bytes_to_u64(value)
    }
}
