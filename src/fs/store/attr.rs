//! Attribute store: inode id → serialized attribute blob.
//!
//! Reads happen on cache miss; bulk writes arrive through WAL dumps, which
//! batch directly against the underlying store handle.

use crate::db::MetaStore;
use crate::fs::errors::FsError;
use crate::fs::inode::{InodeAttributes, InodeId};
use crate::fs::key_codec::KeyCodec;
use std::sync::Arc;

#[derive(Clone)]
pub struct AttrStore {
    store: Arc<MetaStore>,
}

impl AttrStore {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: InodeId) -> Result<Option<InodeAttributes>, FsError> {
        match self.store.get(&KeyCodec::attr_key(id)).await? {
            None => Ok(None),
            Some(blob) => Ok(Some(InodeAttributes::unmarshal(&blob)?)),
        }
    }

    pub async fn put(&self, id: InodeId, attrs: &InodeAttributes) -> Result<(), FsError> {
        let blob = attrs.marshal()?;
        self.store.put(&KeyCodec::attr_key(id), &blob).await
    }

    pub async fn delete(&self, id: InodeId) -> Result<(), FsError> {
        self.store.delete(&KeyCodec::attr_key(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::Timestamp;

    #[tokio::test]
    async fn test_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path(), "attrs").await.unwrap());
        let attrs_store = AttrStore::new(store);

        let attrs = InodeAttributes {
            size: 512,
            nlink: 2,
            mode: libc::S_IFREG as u32 | 0o640,
            uid: 7,
            gid: 8,
            mtime: Timestamp::now(),
            parent: 1,
            ..Default::default()
        };

        assert!(attrs_store.get(99).await.unwrap().is_none());
        attrs_store.put(99, &attrs).await.unwrap();
        assert_eq!(attrs_store.get(99).await.unwrap().unwrap(), attrs);
        attrs_store.delete(99).await.unwrap();
        assert!(attrs_store.get(99).await.unwrap().is_none());
    }
}
