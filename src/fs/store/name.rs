//! Name-index store: `(parent, name)` → inode id.
//!
//! Keys are `"<parent_id>:<name>"`; iteration order is lexicographic on the
//! key, which fixes readdir order. Pagination seeks to the cursor name and
//! skips it (seek-then-skip-one), so pages are strictly increasing with no
//! duplicates or omissions while the directory is quiet.

use crate::db::MetaStore;
use crate::fs::errors::FsError;
use crate::fs::inode::InodeId;
use crate::fs::key_codec::KeyCodec;
use futures::StreamExt;
use std::ops::Bound;
use std::sync::Arc;

#[derive(Clone)]
pub struct NameIndexStore {
    store: Arc<MetaStore>,
}

/// One page of child names. `truncated` is set when the scan stopped at the
/// limit rather than the end of the prefix.
pub struct NamePage {
    pub entries: Vec<(String, InodeId)>,
    pub truncated: bool,
}

impl NameIndexStore {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, parent: InodeId, name: &str) -> Result<Option<InodeId>, FsError> {
        let key = KeyCodec::name_key(parent, name);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(value) => Ok(Some(KeyCodec::decode_inode_value(&value)?)),
        }
    }

    pub async fn insert(&self, parent: InodeId, name: &str, id: InodeId) -> Result<(), FsError> {
        let key = KeyCodec::name_key(parent, name);
        self.store.put(&key, &KeyCodec::inode_value(id)).await
    }

    pub async fn remove(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        let key = KeyCodec::name_key(parent, name);
        self.store.delete(&key).await
    }

    /// Up to `limit` children of `parent` strictly after `start_after`,
    /// lexicographically ordered. The root self-entry (empty name) is never
    /// reported.
    pub async fn children(
        &self,
        parent: InodeId,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<NamePage, FsError> {
        let mut entries = Vec::new();
        if limit == 0 {
            return Ok(NamePage {
                entries,
                truncated: true,
            });
        }

        let (prefix_start, end) = KeyCodec::name_range(parent);
        let start = match start_after {
            None => prefix_start,
            Some(name) => KeyCodec::name_key(parent, name),
        };
        let range = (Bound::Included(start), Bound::Excluded(end));

        let mut stream = self.store.scan(range).await?;
        let mut truncated = false;
        while let Some(kv) = stream.next().await {
            let (key, value) = kv?;
            let (_, name) = KeyCodec::split_name_key(&key)?;
            if name.is_empty() {
                continue;
            }
            if let Some(cursor) = start_after {
                if name == cursor {
                    continue;
                }
            }
            let id = KeyCodec::decode_inode_value(&value)?;
            entries.push((name, id));
            if entries.len() == limit {
                truncated = stream.next().await.is_some();
                break;
            }
        }
        Ok(NamePage { entries, truncated })
    }

    /// Full prefix scan counting every child entry.
    pub async fn count_children(&self, parent: InodeId) -> Result<usize, FsError> {
        let (start, end) = KeyCodec::name_range(parent);
        let mut stream = self.store.scan(start..end).await?;
        let mut count = 0usize;
        while let Some(kv) = stream.next().await {
            let (key, _) = kv?;
            let (_, name) = KeyCodec::split_name_key(&key)?;
            if !name.is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// The highest inode id referenced by any name entry. Crash-recovery
    /// fallback for the last-inode counter.
    pub async fn max_inode_id(&self) -> Result<InodeId, FsError> {
        let mut stream = self.store.scan::<std::ops::RangeFull>(..).await?;
        let mut max = 0u64;
        while let Some(kv) = stream.next().await {
            let (_, value) = kv?;
            let id = KeyCodec::decode_inode_value(&value)?;
            max = max.max(id);
        }
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, NameIndexStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path(), "inodes").await.unwrap());
        (dir, NameIndexStore::new(store))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let (_dir, names) = open_store().await;
        assert!(names.get(1, "foo").await.unwrap().is_none());
        names.insert(1, "foo", 42).await.unwrap();
        assert_eq!(names.get(1, "foo").await.unwrap(), Some(42));
        names.remove(1, "foo").await.unwrap();
        assert!(names.get(1, "foo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_children_lexicographic_and_scoped() {
        let (_dir, names) = open_store().await;
        names.insert(1, "delta", 4).await.unwrap();
        names.insert(1, "alpha", 2).await.unwrap();
        names.insert(1, "charlie", 3).await.unwrap();
        // Root self-entry and a different parent must stay invisible.
        names.insert(1, "", 1).await.unwrap();
        names.insert(11, "other", 9).await.unwrap();

        let page = names.children(1, None, 10).await.unwrap();
        assert!(!page.truncated);
        let got: Vec<&str> = page.entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(got, vec!["alpha", "charlie", "delta"]);
    }

    #[tokio::test]
    async fn test_children_pagination_no_dup_no_skip() {
        let (_dir, names) = open_store().await;
        for i in 0..9u64 {
            names
                .insert(5, &format!("name-{i}"), 100 + i)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = names.children(5, cursor.as_deref(), 4).await.unwrap();
            for (name, _) in &page.entries {
                seen.push(name.clone());
            }
            if !page.truncated {
                break;
            }
            cursor = page.entries.last().map(|(n, _)| n.clone());
        }
        let expected: Vec<String> = (0..9).map(|i| format!("name-{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_count_children_excludes_self_entry() {
        let (_dir, names) = open_store().await;
        names.insert(0, "", 1).await.unwrap();
        names.insert(1, "a", 2).await.unwrap();
        names.insert(1, "b", 3).await.unwrap();
        assert_eq!(names.count_children(0).await.unwrap(), 0);
        assert_eq!(names.count_children(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_max_inode_id() {
        let (_dir, names) = open_store().await;
        assert_eq!(names.max_inode_id().await.unwrap(), 0);
        names.insert(1, "a", 17).await.unwrap();
        names.insert(1, "b", 5).await.unwrap();
        names.insert(2, "c", 11).await.unwrap();
        assert_eq!(names.max_inode_id().await.unwrap(), 17);
    }
}
