#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **stage-store-memory** – In-memory blob store driver for the staging engine.
//!
//! Non-persistent, suitable for tests, demos, and single-process use. All
//! blobs are lost when the process terminates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use stage_store_core::{BlobId, BlobStore};

/// An in-memory, non-persistent blob store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobId, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Construct a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs currently stored.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// True if the store holds no blobs.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &BlobId) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn assoc(&self, key: BlobId, value: Vec<u8>) -> anyhow::Result<()> {
        self.blobs.write().await.insert(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_types::{CommitObject, Transaction};

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        let store = MemoryBlobStore::new();
        assert!(store.get(&[0u8; 32]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assoc_then_get_round_trips() {
        let store = MemoryBlobStore::new();
        let key = [7u8; 32];
        store.assoc(key, b"payload".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn put_and_get_commit_round_trip() {
        let store = MemoryBlobStore::new();
        let (_, commit) =
            CommitObject::new(vec![Transaction::new(serde_json::json!({"b": 2}), "merge")], vec![]);
        let id = store.put_commit(&commit).await.unwrap();
        let loaded = store.get_commit(&id).await.unwrap().unwrap();
        assert_eq!(loaded, commit);
        assert_eq!(store.len().await, 1);
    }
}
