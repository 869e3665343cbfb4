#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **stage-store-core** – Content-addressed blob store abstraction.
//!
//! This crate provides the storage trait the staging engine uses to resolve
//! commit objects and transaction parameters by content address. It defines
//! the contract only; concrete backends (`stage-store-memory`, and in a
//! production deployment a durable driver) implement [`BlobStore`] against
//! this crate.

use async_trait::async_trait;
use stage_types::CommitId;

//─────────────────────────────
//  Blob identifiers
//─────────────────────────────

/// A content-address: a BLAKE3 digest of the bytes it names.
pub type BlobId = [u8; 32];

/// Well-known key used to look up the registered blob-store transaction
/// marker. Mirrors [`stage_types::TransFnId::BLOB_STORE_MARKER`] but kept
/// distinct because the store and the evaluator are separate collaborators.
pub const TRANS_BLOB_MARKER_KEY: &str = "trans-blob-id";

/// Compute the content address of a byte slice.
pub fn blob_id(bytes: &[u8]) -> BlobId {
    *blake3::hash(bytes).as_bytes()
}

/// Content-address a commit object's serialized bytes, returning both the
/// bytes and their digest (suitable for an `assoc` call).
pub fn serialize_commit(commit: &stage_types::CommitObject) -> (Vec<u8>, CommitId) {
    let bytes = serde_json::to_vec(commit).expect("CommitObject is always serializable");
    (bytes, commit.digest())
}

//─────────────────────────────
//  Storage backend trait
//─────────────────────────────

/// Abstraction over a content-addressed blob store: `get`/`assoc` plus the
/// default `put_commit`/`get_commit` convenience wrappers built on them.
/// Implementations must be thread-safe; the staging engine holds a single
/// shared `Arc<dyn BlobStore>`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the bytes stored under `key`, if present.
    async fn get(&self, key: &BlobId) -> anyhow::Result<Option<Vec<u8>>>;

    /// Associate `value` with `key`. Overwriting an existing key with the
    /// same content is a no-op in practice since keys are content
    /// addresses, but implementations are not required to detect that.
    async fn assoc(&self, key: BlobId, value: Vec<u8>) -> anyhow::Result<()>;

    /// Convenience wrapper that stores a [`stage_types::CommitObject`] under
    /// its own digest and returns the resulting [`CommitId`].
    async fn put_commit(&self, commit: &stage_types::CommitObject) -> anyhow::Result<CommitId> {
        let (bytes, id) = serialize_commit(commit);
        self.assoc(id.0, bytes).await?;
        Ok(id)
    }

    /// Convenience wrapper that loads and deserializes a commit object by id.
    async fn get_commit(&self, id: &CommitId) -> anyhow::Result<Option<stage_types::CommitObject>> {
        match self.get(&id.0).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by storage operations beyond plain I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested blob was not found.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// The stored bytes could not be deserialized into the expected type.
    #[error("failed to deserialize stored value: {0}")]
    DeserializationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_types::{CommitObject, Transaction};

    #[test]
    fn blob_id_is_deterministic() {
        assert_eq!(blob_id(b"hello"), blob_id(b"hello"));
        assert_ne!(blob_id(b"hello"), blob_id(b"world"));
    }

    #[test]
    fn serialize_commit_round_trips_digest() {
        let (_, commit) =
            CommitObject::new(vec![Transaction::new(serde_json::json!(1), "merge")], vec![]);
        let (_, id) = serialize_commit(&commit);
        assert_eq!(id, commit.digest());
    }
}
