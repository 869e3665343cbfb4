#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **stage-types** – Shared primitive data structures for the staging engine.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, networking, or storage
//! backends — those live in `stage-store-core`, `stage-bus-core` and
//! `stage-dag`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

//─────────────────────────────
//  Size limits
//─────────────────────────────

/// Maximum number of transactions a single staging append may contain.
pub const MAX_TRANSACTIONS_PER_APPEND: usize = 10_000;

/// Maximum allowed size for a branch name.
pub const MAX_BRANCH_NAME_LEN: usize = 256;

//─────────────────────────────
//  Identifiers
//─────────────────────────────

/// Identifier of a local user session. The stage has no notion of
/// authentication; this is simply the key under which staged state is kept.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a repository. Random (UUID v4) at `create_repo`, preserved
/// across `fork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub Uuid);

impl RepoId {
    /// Mint a new, random repository id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RepoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a branch within a repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchName(pub String);

impl BranchName {
    /// Validate a branch name against the configured size limit.
    pub fn validate(&self) -> Result<(), StageTypeError> {
        if self.0.is_empty() || self.0.len() > MAX_BRANCH_NAME_LEN {
            return Err(StageTypeError::InvalidBranchName(self.0.clone()));
        }
        Ok(())
    }
}

impl From<&str> for BranchName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed identifier of a [`CommitObject`]: a BLAKE3 digest.
///
/// Parent ordering throughout the crate graph (history linearization, merge
/// fold order) is the ascending byte order of this digest — the
/// deterministic choice recorded in `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId(pub [u8; 32]);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self)
    }
}

/// Identifier of a transaction function, resolved by the [`Evaluator`]
/// contract (`stage-dag`) into a concrete `(value, params) -> value`
/// mapping. May be a symbolic name (`"merge"`) or a content address of
/// stored function source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransFnId(pub String);

impl TransFnId {
    /// Reserved identifier routed by the materializer to the blob-store
    /// transaction path instead of the evaluator.
    pub const BLOB_STORE_MARKER: &'static str = "trans-blob-id";

    /// True if this is the reserved blob-store marker.
    pub fn is_blob_store_marker(&self) -> bool {
        self.0 == Self::BLOB_STORE_MARKER
    }

    /// Construct the reserved blob-store marker identifier.
    pub fn blob_store_marker() -> Self {
        Self(Self::BLOB_STORE_MARKER.to_owned())
    }
}

impl From<&str> for TransFnId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

//─────────────────────────────
//  Values and parameters
//─────────────────────────────

/// A materialized repository value. Opaque JSON — the stage performs no
/// schema validation (an explicit Non-goal).
pub type Value = serde_json::Value;

/// Parameters passed to a transaction function alongside the current value.
pub type Params = serde_json::Value;

//─────────────────────────────
//  Transactions & commits
//─────────────────────────────

/// A `(params, trans-fn-id)` pair, staged or already committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Parameters supplied to the transaction function.
    pub params: Params,
    /// Identifier of the transaction function to apply.
    pub trans_fn: TransFnId,
}

impl Transaction {
    /// Construct a new transaction.
    pub fn new(params: Params, trans_fn: impl Into<TransFnId>) -> Self {
        Self { params, trans_fn: trans_fn.into() }
    }

    /// Construct a `transact_binary`-style transaction routed to the
    /// blob-store transaction path.
    pub fn blob(blob: Params) -> Self {
        Self { params: blob, trans_fn: TransFnId::blob_store_marker() }
    }
}

/// An immutable commit object: an ordered list of transactions folded onto
/// the linearized value of its parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitObject {
    /// Transactions carried by this commit, in fold order.
    pub transactions: Vec<Transaction>,
    /// Parent commit ids. Empty for a root commit. More than one parent
    /// marks a merge commit.
    pub parents: Vec<CommitId>,
}

impl CommitObject {
    /// Construct a new commit object and compute its content-addressed id.
    ///
    /// Parent digests are sorted into ascending byte order before hashing so
    /// that two commits with the same transactions and the same parent set
    /// (given in any order) hash identically.
    pub fn new(transactions: Vec<Transaction>, mut parents: Vec<CommitId>) -> (CommitId, Self) {
        parents.sort_unstable();
        let commit = Self { transactions, parents };
        (commit.digest(), commit)
    }

    /// Recompute the content-addressed id of this commit object.
    pub fn digest(&self) -> CommitId {
        let bytes = serde_json::to_vec(self).expect("CommitObject is always serializable");
        let mut hasher = blake3::Hasher::new();
        hasher.update(&bytes);
        CommitId(*hasher.finalize().as_bytes())
    }

    /// Parents in deterministic ascending-byte order.
    pub fn ordered_parents(&self) -> Vec<CommitId> {
        let mut parents = self.parents.clone();
        parents.sort_unstable();
        parents
    }
}

//─────────────────────────────
//  Causal order & repository metadata
//─────────────────────────────

/// The commit DAG as a `commit-id -> parents` map.
pub type CausalOrder = BTreeMap<CommitId, Vec<CommitId>>;

/// The set of heads of a branch. `len() >= 2` means the branch is in
/// conflict.
pub type BranchHeads = BTreeSet<CommitId>;

/// Repository metadata: the causal order plus named branch heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoMetadata {
    /// Repository identifier. Preserved across forks.
    pub id: RepoId,
    /// The full commit DAG known to this stage for this repository.
    pub causal_order: CausalOrder,
    /// Named branches and their (possibly conflicting) heads.
    pub branches: BTreeMap<BranchName, BranchHeads>,
}

impl RepoMetadata {
    /// True if `branch` has more than one head.
    pub fn multiple_branch_heads(&self, branch: &BranchName) -> bool {
        self.branches.get(branch).map(|h| h.len() > 1).unwrap_or(false)
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised while constructing or validating core types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StageTypeError {
    /// A branch name was empty or exceeded [`MAX_BRANCH_NAME_LEN`].
    #[error("invalid branch name: {0:?}")]
    InvalidBranchName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_digest_is_order_independent_over_parents() {
        let p1 = CommitObject::new(vec![], vec![]).0;
        let p2 = CommitObject::new(vec![Transaction::new(serde_json::json!(1), "merge")], vec![]).0;

        let (id_a, _) = CommitObject::new(vec![], vec![p1, p2]);
        let (id_b, _) = CommitObject::new(vec![], vec![p2, p1]);

        assert_eq!(id_a, id_b);
    }

    #[test]
    fn commit_digest_changes_with_transactions() {
        let (id_empty, _) = CommitObject::new(vec![], vec![]);
        let (id_with_tx, _) =
            CommitObject::new(vec![Transaction::new(serde_json::json!({"b": 2}), "merge")], vec![]);
        assert_ne!(id_empty, id_with_tx);
    }

    #[test]
    fn blob_store_marker_round_trips() {
        let marker = TransFnId::blob_store_marker();
        assert!(marker.is_blob_store_marker());
        assert!(!TransFnId::from("merge").is_blob_store_marker());
    }

    #[test]
    fn branch_name_validation_rejects_empty_and_oversized() {
        assert!(BranchName::from("master").validate().is_ok());
        assert!(BranchName::from("").validate().is_err());
        let long = "x".repeat(MAX_BRANCH_NAME_LEN + 1);
        assert!(BranchName::from(long.as_str()).validate().is_err());
    }
}
