//! Memoized commit-value materialization.

use dashmap::DashMap;
use stage_types::{CommitId, RepoId, Value};

/// Key identifying one memoized materialization: the evaluator that produced
/// it, the repository whose causal order it was folded over, and the commit
/// it was folded up to.
///
/// Including the evaluator identity means swapping in a different
/// [`crate::evaluator::Evaluator`] (e.g. in a test) can never observe a
/// value folded by another evaluator's functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    evaluator: String,
    repo: RepoId,
    commit: CommitId,
}

/// A concurrent, append-only memo table from `(evaluator, repo, commit)` to
/// the materialized [`Value`] at that commit.
///
/// Entries are pure functions of their key — a commit's value never changes
/// once computed — so concurrent readers and writers never need to
/// coordinate beyond what [`DashMap`] already provides.
#[derive(Debug, Default)]
pub struct CommitValueCache {
    entries: DashMap<CacheKey, Value>,
}

impl CommitValueCache {
    /// Construct an empty cache.
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Look up a previously materialized value.
    pub fn get(&self, evaluator: &str, repo: RepoId, commit: CommitId) -> Option<Value> {
        let key = CacheKey { evaluator: evaluator.to_owned(), repo, commit };
        self.entries.get(&key).map(|entry| entry.value().clone())
    }

    /// Record a materialized value. Overwriting an existing entry with an
    /// identical recomputation is harmless since the fold is deterministic.
    pub fn insert(&self, evaluator: &str, repo: RepoId, commit: CommitId, value: Value) {
        let key = CacheKey { evaluator: evaluator.to_owned(), repo, commit };
        self.entries.insert(key, value);
    }

    /// Number of memoized entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing has been memoized yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = CommitValueCache::new();
        let repo = RepoId::new();
        let commit = CommitId([1u8; 32]);

        assert!(cache.get("builtin", repo, commit).is_none());
        cache.insert("builtin", repo, commit, serde_json::json!({"a": 1}));
        assert_eq!(cache.get("builtin", repo, commit), Some(serde_json::json!({"a": 1})));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_evaluators_do_not_share_entries() {
        let cache = CommitValueCache::new();
        let repo = RepoId::new();
        let commit = CommitId([2u8; 32]);

        cache.insert("builtin", repo, commit, serde_json::json!(1));
        assert!(cache.get("other", repo, commit).is_none());
    }
}
