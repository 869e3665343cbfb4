//! Commit-value materialization.

use std::collections::HashMap;

use base64::Engine;
use stage_store_core::BlobStore;
use stage_types::{CausalOrder, CommitId, Params, RepoId, Transaction, Value};

use crate::cache::CommitValueCache;
use crate::error::DagError;
use crate::evaluator::Evaluator;
use crate::history;

/// Apply one transaction to `value`, routing the reserved blob-store marker
/// to [`store_blob_trans`] and everything else to `evaluator`.
pub async fn trans_apply(
    store: &dyn BlobStore,
    evaluator: &dyn Evaluator,
    value: &Value,
    trans: &Transaction,
) -> Result<Value, DagError> {
    if trans.trans_fn.is_blob_store_marker() {
        store_blob_trans(store, &trans.params).await
    } else {
        evaluator.apply(&trans.trans_fn, value, &trans.params)
    }
}

/// Store the base64-encoded payload carried in `params` as a content-addressed
/// blob, returning `{"blob_id": "<hex>"}` as the transaction's resulting
/// value — the handle a later `get`-style read resolves back to bytes.
pub async fn store_blob_trans(store: &dyn BlobStore, params: &Params) -> Result<Value, DagError> {
    let encoded = params
        .as_str()
        .ok_or_else(|| DagError::InvalidBlobPayload("payload must be a base64 string".to_owned()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| DagError::InvalidBlobPayload(e.to_string()))?;
    let id = stage_store_core::blob_id(&bytes);
    store.assoc(id, bytes).await?;
    Ok(serde_json::json!({ "blob_id": hex(&id) }))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Materialize the value of `target`, folding transactions ancestors-first
/// over the causal order and memoizing every intermediate commit in `cache`.
///
/// For a commit with no parents the fold starts from [`Value::Null`]; for a
/// commit with parents the fold starts from the value of its first parent in
/// ascending-digest order — a merge commit's own transactions are
/// expected to carry the actual merge step (see
/// [`crate::evaluator::BuiltinEvaluator::merge`]) with the other parent's
/// value supplied as `params`.
pub async fn commit_value(
    store: &dyn BlobStore,
    cache: &CommitValueCache,
    evaluator: &dyn Evaluator,
    causal: &CausalOrder,
    repo: RepoId,
    target: CommitId,
) -> Result<Value, DagError> {
    if let Some(value) = cache.get(evaluator.name(), repo, target) {
        return Ok(value);
    }

    let linear = history::history(causal, target)?;
    let mut computed: HashMap<CommitId, Value> = HashMap::new();

    for id in linear {
        if let Some(value) = cache.get(evaluator.name(), repo, id) {
            computed.insert(id, value);
            continue;
        }

        let commit = store
            .get_commit(&id)
            .await?
            .ok_or(DagError::UnknownCommit(id))?;
        let parents = commit.ordered_parents();

        let mut value = match parents.first() {
            Some(first) => computed
                .get(first)
                .cloned()
                .ok_or(DagError::UnknownCommit(*first))?,
            None => Value::Null,
        };

        for trans in &commit.transactions {
            value = trans_apply(store, evaluator, &value, trans).await?;
        }

        cache.insert(evaluator.name(), repo, id, value.clone());
        computed.insert(id, value);
        tokio::task::yield_now().await;
    }

    computed.remove(&target).ok_or(DagError::UnknownCommit(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::BuiltinEvaluator;
    use stage_store_memory::MemoryBlobStore;
    use stage_types::CommitObject;

    async fn store_commit(
        store: &MemoryBlobStore,
        causal: &mut CausalOrder,
        transactions: Vec<Transaction>,
        parents: Vec<CommitId>,
    ) -> CommitId {
        let (id, commit) = CommitObject::new(transactions, parents);
        causal.insert(id, commit.ordered_parents());
        store.put_commit(&commit).await.unwrap();
        id
    }

    #[tokio::test]
    async fn single_branch_fold_applies_transactions_in_order() {
        let store = MemoryBlobStore::new();
        let cache = CommitValueCache::new();
        let evaluator = BuiltinEvaluator::new();
        let repo = RepoId::new();
        let mut causal = CausalOrder::new();

        let root = store_commit(
            &store,
            &mut causal,
            vec![Transaction::new(serde_json::json!({"a": 1}), "set")],
            vec![],
        )
        .await;
        let tip = store_commit(
            &store,
            &mut causal,
            vec![Transaction::new(serde_json::json!({"b": 2}), "merge")],
            vec![root],
        )
        .await;

        let value = commit_value(&store, &cache, &evaluator, &causal, repo, tip).await.unwrap();
        assert_eq!(value, serde_json::json!({"a": 1, "b": 2}));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn repeated_materialization_reuses_cache() {
        let store = MemoryBlobStore::new();
        let cache = CommitValueCache::new();
        let evaluator = BuiltinEvaluator::new();
        let repo = RepoId::new();
        let mut causal = CausalOrder::new();

        let root = store_commit(
            &store,
            &mut causal,
            vec![Transaction::new(serde_json::json!({"a": 1}), "set")],
            vec![],
        )
        .await;

        let first = commit_value(&store, &cache, &evaluator, &causal, repo, root).await.unwrap();
        assert_eq!(cache.len(), 1);
        let second = commit_value(&store, &cache, &evaluator, &causal, repo, root).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn binary_transaction_stores_a_blob_and_returns_its_handle() {
        let store = MemoryBlobStore::new();
        let cache = CommitValueCache::new();
        let evaluator = BuiltinEvaluator::new();
        let repo = RepoId::new();
        let mut causal = CausalOrder::new();

        let payload = base64::engine::general_purpose::STANDARD.encode(b"hello world");
        let tip = store_commit(&store, &mut causal, vec![Transaction::blob(serde_json::json!(payload))], vec![])
            .await;

        let value = commit_value(&store, &cache, &evaluator, &causal, repo, tip).await.unwrap();
        let blob_id = value.get("blob_id").and_then(|v| v.as_str()).unwrap();
        assert_eq!(blob_id.len(), 64);
    }
}
