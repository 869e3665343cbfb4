//! Conflict summarization between diverging branch heads.

use std::collections::{BTreeMap, HashSet};

use stage_store_core::BlobStore;
use stage_types::{BranchName, CommitId, RepoMetadata, Transaction, Value};

use crate::cache::CommitValueCache;
use crate::error::DagError;
use crate::evaluator::Evaluator;
use crate::history::ancestors_inclusive;
use crate::materializer::commit_value;

/// A commit loaded out of the store for inclusion in a [`Conflict`]: its id
/// alongside the transactions and parents carried by the commit object, so a
/// caller can inspect or replay a diverging side without a second store
/// round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCommit {
    /// This commit's content-addressed id.
    pub id: CommitId,
    /// Transactions carried by the commit, in fold order.
    pub transactions: Vec<Transaction>,
    /// Parent ids in ascending-digest order.
    pub parents: Vec<CommitId>,
}

/// A summarized conflict on one branch: its current heads, the commit at
/// which they last agreed (and its materialized value), and — per head —
/// the commits unique to that head since the divergence.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// The branch this conflict was computed for.
    pub branch: BranchName,
    /// The branch's current (conflicting) heads.
    pub heads: Vec<CommitId>,
    /// The minimal frontier of common ancestors of every head. More than one
    /// entry means the heads share no single most-recent ancestor.
    pub lowest_common_ancestors: Vec<CommitId>,
    /// The materialized value at the (singular) lowest common ancestor.
    pub lca_value: Value,
    /// For each head, the commits introduced since the branches diverged,
    /// loaded out of the store — reachable from that head but not from the
    /// lowest-common-ancestor frontier.
    pub unique_commits: BTreeMap<CommitId, Vec<ConflictCommit>>,
}

/// The minimal frontier of common ancestors of every commit in `heads`:
/// commits that are ancestors of all of them, with any entry that is itself
/// an ancestor of another entry removed.
pub fn lowest_common_ancestors(
    causal: &stage_types::CausalOrder,
    heads: &[CommitId],
) -> Result<Vec<CommitId>, DagError> {
    let mut sets = Vec::with_capacity(heads.len());
    for &head in heads {
        sets.push(ancestors_inclusive(causal, head)?);
    }

    let mut common: HashSet<CommitId> = match sets.first() {
        Some(first) => first.clone(),
        None => return Ok(Vec::new()),
    };
    for set in &sets[1..] {
        common.retain(|c| set.contains(c));
    }

    if common.is_empty() {
        return Err(DagError::NoCommonAncestor);
    }

    // Reduce to the minimal frontier: drop any candidate that is a proper
    // ancestor of another candidate still in the set.
    let candidates: Vec<CommitId> = common.iter().copied().collect();
    let mut frontier = Vec::new();
    for &candidate in &candidates {
        let is_ancestor_of_another = candidates.iter().any(|&other| {
            other != candidate
                && ancestors_inclusive(causal, other)
                    .map(|s| s.contains(&candidate))
                    .unwrap_or(false)
                && !ancestors_inclusive(causal, candidate)
                    .map(|s| s.contains(&other))
                    .unwrap_or(false)
        });
        if !is_ancestor_of_another {
            frontier.push(candidate);
        }
    }
    frontier.sort_unstable();
    Ok(frontier)
}

/// Commits reachable from `head` that are not ancestors of any member of the
/// lowest-common-ancestor frontier — i.e. unique to this head's side of the
/// divergence.
pub fn isolate_branch(
    causal: &stage_types::CausalOrder,
    head: CommitId,
    lca: &[CommitId],
) -> Result<Vec<CommitId>, DagError> {
    let reachable = ancestors_inclusive(causal, head)?;
    let mut excluded = HashSet::new();
    for &anchor in lca {
        excluded.extend(ancestors_inclusive(causal, anchor)?);
    }
    let mut unique: Vec<CommitId> = reachable.into_iter().filter(|c| !excluded.contains(c)).collect();
    unique.sort_unstable();
    Ok(unique)
}

async fn load_conflict_commits(
    store: &dyn BlobStore,
    causal: &stage_types::CausalOrder,
    head: CommitId,
    lca: &[CommitId],
) -> Result<Vec<ConflictCommit>, DagError> {
    let ids = isolate_branch(causal, head, lca)?;
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let commit = store.get_commit(&id).await?.ok_or(DagError::UnknownCommit(id))?;
        records.push(ConflictCommit { id, parents: commit.ordered_parents(), transactions: commit.transactions });
    }
    Ok(records)
}

/// Summarize the conflict currently open on `branch`.
///
/// Returns [`DagError::MissingConflictForSummary`] if the branch has fewer
/// than two heads — callers should check [`RepoMetadata::multiple_branch_heads`]
/// first. Returns [`DagError::NonSingularLCA`] if the heads share no single
/// most-recent common ancestor; use [`summarize_conflict_multi`] only once
/// that frontier has been resolved some other way.
pub async fn summarize_conflict(
    store: &dyn BlobStore,
    cache: &CommitValueCache,
    evaluator: &dyn Evaluator,
    metadata: &RepoMetadata,
    branch: &BranchName,
) -> Result<Conflict, DagError> {
    let heads = metadata
        .branches
        .get(branch)
        .ok_or_else(|| DagError::UnknownBranch(metadata.id, branch.clone()))?;

    if heads.len() < 2 {
        return Err(DagError::MissingConflictForSummary(metadata.id, branch.clone()));
    }

    let head_vec: Vec<CommitId> = heads.iter().copied().collect();
    let lca = lowest_common_ancestors(&metadata.causal_order, &head_vec)?;
    let &lca_id = match lca.as_slice() {
        [single] => single,
        _ => return Err(DagError::NonSingularLCA(lca)),
    };
    let lca_value =
        commit_value(store, cache, evaluator, &metadata.causal_order, metadata.id, lca_id).await?;

    let mut unique_commits = BTreeMap::new();
    for &head in &head_vec {
        let commits = load_conflict_commits(store, &metadata.causal_order, head, &lca).await?;
        unique_commits.insert(head, commits);
    }

    Ok(Conflict { branch: branch.clone(), heads: head_vec, lowest_common_ancestors: lca, lca_value, unique_commits })
}

/// Summarize every currently conflicting branch named in `branches`,
/// silently skipping any that are not in conflict.
///
/// Unlike [`summarize_conflict`], a branch whose heads share no single
/// lowest common ancestor is skipped rather than rejected — callers that
/// want to see every branch, resolved cut or not, use this entry point.
pub async fn summarize_conflict_multi(
    store: &dyn BlobStore,
    cache: &CommitValueCache,
    evaluator: &dyn Evaluator,
    metadata: &RepoMetadata,
    branches: &[BranchName],
) -> Result<Vec<Conflict>, DagError> {
    let mut out = Vec::new();
    for branch in branches {
        if !metadata.multiple_branch_heads(branch) {
            continue;
        }
        match summarize_conflict(store, cache, evaluator, metadata, branch).await {
            Ok(conflict) => out.push(conflict),
            Err(DagError::NonSingularLCA(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::BuiltinEvaluator;
    use std::collections::BTreeSet;
    use stage_store_memory::MemoryBlobStore;
    use stage_types::{CommitObject, RepoId};

    async fn commit(
        store: &MemoryBlobStore,
        causal: &mut stage_types::CausalOrder,
        transactions: Vec<Transaction>,
        parents: Vec<CommitId>,
    ) -> CommitId {
        let (id, commit) = CommitObject::new(transactions, parents);
        causal.insert(id, commit.ordered_parents());
        store.put_commit(&commit).await.unwrap();
        id
    }

    #[tokio::test]
    async fn lca_of_a_diamond_is_the_fork_point() {
        let store = MemoryBlobStore::new();
        let mut causal = stage_types::CausalOrder::new();
        let root_id = commit(&store, &mut causal, vec![], vec![]).await;
        let a_id =
            commit(&store, &mut causal, vec![Transaction::new(serde_json::json!("a"), "set")], vec![root_id]).await;
        let b_id =
            commit(&store, &mut causal, vec![Transaction::new(serde_json::json!("b"), "set")], vec![root_id]).await;

        let lca = lowest_common_ancestors(&causal, &[a_id, b_id]).unwrap();
        assert_eq!(lca, vec![root_id]);
    }

    #[tokio::test]
    async fn summarize_conflict_reports_unique_commits_and_lca_value_per_head() {
        let store = MemoryBlobStore::new();
        let cache = CommitValueCache::new();
        let evaluator = BuiltinEvaluator::new();
        let mut causal = stage_types::CausalOrder::new();

        let root_id =
            commit(&store, &mut causal, vec![Transaction::new(serde_json::json!({"init": 43}), "set")], vec![])
                .await;
        let a_id = commit(&store, &mut causal, vec![Transaction::new(serde_json::json!({"a": 1}), "merge")], vec![root_id])
            .await;
        let b_id = commit(&store, &mut causal, vec![Transaction::new(serde_json::json!({"b": 1}), "merge")], vec![root_id])
            .await;

        let mut heads = BTreeSet::new();
        heads.insert(a_id);
        heads.insert(b_id);
        let mut branches = BTreeMap::new();
        let branch = BranchName::from("main");
        branches.insert(branch.clone(), heads);

        let metadata = RepoMetadata { id: RepoId::new(), causal_order: causal, branches };
        let conflict = summarize_conflict(&store, &cache, &evaluator, &metadata, &branch).await.unwrap();

        assert_eq!(conflict.lowest_common_ancestors, vec![root_id]);
        assert_eq!(conflict.lca_value, serde_json::json!({"init": 43}));
        assert_eq!(conflict.unique_commits[&a_id].iter().map(|c| c.id).collect::<Vec<_>>(), vec![a_id]);
        assert_eq!(conflict.unique_commits[&b_id].iter().map(|c| c.id).collect::<Vec<_>>(), vec![b_id]);
    }

    #[tokio::test]
    async fn summarize_conflict_on_a_resolved_branch_errors() {
        let store = MemoryBlobStore::new();
        let cache = CommitValueCache::new();
        let evaluator = BuiltinEvaluator::new();
        let mut causal = stage_types::CausalOrder::new();
        let root_id = commit(&store, &mut causal, vec![], vec![]).await;

        let mut heads = BTreeSet::new();
        heads.insert(root_id);
        let mut branches = BTreeMap::new();
        let branch = BranchName::from("main");
        branches.insert(branch.clone(), heads);

        let metadata = RepoMetadata { id: RepoId::new(), causal_order: causal, branches };
        assert!(matches!(
            summarize_conflict(&store, &cache, &evaluator, &metadata, &branch).await,
            Err(DagError::MissingConflictForSummary(_, _))
        ));
    }

    #[tokio::test]
    async fn summarize_conflict_multi_skips_a_non_singular_cut() {
        let store = MemoryBlobStore::new();
        let cache = CommitValueCache::new();
        let evaluator = BuiltinEvaluator::new();
        let mut causal = stage_types::CausalOrder::new();

        // Two independent roots, each merged into both heads directly (no
        // single commit unifies them first): the common-ancestor frontier
        // is `{root_a, root_b}` since neither dominates the other.
        let root_a = commit(&store, &mut causal, vec![], vec![]).await;
        let root_b = commit(&store, &mut causal, vec![], vec![]).await;
        let head_a =
            commit(&store, &mut causal, vec![Transaction::new(serde_json::json!("a"), "set")], vec![root_a, root_b])
                .await;
        let head_b =
            commit(&store, &mut causal, vec![Transaction::new(serde_json::json!("b"), "set")], vec![root_a, root_b])
                .await;

        let mut heads = BTreeSet::new();
        heads.insert(head_a);
        heads.insert(head_b);
        let mut branches = BTreeMap::new();
        let branch = BranchName::from("main");
        branches.insert(branch.clone(), heads);

        let metadata = RepoMetadata { id: RepoId::new(), causal_order: causal, branches };
        let conflicts =
            summarize_conflict_multi(&store, &cache, &evaluator, &metadata, &[branch]).await.unwrap();
        assert!(conflicts.is_empty());

        let direct = summarize_conflict(&store, &cache, &evaluator, &metadata, &branch).await;
        assert!(matches!(direct, Err(DagError::NonSingularLCA(_))));
    }
}
