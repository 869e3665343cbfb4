//! Bridges [`crate::state`] to `stage-dag`'s value materializer and conflict
//! summarizer.

use stage_dag::{CommitValueCache, DagError, Evaluator};
use stage_store_core::BlobStore;
use stage_types::{BranchName, RepoMetadata, Transaction};

use crate::error::RuntimeError;
use crate::state::BranchState;

/// Compute the observable value of `branch`: the materialized commit value
/// folded with any staged transactions, or a [`BranchState::Conflict`] if
/// the branch currently has more than one head.
pub async fn branch_value(
    store: &dyn BlobStore,
    cache: &CommitValueCache,
    evaluator: &dyn Evaluator,
    meta: &RepoMetadata,
    branch: &BranchName,
    staged: &[Transaction],
) -> Result<BranchState, RuntimeError> {
    let heads = meta
        .branches
        .get(branch)
        .ok_or_else(|| DagError::UnknownBranch(meta.id, branch.clone()))?;

    if heads.len() > 1 {
        let conflict = stage_dag::summarize_conflict(store, cache, evaluator, meta, branch).await?;
        return Ok(BranchState::Conflict(conflict));
    }

    let head = *heads.iter().next().expect("non-empty by I2");
    let mut value = stage_dag::commit_value(store, cache, evaluator, &meta.causal_order, meta.id, head).await?;
    for trans in staged {
        value = stage_dag::trans_apply(store, evaluator, &value, trans).await?;
    }
    Ok(BranchState::Value(value))
}
