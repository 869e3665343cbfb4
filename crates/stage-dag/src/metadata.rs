//! The metadata algebra: repository creation, commit/merge bookkeeping, and
//! the CRDT-style `update` used to reconcile metadata received from peers.

use std::collections::{BTreeMap, BTreeSet};

use stage_types::{BranchHeads, BranchName, CausalOrder, CommitId, RepoId, RepoMetadata};

use crate::error::DagError;
use crate::history::ancestors_inclusive;

/// Construct the metadata for a brand-new repository with a single root
/// commit already recorded on `initial_branch`.
pub fn new_repository(initial_branch: BranchName, root: CommitId) -> RepoMetadata {
    let mut causal_order = CausalOrder::new();
    causal_order.insert(root, Vec::new());

    let mut heads = BranchHeads::new();
    heads.insert(root);
    let mut branches = BTreeMap::new();
    branches.insert(initial_branch, heads);

    RepoMetadata { id: RepoId::new(), causal_order, branches }
}

/// Duplicate a repository's metadata under the same [`RepoId`] — the
/// starting point for a local subscription to a peer's repository.
pub fn fork(source: &RepoMetadata) -> RepoMetadata {
    source.clone()
}

/// Record a new linear commit on `branch`, advancing its single head from
/// `parent` to `new_commit`.
///
/// Errors with [`DagError::MultipleBranchHeads`] if the branch is currently
/// in conflict — callers must `merge!` first.
pub fn commit(
    metadata: &mut RepoMetadata,
    branch: &BranchName,
    new_commit: CommitId,
    parent: CommitId,
) -> Result<(), DagError> {
    let heads = metadata
        .branches
        .get_mut(branch)
        .ok_or_else(|| DagError::UnknownBranch(metadata.id, branch.clone()))?;

    if heads.len() > 1 {
        return Err(DagError::MultipleBranchHeads(metadata.id, branch.clone()));
    }
    if !heads.contains(&parent) {
        return Err(DagError::UnknownCommit(parent));
    }

    metadata.causal_order.insert(new_commit, vec![parent]);
    heads.clear();
    heads.insert(new_commit);
    Ok(())
}

/// Record a merge commit that resolves `branch`'s current conflict,
/// collapsing every existing head to `new_commit`.
///
/// Errors with [`DagError::NothingToMerge`] if the branch has fewer than two
/// heads.
pub fn merge(
    metadata: &mut RepoMetadata,
    branch: &BranchName,
    new_commit: CommitId,
    parents: Vec<CommitId>,
) -> Result<(), DagError> {
    let heads = metadata
        .branches
        .get_mut(branch)
        .ok_or_else(|| DagError::UnknownBranch(metadata.id, branch.clone()))?;

    if heads.len() < 2 {
        return Err(DagError::NothingToMerge(metadata.id, branch.clone()));
    }

    metadata.causal_order.insert(new_commit, parents);
    heads.clear();
    heads.insert(new_commit);
    Ok(())
}

/// Merge metadata received from a peer into a union of both sides: the
/// causal orders are unioned outright (entries are content-addressed and
/// therefore agree whenever both sides know a commit), and each branch's
/// heads become the head-minimal union of both sides' heads — any head that
/// is now a proper ancestor of another head in the union is dropped, since
/// it is no longer a frontier of the branch's history.
pub fn update(a: &RepoMetadata, b: &RepoMetadata) -> Result<RepoMetadata, DagError> {
    let mut causal_order = a.causal_order.clone();
    causal_order.extend(b.causal_order.iter().map(|(k, v)| (*k, v.clone())));

    let mut branch_names: BTreeSet<BranchName> = a.branches.keys().cloned().collect();
    branch_names.extend(b.branches.keys().cloned());

    let mut branches = BTreeMap::new();
    for name in branch_names {
        let mut union: BranchHeads = a.branches.get(&name).cloned().unwrap_or_default();
        union.extend(b.branches.get(&name).cloned().unwrap_or_default());
        branches.insert(name, reduce_to_frontier(&causal_order, union)?);
    }

    Ok(RepoMetadata { id: a.id, causal_order, branches })
}

/// Drop any commit in `candidates` that is a proper ancestor of another
/// commit still in the set, leaving only the most recent frontier.
fn reduce_to_frontier(causal: &CausalOrder, candidates: BranchHeads) -> Result<BranchHeads, DagError> {
    let list: Vec<CommitId> = candidates.iter().copied().collect();
    let mut frontier = BranchHeads::new();
    for &candidate in &list {
        let is_superseded = list.iter().any(|&other| {
            other != candidate
                && ancestors_inclusive(causal, other)
                    .map(|ancestors| ancestors.contains(&candidate))
                    .unwrap_or(false)
        });
        if !is_superseded {
            frontier.insert(candidate);
        }
    }
    Ok(frontier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_types::CommitObject;

    fn root() -> (CommitId, CommitObject) {
        CommitObject::new(vec![], vec![])
    }

    #[test]
    fn new_repository_has_one_head_on_the_initial_branch() {
        let (root_id, _) = root();
        let branch = BranchName::from("main");
        let meta = new_repository(branch.clone(), root_id);
        assert_eq!(meta.branches[&branch].len(), 1);
        assert!(meta.branches[&branch].contains(&root_id));
    }

    #[test]
    fn commit_advances_the_single_head() {
        let (root_id, _) = root();
        let branch = BranchName::from("main");
        let mut meta = new_repository(branch.clone(), root_id);

        let (next_id, _) = CommitObject::new(vec![], vec![root_id]);
        commit(&mut meta, &branch, next_id, root_id).unwrap();

        assert_eq!(meta.branches[&branch], BTreeSet::from([next_id]));
    }

    #[test]
    fn update_collapses_to_the_most_recent_shared_head() {
        let (root_id, _) = root();
        let branch = BranchName::from("main");
        let base = new_repository(branch.clone(), root_id);

        let mut side_a = base.clone();
        let (a_id, _) = CommitObject::new(vec![], vec![root_id]);
        commit(&mut side_a, &branch, a_id, root_id).unwrap();

        // side_b never advances past root: its head is superseded by side_a's.
        let side_b = base.clone();

        let merged = update(&side_a, &side_b).unwrap();
        assert_eq!(merged.branches[&branch], BTreeSet::from([a_id]));
    }

    #[test]
    fn update_keeps_both_heads_when_branches_diverge() {
        let (root_id, _) = root();
        let branch = BranchName::from("main");
        let base = new_repository(branch.clone(), root_id);

        let mut side_a = base.clone();
        let (a_id, _) = CommitObject::new(vec![], vec![root_id]);
        commit(&mut side_a, &branch, a_id, root_id).unwrap();

        let mut side_b = base.clone();
        let (b_id, _) = CommitObject::new(
            vec![stage_types::Transaction::new(serde_json::json!(1), "set")],
            vec![root_id],
        );
        commit(&mut side_b, &branch, b_id, root_id).unwrap();

        let merged = update(&side_a, &side_b).unwrap();
        assert_eq!(merged.branches[&branch].len(), 2);
    }
}
