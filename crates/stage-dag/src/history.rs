//! Depth-first linearization of the commit DAG.

use std::collections::HashSet;

use stage_types::{CausalOrder, CommitId};

use crate::error::DagError;

/// Linearize the commit DAG reachable from `head`, ancestors first.
///
/// Each commit appears exactly once, after every one of its parents. Parent
/// order at each node is the ascending byte order of the commit digest,
/// which makes the output — and therefore every downstream fold over
/// it — fully deterministic regardless of insertion order into the causal
/// map.
///
/// Implemented as an explicit stack so materialization over deep histories
/// never grows the call stack.
pub fn history(causal: &CausalOrder, head: CommitId) -> Result<Vec<CommitId>, DagError> {
    let mut output = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![head];

    while let Some(&frame) = stack.last() {
        let parents = causal.get(&frame).ok_or(DagError::UnknownCommit(frame))?;
        let mut ordered: Vec<CommitId> = parents.clone();
        ordered.sort_unstable();

        let pending: Vec<CommitId> =
            ordered.into_iter().filter(|p| !visited.contains(p)).collect();

        if pending.is_empty() {
            if visited.insert(frame) {
                output.push(frame);
            }
            stack.pop();
        } else {
            for parent in pending.into_iter().rev() {
                stack.push(parent);
            }
        }
    }

    Ok(output)
}

/// The set of ancestors of `start`, including `start` itself.
pub fn ancestors_inclusive(
    causal: &CausalOrder,
    start: CommitId,
) -> Result<HashSet<CommitId>, DagError> {
    let mut visited = HashSet::new();
    let mut stack = vec![start];
    while let Some(c) = stack.pop() {
        if !visited.insert(c) {
            continue;
        }
        let parents = causal.get(&c).ok_or(DagError::UnknownCommit(c))?;
        for &p in parents {
            if !visited.contains(&p) {
                stack.push(p);
            }
        }
    }
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_types::CommitObject;

    fn commit(parents: Vec<CommitId>) -> (CommitId, CommitObject) {
        CommitObject::new(vec![], parents)
    }

    #[test]
    fn linear_chain_orders_oldest_first() {
        let (root_id, root) = commit(vec![]);
        let (mid_id, mid) = commit(vec![root_id]);
        let (tip_id, tip) = commit(vec![mid_id]);

        let mut causal = CausalOrder::new();
        causal.insert(root_id, root.parents.clone());
        causal.insert(mid_id, mid.parents.clone());
        causal.insert(tip_id, tip.parents.clone());

        let h = history(&causal, tip_id).unwrap();
        assert_eq!(h, vec![root_id, mid_id, tip_id]);
    }

    #[test]
    fn each_commit_appears_once_in_a_diamond() {
        let (root_id, root) = commit(vec![]);
        let (a_id, a) = commit(vec![root_id]);
        let (b_id, b) = commit(vec![root_id]);
        let (merge_id, merge) = commit(vec![a_id, b_id]);

        let mut causal = CausalOrder::new();
        causal.insert(root_id, root.parents.clone());
        causal.insert(a_id, a.parents.clone());
        causal.insert(b_id, b.parents.clone());
        causal.insert(merge_id, merge.parents.clone());

        let h = history(&causal, merge_id).unwrap();
        assert_eq!(h.len(), 4);
        assert_eq!(h.last(), Some(&merge_id));
        assert_eq!(h.iter().filter(|&&c| c == root_id).count(), 1);

        let root_pos = h.iter().position(|&c| c == root_id).unwrap();
        let a_pos = h.iter().position(|&c| c == a_id).unwrap();
        let b_pos = h.iter().position(|&c| c == b_id).unwrap();
        assert!(root_pos < a_pos && root_pos < b_pos);
    }

    #[test]
    fn unknown_head_is_reported() {
        let causal = CausalOrder::new();
        let (missing_id, _) = commit(vec![]);
        assert!(matches!(
            history(&causal, missing_id),
            Err(DagError::UnknownCommit(_))
        ));
    }
}
