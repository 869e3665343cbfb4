use stage_types::{BranchName, CommitId, RepoId};

/// Errors raised by the deterministic DAG core.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// A commit id referenced by a causal order is not present in it.
    #[error("unknown commit {0}")]
    UnknownCommit(CommitId),
    /// A branch name has no entry in the repository's metadata.
    #[error("unknown branch {0:?} in repo {1}")]
    UnknownBranch(RepoId, BranchName),
    /// `branch_value` (or `commit!`/`merge!`) was called on a branch that
    /// currently has more than one head.
    #[error("branch {1:?} of repo {0} has multiple heads")]
    MultipleBranchHeads(RepoId, BranchName),
    /// `summarize_conflict` was called on a branch that is not in conflict.
    #[error("branch {1:?} of repo {0} is not in conflict")]
    MissingConflictForSummary(RepoId, BranchName),
    /// The lowest-common-ancestor cut had more than one member and the
    /// caller used the single-conflict entry point.
    #[error("non-singular LCA cut: {0:?}")]
    NonSingularLCA(Vec<CommitId>),
    /// Two commit histories for the same repository share no ancestor,
    /// which should be impossible for a causal order rooted at one create.
    #[error("no common ancestor between diverging heads")]
    NoCommonAncestor,
    /// `merge!` was called on a branch with fewer than two heads.
    #[error("branch {1:?} of repo {0} has nothing to merge")]
    NothingToMerge(RepoId, BranchName),
    /// The evaluator does not recognise a transaction function identifier.
    #[error("unknown transaction function {0:?}")]
    UnknownTransFn(stage_types::TransFnId),
    /// A `transact_binary` payload was not valid base64.
    #[error("invalid binary transaction payload: {0}")]
    InvalidBlobPayload(String),
    /// An underlying blob-store or (de)serialization operation failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
