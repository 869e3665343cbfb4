use stage_types::{RepoId, UserId};

/// Errors raised by the stage's public API and state mutators.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// `install_repo` (via `create_repo`/`fork`) was called for a
    /// `(user, repo)` pair that already exists in the stage.
    #[error("repo {1} already exists for user {0:?}")]
    RepoAlreadyExists(UserId, RepoId),
    /// `fork` was asked to take a repo id the local user already holds.
    #[error("forking {1} for user {0:?} is impossible: already present")]
    ForkingImpossible(UserId, RepoId),
    /// An operation referenced a `(user, repo)` pair not present in the
    /// stage.
    #[error("no such repo {1} for user {0:?}")]
    UnknownRepo(UserId, RepoId),
    /// An error surfaced by the deterministic DAG core.
    #[error(transparent)]
    Dag(#[from] stage_dag::DagError),
    /// An underlying blob-store operation failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
