//! Stage state and its atomic mutators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use stage_bus_core::{MetaKeys, RepoMetas};
use stage_dag::Conflict;
use stage_types::{BranchName, CommitId, RepoId, RepoMetadata, Transaction, UserId, Value};

use crate::error::RuntimeError;

/// The last sync operation recorded against a repository entry, cleared by
/// `cleanup_ops_and_new_values`. Per-repo, not per-branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// The repo's metadata was published to the peer.
    MetaPub,
    /// The repo's metadata was (re-)subscribed to.
    MetaSub,
}

/// The observable value of one branch, as computed by the materializer or
/// the conflict summarizer, possibly wrapped to note that staged
/// transactions were invalidated by an incoming history.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchState {
    /// A single-head branch's materialized value.
    Value(Value),
    /// A multi-head branch's summarized conflict.
    Conflict(Conflict),
    /// The branch's value just after staged transactions were invalidated
    /// by an incoming `:meta-pub`.
    Abort {
        /// The branch's new value after the incoming history was applied.
        new_value: Box<BranchState>,
        /// Transactions staged before the incoming history arrived, now
        /// invalidated and returned to the application.
        aborted: Vec<Transaction>,
    },
}

/// One repository's entry in the stage.
#[derive(Debug, Clone)]
pub struct RepoEntry {
    /// The repository's metadata: causal order plus branch heads.
    pub meta: RepoMetadata,
    /// Staged, uncommitted transactions per branch, in submission order.
    pub transactions: BTreeMap<BranchName, Vec<Transaction>>,
    /// Blobs (commit objects) produced locally since the last `:meta-pubed`
    /// ack, that a remote peer's `:fetch`/`:binary-fetch` may still need.
    pub new_values: BTreeMap<BranchName, BTreeMap<CommitId, Vec<u8>>>,
    /// Last sync operation recorded for this repo in the current cycle.
    pub op: Option<Op>,
}

impl RepoEntry {
    /// A fresh entry around freshly constructed metadata, with no staged
    /// transactions and no pending publications.
    pub fn new(meta: RepoMetadata) -> Self {
        Self { meta, transactions: BTreeMap::new(), new_values: BTreeMap::new(), op: None }
    }
}

/// The root stage value: `user -> repo-id -> RepoEntry`.
pub type StageValue = BTreeMap<UserId, BTreeMap<RepoId, RepoEntry>>;

/// The stage's mutable state: the root CAS plus the subscription config and
/// the narrow append/abort-check critical section.
///
/// All updates other than `append_transactions` go through a write-lock
/// acquisition, clone-and-mutate, replace over `root` — following the
/// teacher's `Arc<RwLock<WorldState>>` pattern rather than a persistent
/// structure. `append_mutex` is reserved for the one critical section where
/// a concurrent abort decision must not be allowed to race a staged append.
#[derive(Debug, Clone)]
pub struct StageState {
    root: Arc<RwLock<StageValue>>,
    append_mutex: Arc<Mutex<()>>,
    subs: Arc<RwLock<MetaKeys>>,
}

impl Default for StageState {
    fn default() -> Self {
        Self::new()
    }
}

impl StageState {
    /// Construct an empty stage.
    pub fn new() -> Self {
        Self {
            root: Arc::new(RwLock::new(StageValue::new())),
            append_mutex: Arc::new(Mutex::new(())),
            subs: Arc::new(RwLock::new(MetaKeys::new())),
        }
    }

    /// A read-only clone of the current root value.
    pub async fn snapshot(&self) -> StageValue {
        self.root.read().await.clone()
    }

    /// The current subscription set (`config.subs`).
    pub async fn subs(&self) -> MetaKeys {
        self.subs.read().await.clone()
    }

    /// Replace the subscription set wholesale.
    pub async fn set_subs(&self, subs: MetaKeys) {
        *self.subs.write().await = subs;
    }

    /// Install a brand-new repo entry for `user`. Fails if one is already
    /// present, used by `create_repo`/`fork` to reject a duplicate.
    pub async fn install_repo(
        &self,
        user: UserId,
        id: RepoId,
        entry: RepoEntry,
        branches: BTreeSet<BranchName>,
    ) -> Result<(), RuntimeError> {
        {
            let mut root = self.root.write().await;
            let user_repos = root.entry(user.clone()).or_default();
            if user_repos.contains_key(&id) {
                return Err(RuntimeError::RepoAlreadyExists(user.clone(), id));
            }
            user_repos.insert(id, entry);
        }
        let mut subs = self.subs.write().await;
        subs.entry(user).or_default().insert(id, branches);
        Ok(())
    }

    /// Append staged transactions to `(user, repo, branch)`. Atomic with
    /// respect to any concurrent abort decision made by the stage loop.
    pub async fn append_transactions(
        &self,
        user: &UserId,
        repo: RepoId,
        branch: &BranchName,
        txs: Vec<Transaction>,
    ) -> Result<(), RuntimeError> {
        let _guard = self.append_mutex.lock().await;
        let mut root = self.root.write().await;
        let entry = root
            .get_mut(user)
            .and_then(|repos| repos.get_mut(&repo))
            .ok_or_else(|| RuntimeError::UnknownRepo(user.clone(), repo))?;
        entry.transactions.entry(branch.clone()).or_default().extend(txs);
        Ok(())
    }

    /// Take and clear the staged transactions for `(user, repo, branch)`,
    /// under the same critical section `append_transactions` uses, so a
    /// concurrent append can never be silently lost to an abort decision.
    pub async fn take_staged(
        &self,
        user: &UserId,
        repo: RepoId,
        branch: &BranchName,
    ) -> Vec<Transaction> {
        let _guard = self.append_mutex.lock().await;
        let mut root = self.root.write().await;
        root.get_mut(user)
            .and_then(|repos| repos.get_mut(&repo))
            .and_then(|entry| entry.transactions.get_mut(branch))
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Clear `op` and `new-values[b]` for every `(u, r, b)` named in `metas`.
    pub async fn cleanup_ops_and_new_values(&self, metas: &MetaKeys) {
        let mut root = self.root.write().await;
        for (user, repos) in metas {
            for (&repo, branches) in repos {
                if let Some(entry) = root.get_mut(user).and_then(|r| r.get_mut(&repo)) {
                    entry.op = None;
                    for branch in branches {
                        entry.new_values.remove(branch);
                    }
                }
            }
        }
    }

    /// Apply incoming `:meta-pub` metadata to every `(u, r)` it names,
    /// installing it fresh if the repo is not yet present locally.
    ///
    /// Returns the `(user, repo, old_meta, new_meta)` triples for every repo
    /// whose metadata actually changed, for the caller to recompute
    /// affected branch values against.
    pub async fn apply_meta_pub(
        &self,
        metas: RepoMetas,
    ) -> Result<Vec<(UserId, RepoId, RepoMetadata, RepoMetadata)>, RuntimeError> {
        let mut changed = Vec::new();
        let mut root = self.root.write().await;
        for (user, repos) in metas {
            let user_repos = root.entry(user.clone()).or_default();
            for (repo, incoming) in repos {
                match user_repos.get_mut(&repo) {
                    Some(entry) => {
                        let old_meta = entry.meta.clone();
                        let merged = stage_dag::update(&old_meta, &incoming)?;
                        if merged != old_meta {
                            entry.meta = merged.clone();
                            changed.push((user.clone(), repo, old_meta, merged));
                        }
                    }
                    None => {
                        user_repos.insert(repo, RepoEntry::new(incoming.clone()));
                        changed.push((user.clone(), repo, incoming.clone(), incoming));
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Remove `(user, repo)` pairs from the stage and from `config.subs`.
    pub async fn remove(&self, repos: &[(UserId, RepoId)]) {
        {
            let mut root = self.root.write().await;
            for (user, repo) in repos {
                if let Some(user_repos) = root.get_mut(user) {
                    user_repos.remove(repo);
                }
            }
        }
        let mut subs = self.subs.write().await;
        for (user, repo) in repos {
            if let Some(user_subs) = subs.get_mut(user) {
                user_subs.remove(repo);
            }
        }
    }

    /// Read one repo's current entry, cloned.
    pub async fn entry(&self, user: &UserId, repo: RepoId) -> Option<RepoEntry> {
        self.root.read().await.get(user).and_then(|r| r.get(&repo)).cloned()
    }

    /// Overwrite a repo's metadata in place, used after a local `commit`/
    /// `merge` produces a new commit node.
    pub async fn replace_meta(
        &self,
        user: &UserId,
        repo: RepoId,
        meta: RepoMetadata,
    ) -> Result<(), RuntimeError> {
        let mut root = self.root.write().await;
        let entry = root
            .get_mut(user)
            .and_then(|repos| repos.get_mut(&repo))
            .ok_or_else(|| RuntimeError::UnknownRepo(user.clone(), repo))?;
        entry.meta = meta;
        Ok(())
    }

    /// Record newly produced blob bytes as `new-values` for `(user, repo, branch)`.
    pub async fn record_new_value(
        &self,
        user: &UserId,
        repo: RepoId,
        branch: &BranchName,
        id: CommitId,
        bytes: Vec<u8>,
    ) {
        let mut root = self.root.write().await;
        if let Some(entry) = root.get_mut(user).and_then(|r| r.get_mut(&repo)) {
            entry.new_values.entry(branch.clone()).or_default().insert(id, bytes);
            entry.op = Some(Op::MetaPub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_types::{CommitObject, RepoId};

    fn sample_meta() -> (RepoId, RepoMetadata) {
        let (root_id, _) = CommitObject::new(vec![], vec![]);
        let meta = stage_dag::new_repository(BranchName::from("master"), root_id);
        (meta.id, meta)
    }

    #[tokio::test]
    async fn install_repo_rejects_duplicates() {
        let state = StageState::new();
        let user = UserId::from("john");
        let (id, meta) = sample_meta();

        state
            .install_repo(user.clone(), id, RepoEntry::new(meta.clone()), BTreeSet::from([BranchName::from("master")]))
            .await
            .unwrap();

        let err = state
            .install_repo(user, id, RepoEntry::new(meta), BTreeSet::new())
            .await;
        assert!(matches!(err, Err(RuntimeError::RepoAlreadyExists(_, _))));
    }

    #[tokio::test]
    async fn append_then_take_staged_round_trips() {
        let state = StageState::new();
        let user = UserId::from("john");
        let (id, meta) = sample_meta();
        let branch = BranchName::from("master");
        state
            .install_repo(user.clone(), id, RepoEntry::new(meta), BTreeSet::from([branch.clone()]))
            .await
            .unwrap();

        let tx = Transaction::new(serde_json::json!({"b": 2}), "merge");
        state.append_transactions(&user, id, &branch, vec![tx.clone()]).await.unwrap();

        let entry = state.entry(&user, id).await.unwrap();
        assert_eq!(entry.transactions[&branch], vec![tx.clone()]);

        let taken = state.take_staged(&user, id, &branch).await;
        assert_eq!(taken, vec![tx]);
        let entry = state.entry(&user, id).await.unwrap();
        assert!(entry.transactions[&branch].is_empty());
    }

    #[tokio::test]
    async fn remove_clears_both_state_and_subs() {
        let state = StageState::new();
        let user = UserId::from("john");
        let (id, meta) = sample_meta();
        state
            .install_repo(user.clone(), id, RepoEntry::new(meta), BTreeSet::from([BranchName::from("master")]))
            .await
            .unwrap();

        state.remove(&[(user.clone(), id)]).await;
        assert!(state.entry(&user, id).await.is_none());
        assert!(state.subs().await.get(&user).map(|m| m.contains_key(&id)).unwrap_or(false) == false);
    }
}
