//! The stage's public API.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;
use tracing::info;

use stage_bus_core::{MetaKeys, PeerChannel, PeerMessage};
use stage_dag::{BuiltinEvaluator, CommitValueCache, DagError, Evaluator};
use stage_store_core::{serialize_commit, BlobStore};
use stage_store_memory::MemoryBlobStore;
use stage_types::{BranchName, CommitId, CommitObject, RepoId, Transaction, UserId, Value};

use crate::config::StageConfig;
use crate::error::RuntimeError;
use crate::loop_task::{ObservableValue, StageLoop};
use crate::materialize::branch_value;
use crate::state::{BranchState, RepoEntry, StageState};
use crate::sync::SyncDriver;

/// A handle to one running stage: its state, collaborators, background
/// loop, and observable value stream.
pub struct Stage {
    state: StageState,
    channel: Arc<dyn PeerChannel>,
    store: Arc<dyn BlobStore>,
    cache: Arc<CommitValueCache>,
    evaluator: Arc<dyn Evaluator>,
    sync_driver: SyncDriver,
    config: StageConfig,
    val_rx: watch::Receiver<ObservableValue>,
    loop_handle: tokio::task::JoinHandle<()>,
}

impl Stage {
    /// `create_stage!` — allocate the stage's collaborators, wire it into
    /// the given peer channel, and start the background stage loop.
    ///
    /// Unlike a `create_stage(user, peer, eval)` bound to one owning user,
    /// this `StageState` is keyed by user per operation, so a stage handle
    /// itself is user-agnostic and every subsequent call names its own
    /// `user`.
    pub fn create_stage(channel: Arc<dyn PeerChannel>, evaluator: Arc<dyn Evaluator>, config: StageConfig) -> Self {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        Self::create_stage_with_store(channel, store, evaluator, config)
    }

    /// As [`Stage::create_stage`], but with an explicit blob store backend.
    pub fn create_stage_with_store(
        channel: Arc<dyn PeerChannel>,
        store: Arc<dyn BlobStore>,
        evaluator: Arc<dyn Evaluator>,
        config: StageConfig,
    ) -> Self {
        let state = StageState::new();
        let cache = Arc::new(CommitValueCache::new());
        let sync_driver = SyncDriver::new(Arc::clone(&channel), Arc::clone(&store), config.ack_timeout);

        let (stage_loop, val_rx) = StageLoop::new(
            state.clone(),
            Arc::clone(&channel),
            Arc::clone(&cache),
            Arc::clone(&evaluator),
            Arc::clone(&store),
        );
        let loop_handle = stage_loop.spawn();

        info!("stage created");
        Self { state, channel, store, cache, evaluator, sync_driver, config, val_rx, loop_handle }
    }

    /// Convenience constructor using the built-in `set`/`merge` evaluator.
    pub fn create_stage_with_builtins(channel: Arc<dyn PeerChannel>, config: StageConfig) -> Self {
        Self::create_stage(channel, Arc::new(BuiltinEvaluator::new()), config)
    }

    /// The stage's observable value stream (sliding buffer of one).
    pub fn subscribe(&self) -> watch::Receiver<ObservableValue> {
        self.val_rx.clone()
    }

    /// `create_repo(description, init_val, branch)` — construct a new
    /// repository with a single root commit, install it for `user`, and
    /// publish it.
    pub async fn create_repo(
        &self,
        user: UserId,
        description: &str,
        init_val: Value,
        branch: BranchName,
    ) -> Result<RepoId, RuntimeError> {
        let (root_id, root_commit) = CommitObject::new(vec![Transaction::new(init_val, "set")], vec![]);
        self.store.put_commit(&root_commit).await?;

        let meta = stage_dag::new_repository(branch.clone(), root_id);
        let repo_id = meta.id;
        info!(%repo_id, description, "creating repository");

        self.state
            .install_repo(user.clone(), repo_id, RepoEntry::new(meta), BTreeSet::from([branch.clone()]))
            .await?;
        self.record_and_sync(&user, repo_id, &branch, root_id, &root_commit).await?;
        Ok(repo_id)
    }

    /// `fork(user, repo_id, branch)` — take a fork of `source_user`'s
    /// stage-visible repository into `user`'s own namespace, preserving
    /// `repo_id`.
    pub async fn fork(
        &self,
        user: UserId,
        source_user: &UserId,
        repo_id: RepoId,
        _branch: BranchName,
    ) -> Result<(), RuntimeError> {
        if self.state.entry(&user, repo_id).await.is_some() {
            return Err(RuntimeError::ForkingImpossible(user, repo_id));
        }
        let source = self
            .state
            .entry(source_user, repo_id)
            .await
            .ok_or_else(|| RuntimeError::UnknownRepo(source_user.clone(), repo_id))?;

        let forked_meta = stage_dag::fork(&source.meta);
        let branches: BTreeSet<BranchName> = forked_meta.branches.keys().cloned().collect();
        self.state
            .install_repo(user.clone(), repo_id, RepoEntry::new(forked_meta), branches.clone())
            .await?;
        self.sync_and_cleanup(&user, repo_id, branches).await
    }

    /// `subscribe_repos(subs)` — replace the subscription set, exchange
    /// `:meta-sub`/`:meta-subed` and `:meta-pub-req`/`:meta-pub`, and block
    /// until every subscribed key is present in the stage.
    pub async fn subscribe_repos(&self, _user: UserId, subs: MetaKeys) -> Result<(), RuntimeError> {
        self.state.set_subs(subs.clone()).await;

        let own = self.channel.host_tag();
        let mut rx = self.channel.subscribe();

        self.channel
            .send(PeerMessage::MetaSub { metas: subs.clone(), peer: own })
            .map_err(|e| RuntimeError::Store(anyhow::anyhow!(e)))?;
        wait_for(&mut rx, |m| matches!(m, PeerMessage::MetaSubed { .. })).await;

        self.channel
            .send(PeerMessage::MetaPubReq { metas: subs.clone(), peer: own })
            .map_err(|e| RuntimeError::Store(anyhow::anyhow!(e)))?;
        wait_for(&mut rx, |m| matches!(m, PeerMessage::MetaPub { .. })).await;

        loop {
            let mut all_present = true;
            'outer: for (u, repos) in &subs {
                for &r in repos.keys() {
                    if self.state.entry(u, r).await.is_none() {
                        all_present = false;
                        break 'outer;
                    }
                }
            }
            if all_present {
                break;
            }
            tokio::time::sleep(self.config.subscribe_poll_interval).await;
        }
        Ok(())
    }

    /// `remove_repos(repos)` — drop entries from the stage and
    /// subscriptions, then re-subscribe to narrow the peer's publication
    /// filter.
    pub async fn remove_repos(&self, user: UserId, repos: &[(UserId, RepoId)]) -> Result<(), RuntimeError> {
        self.state.remove(repos).await;
        let narrowed = self.state.subs().await;
        self.subscribe_repos(user, narrowed).await
    }

    /// `transact(user, repo, branch, txs)` — stage transactions and
    /// materialize (but do not commit) the branch's new value.
    pub async fn transact(
        &self,
        user: UserId,
        repo: RepoId,
        branch: BranchName,
        txs: Vec<Transaction>,
    ) -> Result<BranchState, RuntimeError> {
        self.state.append_transactions(&user, repo, &branch, txs).await?;
        let entry = self
            .state
            .entry(&user, repo)
            .await
            .ok_or_else(|| RuntimeError::UnknownRepo(user.clone(), repo))?;
        let staged = entry.transactions.get(&branch).cloned().unwrap_or_default();

        branch_value(self.store.as_ref(), &self.cache, self.evaluator.as_ref(), &entry.meta, &branch, &staged)
            .await
            .map_err(RuntimeError::from)
    }

    /// `transact_binary(user, repo, branch, blob)` — a `transact` routed to
    /// the blob-store transaction path.
    pub async fn transact_binary(
        &self,
        user: UserId,
        repo: RepoId,
        branch: BranchName,
        blob_base64: String,
    ) -> Result<BranchState, RuntimeError> {
        self.transact(user, repo, branch, vec![Transaction::blob(serde_json::json!(blob_base64))]).await
    }

    /// `commit(repos)` — turn every `(user, repo, branch)`'s staged
    /// transactions into a new commit node, then publish.
    pub async fn commit(&self, repos: Vec<(UserId, RepoId, BranchName)>) -> Result<(), RuntimeError> {
        for (user, repo, branch) in &repos {
            let entry = self
                .state
                .entry(user, *repo)
                .await
                .ok_or_else(|| RuntimeError::UnknownRepo(user.clone(), *repo))?;
            let staged = self.state.take_staged(user, *repo, branch).await;
            if staged.is_empty() {
                continue;
            }

            let heads = entry
                .meta
                .branches
                .get(branch)
                .ok_or_else(|| DagError::UnknownBranch(entry.meta.id, branch.clone()))?;
            if heads.len() > 1 {
                return Err(DagError::MultipleBranchHeads(entry.meta.id, branch.clone()).into());
            }
            let head = *heads.iter().next().expect("non-empty by I2");

            let (new_id, commit_obj) = CommitObject::new(staged, vec![head]);
            self.store.put_commit(&commit_obj).await?;

            let mut new_meta = entry.meta.clone();
            stage_dag::commit(&mut new_meta, branch, new_id, head)?;
            self.state.replace_meta(user, *repo, new_meta).await?;
            self.record_new_value(user, *repo, branch, new_id, &commit_obj).await;
        }

        for (user, repo, branch) in &repos {
            self.sync_and_cleanup(user, *repo, std::iter::once(branch.clone())).await?;
        }
        Ok(())
    }

    /// `merge(user, repo, branch, heads_order, wait?)` — resolve a
    /// conflicting branch with a merge commit over every current head, in
    /// `heads_order` within the divergent portion.
    pub async fn merge(
        &self,
        user: UserId,
        repo: RepoId,
        branch: BranchName,
        heads_order: Vec<CommitId>,
        wait: bool,
    ) -> Result<bool, RuntimeError> {
        let entry = self
            .state
            .entry(&user, repo)
            .await
            .ok_or_else(|| RuntimeError::UnknownRepo(user.clone(), repo))?;

        if wait {
            let cost_ms = merge_cost(&entry.meta.causal_order);
            if cost_ms > 0 {
                let sleep_ms = rand::thread_rng().gen_range(0..cost_ms);
                tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            }
            let rechecked = self
                .state
                .entry(&user, repo)
                .await
                .ok_or_else(|| RuntimeError::UnknownRepo(user.clone(), repo))?;
            if rechecked.meta.causal_order != entry.meta.causal_order {
                return Ok(false);
            }
        }

        let heads = entry
            .meta
            .branches
            .get(&branch)
            .ok_or_else(|| DagError::UnknownBranch(entry.meta.id, branch.clone()))?
            .clone();
        if heads.len() < 2 {
            return Err(DagError::NothingToMerge(entry.meta.id, branch.clone()).into());
        }

        let mut ordered: Vec<CommitId> =
            heads_order.into_iter().filter(|h| heads.contains(h)).collect();
        for head in &heads {
            if !ordered.contains(head) {
                ordered.push(*head);
            }
        }

        // The materializer always folds a commit from its ascending-digest-first
        // parent (see `stage_dag::commit_value`), regardless of `ordered`'s
        // caller-supplied order, so that parent must be excluded here rather
        // than `ordered[0]` — otherwise its contribution would be both the
        // fold base and re-applied as a merge transaction's source value,
        // silently dropping whichever head `ordered` actually put first.
        let base = *ordered.iter().min().expect("heads is non-empty");

        let mut transactions = Vec::new();
        for &parent in ordered.iter().filter(|&&h| h != base) {
            let value = stage_dag::commit_value(
                self.store.as_ref(),
                &self.cache,
                self.evaluator.as_ref(),
                &entry.meta.causal_order,
                entry.meta.id,
                parent,
            )
            .await?;
            transactions.push(Transaction::new(value, "merge"));
        }

        let (new_id, commit_obj) = CommitObject::new(transactions, ordered.clone());
        self.store.put_commit(&commit_obj).await?;

        let mut new_meta = entry.meta.clone();
        stage_dag::merge(&mut new_meta, &branch, new_id, ordered)?;
        self.state.replace_meta(&user, repo, new_meta).await?;
        self.record_new_value(&user, repo, &branch, new_id, &commit_obj).await;
        self.sync_and_cleanup(&user, repo, std::iter::once(branch)).await?;
        Ok(true)
    }

    /// `connect(url)` — request a connection to `url` and wait for the
    /// peer's acknowledgement.
    pub async fn connect(&self, url: String) -> Result<(), RuntimeError> {
        let mut rx = self.channel.subscribe();
        self.channel
            .send(PeerMessage::Connect { url: url.clone() })
            .map_err(|e| RuntimeError::Store(anyhow::anyhow!(e)))?;
        wait_for(&mut rx, |m| matches!(m, PeerMessage::Connected { url: got } if *got == url)).await;
        Ok(())
    }

    async fn record_new_value(
        &self,
        user: &UserId,
        repo: RepoId,
        branch: &BranchName,
        id: CommitId,
        commit: &CommitObject,
    ) {
        let (bytes, _) = serialize_commit(commit);
        self.state.record_new_value(user, repo, branch, id, bytes).await;
    }

    async fn record_and_sync(
        &self,
        user: &UserId,
        repo: RepoId,
        branch: &BranchName,
        id: CommitId,
        commit: &CommitObject,
    ) -> Result<(), RuntimeError> {
        self.record_new_value(user, repo, branch, id, commit).await;
        self.sync_and_cleanup(user, repo, std::iter::once(branch.clone())).await
    }

    async fn sync_and_cleanup(
        &self,
        user: &UserId,
        repo: RepoId,
        branches: impl IntoIterator<Item = BranchName>,
    ) -> Result<(), RuntimeError> {
        let mut metas = MetaKeys::new();
        metas.entry(user.clone()).or_default().insert(repo, branches.into_iter().collect());

        self.sync_driver.sync(&self.state, &metas).await?;
        self.state.cleanup_ops_and_new_values(&metas).await;
        Ok(())
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

async fn wait_for(rx: &mut tokio::sync::broadcast::Receiver<PeerMessage>, matches: impl Fn(&PeerMessage) -> bool) {
    while let Ok(msg) = rx.recv().await {
        if matches(&msg) {
            return;
        }
    }
}

/// `merge_cost(causal) = floor(100000 * (-ln(1 - merge_ratio)))` where
/// `merge_ratio` is the fraction of commits with more than one parent.
/// Zero when the causal order has no merge commits, strictly increasing in
/// `merge_ratio`.
pub fn merge_cost(causal: &stage_types::CausalOrder) -> u64 {
    if causal.is_empty() {
        return 0;
    }
    let merges = causal.values().filter(|parents| parents.len() > 1).count();
    let merge_ratio = merges as f64 / causal.len() as f64;
    if merge_ratio <= 0.0 {
        return 0;
    }
    let ratio = merge_ratio.min(0.999_999);
    (100_000.0 * (-(1.0 - ratio).ln())).floor().max(0.0) as u64
}
