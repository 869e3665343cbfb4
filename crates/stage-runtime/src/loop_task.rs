//! The inbound stage loop: reacts to `:meta-pub` bursts from the peer.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use stage_bus_core::{is_echo, HostTag, MetaKeys, PeerChannel, PeerMessage, RepoMetas};
use stage_dag::{CommitValueCache, Evaluator};
use stage_store_core::BlobStore;
use stage_types::{BranchName, RepoId, UserId};

use crate::materialize::branch_value;
use crate::state::{BranchState, StageState};

/// The observable stage value: every branch of every repo the stage knows
/// about, as a materialized value, an open conflict, or an aborted-update
/// wrapper.
pub type ObservableValue = BTreeMap<UserId, BTreeMap<RepoId, BTreeMap<BranchName, BranchState>>>;

/// Runs the inbound half of the sync protocol as a background task:
/// consumes `:meta-pub` bursts, merges metadata, recomputes affected branch
/// values, and publishes the result on a `tokio::sync::watch` stream.
///
/// **Consistency caveat.** The snapshot of the previous observable value
/// read at the start of each burst is not taken under the same lock as the
/// state mutations that follow; a consumer may therefore see a
/// monotonically stale view rather than a perfectly linearized one. This is
/// deliberate — it favors liveness over strict serialization, mirroring the
/// stage's general CAS-over-RwLock posture — and is the resolution recorded
/// for the val_atom coherence question.
pub struct StageLoop {
    state: StageState,
    channel: Arc<dyn PeerChannel>,
    cache: Arc<CommitValueCache>,
    evaluator: Arc<dyn Evaluator>,
    store: Arc<dyn BlobStore>,
    val_tx: watch::Sender<ObservableValue>,
}

impl StageLoop {
    /// Construct the loop's shared collaborators and its value stream.
    /// Returns the loop and a receiver observers can clone freely.
    pub fn new(
        state: StageState,
        channel: Arc<dyn PeerChannel>,
        cache: Arc<CommitValueCache>,
        evaluator: Arc<dyn Evaluator>,
        store: Arc<dyn BlobStore>,
    ) -> (Self, watch::Receiver<ObservableValue>) {
        let (val_tx, val_rx) = watch::channel(ObservableValue::new());
        (Self { state, channel, cache, evaluator, store, val_tx }, val_rx)
    }

    /// Spawn the loop as a background task. The task runs until the peer
    /// channel is closed.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let own_tag = self.channel.host_tag();
        let mut rx = self.channel.subscribe();

        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(_) => break,
            };

            if is_echo(own_tag, &msg) {
                continue;
            }

            match msg {
                PeerMessage::MetaPub { metas, .. } => self.handle_meta_pub(own_tag, metas).await,
                PeerMessage::MetaSub { .. } => {
                    let _ = self.channel.send(PeerMessage::MetaSubed { peer: own_tag });
                }
                PeerMessage::MetaPubReq { metas, .. } => self.handle_meta_pub_req(own_tag, metas).await,
                PeerMessage::Connect { url } => {
                    let _ = self.channel.send(PeerMessage::Connected { url });
                }
                _ => continue,
            }
        }
    }

    /// Reply to an incoming `:meta-pub-req` with a snapshot of whatever
    /// this stage already holds for the requested keys, so the requester's
    /// wait for a `:meta-pub` reply does not stall on a repo it hasn't
    /// heard of yet.
    async fn handle_meta_pub_req(&self, own_tag: HostTag, metas: MetaKeys) {
        let snapshot = self.state.snapshot().await;
        let mut reply = RepoMetas::new();
        for (user, repos) in &metas {
            let Some(user_repos) = snapshot.get(user) else { continue };
            for &repo in repos.keys() {
                if let Some(entry) = user_repos.get(&repo) {
                    reply.entry(user.clone()).or_default().insert(repo, entry.meta.clone());
                }
            }
        }
        let _ = self.channel.send(PeerMessage::MetaPub { metas: reply, peer: own_tag });
    }

    async fn handle_meta_pub(&self, own_tag: HostTag, metas: RepoMetas) {
        let changed = match self.state.apply_meta_pub(metas).await {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(error = %e, "failed to apply incoming meta-pub");
                return;
            }
        };

        if changed.is_empty() {
            debug!("meta-pub caused no metadata change; val_atom left untouched");
        } else {
            let mut observable = self.val_tx.borrow().clone();
            let mut any_branch_changed = false;

            for (user, repo, old_meta, new_meta) in changed {
                for (branch, new_heads) in &new_meta.branches {
                    if old_meta.branches.get(branch) == Some(new_heads) {
                        // This branch's heads are untouched by the incoming
                        // burst; staged transactions on it are still valid
                        // against the current value, so leave them staged.
                        continue;
                    }

                    let staged = self.state.take_staged(&user, repo, branch).await;
                    let new_state = match branch_value(
                        self.store.as_ref(),
                        &self.cache,
                        self.evaluator.as_ref(),
                        &new_meta,
                        branch,
                        &[],
                    )
                    .await
                    {
                        Ok(state) => state,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to recompute branch value");
                            continue;
                        }
                    };

                    let prior = observable
                        .get(&user)
                        .and_then(|r| r.get(&repo))
                        .and_then(|b| b.get(branch));

                    let resolved = if !staged.is_empty() {
                        let mut aborted = match prior {
                            Some(BranchState::Abort { aborted, .. }) => aborted.clone(),
                            _ => Vec::new(),
                        };
                        aborted.extend(staged);
                        BranchState::Abort { new_value: Box::new(new_state), aborted }
                    } else if let Some(BranchState::Abort { aborted, .. }) = prior {
                        BranchState::Abort { new_value: Box::new(new_state), aborted: aborted.clone() }
                    } else {
                        new_state
                    };

                    observable
                        .entry(user.clone())
                        .or_default()
                        .entry(repo)
                        .or_default()
                        .insert(branch.clone(), resolved);
                    any_branch_changed = true;
                }
            }

            if any_branch_changed {
                let _ = self.val_tx.send(observable);
            }
        }

        let _ = self.channel.send(PeerMessage::MetaPubed { peer: own_tag });
        info!("replied meta-pubed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use stage_bus_core::InProcessPeerChannel;
    use stage_dag::{BuiltinEvaluator, CommitValueCache};
    use stage_store_memory::MemoryBlobStore;
    use stage_types::{CommitObject, UserId};

    use crate::state::RepoEntry;

    fn spawn_loop(channel: Arc<dyn PeerChannel>, state: StageState) -> tokio::task::JoinHandle<()> {
        let cache = Arc::new(CommitValueCache::new());
        let evaluator: Arc<dyn Evaluator> = Arc::new(BuiltinEvaluator::new());
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let (stage_loop, _val_rx) = StageLoop::new(state, channel, cache, evaluator, store);
        stage_loop.spawn()
    }

    #[tokio::test]
    async fn meta_sub_is_acked_by_the_peer_loop() {
        let (requester, peer) = InProcessPeerChannel::paired(16);
        let own_tag = requester.host_tag();
        let mut rx = requester.subscribe();

        let _handle = spawn_loop(Arc::new(peer), StageState::new());

        requester
            .send(PeerMessage::MetaSub { metas: MetaKeys::new(), peer: own_tag })
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply, PeerMessage::MetaSubed { .. }));
    }

    #[tokio::test]
    async fn connect_is_acked_by_the_peer_loop() {
        let (requester, peer) = InProcessPeerChannel::paired(16);
        let mut rx = requester.subscribe();

        let _handle = spawn_loop(Arc::new(peer), StageState::new());

        requester.send(PeerMessage::Connect { url: "wss://peer.example".to_owned() }).unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply, PeerMessage::Connected { url: "wss://peer.example".to_owned() });
    }

    #[tokio::test]
    async fn meta_pub_req_replies_with_the_peers_known_metadata() {
        let (requester, peer) = InProcessPeerChannel::paired(16);
        let own_tag = requester.host_tag();
        let mut rx = requester.subscribe();

        let peer_state = StageState::new();
        let user = UserId::from("alice");
        let (root_id, _) = CommitObject::new(vec![], vec![]);
        let meta = stage_dag::new_repository(BranchName::from("main"), root_id);
        let repo_id = meta.id;
        peer_state
            .install_repo(user.clone(), repo_id, RepoEntry::new(meta), BTreeSet::from([BranchName::from("main")]))
            .await
            .unwrap();

        let _handle = spawn_loop(Arc::new(peer), peer_state);

        let mut metas = MetaKeys::new();
        metas.entry(user.clone()).or_default().insert(repo_id, BTreeSet::from([BranchName::from("main")]));
        requester.send(PeerMessage::MetaPubReq { metas, peer: own_tag }).unwrap();

        let reply = loop {
            match rx.recv().await.unwrap() {
                PeerMessage::MetaPub { metas, .. } => break metas,
                _ => continue,
            }
        };
        assert!(reply.get(&user).and_then(|r| r.get(&repo_id)).is_some());
    }
}
