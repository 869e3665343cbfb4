//! The outbound sync protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stage_bus_core::{MetaKeys, PeerChannel, PeerMessage, RepoMetas};
use stage_store_core::BlobStore;

use crate::error::RuntimeError;
use crate::state::{Op, StageState};

/// Drives the outbound half of the peer sync protocol: publishes this
/// stage's metadata for a set of repositories, serves the peer's fetch
/// requests while waiting, and retires the publication once acknowledged.
pub struct SyncDriver {
    channel: Arc<dyn PeerChannel>,
    store: Arc<dyn BlobStore>,
    ack_timeout: Duration,
}

impl SyncDriver {
    /// Construct a driver over `channel`/`store`, warning after `ack_timeout`
    /// if no `:meta-pubed` has arrived yet.
    pub fn new(channel: Arc<dyn PeerChannel>, store: Arc<dyn BlobStore>, ack_timeout: Duration) -> Self {
        Self { channel, store, ack_timeout }
    }

    /// Push a snapshot for every `(user, repo, branches)` in `metas` and
    /// wait for the peer's acknowledgement, serving its fetch requests in
    /// the meantime.
    ///
    /// Subscribes before publishing so the outbound `:meta-pub` cannot be
    /// missed by the time the peer's reply or fetch requests start arriving.
    pub async fn sync(&self, state: &StageState, metas: &MetaKeys) -> Result<(), RuntimeError> {
        let mut rx = self.channel.subscribe();

        let snapshot = state.snapshot().await;
        let new_values = collect_new_values(&snapshot, metas);
        let meta_pubs = collect_meta_pubs(&snapshot, metas);

        if !meta_pubs.is_empty() {
            self.channel
                .send(PeerMessage::MetaPub { metas: meta_pubs, peer: self.channel.host_tag() })
                .map_err(|e| RuntimeError::Store(anyhow::anyhow!(e)))?;
        }

        let mut warned = false;
        loop {
            let message = if warned {
                match rx.recv().await {
                    Ok(msg) => msg,
                    Err(_) => return Ok(()),
                }
            } else {
                match tokio::time::timeout(self.ack_timeout, rx.recv()).await {
                    Ok(Ok(msg)) => msg,
                    Ok(Err(_)) => return Ok(()),
                    Err(_) => {
                        tracing::warn!("No meta-pubed ack received after 10 secs. Continue waiting...");
                        warned = true;
                        continue;
                    }
                }
            };

            match message {
                PeerMessage::Fetch { ids } => {
                    let values: BTreeMap<_, _> = ids
                        .into_iter()
                        .filter_map(|id| new_values.get(&id).cloned().map(|bytes| (id, bytes)))
                        .collect();
                    let _ = self
                        .channel
                        .send(PeerMessage::Fetched { values, peer: self.channel.host_tag() });
                }
                PeerMessage::BinaryFetch { ids } => {
                    for id in ids {
                        if let Some(value) = self.store.get(&id).await? {
                            let _ = self.channel.send(PeerMessage::BinaryFetched {
                                id,
                                value,
                                peer: self.channel.host_tag(),
                            });
                        }
                    }
                }
                PeerMessage::MetaPubed { .. } => break,
                _ => continue,
            }
        }

        Ok(())
    }
}

fn collect_new_values(
    snapshot: &crate::state::StageValue,
    metas: &MetaKeys,
) -> BTreeMap<stage_types::CommitId, Vec<u8>> {
    let mut new_values = BTreeMap::new();
    for (user, repos) in metas {
        for (repo, branches) in repos {
            let Some(entry) = snapshot.get(user).and_then(|r| r.get(repo)) else { continue };
            for branch in branches {
                if let Some(blobs) = entry.new_values.get(branch) {
                    new_values.extend(blobs.clone());
                }
            }
        }
    }
    new_values
}

fn collect_meta_pubs(snapshot: &crate::state::StageValue, metas: &MetaKeys) -> RepoMetas {
    let mut meta_pubs = RepoMetas::new();
    for (user, repos) in metas {
        for (repo, _branches) in repos {
            let Some(entry) = snapshot.get(user).and_then(|r| r.get(repo)) else { continue };
            if matches!(entry.op, Some(Op::MetaPub) | Some(Op::MetaSub)) {
                meta_pubs.entry(user.clone()).or_default().insert(*repo, entry.meta.clone());
            }
        }
    }
    meta_pubs
}
