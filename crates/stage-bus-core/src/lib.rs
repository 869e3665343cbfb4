#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **stage-bus-core** – Peer wire protocol for the staging engine's sync
//! driver.
//!
//! This crate defines the topic-tagged message enum exchanged with a peer,
//! a host tag used to suppress echoes of a stage's own publications, and an
//! in-process channel implementing the protocol over a `tokio::broadcast`
//! pair — suitable for tests and as the shape a real transport adapter
//! (TCP, WebSocket, ...) must fill.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use stage_types::{BranchName, CommitId, RepoId, RepoMetadata, UserId};

//─────────────────────────────
//  Host tagging
//─────────────────────────────

/// A content-opaque identifier of a stage instance, attached to every
/// message this stage publishes so peers — including itself, when the
/// transport loops back — can recognise and drop its own echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostTag(pub Uuid);

impl HostTag {
    /// Mint a new, random host tag.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HostTag {
    fn default() -> Self {
        Self::new()
    }
}

//─────────────────────────────
//  Wire types
//─────────────────────────────

/// The set of `(user, repo, branches)` keys a `:meta-sub`/`:meta-pub-req`
/// names, or that a `:meta-pub` burst touches.
pub type MetaKeys = BTreeMap<UserId, BTreeMap<RepoId, std::collections::BTreeSet<BranchName>>>;

/// Repository metadata keyed the same way as [`MetaKeys`], carried by a
/// `:meta-pub` message.
pub type RepoMetas = BTreeMap<UserId, BTreeMap<RepoId, RepoMetadata>>;

/// A content address of a binary (non-commit) blob.
pub type BlobId = [u8; 32];

/// The topic-tagged peer wire protocol.
///
/// Every variant that can originate from this stage carries a [`HostTag`] so
/// the block-detector can drop a message that loops back to its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PeerMessage {
    /// Request a connection to `url`.
    Connect {
        /// Target peer URL.
        url: String,
    },
    /// Acknowledges a successful [`PeerMessage::Connect`].
    Connected {
        /// The URL that is now connected.
        url: String,
    },
    /// Subscribe to future `:meta-pub` bursts for `metas`.
    MetaSub {
        /// Keys to subscribe to.
        metas: MetaKeys,
        /// Sender's host tag.
        peer: HostTag,
    },
    /// Acknowledges a [`PeerMessage::MetaSub`].
    MetaSubed {
        /// Sender's host tag.
        peer: HostTag,
    },
    /// Ask the peer to republish its current metadata for `metas`.
    MetaPubReq {
        /// Keys being requested.
        metas: MetaKeys,
        /// Sender's host tag.
        peer: HostTag,
    },
    /// Publish repository metadata. Flows in both directions; outbound
    /// instances are host-tagged so this stage can drop its own echo.
    MetaPub {
        /// Published metadata, keyed by user then repository.
        metas: RepoMetas,
        /// Sender's host tag.
        peer: HostTag,
    },
    /// Acknowledges a [`PeerMessage::MetaPub`].
    MetaPubed {
        /// Sender's host tag.
        peer: HostTag,
    },
    /// Request the commit blobs named by `ids`.
    Fetch {
        /// Requested commit ids.
        ids: Vec<CommitId>,
    },
    /// Reply to a [`PeerMessage::Fetch`] with the subset of requested ids
    /// this stage can serve.
    Fetched {
        /// Serialized commit object bytes, keyed by id.
        values: BTreeMap<CommitId, Vec<u8>>,
        /// Sender's host tag.
        peer: HostTag,
    },
    /// Request the binary blobs named by `ids`.
    BinaryFetch {
        /// Requested blob ids.
        ids: Vec<BlobId>,
    },
    /// Reply to a [`PeerMessage::BinaryFetch`], one message per id.
    BinaryFetched {
        /// The blob id this reply answers.
        id: BlobId,
        /// The blob's bytes.
        value: Vec<u8>,
        /// Sender's host tag.
        peer: HostTag,
    },
}

impl PeerMessage {
    /// The host tag carried by this message, if the variant carries one.
    pub fn peer(&self) -> Option<HostTag> {
        match self {
            PeerMessage::MetaSub { peer, .. }
            | PeerMessage::MetaSubed { peer }
            | PeerMessage::MetaPubReq { peer, .. }
            | PeerMessage::MetaPub { peer, .. }
            | PeerMessage::MetaPubed { peer }
            | PeerMessage::Fetched { peer, .. }
            | PeerMessage::BinaryFetched { peer, .. } => Some(*peer),
            PeerMessage::Connect { .. }
            | PeerMessage::Connected { .. }
            | PeerMessage::Fetch { .. }
            | PeerMessage::BinaryFetch { .. } => None,
        }
    }
}

/// True if `msg` was published by `own` — the block-detector's test.
pub fn is_echo(own: HostTag, msg: &PeerMessage) -> bool {
    msg.peer() == Some(own)
}

//─────────────────────────────
//  Channel trait
//─────────────────────────────

/// Errors raised by a [`PeerChannel`].
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The channel has no active receivers left.
    #[error("peer channel closed")]
    Closed,
}

/// A duplex, topic-tagged channel to a peer.
///
/// All implementations must be thread-safe and support multiple concurrent
/// subscribers.
pub trait PeerChannel: Send + Sync {
    /// This channel's own host tag, attached to outbound messages that
    /// require one.
    fn host_tag(&self) -> HostTag;

    /// Publish a message to the peer (or, for the in-process implementation,
    /// to every subscriber).
    fn send(&self, msg: PeerMessage) -> Result<(), BusError>;

    /// Subscribe to the live message stream.
    fn subscribe(&self) -> broadcast::Receiver<PeerMessage>;
}

//─────────────────────────────
//  In-process implementation
//─────────────────────────────

/// An in-process peer channel backed by a `tokio::broadcast` pair.
///
/// Two stages sharing a clone of the same [`InProcessPeerChannel`] (or two
/// instances wired together by an adapter that relays between them) can
/// exercise the full sync protocol without any real transport.
#[derive(Debug, Clone)]
pub struct InProcessPeerChannel {
    tx: std::sync::Arc<broadcast::Sender<PeerMessage>>,
    host_tag: HostTag,
}

impl InProcessPeerChannel {
    /// Create a new channel with the given broadcast buffer capacity and a
    /// fresh, random host tag.
    pub fn new(capacity: usize) -> Self {
        Self::with_host_tag(capacity, HostTag::new())
    }

    /// Create a new channel with an explicit host tag.
    pub fn with_host_tag(capacity: usize, host_tag: HostTag) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: std::sync::Arc::new(tx), host_tag }
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Construct two channels that share the same underlying broadcast pair
    /// but carry distinct host tags, as if two stages were talking over one
    /// transport. Messages either side sends are visible to both, and
    /// neither mistakes the other's traffic for its own echo.
    pub fn paired(capacity: usize) -> (Self, Self) {
        let (tx, _rx) = broadcast::channel(capacity);
        let tx = std::sync::Arc::new(tx);
        (
            Self { tx: tx.clone(), host_tag: HostTag::new() },
            Self { tx, host_tag: HostTag::new() },
        )
    }
}

impl PeerChannel for InProcessPeerChannel {
    fn host_tag(&self) -> HostTag {
        self.host_tag
    }

    fn send(&self, msg: PeerMessage) -> Result<(), BusError> {
        // A lagging or absent receiver is not this sender's problem to solve.
        let _ = self.tx.send(msg);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_round_trips_through_the_channel() {
        let channel = InProcessPeerChannel::new(16);
        let mut rx = channel.subscribe();

        let msg = PeerMessage::Connect { url: "wss://peer.example".to_owned() };
        channel.send(msg.clone()).unwrap();

        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive_meta_pub() {
        let channel = InProcessPeerChannel::new(16);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        let msg = PeerMessage::MetaPubed { peer: channel.host_tag() };
        channel.send(msg.clone()).unwrap();

        assert_eq!(a.recv().await.unwrap(), msg);
        assert_eq!(b.recv().await.unwrap(), msg);
    }

    #[test]
    fn is_echo_detects_own_host_tag() {
        let own = HostTag::new();
        let other = HostTag::new();

        assert!(is_echo(own, &PeerMessage::MetaPubed { peer: own }));
        assert!(!is_echo(own, &PeerMessage::MetaPubed { peer: other }));
        assert!(!is_echo(own, &PeerMessage::Connect { url: "x".into() }));
    }
}
