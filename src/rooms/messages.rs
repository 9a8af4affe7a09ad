//! Message types for room actor communication.
//!
//! All mutation of a room's state flows through its actor mailbox via
//! `tokio::sync::mpsc`; request-reply pairs use `tokio::sync::oneshot`.
//! This is what serializes a room's state transitions: two racing leaves,
//! or a leave racing a negotiation attach, are ordered by the mailbox.

use crate::errors::SignalError;
use crate::outbound::OutboundSender;
use crate::protocol::{MediaKind, TransportDirection};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

/// Messages handled by a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// A peer joins the room. Fails with `DuplicatePeer` if the id is
    /// taken; on success returns the peers already present.
    Join {
        peer_id: String,
        display_name: String,
        connection: OutboundSender,
        respond_to: oneshot::Sender<Result<Vec<PeerSummary>, SignalError>>,
    },

    /// Remove a peer and everything it owns. The single teardown path:
    /// explicit leave and abrupt disconnect both end here. Safe to send
    /// for an absent peer.
    RemovePeer {
        peer_id: String,
        respond_to: oneshot::Sender<PeerRemoval>,
    },

    /// Record a gateway-created transport against a peer.
    AttachTransport {
        peer_id: String,
        transport: TransportSeed,
        respond_to: oneshot::Sender<Result<TransportAttached, SignalError>>,
    },

    /// Claim a transport for DTLS connect. Answers `AlreadyConnected`
    /// for duplicate connect calls so the caller can ack without a
    /// second gateway round-trip.
    BeginTransportConnect {
        peer_id: String,
        transport_id: String,
        respond_to: oneshot::Sender<Result<ConnectPhase, SignalError>>,
    },

    /// Mark a transport connected after the gateway call succeeded.
    CompleteTransportConnect {
        peer_id: String,
        transport_id: String,
    },

    /// Check a transport exists and is connected (produce/consume
    /// precondition).
    RequireConnectedTransport {
        peer_id: String,
        transport_id: String,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Record a gateway-created producer and announce it to the room.
    AttachProducer {
        peer_id: String,
        transport_id: String,
        producer_id: String,
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Resolve a producer id to its owner, or `ProducerGone`.
    ResolveProducer {
        producer_id: String,
        respond_to: oneshot::Sender<Result<ProducerRef, SignalError>>,
    },

    /// Record a gateway-created consumer against a peer, re-validating
    /// that the source producer still exists.
    AttachConsumer {
        peer_id: String,
        consumer: ConsumerSeed,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Relay a chat message to the whole room, sender included.
    Chat {
        sender_peer_id: String,
        message: String,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Update a peer's mute/video-off flags and announce the change.
    SetMediaState {
        peer_id: String,
        audio_muted: bool,
        video_off: bool,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },

    /// Current peer set with their producers (capability advertisement).
    ListPeers {
        respond_to: oneshot::Sender<Vec<PeerSummary>>,
    },

    /// Room snapshot for tests and introspection.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Gateway transport descriptor as handed to the room for attachment.
#[derive(Debug, Clone)]
pub struct TransportSeed {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Result of attaching a transport. `replaced` lists gateway resource ids
/// displaced by this attachment (a re-created transport for the same
/// direction plus anything riding on it); the caller must release them.
#[derive(Debug, Clone, Default)]
pub struct TransportAttached {
    pub replaced: Vec<String>,
}

/// Outcome of a transport connect claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// Transport already connected; duplicate connect is a no-op success.
    AlreadyConnected,
    /// Caller should perform the gateway DTLS connect.
    Proceed,
}

/// Owner and kind of a resolved producer.
#[derive(Debug, Clone)]
pub struct ProducerRef {
    pub peer_id: String,
    pub kind: MediaKind,
}

/// Gateway consumer descriptor as handed to the room for attachment.
#[derive(Debug, Clone)]
pub struct ConsumerSeed {
    pub id: String,
    pub transport_id: String,
    pub producer_id: String,
    pub producer_peer_id: String,
    pub kind: MediaKind,
}

/// Result of removing a peer.
#[derive(Debug, Clone)]
pub struct PeerRemoval {
    /// Whether the peer was present (absent removal is a no-op).
    pub was_present: bool,
    /// Whether the room is now empty and must be deleted.
    pub now_empty: bool,
    /// Gateway resource ids to release: the peer's consumers, producers
    /// and transports, plus other peers' consumers invalidated by the
    /// departure.
    pub released: Vec<String>,
}

/// A peer and its producers, as advertised to joining peers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub display_name: String,
    pub producers: Vec<ProducerSummary>,
}

/// A producer as advertised in a peer summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: String,
    pub kind: MediaKind,
}

/// Room snapshot.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    pub peers: Vec<PeerSummary>,
    pub created_at: i64,
}
