//! Signaling error types.
//!
//! Error types map to stable wire `code` values in error acks. Internal
//! details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Signaling core error type.
///
/// Maps to wire error codes:
/// - `Unauthorized`: 2
/// - `NotJoined`, `AlreadyJoined`: 3
/// - `UnknownRoom`, `UnknownPeer`, `UnknownTransport`, `ProducerGone`: 4
/// - `DuplicatePeer`, `TransportNotConnected`: 5
/// - `Internal`: 6
/// - `Gateway`, `Draining`: 7 (retryable)
#[derive(Debug, Error)]
pub enum SignalError {
    /// Identity token validation failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request requires a joined session.
    #[error("session has not joined a room")]
    NotJoined,

    /// Session attempted a second join without leaving first.
    #[error("session already joined room {0}")]
    AlreadyJoined(String),

    /// Room does not exist.
    #[error("unknown room: {0}")]
    UnknownRoom(String),

    /// Peer not present in the room (e.g. removed mid-negotiation).
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Transport not found on the peer.
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    /// Operation requires a connected transport.
    #[error("transport not connected: {0}")]
    TransportNotConnected(String),

    /// Target producer no longer exists (source peer left).
    #[error("producer gone: {0}")]
    ProducerGone(String),

    /// A peer with this ID is already present in the room.
    #[error("duplicate peer in room: {0}")]
    DuplicatePeer(String),

    /// SFU gateway call failed; the request may be retried.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Server is shutting down and not accepting new joins.
    #[error("server is draining")]
    Draining,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> u16 {
        match self {
            SignalError::Unauthorized(_) => 2,
            SignalError::NotJoined | SignalError::AlreadyJoined(_) => 3,
            SignalError::UnknownRoom(_)
            | SignalError::UnknownPeer(_)
            | SignalError::UnknownTransport(_)
            | SignalError::ProducerGone(_) => 4,
            SignalError::DuplicatePeer(_) | SignalError::TransportNotConnected(_) => 5,
            SignalError::Internal(_) => 6,
            SignalError::Gateway(_) | SignalError::Draining => 7,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalError::Unauthorized(_) => "Invalid or expired token".to_string(),
            SignalError::NotJoined => "Join a room first".to_string(),
            SignalError::AlreadyJoined(_) => "Already joined a room".to_string(),
            SignalError::UnknownRoom(_) => "Room not found".to_string(),
            SignalError::UnknownPeer(_) => "Peer not found".to_string(),
            SignalError::UnknownTransport(_) => "Transport not found".to_string(),
            SignalError::TransportNotConnected(_) => "Transport is not connected".to_string(),
            SignalError::ProducerGone(_) => "Producer no longer exists".to_string(),
            SignalError::DuplicatePeer(_) => "Peer ID already in use in this room".to_string(),
            SignalError::Gateway(_) => "Media server failure, please retry".to_string(),
            SignalError::Draining => "Server is shutting down, please reconnect".to_string(),
            SignalError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
