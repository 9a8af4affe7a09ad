//! Wire protocol types.
//!
//! JSON over a persistent WebSocket per client. Client requests carry a
//! numeric request id and are answered with an ack (or error) carrying the
//! same id; server-initiated events carry no id. Opaque SFU descriptors
//! (ICE/DTLS/RTP parameters, capabilities) travel as raw JSON values.

use crate::errors::SignalError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Media kind of a producer or consumer track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Transport role: a peer holds at most one transport per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Outbound media (produce).
    Send,
    /// Inbound media (consume).
    Receive,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Receive => write!(f, "receive"),
        }
    }
}

/// A client request envelope: request id plus the event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    /// Request correlation id, echoed in the ack.
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Client-to-server requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    JoinRoom {
        room_id: String,
        peer_id: String,
        display_name: String,
    },
    LeaveRoom {
        room_id: String,
        peer_id: String,
    },
    #[serde(rename = "createWebRtcTransport")]
    CreateWebRtcTransport {
        /// True for the receive transport, false for the send transport.
        consumer: bool,
    },
    #[serde(rename = "connectTransport")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    SendMessage {
        room_id: String,
        message: String,
    },
    UpdateMediaState {
        audio_muted: bool,
        video_off: bool,
    },
}

/// Server-to-client events (no request id, fan-out via the room).
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    PeerJoined {
        peer_id: String,
        display_name: String,
    },
    PeerLeft {
        peer_id: String,
    },
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },
    PeerMediaState {
        peer_id: String,
        audio_muted: bool,
        video_off: bool,
    },
    NewMessage {
        sender: String,
        message: String,
        /// RFC 3339, stamped server-side.
        timestamp: String,
    },
}

/// Error body carried in an error ack.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

/// Any server-to-client frame: request acks, error acks, or events.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Ack {
        id: u64,
        #[serde(skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    Error {
        id: u64,
        error: ErrorBody,
    },
    Event(ServerEvent),
}

impl ServerMessage {
    /// Build an error ack from a [`SignalError`], exposing only the
    /// client-safe message.
    #[must_use]
    pub fn error(id: u64, err: &SignalError) -> Self {
        ServerMessage::Error {
            id,
            error: ErrorBody {
                code: err.error_code(),
                message: err.client_message(),
            },
        }
    }
}
