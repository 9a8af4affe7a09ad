//! SFU gateway abstraction.
//!
//! The signaling core never touches the media plane; it negotiates
//! control-plane handles (transports, producers, consumers) through this
//! trait and stores the opaque descriptors the gateway returns. The
//! implementation is swappable: [`LocalGateway`] hands out deterministic
//! handles for standalone mode and tests, a production build would back
//! this with the real media-server API.

mod local;

pub use local::LocalGateway;

use crate::errors::SignalError;
use crate::protocol::{MediaKind, TransportDirection};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure from the media-plane gateway. Surfaced to clients as a
/// retryable error; the triggering request is aborted with no state
/// attached.
#[derive(Debug, Error)]
#[error("sfu gateway failure: {0}")]
pub struct GatewayError(pub String);

impl From<GatewayError> for SignalError {
    fn from(err: GatewayError) -> Self {
        SignalError::Gateway(err.0)
    }
}

/// Transport handle plus the ICE/DTLS parameters the client needs to
/// complete the handshake.
#[derive(Debug, Clone)]
pub struct TransportDescriptor {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Producer handle for one outbound track.
#[derive(Debug, Clone)]
pub struct ProducerDescriptor {
    pub id: String,
}

/// Consumer handle plus the RTP parameters the client needs to receive
/// the track.
#[derive(Debug, Clone)]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Control-plane interface to the SFU engine.
///
/// Calls may be slow; callers must not hold room state locked across them.
/// Every created resource must eventually be passed to `close_resource`,
/// including resources whose owning peer disappeared mid-negotiation.
#[async_trait]
pub trait SfuGateway: Send + Sync {
    /// Router RTP capabilities advertised to joining peers.
    async fn router_capabilities(&self, room_id: &str) -> Result<Value, GatewayError>;

    /// Create a WebRTC transport for a peer.
    async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, GatewayError>;

    /// Complete the DTLS handshake for a transport.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), GatewayError>;

    /// Register an outbound track on a connected transport.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerDescriptor, GatewayError>;

    /// Subscribe a transport to another peer's producer.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        kind: MediaKind,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, GatewayError>;

    /// Release a transport/producer/consumer handle. Idempotent; closing
    /// an unknown or already-closed resource is not an error.
    async fn close_resource(&self, resource_id: &str) -> Result<(), GatewayError>;
}
