//! Per-connection signaling session.
//!
//! One `SignalingSession` per WebSocket connection. Requests on a
//! connection are handled one at a time in arrival order; concurrency in
//! the system comes from many connections, not from pipelining within one.
//!
//! The session is where SFU gateway calls happen: always outside the room
//! actors, so a slow media server never blocks a room's mailbox. Every
//! gateway result is attached to the room through a message that
//! re-validates the peer; if the peer vanished mid-negotiation the session
//! releases the freshly created gateway resource instead of leaking it.

use crate::errors::SignalError;
use crate::observability::metrics::CoreMetrics;
use crate::outbound::OutboundSender;
use crate::protocol::{
    ClientRequest, MediaKind, RequestEnvelope, ServerMessage, TransportDirection,
};
use crate::registry::ConnectionRegistry;
use crate::rooms::{ConnectPhase, ConsumerSeed, RoomHandle, RoomStoreHandle, TransportSeed};
use crate::sfu::SfuGateway;

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Session room-membership state.
enum SessionState {
    /// Authenticated, not in a room.
    Idle,
    /// Joined a room as a peer.
    Joined {
        room_id: String,
        peer_id: String,
        room: RoomHandle,
    },
    /// Torn down; no further requests are served.
    Closed,
}

/// Per-connection signaling state machine.
pub struct SignalingSession {
    connection_id: String,
    connection: OutboundSender,
    registry: Arc<ConnectionRegistry>,
    store: RoomStoreHandle,
    gateway: Arc<dyn SfuGateway>,
    metrics: Arc<CoreMetrics>,
    state: SessionState,
}

impl SignalingSession {
    #[must_use]
    pub fn new(
        connection_id: String,
        connection: OutboundSender,
        registry: Arc<ConnectionRegistry>,
        store: RoomStoreHandle,
        gateway: Arc<dyn SfuGateway>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            connection_id,
            connection,
            registry,
            store,
            gateway,
            metrics,
            state: SessionState::Idle,
        }
    }

    /// Handle one request and queue the ack (or error ack) on the
    /// connection's outbound queue.
    pub async fn handle_request(&mut self, envelope: RequestEnvelope) {
        let id = envelope.id;
        let frame = match self.dispatch(envelope.request).await {
            Ok(data) => ServerMessage::Ack { id, data },
            Err(err) => {
                self.metrics.request_failed();
                debug!(
                    target: "signal.session",
                    connection_id = %self.connection_id,
                    request_id = id,
                    error = %err,
                    "Request failed"
                );
                ServerMessage::error(id, &err)
            }
        };
        self.connection.send(frame);
    }

    /// Tear the session down. Idempotent; runs the same release path as
    /// an explicit leave, then unregisters the connection.
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closed;
        self.registry.unregister(&self.connection_id).await;
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<Value, SignalError> {
        match request {
            ClientRequest::JoinRoom {
                room_id,
                peer_id,
                display_name,
            } => self.join_room(room_id, peer_id, display_name).await,
            ClientRequest::LeaveRoom { room_id, peer_id } => {
                self.leave_room(&room_id, &peer_id).await
            }
            ClientRequest::CreateWebRtcTransport { consumer } => {
                let direction = if consumer {
                    TransportDirection::Receive
                } else {
                    TransportDirection::Send
                };
                self.create_transport(direction).await
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(transport_id, &dtls_parameters).await,
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.produce(transport_id, kind, &rtp_parameters).await,
            ClientRequest::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.consume(transport_id, producer_id, &rtp_capabilities)
                    .await
            }
            ClientRequest::SendMessage { room_id, message } => {
                self.send_message(&room_id, message).await
            }
            ClientRequest::UpdateMediaState {
                audio_muted,
                video_off,
            } => self.update_media_state(audio_muted, video_off).await,
        }
    }

    /// Current room binding, or `NotJoined`.
    fn joined(&self) -> Result<(&str, &str, &RoomHandle), SignalError> {
        match &self.state {
            SessionState::Joined {
                room_id,
                peer_id,
                room,
            } => Ok((room_id, peer_id, room)),
            SessionState::Idle => Err(SignalError::NotJoined),
            SessionState::Closed => Err(SignalError::Draining),
        }
    }

    async fn join_room(
        &mut self,
        room_id: String,
        peer_id: String,
        display_name: String,
    ) -> Result<Value, SignalError> {
        match &self.state {
            SessionState::Joined { room_id, .. } => {
                return Err(SignalError::AlreadyJoined(room_id.clone()));
            }
            SessionState::Closed => return Err(SignalError::Draining),
            SessionState::Idle => {}
        }

        let (room, existing) = self
            .store
            .join_room(
                room_id.clone(),
                peer_id.clone(),
                display_name,
                self.connection.clone(),
            )
            .await?;

        // The socket may have closed while the join was in flight; undo
        // rather than leave an orphan peer in the room.
        if !self.registry.bind(&self.connection_id, &room_id, &peer_id) {
            self.store.leave_room(room_id, peer_id).await;
            return Err(SignalError::Draining);
        }

        let capabilities = match self.gateway.router_capabilities(&room_id).await {
            Ok(caps) => caps,
            Err(err) => {
                self.metrics.gateway_failure();
                self.registry.leave(&self.connection_id).await;
                return Err(err.into());
            }
        };

        self.state = SessionState::Joined {
            room_id,
            peer_id,
            room,
        };

        Ok(json!({
            "routerRtpCapabilities": capabilities,
            "peers": existing,
        }))
    }

    /// Explicit leave. Idempotent: leaving while not joined, or with ids
    /// that do not match the session's binding, acks as a no-op.
    async fn leave_room(&mut self, room_id: &str, peer_id: &str) -> Result<Value, SignalError> {
        let matches_binding = matches!(
            &self.state,
            SessionState::Joined { room_id: r, peer_id: p, .. } if r == room_id && p == peer_id
        );
        if !matches_binding {
            return Ok(Value::Null);
        }

        self.registry.leave(&self.connection_id).await;
        self.state = SessionState::Idle;
        Ok(Value::Null)
    }

    async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<Value, SignalError> {
        let (room_id, peer_id, room) = self.joined()?;
        let (room_id, peer_id, room) = (room_id.to_string(), peer_id.to_string(), room.clone());

        let descriptor = self
            .gateway
            .create_transport(&room_id, &peer_id, direction)
            .await
            .map_err(|err| {
                self.metrics.gateway_failure();
                SignalError::from(err)
            })?;

        let seed = TransportSeed {
            id: descriptor.id.clone(),
            direction,
            ice_parameters: descriptor.ice_parameters.clone(),
            ice_candidates: descriptor.ice_candidates.clone(),
            dtls_parameters: descriptor.dtls_parameters.clone(),
        };

        match room.attach_transport(peer_id, seed).await {
            Ok(attached) => {
                // A re-created transport displaces its predecessor and
                // anything riding on it.
                for resource_id in attached.replaced {
                    self.release_resource(&resource_id).await;
                }
                Ok(json!({
                    "id": descriptor.id,
                    "iceParameters": descriptor.ice_parameters,
                    "iceCandidates": descriptor.ice_candidates,
                    "dtlsParameters": descriptor.dtls_parameters,
                }))
            }
            Err(err) => {
                // Peer vanished mid-negotiation: the transport has no
                // owner, release it.
                self.release_resource(&descriptor.id).await;
                Err(err)
            }
        }
    }

    async fn connect_transport(
        &mut self,
        transport_id: String,
        dtls_parameters: &Value,
    ) -> Result<Value, SignalError> {
        let (_, peer_id, room) = self.joined()?;
        let (peer_id, room) = (peer_id.to_string(), room.clone());

        match room
            .begin_transport_connect(peer_id.clone(), transport_id.clone())
            .await?
        {
            // Duplicate connect: plain success, no second DTLS handshake.
            ConnectPhase::AlreadyConnected => Ok(json!({"connected": true})),
            ConnectPhase::Proceed => {
                self.gateway
                    .connect_transport(&transport_id, dtls_parameters)
                    .await
                    .map_err(|err| {
                        self.metrics.gateway_failure();
                        SignalError::from(err)
                    })?;
                room.complete_transport_connect(peer_id, transport_id).await;
                Ok(json!({"connected": true}))
            }
        }
    }

    async fn produce(
        &mut self,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<Value, SignalError> {
        let (_, peer_id, room) = self.joined()?;
        let (peer_id, room) = (peer_id.to_string(), room.clone());

        room.require_connected_transport(peer_id.clone(), transport_id.clone())
            .await?;

        let producer = self
            .gateway
            .produce(&transport_id, kind, rtp_parameters)
            .await
            .map_err(|err| {
                self.metrics.gateway_failure();
                SignalError::from(err)
            })?;

        match room
            .attach_producer(peer_id, transport_id, producer.id.clone(), kind)
            .await
        {
            Ok(()) => Ok(json!({"id": producer.id})),
            Err(err) => {
                self.release_resource(&producer.id).await;
                Err(err)
            }
        }
    }

    async fn consume(
        &mut self,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: &Value,
    ) -> Result<Value, SignalError> {
        let (_, peer_id, room) = self.joined()?;
        let (peer_id, room) = (peer_id.to_string(), room.clone());

        // Resolve first so a dead producer fails before any gateway work.
        let producer = room.resolve_producer(producer_id.clone()).await?;
        room.require_connected_transport(peer_id.clone(), transport_id.clone())
            .await?;

        let consumer = self
            .gateway
            .consume(&transport_id, &producer_id, producer.kind, rtp_capabilities)
            .await
            .map_err(|err| {
                self.metrics.gateway_failure();
                SignalError::from(err)
            })?;

        let seed = ConsumerSeed {
            id: consumer.id.clone(),
            transport_id,
            producer_id: consumer.producer_id.clone(),
            producer_peer_id: producer.peer_id.clone(),
            kind: consumer.kind,
        };

        match room.attach_consumer(peer_id, seed).await {
            Ok(()) => Ok(json!({
                "id": consumer.id,
                "producerId": consumer.producer_id,
                "producerPeerId": producer.peer_id,
                "kind": consumer.kind,
                "rtpParameters": consumer.rtp_parameters,
            })),
            Err(err) => {
                // Producer vanished between gateway call and attach.
                self.release_resource(&consumer.id).await;
                Err(err)
            }
        }
    }

    async fn send_message(&mut self, room_id: &str, message: String) -> Result<Value, SignalError> {
        let (bound_room_id, peer_id, room) = self.joined()?;
        if bound_room_id != room_id {
            return Err(SignalError::UnknownRoom(room_id.to_string()));
        }
        let (peer_id, room) = (peer_id.to_string(), room.clone());

        room.chat(peer_id, message).await?;
        Ok(Value::Null)
    }

    async fn update_media_state(
        &mut self,
        audio_muted: bool,
        video_off: bool,
    ) -> Result<Value, SignalError> {
        let (_, peer_id, room) = self.joined()?;
        let (peer_id, room) = (peer_id.to_string(), room.clone());

        room.set_media_state(peer_id, audio_muted, video_off).await?;
        Ok(Value::Null)
    }

    /// Best-effort gateway release for a resource the room refused or
    /// displaced. Never fails the request that triggered it.
    async fn release_resource(&self, resource_id: &str) {
        if let Err(err) = self.gateway.close_resource(resource_id).await {
            self.metrics.gateway_failure();
            warn!(
                target: "signal.session",
                connection_id = %self.connection_id,
                resource_id = %resource_id,
                error = %err,
                "Failed to release gateway resource"
            );
        }
    }
}
