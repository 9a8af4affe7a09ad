//! `RoomActor` - per-room actor that owns room state.
//!
//! Each `RoomActor`:
//! - Owns all state for one room (peers, transports, producers, consumers)
//! - Serializes the room's state transitions through its mailbox
//! - Fans room events out to member connections (best-effort per
//!   connection)
//!
//! Gateway calls never happen inside this actor: sessions negotiate with
//! the SFU gateway first and attach the result afterwards, so a slow
//! negotiation cannot stall unrelated joins and leaves in the same room.

use super::messages::{
    ConnectPhase, ConsumerSeed, PeerRemoval, PeerSummary, ProducerRef, RoomMessage, RoomState,
    TransportAttached, TransportSeed,
};
use super::peer::{ConsumerRecord, Peer, ProducerRecord, TransportRecord, TransportState};
use crate::errors::SignalError;
use crate::observability::metrics::CoreMetrics;
use crate::outbound::OutboundSender;
use crate::protocol::{MediaKind, ServerEvent, ServerMessage};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 256;

/// Handle to a `RoomActor`.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomHandle {
    /// Get the room ID.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Join a peer to the room, returning the peers already present.
    pub(crate) async fn join(
        &self,
        peer_id: String,
        display_name: String,
        connection: OutboundSender,
    ) -> Result<Vec<PeerSummary>, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                peer_id,
                display_name,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))?;
        rx.await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))?
    }

    /// Remove a peer and everything it owns. Returns what to release.
    pub(crate) async fn remove_peer(&self, peer_id: String) -> Result<PeerRemoval, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::RemovePeer {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))?;
        rx.await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))
    }

    /// Record a gateway-created transport against a peer.
    pub async fn attach_transport(
        &self,
        peer_id: String,
        transport: TransportSeed,
    ) -> Result<TransportAttached, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::AttachTransport {
                peer_id: peer_id.clone(),
                transport,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownPeer(peer_id.clone()))?;
        rx.await.map_err(|_| SignalError::UnknownPeer(peer_id))?
    }

    /// Claim a transport for DTLS connect.
    pub async fn begin_transport_connect(
        &self,
        peer_id: String,
        transport_id: String,
    ) -> Result<ConnectPhase, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::BeginTransportConnect {
                peer_id: peer_id.clone(),
                transport_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownPeer(peer_id.clone()))?;
        rx.await.map_err(|_| SignalError::UnknownPeer(peer_id))?
    }

    /// Mark a transport connected after the gateway call succeeded.
    /// Fire-and-forget: if the peer left meanwhile the room ignores it.
    pub async fn complete_transport_connect(&self, peer_id: String, transport_id: String) {
        let _ = self
            .sender
            .send(RoomMessage::CompleteTransportConnect {
                peer_id,
                transport_id,
            })
            .await;
    }

    /// Produce/consume precondition: the transport exists and is connected.
    pub async fn require_connected_transport(
        &self,
        peer_id: String,
        transport_id: String,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::RequireConnectedTransport {
                peer_id: peer_id.clone(),
                transport_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownPeer(peer_id.clone()))?;
        rx.await.map_err(|_| SignalError::UnknownPeer(peer_id))?
    }

    /// Record a producer and announce it to the rest of the room.
    pub async fn attach_producer(
        &self,
        peer_id: String,
        transport_id: String,
        producer_id: String,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::AttachProducer {
                peer_id: peer_id.clone(),
                transport_id,
                producer_id,
                kind,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownPeer(peer_id.clone()))?;
        rx.await.map_err(|_| SignalError::UnknownPeer(peer_id))?
    }

    /// Resolve a producer id to its owner, or `ProducerGone`.
    pub async fn resolve_producer(&self, producer_id: String) -> Result<ProducerRef, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ResolveProducer {
                producer_id: producer_id.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::ProducerGone(producer_id.clone()))?;
        rx.await
            .map_err(|_| SignalError::ProducerGone(producer_id))?
    }

    /// Record a consumer, re-validating the source producer.
    pub async fn attach_consumer(
        &self,
        peer_id: String,
        consumer: ConsumerSeed,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::AttachConsumer {
                peer_id: peer_id.clone(),
                consumer,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownPeer(peer_id.clone()))?;
        rx.await.map_err(|_| SignalError::UnknownPeer(peer_id))?
    }

    /// Relay a chat message to the whole room.
    pub async fn chat(&self, sender_peer_id: String, message: String) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Chat {
                sender_peer_id,
                message,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))?;
        rx.await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))?
    }

    /// Update a peer's media flags and announce the change.
    pub async fn set_media_state(
        &self,
        peer_id: String,
        audio_muted: bool,
        video_off: bool,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::SetMediaState {
                peer_id: peer_id.clone(),
                audio_muted,
                video_off,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::UnknownPeer(peer_id.clone()))?;
        rx.await.map_err(|_| SignalError::UnknownPeer(peer_id))?
    }

    /// Current peer set with their producers.
    pub async fn list_peers(&self) -> Result<Vec<PeerSummary>, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ListPeers { respond_to: tx })
            .await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))?;
        rx.await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))
    }

    /// Room snapshot for tests and introspection.
    pub async fn get_state(&self) -> Result<RoomState, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))?;
        rx.await
            .map_err(|_| SignalError::UnknownRoom(self.room_id.clone()))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    peers: HashMap<String, Peer>,
    created_at: i64,
    metrics: Arc<CoreMetrics>,
}

impl RoomActor {
    /// Spawn a new room actor. Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        cancel_token: CancellationToken,
        metrics: Arc<CoreMetrics>,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            peers: HashMap::new(),
            created_at: chrono::Utc::now().timestamp(),
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "signal.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        debug!(
            target: "signal.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "signal.room",
                        room_id = %self.room_id,
                        peers = self.peers.len(),
                        "RoomActor cancelled"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            debug!(
                                target: "signal.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                display_name,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(peer_id, display_name, connection);
                let _ = respond_to.send(result);
            }

            RoomMessage::RemovePeer {
                peer_id,
                respond_to,
            } => {
                let removal = self.handle_remove_peer(&peer_id);
                let _ = respond_to.send(removal);
            }

            RoomMessage::AttachTransport {
                peer_id,
                transport,
                respond_to,
            } => {
                let result = self.handle_attach_transport(&peer_id, transport);
                let _ = respond_to.send(result);
            }

            RoomMessage::BeginTransportConnect {
                peer_id,
                transport_id,
                respond_to,
            } => {
                let result = self.handle_begin_transport_connect(&peer_id, &transport_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::CompleteTransportConnect {
                peer_id,
                transport_id,
            } => {
                self.handle_complete_transport_connect(&peer_id, &transport_id);
            }

            RoomMessage::RequireConnectedTransport {
                peer_id,
                transport_id,
                respond_to,
            } => {
                let result = self.check_transport_connected(&peer_id, &transport_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::AttachProducer {
                peer_id,
                transport_id,
                producer_id,
                kind,
                respond_to,
            } => {
                let result = self.handle_attach_producer(&peer_id, transport_id, producer_id, kind);
                let _ = respond_to.send(result);
            }

            RoomMessage::ResolveProducer {
                producer_id,
                respond_to,
            } => {
                let result = self.handle_resolve_producer(&producer_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::AttachConsumer {
                peer_id,
                consumer,
                respond_to,
            } => {
                let result = self.handle_attach_consumer(&peer_id, consumer);
                let _ = respond_to.send(result);
            }

            RoomMessage::Chat {
                sender_peer_id,
                message,
                respond_to,
            } => {
                let result = self.handle_chat(&sender_peer_id, message);
                let _ = respond_to.send(result);
            }

            RoomMessage::SetMediaState {
                peer_id,
                audio_muted,
                video_off,
                respond_to,
            } => {
                let result = self.handle_set_media_state(&peer_id, audio_muted, video_off);
                let _ = respond_to.send(result);
            }

            RoomMessage::ListPeers { respond_to } => {
                let _ = respond_to.send(self.peer_summaries(None));
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(RoomState {
                    room_id: self.room_id.clone(),
                    peers: self.peer_summaries(None),
                    created_at: self.created_at,
                });
            }
        }
    }

    fn handle_join(
        &mut self,
        peer_id: String,
        display_name: String,
        connection: OutboundSender,
    ) -> Result<Vec<PeerSummary>, SignalError> {
        // Reject, never overwrite: a duplicate id must not hijack another
        // connection's slot.
        if self.peers.contains_key(&peer_id) {
            return Err(SignalError::DuplicatePeer(peer_id));
        }

        let existing = self.peer_summaries(None);

        self.broadcast(
            None,
            ServerEvent::PeerJoined {
                peer_id: peer_id.clone(),
                display_name: display_name.clone(),
            },
        );

        self.peers.insert(
            peer_id.clone(),
            Peer::new(peer_id.clone(), display_name, connection),
        );
        self.metrics.peer_joined();

        info!(
            target: "signal.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            total_peers = self.peers.len(),
            "Peer joined"
        );

        Ok(existing)
    }

    /// The single peer-removal routine: explicit leave, abrupt disconnect
    /// and room shutdown all come through here, so cleanup cannot fork.
    fn handle_remove_peer(&mut self, peer_id: &str) -> PeerRemoval {
        let Some(peer) = self.peers.remove(peer_id) else {
            return PeerRemoval {
                was_present: false,
                now_empty: self.peers.is_empty(),
                released: Vec::new(),
            };
        };

        let mut released = peer.owned_resource_ids();
        let producer_ids: Vec<String> = peer.producers.keys().cloned().collect();
        released.extend(self.invalidate_consumers_of(&producer_ids));

        self.broadcast(
            None,
            ServerEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            },
        );
        self.metrics.peer_left();

        info!(
            target: "signal.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            remaining_peers = self.peers.len(),
            released = released.len(),
            "Peer removed"
        );

        PeerRemoval {
            was_present: true,
            now_empty: self.peers.is_empty(),
            released,
        }
    }

    fn handle_attach_transport(
        &mut self,
        peer_id: &str,
        seed: TransportSeed,
    ) -> Result<TransportAttached, SignalError> {
        let mut orphan_producers: Vec<String> = Vec::new();
        let mut replaced: Vec<String> = Vec::new();

        {
            let peer = self
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;

            let record = TransportRecord {
                id: seed.id,
                direction: seed.direction,
                ice_parameters: seed.ice_parameters,
                ice_candidates: seed.ice_candidates,
                dtls_parameters: seed.dtls_parameters,
                state: TransportState::Created,
            };

            // One transport per role: re-creating a direction displaces the
            // previous transport and everything riding on it.
            if let Some(old) = peer.transports.insert(seed.direction, record) {
                orphan_producers = peer
                    .producers
                    .values()
                    .filter(|p| p.transport_id == old.id)
                    .map(|p| p.id.clone())
                    .collect();
                for id in &orphan_producers {
                    peer.producers.remove(id);
                }

                let orphan_consumers: Vec<String> = peer
                    .consumers
                    .values()
                    .filter(|c| c.transport_id == old.id)
                    .map(|c| c.id.clone())
                    .collect();
                for id in &orphan_consumers {
                    peer.consumers.remove(id);
                }

                replaced.extend(orphan_consumers);
                replaced.extend(orphan_producers.iter().cloned());
                replaced.push(old.id);
            }
        }

        replaced.extend(self.invalidate_consumers_of(&orphan_producers));

        Ok(TransportAttached { replaced })
    }

    fn handle_begin_transport_connect(
        &mut self,
        peer_id: &str,
        transport_id: &str,
    ) -> Result<ConnectPhase, SignalError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;
        let transport = peer
            .transport_mut(transport_id)
            .ok_or_else(|| SignalError::UnknownTransport(transport_id.to_string()))?;

        match transport.state {
            TransportState::Connected => Ok(ConnectPhase::AlreadyConnected),
            TransportState::Created | TransportState::Connecting => {
                transport.state = TransportState::Connecting;
                Ok(ConnectPhase::Proceed)
            }
            TransportState::Closed => {
                Err(SignalError::UnknownTransport(transport_id.to_string()))
            }
        }
    }

    fn handle_complete_transport_connect(&mut self, peer_id: &str, transport_id: &str) {
        // Peer may have left while the gateway call was in flight; the
        // transport was released with it, nothing to mark.
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        if let Some(transport) = peer.transport_mut(transport_id) {
            if transport.state != TransportState::Closed {
                transport.state = TransportState::Connected;
            }
        }
    }

    fn check_transport_connected(
        &self,
        peer_id: &str,
        transport_id: &str,
    ) -> Result<(), SignalError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;
        let transport = peer
            .transport(transport_id)
            .ok_or_else(|| SignalError::UnknownTransport(transport_id.to_string()))?;

        if transport.state == TransportState::Connected {
            Ok(())
        } else {
            Err(SignalError::TransportNotConnected(transport_id.to_string()))
        }
    }

    fn handle_attach_producer(
        &mut self,
        peer_id: &str,
        transport_id: String,
        producer_id: String,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        {
            let peer = self
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;

            // The transport may have been replaced while the gateway call
            // was in flight; attaching to it would leak a dead producer.
            let transport = peer
                .transport(&transport_id)
                .ok_or_else(|| SignalError::UnknownTransport(transport_id.clone()))?;
            if transport.state != TransportState::Connected {
                return Err(SignalError::TransportNotConnected(transport_id));
            }

            peer.producers.insert(
                producer_id.clone(),
                ProducerRecord {
                    id: producer_id.clone(),
                    transport_id,
                    kind,
                },
            );
        }

        self.broadcast(
            Some(peer_id),
            ServerEvent::NewProducer {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.clone(),
                kind,
            },
        );

        debug!(
            target: "signal.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer attached"
        );

        Ok(())
    }

    fn handle_resolve_producer(&self, producer_id: &str) -> Result<ProducerRef, SignalError> {
        for peer in self.peers.values() {
            if let Some(producer) = peer.producers.get(producer_id) {
                return Ok(ProducerRef {
                    peer_id: peer.peer_id.clone(),
                    kind: producer.kind,
                });
            }
        }
        Err(SignalError::ProducerGone(producer_id.to_string()))
    }

    fn handle_attach_consumer(
        &mut self,
        peer_id: &str,
        seed: ConsumerSeed,
    ) -> Result<(), SignalError> {
        // Re-validate: the source peer may have left between the consume
        // request and this attach.
        self.handle_resolve_producer(&seed.producer_id)?;

        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;

        peer.consumers.insert(
            seed.id.clone(),
            ConsumerRecord {
                id: seed.id,
                transport_id: seed.transport_id,
                producer_id: seed.producer_id,
                producer_peer_id: seed.producer_peer_id,
                kind: seed.kind,
            },
        );

        Ok(())
    }

    fn handle_chat(&mut self, sender_peer_id: &str, message: String) -> Result<(), SignalError> {
        if !self.peers.contains_key(sender_peer_id) {
            return Err(SignalError::UnknownPeer(sender_peer_id.to_string()));
        }

        // Whole-room fan-out, sender's connection included.
        self.broadcast(
            None,
            ServerEvent::NewMessage {
                sender: sender_peer_id.to_string(),
                message,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        );

        Ok(())
    }

    fn handle_set_media_state(
        &mut self,
        peer_id: &str,
        audio_muted: bool,
        video_off: bool,
    ) -> Result<(), SignalError> {
        {
            let peer = self
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;
            peer.audio_muted = audio_muted;
            peer.video_off = video_off;
        }

        self.broadcast(
            Some(peer_id),
            ServerEvent::PeerMediaState {
                peer_id: peer_id.to_string(),
                audio_muted,
                video_off,
            },
        );

        Ok(())
    }

    /// Remove every consumer (of any peer) referencing one of the given
    /// producers, notifying the consuming connection. Returns the released
    /// consumer ids.
    fn invalidate_consumers_of(&mut self, producer_ids: &[String]) -> Vec<String> {
        if producer_ids.is_empty() {
            return Vec::new();
        }

        let mut released = Vec::new();
        for peer in self.peers.values_mut() {
            let doomed: Vec<String> = peer
                .consumers
                .values()
                .filter(|c| producer_ids.contains(&c.producer_id))
                .map(|c| c.id.clone())
                .collect();

            for consumer_id in doomed {
                if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                    peer.connection
                        .send(ServerMessage::Event(ServerEvent::ConsumerClosed {
                            consumer_id: consumer_id.clone(),
                            producer_id: consumer.producer_id,
                        }));
                    released.push(consumer_id);
                }
            }
        }
        released
    }

    fn peer_summaries(&self, except: Option<&str>) -> Vec<PeerSummary> {
        let mut summaries: Vec<PeerSummary> = self
            .peers
            .values()
            .filter(|p| except != Some(p.peer_id.as_str()))
            .map(Peer::summary)
            .collect();
        summaries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        summaries
    }

    /// Fan an event out to every member connection except `except`.
    /// Best-effort per connection: a full or closed outbound queue drops
    /// the frame for that connection only.
    fn broadcast(&self, except: Option<&str>, event: ServerEvent) {
        for peer in self.peers.values() {
            if except == Some(peer.peer_id.as_str()) {
                continue;
            }
            if !peer.connection.send(ServerMessage::Event(event.clone())) {
                warn!(
                    target: "signal.room",
                    room_id = %self.room_id,
                    peer_id = %peer.peer_id,
                    "Dropped room event for peer connection"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::TransportDirection;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    fn spawn_room(room_id: &str) -> (RoomHandle, CancellationToken) {
        let cancel_token = CancellationToken::new();
        let (handle, _task) = RoomActor::spawn(
            room_id.to_string(),
            cancel_token.clone(),
            CoreMetrics::new(),
        );
        (handle, cancel_token)
    }

    async fn join(
        room: &RoomHandle,
        peer_id: &str,
    ) -> (Vec<PeerSummary>, Receiver<ServerMessage>) {
        let (connection, rx) = OutboundSender::channel(format!("conn-{peer_id}"), 32);
        let existing = room
            .join(peer_id.to_string(), peer_id.to_uppercase(), connection)
            .await
            .unwrap();
        (existing, rx)
    }

    fn seed(id: &str, direction: TransportDirection) -> TransportSeed {
        TransportSeed {
            id: id.to_string(),
            direction,
            ice_parameters: json!({}),
            ice_candidates: json!([]),
            dtls_parameters: json!({}),
        }
    }

    async fn connect_transport(room: &RoomHandle, peer: &str, transport: &str) {
        let phase = room
            .begin_transport_connect(peer.to_string(), transport.to_string())
            .await
            .unwrap();
        assert_eq!(phase, ConnectPhase::Proceed);
        room.complete_transport_connect(peer.to_string(), transport.to_string())
            .await;
    }

    #[tokio::test]
    async fn test_join_returns_existing_peers() {
        let (room, _token) = spawn_room("r1");

        let (existing, _rx_a) = join(&room, "alice").await;
        assert!(existing.is_empty());

        let (existing, _rx_b) = join(&room, "bob").await;
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].peer_id, "alice");

        room.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected_first_untouched() {
        let (room, _token) = spawn_room("r1");
        let (_, mut rx_a) = join(&room, "alice").await;

        let (connection, _rx) = OutboundSender::channel("conn-2", 32);
        let result = room
            .join("alice".to_string(), "Impostor".to_string(), connection)
            .await;
        assert!(matches!(result, Err(SignalError::DuplicatePeer(_))));

        // First peer still present with the original display name, and it
        // saw no join event for the failed attempt.
        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.peers[0].display_name, "ALICE");
        assert!(rx_a.try_recv().is_err());

        room.cancel();
    }

    #[tokio::test]
    async fn test_peer_joined_broadcast_to_others_only() {
        let (room, _token) = spawn_room("r1");
        let (_, mut rx_a) = join(&room, "alice").await;
        let (_, mut rx_b) = join(&room, "bob").await;

        match rx_a.recv().await.unwrap() {
            ServerMessage::Event(ServerEvent::PeerJoined { peer_id, .. }) => {
                assert_eq!(peer_id, "bob");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());

        room.cancel();
    }

    #[tokio::test]
    async fn test_connect_transport_idempotent() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx) = join(&room, "alice").await;

        room.attach_transport("alice".to_string(), seed("t1", TransportDirection::Send))
            .await
            .unwrap();

        let phase = room
            .begin_transport_connect("alice".to_string(), "t1".to_string())
            .await
            .unwrap();
        assert_eq!(phase, ConnectPhase::Proceed);
        room.complete_transport_connect("alice".to_string(), "t1".to_string())
            .await;

        // Duplicate connect: no second gateway round-trip, plain success.
        let phase = room
            .begin_transport_connect("alice".to_string(), "t1".to_string())
            .await
            .unwrap();
        assert_eq!(phase, ConnectPhase::AlreadyConnected);

        room.cancel();
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx) = join(&room, "alice").await;

        room.attach_transport("alice".to_string(), seed("t1", TransportDirection::Send))
            .await
            .unwrap();

        let result = room
            .require_connected_transport("alice".to_string(), "t1".to_string())
            .await;
        assert!(matches!(
            result,
            Err(SignalError::TransportNotConnected(_))
        ));

        connect_transport(&room, "alice", "t1").await;
        room.require_connected_transport("alice".to_string(), "t1".to_string())
            .await
            .unwrap();

        room.cancel();
    }

    #[tokio::test]
    async fn test_new_producer_broadcast_and_advertised() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx_a) = join(&room, "alice").await;
        let (_, mut rx_b) = join(&room, "bob").await;

        room.attach_transport("alice".to_string(), seed("t1", TransportDirection::Send))
            .await
            .unwrap();
        connect_transport(&room, "alice", "t1").await;
        room.attach_producer(
            "alice".to_string(),
            "t1".to_string(),
            "producer-1".to_string(),
            MediaKind::Video,
        )
        .await
        .unwrap();

        match rx_b.recv().await.unwrap() {
            ServerMessage::Event(ServerEvent::NewProducer {
                peer_id,
                producer_id,
                kind,
            }) => {
                assert_eq!(peer_id, "alice");
                assert_eq!(producer_id, "producer-1");
                assert_eq!(kind, MediaKind::Video);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Advertised to later joiners.
        let peers = room.list_peers().await.unwrap();
        let alice = peers.iter().find(|p| p.peer_id == "alice").unwrap();
        assert_eq!(alice.producers.len(), 1);
        assert_eq!(alice.producers[0].id, "producer-1");

        room.cancel();
    }

    #[tokio::test]
    async fn test_resolve_producer_gone() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx) = join(&room, "alice").await;

        let result = room.resolve_producer("producer-404".to_string()).await;
        assert!(matches!(result, Err(SignalError::ProducerGone(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_remove_peer_releases_everything_and_invalidates_consumers() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx_a) = join(&room, "alice").await;
        let (_, mut rx_b) = join(&room, "bob").await;

        // Alice produces video.
        room.attach_transport("alice".to_string(), seed("t1", TransportDirection::Send))
            .await
            .unwrap();
        connect_transport(&room, "alice", "t1").await;
        room.attach_producer(
            "alice".to_string(),
            "t1".to_string(),
            "producer-1".to_string(),
            MediaKind::Video,
        )
        .await
        .unwrap();

        // Bob consumes it.
        room.attach_transport("bob".to_string(), seed("t2", TransportDirection::Receive))
            .await
            .unwrap();
        connect_transport(&room, "bob", "t2").await;
        room.attach_consumer(
            "bob".to_string(),
            ConsumerSeed {
                id: "consumer-1".to_string(),
                transport_id: "t2".to_string(),
                producer_id: "producer-1".to_string(),
                producer_peer_id: "alice".to_string(),
                kind: MediaKind::Video,
            },
        )
        .await
        .unwrap();

        // Alice leaves: her transport + producer and bob's consumer go.
        let removal = room.remove_peer("alice".to_string()).await.unwrap();
        assert!(removal.was_present);
        assert!(!removal.now_empty);
        assert!(removal.released.contains(&"t1".to_string()));
        assert!(removal.released.contains(&"producer-1".to_string()));
        assert!(removal.released.contains(&"consumer-1".to_string()));

        // Bob sees join, new-producer, consumer-closed, peer-left in order.
        let mut events = Vec::new();
        while let Ok(msg) = rx_b.try_recv() {
            if let ServerMessage::Event(event) = msg {
                events.push(event);
            }
        }
        assert!(matches!(events[0], ServerEvent::NewProducer { .. }));
        assert!(matches!(
            events[1],
            ServerEvent::ConsumerClosed { ref producer_id, .. } if producer_id == "producer-1"
        ));
        assert!(matches!(
            events[2],
            ServerEvent::PeerLeft { ref peer_id } if peer_id == "alice"
        ));

        // Producer is gone for late consume attempts.
        let result = room.resolve_producer("producer-1".to_string()).await;
        assert!(matches!(result, Err(SignalError::ProducerGone(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_remove_absent_peer_is_noop() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx) = join(&room, "alice").await;

        let removal = room.remove_peer("ghost".to_string()).await.unwrap();
        assert!(!removal.was_present);
        assert!(!removal.now_empty);
        assert!(removal.released.is_empty());

        room.cancel();
    }

    #[tokio::test]
    async fn test_last_peer_removal_reports_empty() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx) = join(&room, "alice").await;

        let removal = room.remove_peer("alice".to_string()).await.unwrap();
        assert!(removal.was_present);
        assert!(removal.now_empty);

        room.cancel();
    }

    #[tokio::test]
    async fn test_attach_for_removed_peer_fails_unknown_peer() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx_a) = join(&room, "alice").await;
        let (_, _rx_b) = join(&room, "bob").await;

        let _ = room.remove_peer("alice".to_string()).await.unwrap();

        // Negotiation result arriving after disconnect must be rejected so
        // the caller releases the gateway resource.
        let result = room
            .attach_transport("alice".to_string(), seed("t9", TransportDirection::Send))
            .await;
        assert!(matches!(result, Err(SignalError::UnknownPeer(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_chat_fans_out_to_whole_room_including_sender() {
        let (room, _token) = spawn_room("r1");
        let (_, mut rx_a) = join(&room, "alice").await;
        let (_, mut rx_b) = join(&room, "bob").await;

        // Drain bob's join event on alice's connection.
        let _ = rx_a.recv().await;

        room.chat("alice".to_string(), "hello".to_string())
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                ServerMessage::Event(ServerEvent::NewMessage {
                    sender,
                    message,
                    timestamp,
                }) => {
                    assert_eq!(sender, "alice");
                    assert_eq!(message, "hello");
                    assert!(!timestamp.is_empty());
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        room.cancel();
    }

    #[tokio::test]
    async fn test_media_state_broadcast_to_others() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx_a) = join(&room, "alice").await;
        let (_, mut rx_b) = join(&room, "bob").await;

        room.set_media_state("alice".to_string(), true, false)
            .await
            .unwrap();

        match rx_b.recv().await.unwrap() {
            ServerMessage::Event(ServerEvent::PeerMediaState {
                peer_id,
                audio_muted,
                video_off,
            }) => {
                assert_eq!(peer_id, "alice");
                assert!(audio_muted);
                assert!(!video_off);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        room.cancel();
    }

    #[tokio::test]
    async fn test_replacing_send_transport_displaces_producers() {
        let (room, _token) = spawn_room("r1");
        let (_, _rx_a) = join(&room, "alice").await;
        let (_, _rx_b) = join(&room, "bob").await;

        room.attach_transport("alice".to_string(), seed("t1", TransportDirection::Send))
            .await
            .unwrap();
        connect_transport(&room, "alice", "t1").await;
        room.attach_producer(
            "alice".to_string(),
            "t1".to_string(),
            "producer-1".to_string(),
            MediaKind::Audio,
        )
        .await
        .unwrap();

        let attached = room
            .attach_transport("alice".to_string(), seed("t2", TransportDirection::Send))
            .await
            .unwrap();
        assert!(attached.replaced.contains(&"t1".to_string()));
        assert!(attached.replaced.contains(&"producer-1".to_string()));

        let result = room.resolve_producer("producer-1".to_string()).await;
        assert!(matches!(result, Err(SignalError::ProducerGone(_))));

        room.cancel();
    }
}
