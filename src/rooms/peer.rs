//! Per-peer state owned by a room actor.

use super::messages::{PeerSummary, ProducerSummary};
use crate::outbound::OutboundSender;
use crate::protocol::{MediaKind, TransportDirection};
use serde_json::Value;
use std::collections::HashMap;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// A negotiated transport handle and its client-facing parameters.
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub state: TransportState,
}

/// One outbound track a peer is sending.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: String,
    pub transport_id: String,
    pub kind: MediaKind,
}

/// One inbound track a peer is receiving. References the source producer
/// by id only; producer closure invalidates the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: String,
    pub transport_id: String,
    pub producer_id: String,
    pub producer_peer_id: String,
    pub kind: MediaKind,
}

/// Peer state within a room. Does not outlive its connection: the room
/// actor drops the peer when the connection's teardown runs.
#[derive(Debug)]
pub struct Peer {
    pub peer_id: String,
    pub display_name: String,
    pub connection: OutboundSender,
    /// At most one transport per role.
    pub transports: HashMap<TransportDirection, TransportRecord>,
    pub producers: HashMap<String, ProducerRecord>,
    pub consumers: HashMap<String, ConsumerRecord>,
    pub audio_muted: bool,
    pub video_off: bool,
}

impl Peer {
    pub fn new(peer_id: String, display_name: String, connection: OutboundSender) -> Self {
        Self {
            peer_id,
            display_name,
            connection,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            audio_muted: false,
            video_off: false,
        }
    }

    pub fn summary(&self) -> PeerSummary {
        let mut producers: Vec<ProducerSummary> = self
            .producers
            .values()
            .map(|p| ProducerSummary {
                id: p.id.clone(),
                kind: p.kind,
            })
            .collect();
        producers.sort_by(|a, b| a.id.cmp(&b.id));

        PeerSummary {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            producers,
        }
    }

    pub fn transport(&self, transport_id: &str) -> Option<&TransportRecord> {
        self.transports.values().find(|t| t.id == transport_id)
    }

    pub fn transport_mut(&mut self, transport_id: &str) -> Option<&mut TransportRecord> {
        self.transports.values_mut().find(|t| t.id == transport_id)
    }

    /// Every gateway resource this peer owns, in release order: consumers
    /// first, then producers, then transports.
    pub fn owned_resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.consumers.keys().cloned().collect();
        ids.extend(self.producers.keys().cloned());
        ids.extend(self.transports.values().map(|t| t.id.clone()));
        ids
    }
}
