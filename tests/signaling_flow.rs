//! End-to-end signaling flow over the in-process gateway.
//!
//! Drives two sessions through the full negotiation sequence (join,
//! transports, DTLS connect, produce, consume, chat) and verifies room
//! lifecycle and gateway resource cleanup on both explicit leave and
//! abrupt disconnect.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use parley::observability::CoreMetrics;
use parley::outbound::OutboundSender;
use parley::protocol::{RequestEnvelope, ServerEvent, ServerMessage};
use parley::registry::ConnectionRegistry;
use parley::rooms::{RoomStoreActor, RoomStoreHandle};
use parley::session::SignalingSession;
use parley::sfu::{LocalGateway, SfuGateway};
use serde_json::{json, Value};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

struct Harness {
    registry: Arc<ConnectionRegistry>,
    store: RoomStoreHandle,
    gateway: Arc<LocalGateway>,
    metrics: Arc<CoreMetrics>,
}

impl Harness {
    fn new() -> Self {
        let gateway = Arc::new(LocalGateway::new());
        let metrics = CoreMetrics::new();
        let (store, _task) = RoomStoreActor::spawn(
            Arc::clone(&gateway) as Arc<dyn SfuGateway>,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        let registry = ConnectionRegistry::new(store.clone(), Arc::clone(&metrics));
        Self {
            registry,
            store,
            gateway,
            metrics,
        }
    }

    fn session(&self, connection_id: &str) -> (SignalingSession, Receiver<ServerMessage>) {
        let (connection, rx) = OutboundSender::channel(connection_id, 64);
        self.registry.register(connection_id, "user-1");
        let session = SignalingSession::new(
            connection_id.to_string(),
            connection,
            Arc::clone(&self.registry),
            self.store.clone(),
            Arc::clone(&self.gateway) as Arc<dyn SfuGateway>,
            Arc::clone(&self.metrics),
        );
        (session, rx)
    }
}

async fn request(
    session: &mut SignalingSession,
    rx: &mut Receiver<ServerMessage>,
    value: Value,
) -> ServerMessage {
    request_collect(session, rx, value).await.0
}

/// Like [`request`], but also returns any events queued on the same
/// connection ahead of the ack.
async fn request_collect(
    session: &mut SignalingSession,
    rx: &mut Receiver<ServerMessage>,
    value: Value,
) -> (ServerMessage, Vec<ServerEvent>) {
    let envelope: RequestEnvelope = serde_json::from_value(value).unwrap();
    session.handle_request(envelope).await;
    let mut events = Vec::new();
    loop {
        match rx.recv().await.unwrap() {
            ServerMessage::Event(event) => events.push(event),
            frame => return (frame, events),
        }
    }
}

fn ack_data(frame: ServerMessage) -> Value {
    match frame {
        ServerMessage::Ack { data, .. } => data,
        other => panic!("expected ack, got {other:?}"),
    }
}

/// Drain every event currently queued on a connection.
fn drain_events(rx: &mut Receiver<ServerMessage>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let ServerMessage::Event(event) = frame {
            events.push(event);
        }
    }
    events
}

async fn join(
    session: &mut SignalingSession,
    rx: &mut Receiver<ServerMessage>,
    room: &str,
    peer: &str,
) -> Value {
    ack_data(
        request(
            session,
            rx,
            json!({
                "id": 1,
                "event": "join-room",
                "data": {"roomId": room, "peerId": peer, "displayName": peer}
            }),
        )
        .await,
    )
}

async fn setup_transport(
    session: &mut SignalingSession,
    rx: &mut Receiver<ServerMessage>,
    consumer: bool,
) -> String {
    let data = ack_data(
        request(
            session,
            rx,
            json!({
                "id": 10,
                "event": "createWebRtcTransport",
                "data": {"consumer": consumer}
            }),
        )
        .await,
    );
    let transport_id = data["id"].as_str().unwrap().to_string();
    assert!(data["iceParameters"].is_object());
    assert!(data["dtlsParameters"].is_object());

    let connected = ack_data(
        request(
            session,
            rx,
            json!({
                "id": 11,
                "event": "connectTransport",
                "data": {"transportId": transport_id, "dtlsParameters": {"role": "client"}}
            }),
        )
        .await,
    );
    assert_eq!(connected["connected"], true);
    transport_id
}

#[tokio::test]
async fn test_two_peer_conference_lifecycle() {
    let h = Harness::new();

    // A joins an empty room.
    let (mut alice, mut rx_a) = h.session("conn-a");
    let data = join(&mut alice, &mut rx_a, "r1", "alice").await;
    assert!(data["routerRtpCapabilities"]["codecs"].is_array());
    assert_eq!(data["peers"].as_array().unwrap().len(), 0);
    assert_eq!(h.store.room_count().await, 1);

    // B joins; A sees peer-joined, B's ack lists A.
    let (mut bob, mut rx_b) = h.session("conn-b");
    let data = join(&mut bob, &mut rx_b, "r1", "bob").await;
    assert_eq!(data["peers"][0]["peerId"], "alice");

    let events = drain_events(&mut rx_a);
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::PeerJoined { peer_id, .. } if peer_id == "bob")));

    // A produces video; B sees new-producer.
    let send_transport = setup_transport(&mut alice, &mut rx_a, false).await;
    let produce_ack = ack_data(
        request(
            &mut alice,
            &mut rx_a,
            json!({
                "id": 20,
                "event": "produce",
                "data": {
                    "transportId": send_transport,
                    "kind": "video",
                    "rtpParameters": {"codecs": []}
                }
            }),
        )
        .await,
    );
    let producer_id = produce_ack["id"].as_str().unwrap().to_string();

    let events = drain_events(&mut rx_b);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::NewProducer { peer_id, producer_id: p, .. }
            if peer_id == "alice" && *p == producer_id
    )));

    // B consumes A's track.
    let recv_transport = setup_transport(&mut bob, &mut rx_b, true).await;
    let consume_ack = ack_data(
        request(
            &mut bob,
            &mut rx_b,
            json!({
                "id": 30,
                "event": "consume",
                "data": {
                    "transportId": recv_transport,
                    "producerId": producer_id,
                    "rtpCapabilities": {"codecs": []}
                }
            }),
        )
        .await,
    );
    assert_eq!(consume_ack["producerPeerId"], "alice");
    assert_eq!(consume_ack["kind"], "video");
    let consumer_id = consume_ack["id"].as_str().unwrap().to_string();

    // Chat reaches the whole room, sender included. The sender's own
    // copy is queued ahead of the ack.
    let (frame, alice_events) = request_collect(
        &mut alice,
        &mut rx_a,
        json!({
            "id": 40,
            "event": "send-message",
            "data": {"roomId": "r1", "message": "hello"}
        }),
    )
    .await;
    assert!(matches!(frame, ServerMessage::Ack { .. }));
    let bob_events = drain_events(&mut rx_b);
    for events in [&alice_events, &bob_events] {
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::NewMessage { sender, message, .. }
                if sender == "alice" && message == "hello"
        )));
    }

    // A disconnects abruptly. B sees consumer-closed and peer-left; the
    // room survives with B alone.
    alice.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain_events(&mut rx_b);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::ConsumerClosed { consumer_id: c, producer_id: p }
            if *c == consumer_id && *p == producer_id
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::PeerLeft { peer_id } if peer_id == "alice")));

    assert_eq!(h.store.room_count().await, 1);
    let room = h.store.get_room("r1".to_string()).await.unwrap();
    let peers = room.list_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "bob");

    // A's transport and producer, plus B's invalidated consumer, were
    // released; B's receive transport is the only survivor.
    assert_eq!(h.gateway.open_resources(), vec![recv_transport.clone()]);

    // B leaves explicitly; the room is deleted and nothing leaks.
    let frame = request(
        &mut bob,
        &mut rx_b,
        json!({
            "id": 50,
            "event": "leave-room",
            "data": {"roomId": "r1", "peerId": "bob"}
        }),
    )
    .await;
    assert!(matches!(frame, ServerMessage::Ack { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.room_count().await, 0);
    assert!(h.gateway.open_resources().is_empty());
    assert_eq!(h.metrics.rooms_active(), 0);
    assert_eq!(h.metrics.peers_active(), 0);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let h = Harness::new();

    let (mut alice, mut rx_a) = h.session("conn-a");
    join(&mut alice, &mut rx_a, "r1", "alice").await;
    let (mut bob, mut rx_b) = h.session("conn-b");
    join(&mut bob, &mut rx_b, "r2", "bob").await;

    assert_eq!(h.store.room_count().await, 2);

    // Activity in r1 is invisible to r2.
    let _transport = setup_transport(&mut alice, &mut rx_a, false).await;
    request(
        &mut alice,
        &mut rx_a,
        json!({
            "id": 40,
            "event": "send-message",
            "data": {"roomId": "r1", "message": "r1 only"}
        }),
    )
    .await;

    assert!(drain_events(&mut rx_b).is_empty());

    alice.close().await;
    bob.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.room_count().await, 0);
    assert!(h.gateway.open_resources().is_empty());
}

#[tokio::test]
async fn test_gateway_outage_during_join_leaves_no_room_behind() {
    let h = Harness::new();
    h.gateway.set_failing(true);

    let (mut alice, mut rx_a) = h.session("conn-a");
    let frame = request(
        &mut alice,
        &mut rx_a,
        json!({
            "id": 1,
            "event": "join-room",
            "data": {"roomId": "r1", "peerId": "alice", "displayName": "Alice"}
        }),
    )
    .await;
    match frame {
        ServerMessage::Error { error, .. } => assert_eq!(error.code, 7),
        other => panic!("expected error, got {other:?}"),
    }

    assert_eq!(h.store.room_count().await, 0);

    // Recovery: the same session can join once the gateway is back.
    h.gateway.set_failing(false);
    let data = join(&mut alice, &mut rx_a, "r1", "alice").await;
    assert!(data["routerRtpCapabilities"].is_object());
    assert_eq!(h.store.room_count().await, 1);
}

#[tokio::test]
async fn test_duplicate_peer_id_across_connections() {
    let h = Harness::new();

    let (mut alice, mut rx_a) = h.session("conn-a");
    join(&mut alice, &mut rx_a, "r1", "alice").await;

    let (mut impostor, mut rx_i) = h.session("conn-b");
    let frame = request(
        &mut impostor,
        &mut rx_i,
        json!({
            "id": 1,
            "event": "join-room",
            "data": {"roomId": "r1", "peerId": "alice", "displayName": "Impostor"}
        }),
    )
    .await;
    match frame {
        ServerMessage::Error { error, .. } => assert_eq!(error.code, 5),
        other => panic!("expected error, got {other:?}"),
    }

    // The original peer is untouched and the rejected connection can
    // join under a free id.
    let room = h.store.get_room("r1".to_string()).await.unwrap();
    assert_eq!(room.list_peers().await.unwrap().len(), 1);

    let data = join(&mut impostor, &mut rx_i, "r1", "bob").await;
    assert_eq!(data["peers"][0]["peerId"], "alice");
}
