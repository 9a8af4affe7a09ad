//! HTTP/WebSocket surface.
//!
//! One WebSocket per client at `GET /ws?token=...`. The token is
//! validated before the upgrade; an invalid token never gets a socket.
//! Each accepted socket is split: a writer task drains the connection's
//! outbound queue while the read loop feeds frames to the session one at
//! a time, which is what serializes requests within a connection.

use crate::auth::{Identity, TokenValidator};
use crate::observability::{health_router, CoreMetrics, HealthState};
use crate::protocol::RequestEnvelope;
use crate::outbound::OutboundSender;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomStoreHandle;
use crate::session::SignalingSession;
use crate::sfu::SfuGateway;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state for the WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<TokenValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub store: RoomStoreHandle,
    pub gateway: Arc<dyn SfuGateway>,
    pub metrics: Arc<CoreMetrics>,
    pub outbound_queue_depth: usize,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

/// Build the full application router: WebSocket endpoint, health probes
/// and the Prometheus scrape endpoint.
pub fn app_router(
    state: AppState,
    health: Arc<HealthState>,
    prometheus: PrometheusHandle,
) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .merge(health_router(health))
        .route(
            "/metrics",
            get(move || {
                let handle = prometheus.clone();
                async move { handle.render() }
            }),
        )
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.validator.validate(&query.token) {
        Ok(identity) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, identity))
            .into_response(),
        Err(err) => {
            debug!(target: "signal.ws", error = %err, "Rejected upgrade");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(
        target: "signal.ws",
        connection_id = %connection_id,
        user_id = %identity.user_id,
        "WebSocket connected"
    );

    state.registry.register(&connection_id, &identity.user_id);

    let (connection, mut outbound_rx) =
        OutboundSender::channel(connection_id.clone(), state.outbound_queue_depth);
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: the only place that touches the socket's send half.
    // Ends when every sender clone (session + room peer) is dropped.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: "signal.ws", error = %err, "Failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut session = SignalingSession::new(
        connection_id.clone(),
        connection,
        Arc::clone(&state.registry),
        state.store.clone(),
        Arc::clone(&state.gateway),
        Arc::clone(&state.metrics),
    );

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<RequestEnvelope>(&text) {
                Ok(envelope) => session.handle_request(envelope).await,
                Err(err) => {
                    debug!(
                        target: "signal.ws",
                        connection_id = %connection_id,
                        error = %err,
                        "Dropping malformed frame"
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong/binary: nothing to do
            Err(err) => {
                debug!(
                    target: "signal.ws",
                    connection_id = %connection_id,
                    error = %err,
                    "WebSocket read error"
                );
                break;
            }
        }
    }

    // Same teardown for clean close and abrupt drop.
    session.close().await;
    drop(session);
    let _ = writer.await;

    info!(
        target: "signal.ws",
        connection_id = %connection_id,
        "WebSocket closed"
    );
}
