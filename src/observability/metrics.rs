//! Core signaling metrics.
//!
//! Atomics for cheap local reads (health endpoints, tests) with the same
//! values mirrored to the `metrics` facade for Prometheus export.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Install the Prometheus recorder and register metric descriptions.
/// Call once at startup; the returned handle renders the scrape body.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, anyhow::Error> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_gauge!("signal_rooms_active", "Number of rooms currently open");
    describe_gauge!("signal_peers_active", "Number of peers currently joined");
    describe_gauge!(
        "signal_connections_active",
        "Number of WebSocket connections currently open"
    );
    describe_counter!("signal_rooms_created_total", "Rooms created");
    describe_counter!("signal_peers_joined_total", "Peers joined");
    describe_counter!(
        "signal_requests_failed_total",
        "Signaling requests answered with an error"
    );
    describe_counter!(
        "signal_gateway_failures_total",
        "SFU gateway calls that failed"
    );

    Ok(handle)
}

/// Shared counters for the signaling core.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    rooms: AtomicI64,
    peers: AtomicI64,
    connections: AtomicI64,
    requests_failed: AtomicU64,
    gateway_failures: AtomicU64,
}

impl CoreMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let now = self.rooms.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("signal_rooms_created_total").increment(1);
        gauge!("signal_rooms_active").set(now as f64);
    }

    pub fn room_closed(&self) {
        let now = self.rooms.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("signal_rooms_active").set(now as f64);
    }

    pub fn peer_joined(&self) {
        let now = self.peers.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("signal_peers_joined_total").increment(1);
        gauge!("signal_peers_active").set(now as f64);
    }

    pub fn peer_left(&self) {
        let now = self.peers.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("signal_peers_active").set(now as f64);
    }

    pub fn connection_opened(&self) {
        let now = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("signal_connections_active").set(now as f64);
    }

    pub fn connection_closed(&self) {
        let now = self.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("signal_connections_active").set(now as f64);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        counter!("signal_requests_failed_total").increment(1);
    }

    pub fn gateway_failure(&self) {
        self.gateway_failures.fetch_add(1, Ordering::Relaxed);
        counter!("signal_gateway_failures_total").increment(1);
    }

    #[must_use]
    pub fn rooms_active(&self) -> i64 {
        self.rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peers_active(&self) -> i64 {
        self.peers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connections_active(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn requests_failed_total(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn gateway_failures_total(&self) -> u64 {
        self.gateway_failures.load(Ordering::Relaxed)
    }
}
