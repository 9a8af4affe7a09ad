//! Parley signaling server.
//!
//! Startup flow:
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the room store actor
//! 4. Serve WebSocket, health and metrics endpoints on one listener
//! 5. Wait for shutdown signal, then drain: mark not-ready, cancel the
//!    actor system, let in-flight teardowns finish

use std::sync::Arc;
use std::time::Duration;

use parley::auth::TokenValidator;
use parley::config::Config;
use parley::observability::{init_metrics_recorder, CoreMetrics, HealthState};
use parley::registry::ConnectionRegistry;
use parley::rooms::RoomStoreActor;
use parley::sfu::{LocalGateway, SfuGateway};
use parley::ws::{app_router, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting signaling server");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        outbound_queue_depth = config.outbound_queue_depth,
        "Configuration loaded"
    );

    // Must happen before any metrics are recorded.
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let metrics = CoreMetrics::new();

    // Standalone mode runs the in-process gateway; a deployment against a
    // real media server swaps this implementation.
    let gateway: Arc<dyn SfuGateway> = Arc::new(LocalGateway::new());

    let shutdown_token = CancellationToken::new();
    let (store, store_task) = RoomStoreActor::spawn(
        Arc::clone(&gateway),
        Arc::clone(&metrics),
        shutdown_token.child_token(),
    );
    let registry = ConnectionRegistry::new(store.clone(), Arc::clone(&metrics));
    info!("Actor system initialized");

    let state = AppState {
        validator: Arc::new(TokenValidator::new(&config.auth_secret)),
        registry,
        store,
        gateway,
        metrics,
        outbound_queue_depth: config.outbound_queue_depth,
    };
    let app = app_router(state, Arc::clone(&health_state), prometheus_handle);

    // Bind before marking ready to fail fast on bind errors.
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind listener");
            e
        })?;
    info!(addr = %config.bind_address, "Listener bound");
    health_state.set_ready();

    let server_token = shutdown_token.child_token();
    let server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("Server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Server failed");
        }
    });

    info!("Signaling server running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, draining");

    // Stop taking traffic first, then cancel the actor system.
    health_state.set_not_ready();
    shutdown_token.cancel();

    if tokio::time::timeout(Duration::from_secs(10), store_task)
        .await
        .is_err()
    {
        error!("Room store did not stop within timeout");
    }
    if tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .is_err()
    {
        error!("Server did not stop within timeout");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed; without them the
/// process cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
