//! Connection registry: maps live WebSocket connections to their room
//! binding.
//!
//! Teardown is funneled through here so that explicit `leave-room`,
//! abrupt socket close and server shutdown all run the same release path
//! exactly once. The map lock is never held across an await; the binding
//! is taken out first, then the room store is called.

use crate::observability::metrics::CoreMetrics;
use crate::rooms::{PeerRemoval, RoomStoreHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// A connection's room membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_id: String,
    pub peer_id: String,
}

#[derive(Debug)]
struct ConnectionEntry {
    user_id: String,
    binding: Option<Binding>,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    store: RoomStoreHandle,
    metrics: Arc<CoreMetrics>,
    connections: Mutex<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(store: RoomStoreHandle, metrics: Arc<CoreMetrics>) -> Arc<Self> {
        Arc::new(Self {
            store,
            metrics,
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an authenticated connection.
    pub fn register(&self, connection_id: &str, user_id: &str) {
        self.lock().insert(
            connection_id.to_string(),
            ConnectionEntry {
                user_id: user_id.to_string(),
                binding: None,
            },
        );
        self.metrics.connection_opened();
        info!(
            target: "signal.registry",
            connection_id = %connection_id,
            user_id = %user_id,
            "Connection registered"
        );
    }

    /// Record a successful join against the connection. Returns false if
    /// the connection is no longer registered (it closed mid-join).
    #[must_use]
    pub fn bind(&self, connection_id: &str, room_id: &str, peer_id: &str) -> bool {
        let mut connections = self.lock();
        match connections.get_mut(connection_id) {
            Some(entry) => {
                entry.binding = Some(Binding {
                    room_id: room_id.to_string(),
                    peer_id: peer_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Current binding of a connection, if any.
    #[must_use]
    pub fn binding(&self, connection_id: &str) -> Option<Binding> {
        self.lock()
            .get(connection_id)
            .and_then(|entry| entry.binding.clone())
    }

    /// Authenticated user behind a connection.
    #[must_use]
    pub fn user_id(&self, connection_id: &str) -> Option<String> {
        self.lock().get(connection_id).map(|e| e.user_id.clone())
    }

    /// Explicit leave: clear the binding and remove the peer from its
    /// room. The connection stays registered and may join again. No-op
    /// if the connection has no binding.
    pub async fn leave(&self, connection_id: &str) -> Option<PeerRemoval> {
        let binding = {
            let mut connections = self.lock();
            connections
                .get_mut(connection_id)
                .and_then(|entry| entry.binding.take())
        };
        self.release(connection_id, binding).await
    }

    /// Remove a connection entirely, tearing down its room membership if
    /// still bound. Idempotent: a second call finds nothing to do.
    pub async fn unregister(&self, connection_id: &str) -> Option<PeerRemoval> {
        let entry = self.lock().remove(connection_id);
        let Some(entry) = entry else {
            return None;
        };
        self.metrics.connection_closed();
        debug!(
            target: "signal.registry",
            connection_id = %connection_id,
            "Connection unregistered"
        );
        self.release(connection_id, entry.binding).await
    }

    async fn release(&self, connection_id: &str, binding: Option<Binding>) -> Option<PeerRemoval> {
        let binding = binding?;
        let removal = self
            .store
            .leave_room(binding.room_id.clone(), binding.peer_id.clone())
            .await;
        info!(
            target: "signal.registry",
            connection_id = %connection_id,
            room_id = %binding.room_id,
            peer_id = %binding.peer_id,
            was_present = removal.was_present,
            "Connection left room"
        );
        Some(removal)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::outbound::OutboundSender;
    use crate::rooms::RoomStoreActor;
    use crate::sfu::{LocalGateway, SfuGateway};
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Arc<ConnectionRegistry>, RoomStoreHandle) {
        let gateway: Arc<dyn SfuGateway> = Arc::new(LocalGateway::new());
        let metrics = CoreMetrics::new();
        let (store, _task) =
            RoomStoreActor::spawn(gateway, Arc::clone(&metrics), CancellationToken::new());
        let registry = ConnectionRegistry::new(store.clone(), metrics);
        (registry, store)
    }

    #[tokio::test]
    async fn test_register_bind_unregister_tears_down_room() {
        let (registry, store) = setup();

        registry.register("conn-1", "user-1");
        let (connection, _rx) = OutboundSender::channel("conn-1", 32);
        store
            .join_room("r1".into(), "alice".into(), "Alice".into(), connection)
            .await
            .unwrap();
        assert!(registry.bind("conn-1", "r1", "alice"));
        assert_eq!(registry.count(), 1);

        let removal = registry.unregister("conn-1").await.unwrap();
        assert!(removal.was_present);
        assert!(removal.now_empty);
        assert_eq!(registry.count(), 0);
        assert_eq!(store.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (registry, _store) = setup();
        registry.register("conn-1", "user-1");

        assert!(registry.unregister("conn-1").await.is_none());
        // Second teardown finds nothing.
        assert!(registry.unregister("conn-1").await.is_none());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_leave_keeps_connection_registered() {
        let (registry, store) = setup();

        registry.register("conn-1", "user-1");
        let (connection, _rx) = OutboundSender::channel("conn-1", 32);
        store
            .join_room("r1".into(), "alice".into(), "Alice".into(), connection)
            .await
            .unwrap();
        assert!(registry.bind("conn-1", "r1", "alice"));

        let removal = registry.leave("conn-1").await.unwrap();
        assert!(removal.was_present);
        assert_eq!(registry.count(), 1);
        assert!(registry.binding("conn-1").is_none());

        // Leave with no binding is a no-op.
        assert!(registry.leave("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn test_bind_fails_for_unknown_connection() {
        let (registry, _store) = setup();
        assert!(!registry.bind("conn-404", "r1", "alice"));
    }
}
