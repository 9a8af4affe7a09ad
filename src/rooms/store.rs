//! `RoomStoreActor` - singleton actor that owns the room table.
//!
//! Room creation and deletion are linearized through this actor's mailbox,
//! which is what upholds the lifecycle invariant: a room exists exactly
//! while it has at least one peer. Two peers joining a fresh room id
//! concurrently resolve to one create; the last two peers leaving resolve
//! to one delete.
//!
//! The store also owns gateway resource release on teardown: whatever a
//! `RoomActor` reports as released is closed here on a background task, so
//! a slow or failing SFU cannot stall signaling.

use super::messages::{PeerRemoval, PeerSummary};
use super::room::{RoomActor, RoomHandle};
use crate::errors::SignalError;
use crate::observability::metrics::CoreMetrics;
use crate::outbound::OutboundSender;
use crate::sfu::SfuGateway;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the store mailbox.
const STORE_CHANNEL_BUFFER: usize = 256;

/// How often to sweep for room tasks that died without being removed.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for room actors to stop during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages handled by the `RoomStoreActor`.
#[derive(Debug)]
enum StoreMessage {
    /// Join a peer to a room, creating the room if it does not exist.
    JoinRoom {
        room_id: String,
        peer_id: String,
        display_name: String,
        connection: OutboundSender,
        respond_to: oneshot::Sender<Result<(RoomHandle, Vec<PeerSummary>), SignalError>>,
    },

    /// Remove a peer from a room, deleting the room if it empties.
    /// Safe to send for absent rooms and peers.
    LeaveRoom {
        room_id: String,
        peer_id: String,
        respond_to: oneshot::Sender<PeerRemoval>,
    },

    /// Look up a live room handle.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },

    /// Number of live rooms.
    RoomCount {
        respond_to: oneshot::Sender<usize>,
    },
}

/// A room actor managed by the store.
struct ManagedRoom {
    handle: RoomHandle,
    cancel_token: CancellationToken,
    task_handle: JoinHandle<()>,
}

/// Handle to the `RoomStoreActor`.
#[derive(Clone)]
pub struct RoomStoreHandle {
    sender: mpsc::Sender<StoreMessage>,
    cancel_token: CancellationToken,
}

impl RoomStoreHandle {
    /// Join a peer to a room, creating the room on first join.
    pub async fn join_room(
        &self,
        room_id: String,
        peer_id: String,
        display_name: String,
        connection: OutboundSender,
    ) -> Result<(RoomHandle, Vec<PeerSummary>), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StoreMessage::JoinRoom {
                room_id,
                peer_id,
                display_name,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::Draining)?;
        rx.await.map_err(|_| SignalError::Draining)?
    }

    /// Remove a peer from a room. Idempotent: absent rooms and peers
    /// report a no-op removal.
    pub async fn leave_room(&self, room_id: String, peer_id: String) -> PeerRemoval {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(StoreMessage::LeaveRoom {
                room_id,
                peer_id,
                respond_to: tx,
            })
            .await
            .is_ok();
        if !sent {
            return PeerRemoval {
                was_present: false,
                now_empty: false,
                released: Vec::new(),
            };
        }
        rx.await.unwrap_or(PeerRemoval {
            was_present: false,
            now_empty: false,
            released: Vec::new(),
        })
    }

    /// Look up a live room handle.
    pub async fn get_room(&self, room_id: String) -> Option<RoomHandle> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StoreMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(StoreMessage::RoomCount { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Cancel the store and every room it manages.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the store is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `RoomStoreActor` implementation.
pub struct RoomStoreActor {
    receiver: mpsc::Receiver<StoreMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    gateway: Arc<dyn SfuGateway>,
    metrics: Arc<CoreMetrics>,
}

impl RoomStoreActor {
    /// Spawn the store actor. Returns a handle and the task join handle.
    pub fn spawn(
        gateway: Arc<dyn SfuGateway>,
        metrics: Arc<CoreMetrics>,
        cancel_token: CancellationToken,
    ) -> (RoomStoreHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(STORE_CHANNEL_BUFFER);

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            gateway,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            RoomStoreHandle {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    #[instrument(skip_all, name = "signal.registry")]
    async fn run(mut self) {
        info!(target: "signal.registry", "RoomStoreActor started");
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "signal.registry",
                        rooms = self.rooms.len(),
                        "RoomStoreActor cancelled, shutting down rooms"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep_dead_rooms();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            debug!(
                                target: "signal.registry",
                                "RoomStoreActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: StoreMessage) {
        match message {
            StoreMessage::JoinRoom {
                room_id,
                peer_id,
                display_name,
                connection,
                respond_to,
            } => {
                let result = self
                    .handle_join_room(room_id, peer_id, display_name, connection)
                    .await;
                let _ = respond_to.send(result);
            }

            StoreMessage::LeaveRoom {
                room_id,
                peer_id,
                respond_to,
            } => {
                let removal = self.handle_leave_room(&room_id, peer_id).await;
                let _ = respond_to.send(removal);
            }

            StoreMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let handle = self.rooms.get(&room_id).map(|r| r.handle.clone());
                let _ = respond_to.send(handle);
            }

            StoreMessage::RoomCount { respond_to } => {
                let _ = respond_to.send(self.rooms.len());
            }
        }
    }

    async fn handle_join_room(
        &mut self,
        room_id: String,
        peer_id: String,
        display_name: String,
        connection: OutboundSender,
    ) -> Result<(RoomHandle, Vec<PeerSummary>), SignalError> {
        let created = if self.rooms.contains_key(&room_id) {
            false
        } else {
            let cancel_token = self.cancel_token.child_token();
            let (handle, task_handle) = RoomActor::spawn(
                room_id.clone(),
                cancel_token.clone(),
                Arc::clone(&self.metrics),
            );
            self.rooms.insert(
                room_id.clone(),
                ManagedRoom {
                    handle,
                    cancel_token,
                    task_handle,
                },
            );
            self.metrics.room_created();
            info!(
                target: "signal.registry",
                room_id = %room_id,
                "Room created"
            );
            true
        };

        // Entry was just inserted or found above.
        let Some(room) = self.rooms.get(&room_id) else {
            return Err(SignalError::Internal("room table entry vanished".into()));
        };
        let handle = room.handle.clone();

        match handle.join(peer_id, display_name, connection).await {
            Ok(existing) => Ok((handle, existing)),
            Err(err) => {
                // A failed first join must not leave an empty room behind.
                if created {
                    self.delete_room(&room_id);
                }
                Err(err)
            }
        }
    }

    async fn handle_leave_room(&mut self, room_id: &str, peer_id: String) -> PeerRemoval {
        let Some(room) = self.rooms.get(room_id) else {
            return PeerRemoval {
                was_present: false,
                now_empty: false,
                released: Vec::new(),
            };
        };

        let removal = match room.handle.remove_peer(peer_id.clone()).await {
            Ok(removal) => removal,
            Err(_) => {
                // The room task is gone; drop the table entry.
                warn!(
                    target: "signal.registry",
                    room_id = %room_id,
                    "Room actor unreachable during leave, deleting"
                );
                self.delete_room(room_id);
                return PeerRemoval {
                    was_present: false,
                    now_empty: false,
                    released: Vec::new(),
                };
            }
        };

        if !removal.released.is_empty() {
            self.release_resources(room_id, removal.released.clone());
        }

        if removal.now_empty {
            self.delete_room(room_id);
            info!(
                target: "signal.registry",
                room_id = %room_id,
                "Room empty, deleted"
            );
        }

        removal
    }

    /// Close gateway resources on a background task. Best-effort: a
    /// failure is logged and counted, never propagated, so teardown
    /// always completes.
    fn release_resources(&self, room_id: &str, resource_ids: Vec<String>) {
        let gateway = Arc::clone(&self.gateway);
        let metrics = Arc::clone(&self.metrics);
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            for resource_id in resource_ids {
                if let Err(err) = gateway.close_resource(&resource_id).await {
                    metrics.gateway_failure();
                    error!(
                        target: "signal.registry",
                        room_id = %room_id,
                        resource_id = %resource_id,
                        error = %err,
                        "Failed to release gateway resource"
                    );
                }
            }
        });
    }

    fn delete_room(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.remove(room_id) {
            room.cancel_token.cancel();
            self.metrics.room_closed();
        }
    }

    /// Drop table entries whose actor task died. Peers of such a room are
    /// torn down by their connection teardown finding the room gone.
    fn sweep_dead_rooms(&mut self) {
        let dead: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, r)| r.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in dead {
            warn!(
                target: "signal.registry",
                room_id = %room_id,
                "Room actor task finished unexpectedly, removing"
            );
            self.delete_room(&room_id);
        }
    }

    async fn graceful_shutdown(&mut self) {
        for (_, room) in self.rooms.iter() {
            room.cancel_token.cancel();
        }

        for (room_id, room) in self.rooms.drain() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, room.task_handle).await {
                Ok(_) => debug!(
                    target: "signal.registry",
                    room_id = %room_id,
                    "Room actor stopped"
                ),
                Err(_) => warn!(
                    target: "signal.registry",
                    room_id = %room_id,
                    "Room actor did not stop within timeout"
                ),
            }
        }
    }
}
