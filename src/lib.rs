//! Parley - signaling and session-coordination core for a multi-party
//! WebRTC conferencing service.
//!
//! Clients hold one WebSocket each and drive the SFU negotiation sequence
//! through it: join a room, create send/receive transports, complete the
//! DTLS handshake, then produce and consume tracks. The server tracks who
//! is in which room, which tracks they publish, and fans room events
//! (joins, leaves, new producers, chat) out to member connections.
//!
//! # Architecture
//!
//! Actor model over tokio channels:
//! - `RoomStoreActor` (singleton): owns the room table, linearizes room
//!   create/delete
//! - `RoomActor` (one per room): owns that room's peers and media state,
//!   serializes its state transitions, fans events out
//!
//! Per-connection pieces are plain tasks, not actors: a read loop feeding
//! a [`session::SignalingSession`] state machine and a writer task
//! draining the connection's bounded outbound queue.
//!
//! SFU gateway calls ([`sfu::SfuGateway`]) always happen in the session,
//! outside the actors; results are attached to the room through messages
//! that re-validate the peer, and orphaned gateway resources are released.

pub mod auth;
pub mod config;
pub mod errors;
pub mod observability;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod session;
pub mod sfu;
pub mod ws;

pub use config::Config;
pub use errors::SignalError;
