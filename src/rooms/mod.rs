//! Room management: per-room actors supervised by a singleton store.
//!
//! Actor hierarchy:
//! - `RoomStoreActor` (singleton) owns the room table and linearizes room
//!   create/delete
//! - `RoomActor` (one per room) owns that room's peers, transports,
//!   producers and consumers, and fans events out to member connections

pub mod messages;
pub mod peer;
pub mod room;
pub mod store;

pub use messages::{
    ConnectPhase, ConsumerSeed, PeerRemoval, PeerSummary, ProducerRef, ProducerSummary, RoomState,
    TransportAttached, TransportSeed,
};
pub use room::{RoomActor, RoomHandle};
pub use store::{RoomStoreActor, RoomStoreHandle};
