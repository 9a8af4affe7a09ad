//! Per-connection outbound queue.
//!
//! Every server-to-client frame (acks and room events alike) goes through
//! one bounded mpsc queue per connection, drained by that connection's
//! writer task. A single producer ordering per room actor plus FIFO queues
//! gives per-connection in-order delivery; `try_send` keeps a slow or dead
//! connection from ever blocking delivery to others.

use crate::protocol::ServerMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cloneable sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    connection_id: String,
    tx: mpsc::Sender<ServerMessage>,
}

impl OutboundSender {
    /// Create a queue of the given depth; the receiver side is drained by
    /// the connection's writer task.
    #[must_use]
    pub fn channel(
        connection_id: impl Into<String>,
        depth: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(depth);
        (
            Self {
                connection_id: connection_id.into(),
                tx,
            },
            rx,
        )
    }

    /// Connection this sender feeds.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Best-effort enqueue. A full queue drops the frame for this
    /// connection only; a closed queue means the connection is gone.
    /// Returns whether the frame was enqueued.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    target: "signal.outbound",
                    connection_id = %self.connection_id,
                    "Outbound queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "signal.outbound",
                    connection_id = %self.connection_id,
                    "Outbound queue closed, connection gone"
                );
                false
            }
        }
    }
}
