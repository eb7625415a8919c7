//! Shared registries
//!
//! The user and room registries are the only shared mutable state in the
//! relay. Every connection task mutates them exclusively through the methods
//! defined here; nothing else touches their internal maps.

mod room;
mod user;

pub use room::{RoomRegistry, RoomSnapshot};
pub use user::{Session, UserRegistry};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::error;
use uuid::Uuid;

use crate::server::ServerMessage;

/// Identifier assigned to a connection when it is accepted
pub type ConnectionId = Uuid;

/// Externally visible session identifier
pub type SessionId = Uuid;

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is already admitted")]
    AlreadyAdmitted(ConnectionId),

    #[error("connection {0} is not admitted")]
    NotAdmitted(ConnectionId),

    #[error("room member {0} has no registered session")]
    MissingSession(ConnectionId),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Reference to one live duplex channel.
///
/// The transport task owns the actual socket; the registries only hold this
/// handle, which queues frames onto the connection's writer task. Sends never
/// await the peer, so a slow or dead client cannot stall a broadcast.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    /// Wrap an outbound frame queue in a new handle with a fresh id
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the writer task is still draining this connection's queue
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Serialize and queue a message for this connection.
    ///
    /// Returns false if the connection has closed or the message failed to
    /// serialize; delivery is best-effort and a false return is not an error.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize outbound message: {}", e);
                return false;
            }
        };
        self.tx.send(Message::Text(json)).is_ok()
    }
}

/// Build a handle plus the receiving end of its frame queue, for tests
#[cfg(test)]
pub(crate) fn test_handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectionHandle::new(tx), rx)
}

/// Drain every queued frame on a test receiver into parsed server messages
#[cfg(test)]
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Message::Text(text) = frame {
            out.push(ServerMessage::from_json(&text).expect("valid server message"));
        }
    }
    out
}
