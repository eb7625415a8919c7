//! WebRTC signaling relay
//!
//! A pure forwarding rule on top of the room registry: offer/answer/ICE
//! payloads are rebroadcast to the named room, retagged with the sender's
//! session id, iff the sender is currently a member of that room. The `data`
//! blob is never inspected; SDP and ICE semantics belong to the clients.

use std::sync::Arc;

use tracing::debug;

use crate::registry::{ConnectionHandle, RoomRegistry, SessionId};
use crate::server::protocol::{ServerMessage, SignalForward, SignalKind, SignalPayload};

/// Forwards signaling payloads between room-co-located peers
pub struct SignalingRelay {
    rooms: Arc<RoomRegistry>,
}

impl SignalingRelay {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self { rooms }
    }

    /// Relay one signaling payload.
    ///
    /// Returns the number of members it was queued for; zero when the sender
    /// is not in the room. Non-membership is a silent drop, not an error, and
    /// the sender gets no delivery confirmation either way.
    pub async fn relay(
        &self,
        sender: &ConnectionHandle,
        sender_session: SessionId,
        kind: SignalKind,
        payload: SignalPayload,
    ) -> usize {
        if !self.rooms.is_member(sender.id(), &payload.room_id).await {
            debug!(
                "dropping {} from {}: sender not in room {}",
                kind.label(),
                sender_session,
                payload.room_id
            );
            return 0;
        }

        let room_id = payload.room_id.clone();
        let msg = ServerMessage::signal(
            kind,
            SignalForward {
                user_id: sender_session,
                target_user_id: payload.target_user_id,
                room_id: payload.room_id,
                data: payload.data,
            },
        );
        self.rooms.broadcast(&room_id, &msg, None).await
    }
}
