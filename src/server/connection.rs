//! Per-connection coordination
//!
//! Drives each connection through its lifecycle from three transport events:
//! open, inbound payload, close. On open the connection is registered with
//! both registries as a pair; inbound payloads are classified as join,
//! command, chat, or signaling and routed accordingly; on close the
//! registries are cleaned up and the room is notified.
//!
//! Chat echo policy: a sender receives its own room broadcast. Join
//! notifications exclude the joiner, which gets a `joined` snapshot instead.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::command::CommandDispatcher;
use crate::registry::{ConnectionHandle, RegistryResult, RoomRegistry, SessionId, UserRegistry};
use crate::server::protocol::{ClientMessage, ServerMessage, SignalKind};
use crate::server::relay::SignalingRelay;

/// Routes transport events for every connection
pub struct ConnectionCoordinator {
    users: Arc<UserRegistry>,
    rooms: Arc<RoomRegistry>,
    commands: CommandDispatcher,
    relay: SignalingRelay,
}

impl ConnectionCoordinator {
    pub fn new(users: Arc<UserRegistry>, rooms: Arc<RoomRegistry>) -> Self {
        let commands = CommandDispatcher::new(users.clone(), rooms.clone());
        let relay = SignalingRelay::new(rooms.clone());
        Self {
            users,
            rooms,
            commands,
            relay,
        }
    }

    /// Handle a newly accepted connection: register it with both registries
    /// and send the welcome payload.
    ///
    /// Registration and admission are paired; if admission fails the session
    /// is rolled back so the connection is never present in one registry but
    /// not the other.
    pub async fn on_connect(&self, handle: &ConnectionHandle) -> RegistryResult<SessionId> {
        let session_id = self.users.register(handle.clone()).await;
        let channels = match self.rooms.admit(handle).await {
            Ok(channels) => channels,
            Err(e) => {
                self.users.unregister(&session_id).await;
                return Err(e);
            }
        };
        handle.send(&ServerMessage::Welcome {
            client_id: session_id,
            channels,
        });
        info!("session {} connected", session_id);
        Ok(session_id)
    }

    /// Handle one inbound text frame.
    ///
    /// Frames that fail to parse, or carry an unknown type, are logged and
    /// dropped; they are never fatal to the connection.
    pub async fn on_message(&self, handle: &ConnectionHandle, session_id: SessionId, text: &str) {
        let msg = match ClientMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("unparsable frame from session {}: {}", session_id, e);
                return;
            }
        };

        match msg {
            ClientMessage::Join { room_id } => self.handle_join(handle, session_id, room_id).await,
            ClientMessage::Message { text } => self.handle_chat(handle, session_id, text).await,
            ClientMessage::Offer(payload) => {
                self.relay.relay(handle, session_id, SignalKind::Offer, payload).await;
            }
            ClientMessage::Answer(payload) => {
                self.relay.relay(handle, session_id, SignalKind::Answer, payload).await;
            }
            ClientMessage::IceCandidate(payload) => {
                self.relay
                    .relay(handle, session_id, SignalKind::IceCandidate, payload)
                    .await;
            }
        }
    }

    /// Handle transport close: tear down both registry entries (idempotent)
    /// and notify the departed room, if any.
    pub async fn on_disconnect(&self, handle: &ConnectionHandle, session_id: SessionId) {
        let left_room = self.rooms.remove(handle.id()).await;
        self.users.unregister(&session_id).await;
        if let Some(room_id) = left_room {
            self.rooms
                .broadcast(&room_id, &ServerMessage::UserLeft { user_id: session_id }, None)
                .await;
        }
        info!("session {} disconnected", session_id);
    }

    async fn handle_join(&self, handle: &ConnectionHandle, session_id: SessionId, room_id: String) {
        let snapshot = match self.rooms.join(handle, &room_id, &self.users).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // NotAdmitted cannot happen for a connection that passed
                // on_connect; MissingSession is a consistency defect. Either
                // way only this join is abandoned.
                error!("join to {} failed for session {}: {}", room_id, session_id, e);
                return;
            }
        };
        handle.send(&ServerMessage::Joined {
            room_id: snapshot.room_id,
            users_count: snapshot.users_count,
            users: snapshot.users,
        });
        self.rooms
            .broadcast(
                &room_id,
                &ServerMessage::UserJoined { user_id: session_id },
                Some(handle.id()),
            )
            .await;
    }

    async fn handle_chat(&self, handle: &ConnectionHandle, session_id: SessionId, text: String) {
        if CommandDispatcher::is_command(&text) && self.commands.dispatch(handle, &text).await {
            return;
        }
        match self.rooms.current_room(handle.id()).await {
            Some(room_id) => {
                self.rooms
                    .broadcast(
                        &room_id,
                        &ServerMessage::Message {
                            user_id: session_id,
                            text,
                        },
                        None,
                    )
                    .await;
            }
            None => debug!("chat from session {} dropped: no current room", session_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{drain, test_handle, ConnectionId};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message;

    fn coordinator() -> ConnectionCoordinator {
        let users = Arc::new(UserRegistry::new());
        let rooms = Arc::new(RoomRegistry::new(vec![
            "general".to_string(),
            "random".to_string(),
        ]));
        ConnectionCoordinator::new(users, rooms)
    }

    async fn connect(
        coordinator: &ConnectionCoordinator,
    ) -> (ConnectionHandle, SessionId, UnboundedReceiver<Message>) {
        let (handle, mut rx) = test_handle();
        let session_id = coordinator.on_connect(&handle).await.unwrap();
        drain(&mut rx); // discard welcome
        (handle, session_id, rx)
    }

    #[tokio::test]
    async fn connect_sends_welcome_with_channels() {
        let coordinator = coordinator();
        let (handle, mut rx) = test_handle();
        let session_id = coordinator.on_connect(&handle).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Welcome {
                client_id: session_id,
                channels: vec!["general".to_string(), "random".to_string()],
            }]
        );
    }

    #[tokio::test]
    async fn end_to_end_join_and_chat() {
        let coordinator = coordinator();
        let (x, x_id, mut rx_x) = connect(&coordinator).await;
        let (y, y_id, mut rx_y) = connect(&coordinator).await;

        coordinator
            .on_message(&x, x_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        assert_eq!(
            drain(&mut rx_x),
            vec![ServerMessage::Joined {
                room_id: "general".to_string(),
                users_count: 1,
                users: vec![x_id],
            }]
        );

        coordinator
            .on_message(&y, y_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        // X sees the join; Y gets the snapshot, not its own userJoined
        assert_eq!(drain(&mut rx_x), vec![ServerMessage::UserJoined { user_id: y_id }]);
        let y_frames = drain(&mut rx_y);
        assert_eq!(y_frames.len(), 1);
        match &y_frames[0] {
            ServerMessage::Joined {
                room_id,
                users_count,
                users,
            } => {
                assert_eq!(room_id, "general");
                assert_eq!(*users_count, 2);
                assert!(users.contains(&x_id) && users.contains(&y_id));
            }
            other => panic!("expected joined, got {:?}", other),
        }

        coordinator
            .on_message(&x, x_id, r#"{"type":"message","text":"hi"}"#)
            .await;
        let expected = ServerMessage::Message {
            user_id: x_id,
            text: "hi".to_string(),
        };
        assert_eq!(drain(&mut rx_y), vec![expected.clone()]);
        // Echo policy: the sender receives its own broadcast
        assert_eq!(drain(&mut rx_x), vec![expected]);
    }

    #[tokio::test]
    async fn chat_without_room_is_dropped() {
        let coordinator = coordinator();
        let (x, x_id, mut rx_x) = connect(&coordinator).await;
        coordinator
            .on_message(&x, x_id, r#"{"type":"message","text":"into the void"}"#)
            .await;
        assert!(drain(&mut rx_x).is_empty());
    }

    #[tokio::test]
    async fn command_text_is_not_broadcast_as_chat() {
        let coordinator = coordinator();
        let (x, x_id, mut rx_x) = connect(&coordinator).await;
        let (y, y_id, mut rx_y) = connect(&coordinator).await;
        coordinator
            .on_message(&x, x_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        coordinator
            .on_message(&y, y_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        drain(&mut rx_x);
        drain(&mut rx_y);

        coordinator
            .on_message(&x, x_id, r#"{"type":"message","text":"/users"}"#)
            .await;

        // Sender gets system replies only; the room sees nothing
        let x_frames = drain(&mut rx_x);
        assert!(x_frames
            .iter()
            .all(|m| matches!(m, ServerMessage::System { .. })));
        assert!(!x_frames.is_empty());
        assert!(drain(&mut rx_y).is_empty());
    }

    #[tokio::test]
    async fn unrecognized_command_falls_through_to_chat() {
        let coordinator = coordinator();
        let (x, x_id, mut rx_x) = connect(&coordinator).await;
        coordinator
            .on_message(&x, x_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        drain(&mut rx_x);

        coordinator
            .on_message(&x, x_id, r#"{"type":"message","text":"/shrug"}"#)
            .await;
        assert_eq!(
            drain(&mut rx_x),
            vec![ServerMessage::Message {
                user_id: x_id,
                text: "/shrug".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_non_fatal() {
        let coordinator = coordinator();
        let (x, x_id, mut rx_x) = connect(&coordinator).await;

        coordinator.on_message(&x, x_id, "{{{{").await;
        coordinator.on_message(&x, x_id, r#"{"type":"selfdestruct"}"#).await;
        assert!(drain(&mut rx_x).is_empty());

        // The connection still works afterwards
        coordinator
            .on_message(&x, x_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        assert_eq!(drain(&mut rx_x).len(), 1);
    }

    #[tokio::test]
    async fn signaling_routes_through_relay_gate() {
        let coordinator = coordinator();
        let (x, x_id, mut rx_x) = connect(&coordinator).await;
        let (y, y_id, mut rx_y) = connect(&coordinator).await;
        let (z, z_id, mut rx_z) = connect(&coordinator).await;
        coordinator
            .on_message(&x, x_id, r#"{"type":"join","roomId":"r1"}"#)
            .await;
        coordinator
            .on_message(&y, y_id, r#"{"type":"join","roomId":"r1"}"#)
            .await;
        drain(&mut rx_x);
        drain(&mut rx_y);

        let offer = format!(
            r#"{{"type":"offer","targetUserId":"{}","roomId":"r1","data":"<opaque>"}}"#,
            y_id
        );
        coordinator.on_message(&x, x_id, &offer).await;
        let y_frames = drain(&mut rx_y);
        assert_eq!(y_frames.len(), 1);
        match &y_frames[0] {
            ServerMessage::Offer(forward) => {
                assert_eq!(forward.user_id, x_id);
                assert_eq!(forward.target_user_id, y_id);
                assert_eq!(forward.data, json!("<opaque>"));
            }
            other => panic!("expected offer, got {:?}", other),
        }

        // Z is not in r1, so its offer goes nowhere
        let rogue = format!(
            r#"{{"type":"offer","targetUserId":"{}","roomId":"r1","data":"<opaque>"}}"#,
            y_id
        );
        drain(&mut rx_x);
        coordinator.on_message(&z, z_id, &rogue).await;
        assert!(drain(&mut rx_x).is_empty());
        assert!(drain(&mut rx_y).is_empty());
        assert!(drain(&mut rx_z).is_empty());
    }

    #[tokio::test]
    async fn disconnect_notifies_room_and_is_idempotent() {
        let coordinator = coordinator();
        let (x, x_id, mut rx_x) = connect(&coordinator).await;
        let (y, y_id, mut rx_y) = connect(&coordinator).await;
        coordinator
            .on_message(&x, x_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        coordinator
            .on_message(&y, y_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        drain(&mut rx_x);
        drain(&mut rx_y);

        coordinator.on_disconnect(&y, y_id).await;
        assert_eq!(drain(&mut rx_x), vec![ServerMessage::UserLeft { user_id: y_id }]);
        assert!(coordinator.users.lookup_by_session(&y_id).await.is_none());

        // Close handling must tolerate being driven twice
        coordinator.on_disconnect(&y, y_id).await;
        assert!(drain(&mut rx_x).is_empty());
    }

    #[tokio::test]
    async fn disconnect_without_room_notifies_nobody() {
        let coordinator = coordinator();
        let (x, x_id, _rx_x) = connect(&coordinator).await;
        let (y, y_id, mut rx_y) = connect(&coordinator).await;
        coordinator
            .on_message(&y, y_id, r#"{"type":"join","roomId":"general"}"#)
            .await;
        drain(&mut rx_y);

        coordinator.on_disconnect(&x, x_id).await;
        assert!(drain(&mut rx_y).is_empty());
    }

    #[tokio::test]
    async fn membership_and_room_sets_stay_inverse() {
        let coordinator = coordinator();
        let (x, x_id, _rx_x) = connect(&coordinator).await;

        let assert_inverse = |rooms: Arc<RoomRegistry>, id: ConnectionId| async move {
            match rooms.current_room(id).await {
                Some(room) => assert!(rooms.is_member(id, &room).await),
                None => {
                    for room in ["general", "random", "r1"] {
                        assert!(!rooms.is_member(id, room).await);
                    }
                }
            }
        };

        for frame in [
            r#"{"type":"join","roomId":"general"}"#,
            r#"{"type":"join","roomId":"random"}"#,
            r#"{"type":"join","roomId":"random"}"#,
        ] {
            coordinator.on_message(&x, x_id, frame).await;
            assert_inverse(coordinator.rooms.clone(), x.id()).await;
        }
        coordinator.on_disconnect(&x, x_id).await;
        assert_inverse(coordinator.rooms.clone(), x.id()).await;
    }
}
