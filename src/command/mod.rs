//! Slash-command dispatcher
//!
//! Parses `/`-prefixed chat text and routes it to a fixed set of
//! administrative actions against the registries. Anything that is not a
//! recognized command falls through to ordinary room chat; every malformed
//! invocation gets a usage reply, to the sender only.

use std::sync::Arc;

use tracing::{debug, error};
use uuid::Uuid;

use crate::registry::{ConnectionHandle, RoomRegistry, Session, SessionId, UserRegistry};
use crate::server::ServerMessage;

/// Dispatches slash commands against the shared registries
pub struct CommandDispatcher {
    users: Arc<UserRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl CommandDispatcher {
    pub fn new(users: Arc<UserRegistry>, rooms: Arc<RoomRegistry>) -> Self {
        Self { users, rooms }
    }

    /// Whether a chat text is a command invocation
    pub fn is_command(text: &str) -> bool {
        text.starts_with('/')
    }

    /// Parse and run a command.
    ///
    /// Returns true if the text was routed to a handler. An unrecognized
    /// keyword returns false so the caller can fall through to a normal
    /// chat broadcast; that fallback is deliberate, not an error.
    pub async fn dispatch(&self, sender: &ConnectionHandle, text: &str) -> bool {
        let Some(rest) = text.strip_prefix('/') else {
            return false;
        };
        let mut parts = rest.split(' ');
        let keyword = parts.next().unwrap_or("").to_lowercase();
        let args: Vec<&str> = parts.collect();

        match keyword.as_str() {
            "msg" => self.private_message(sender, &args).await,
            "kick" => self.kick(sender, &args).await,
            "users" => self.list_users(sender).await,
            "whois" => self.whois(sender, &args).await,
            _ => {
                debug!("unrecognized command /{}, falling through to chat", keyword);
                return false;
            }
        }
        true
    }

    /// `/msg <session-id> <text...>`: deliver a private message
    async fn private_message(&self, sender: &ConnectionHandle, args: &[&str]) {
        let (target_arg, text_args) = match args.split_first() {
            Some(split) => split,
            None => {
                reply(sender, "Usage: /msg <session-id> <message>");
                return;
            }
        };
        let text = text_args.join(" ");
        if target_arg.is_empty() || text.is_empty() {
            reply(sender, "Usage: /msg <session-id> <message>");
            return;
        }
        let Some(sender_id) = self.sender_session(sender).await else {
            return;
        };
        let Some(target) = self.resolve_target(sender, target_arg).await else {
            return;
        };

        self.users
            .send(
                &target.session_id,
                &ServerMessage::PrivateMessage {
                    from: sender_id,
                    text,
                },
            )
            .await;
        reply(sender, format!("Message sent to {}", target.session_id));
    }

    /// `/kick <session-id>`: eject a co-located user from the sender's room
    async fn kick(&self, sender: &ConnectionHandle, args: &[&str]) {
        let Some(target_arg) = args.first().filter(|a| !a.is_empty()) else {
            reply(sender, "Usage: /kick <session-id>");
            return;
        };
        let Some(sender_id) = self.sender_session(sender).await else {
            return;
        };
        let Some(target) = self.resolve_target(sender, target_arg).await else {
            return;
        };

        let sender_room = self.rooms.current_room(sender.id()).await;
        let target_room = self.rooms.current_room(target.handle.id()).await;
        let room_id = match (sender_room, target_room) {
            (Some(sender_room), Some(target_room)) if sender_room == target_room => sender_room,
            _ => {
                reply(
                    sender,
                    format!("User {} is not in this channel", target.session_id),
                );
                return;
            }
        };

        self.rooms.leave(target.handle.id()).await;
        self.users
            .send(
                &target.session_id,
                &ServerMessage::Kicked {
                    from: sender_id,
                    room_id: room_id.clone(),
                },
            )
            .await;
        self.rooms
            .broadcast(
                &room_id,
                &ServerMessage::UserKicked {
                    user_id: target.session_id,
                    by: sender_id,
                },
                None,
            )
            .await;
    }

    /// `/users`: list every session sharing the sender's room
    async fn list_users(&self, sender: &ConnectionHandle) {
        reply(sender, "Users in channel:");
        let Some(room_id) = self.rooms.current_room(sender.id()).await else {
            return;
        };
        match self.rooms.member_sessions(&room_id, &self.users).await {
            Ok(members) => {
                for session_id in members {
                    reply(sender, format!("- {}", session_id));
                }
            }
            Err(e) => error!("failed to list members of {}: {}", room_id, e),
        }
    }

    /// `/whois <session-id>`: report a session's id and current room
    async fn whois(&self, sender: &ConnectionHandle, args: &[&str]) {
        let Some(target_arg) = args.first().filter(|a| !a.is_empty()) else {
            reply(sender, "Usage: /whois <session-id>");
            return;
        };
        let Some(target) = self.resolve_target(sender, target_arg).await else {
            return;
        };

        let room = self.rooms.current_room(target.handle.id()).await;
        reply(sender, format!("User: {}", target.session_id));
        reply(
            sender,
            format!("Current channel: {}", room.as_deref().unwrap_or("None")),
        );
    }

    /// Look up the invoking connection's session. A command from a
    /// connection with no session is an internal inconsistency; the
    /// operation is abandoned and logged.
    async fn sender_session(&self, sender: &ConnectionHandle) -> Option<SessionId> {
        let session_id = self.users.session_id_for(sender.id()).await;
        if session_id.is_none() {
            error!("command from connection {} with no session", sender.id());
        }
        session_id
    }

    /// Resolve a command argument to a session, replying "not found" to the
    /// sender when it names no known session
    async fn resolve_target(&self, sender: &ConnectionHandle, arg: &str) -> Option<Session> {
        let session = match Uuid::parse_str(arg) {
            Ok(session_id) => self.users.lookup_by_session(&session_id).await,
            Err(_) => None,
        };
        if session.is_none() {
            reply(sender, format!("User {} not found", arg));
        }
        session
    }
}

fn reply(sender: &ConnectionHandle, text: impl Into<String>) {
    sender.send(&ServerMessage::system(text));
}
