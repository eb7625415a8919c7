//! Protocol message definitions
//!
//! Defines the JSON message types exchanged between chat clients and the relay
//! server. Every frame is a tagged object with a `type` discriminator; anything
//! with an unknown tag fails to parse and is dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// The three WebRTC signaling kinds the relay forwards.
///
/// The relay never looks inside the payload; the kind only decides which
/// outbound variant carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Wire label, for logging
    pub fn label(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

/// Signaling fields as sent by a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    /// Session id of the peer this signal is meant for
    pub target_user_id: Uuid,
    /// Room the sender claims both peers share
    pub room_id: String,
    /// Opaque SDP/ICE blob, owned entirely by the clients
    pub data: Value,
}

/// Signaling fields as relayed to room members, retagged with the sender
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalForward {
    /// Session id of the sender
    pub user_id: Uuid,
    /// Session id of the intended recipient
    pub target_user_id: Uuid,
    pub room_id: String,
    pub data: Value,
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from a chat client to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a room, implicitly leaving the current one
    Join { room_id: String },

    /// Chat text for the current room; slash-prefixed text is a command
    Message { text: String },

    /// WebRTC offer to relay
    Offer(SignalPayload),

    /// WebRTC answer to relay
    Answer(SignalPayload),

    /// ICE candidate to relay
    #[serde(rename = "ice-candidate")]
    IceCandidate(SignalPayload),
}

impl ClientMessage {
    /// Parse a client message from a JSON text frame
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON (primarily for testing)
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from the server to a chat client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once on connect with the assigned session id and browsable channels
    Welcome {
        client_id: Uuid,
        channels: Vec<String>,
    },

    /// Confirmation of a successful join, with a member snapshot
    Joined {
        room_id: String,
        users_count: usize,
        users: Vec<Uuid>,
    },

    /// A peer joined the recipient's room
    UserJoined { user_id: Uuid },

    /// A peer left the recipient's room
    UserLeft { user_id: Uuid },

    /// Room chat, tagged with the sending session
    Message { user_id: Uuid, text: String },

    /// Server-generated notice for the recipient only
    System { text: String },

    /// Direct message delivered via `/msg`
    PrivateMessage { from: Uuid, text: String },

    /// The recipient was kicked out of a room
    Kicked { from: Uuid, room_id: String },

    /// A peer was kicked out of the recipient's room
    UserKicked { user_id: Uuid, by: Uuid },

    /// Relayed WebRTC offer
    Offer(SignalForward),

    /// Relayed WebRTC answer
    Answer(SignalForward),

    /// Relayed ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate(SignalForward),
}

impl ServerMessage {
    /// Create a system notice
    pub fn system(text: impl Into<String>) -> Self {
        ServerMessage::System { text: text.into() }
    }

    /// Wrap a signaling forward in the outbound variant matching `kind`
    pub fn signal(kind: SignalKind, forward: SignalForward) -> Self {
        match kind {
            SignalKind::Offer => ServerMessage::Offer(forward),
            SignalKind::Answer => ServerMessage::Answer(forward),
            SignalKind::IceCandidate => ServerMessage::IceCandidate(forward),
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server message from JSON (primarily for testing)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_join() {
        let msg = ClientMessage::from_json(r#"{"type":"join","roomId":"general"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                room_id: "general".to_string()
            }
        );
    }

    #[test]
    fn parse_chat_message() {
        let msg = ClientMessage::from_json(r#"{"type":"message","text":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Message {
                text: "hi".to_string()
            }
        );
    }

    #[test]
    fn parse_ice_candidate_tag() {
        let target = Uuid::new_v4();
        let json = format!(
            r#"{{"type":"ice-candidate","targetUserId":"{}","roomId":"r1","data":{{"candidate":"c"}}}}"#,
            target
        );
        let msg = ClientMessage::from_json(&json).unwrap();
        match msg {
            ClientMessage::IceCandidate(p) => {
                assert_eq!(p.target_user_id, target);
                assert_eq!(p.room_id, "r1");
                assert_eq!(p.data, json!({"candidate": "c"}));
            }
            other => panic!("expected ice-candidate, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"shutdown"}"#).is_err());
        assert!(ClientMessage::from_json("not json at all").is_err());
    }

    #[test]
    fn welcome_wire_shape() {
        let id = Uuid::new_v4();
        let msg = ServerMessage::Welcome {
            client_id: id,
            channels: vec!["general".to_string()],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["clientId"], id.to_string());
        assert_eq!(value["channels"], json!(["general"]));
    }

    #[test]
    fn signal_retagging_keeps_data_opaque() {
        let sender = Uuid::new_v4();
        let target = Uuid::new_v4();
        let blob = json!({"sdp": "v=0...", "nested": [1, 2, 3]});
        let msg = ServerMessage::signal(
            SignalKind::Offer,
            SignalForward {
                user_id: sender,
                target_user_id: target,
                room_id: "r1".to_string(),
                data: blob.clone(),
            },
        );
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["userId"], sender.to_string());
        assert_eq!(value["targetUserId"], target.to_string());
        assert_eq!(value["data"], blob);
    }
}
