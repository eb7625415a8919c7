//! Room registry
//!
//! The authoritative membership store: which room each connection is in, and
//! which connections each room holds. Both directions live under a single
//! lock, so a join's implicit leave is atomic and a broadcast never observes
//! a half-updated member set.
//!
//! Rooms are created lazily on first join and deleted the moment they empty;
//! a room id is present iff its member set is non-empty.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use super::{ConnectionHandle, ConnectionId, RegistryError, RegistryResult, SessionId, UserRegistry};
use crate::server::ServerMessage;

/// Member snapshot returned by a successful join
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub users_count: usize,
    pub users: Vec<SessionId>,
}

#[derive(Default)]
struct RoomMaps {
    /// room id -> member connections; never contains an empty set
    rooms: HashMap<String, HashMap<ConnectionId, ConnectionHandle>>,
    /// admitted connections and their current room, if any
    membership: HashMap<ConnectionId, Option<String>>,
}

impl RoomMaps {
    /// Detach a connection from its current room, deleting the room if it
    /// empties. Leaves the membership entry in place, cleared to None.
    fn detach(&mut self, connection_id: ConnectionId) -> Option<String> {
        let slot = self.membership.get_mut(&connection_id)?;
        let room_id = slot.take()?;
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some(room_id)
    }
}

/// Thread-safe store of rooms and per-connection membership
pub struct RoomRegistry {
    inner: RwLock<RoomMaps>,
    /// Pre-defined room names advertised to clients on admission. Joining is
    /// not restricted to this list.
    channels: Vec<String>,
}

impl RoomRegistry {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            inner: RwLock::new(RoomMaps::default()),
            channels,
        }
    }

    /// Register a connection as a client of the system, prior to any room
    /// membership. Returns the advertised channel list. Admitting the same
    /// connection twice is a logic error.
    pub async fn admit(&self, handle: &ConnectionHandle) -> RegistryResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        if inner.membership.contains_key(&handle.id()) {
            return Err(RegistryError::AlreadyAdmitted(handle.id()));
        }
        inner.membership.insert(handle.id(), None);
        Ok(self.channels.clone())
    }

    /// Move a connection into a room, implicitly leaving its current one.
    ///
    /// The leave and join happen under one write lock, so no observer can see
    /// the connection in two rooms or in none mid-operation. The returned
    /// snapshot resolves every member through the user registry; a member
    /// without a session is an internal consistency violation.
    pub async fn join(
        &self,
        handle: &ConnectionHandle,
        room_id: &str,
        users: &UserRegistry,
    ) -> RegistryResult<RoomSnapshot> {
        let mut inner = self.inner.write().await;
        if !inner.membership.contains_key(&handle.id()) {
            return Err(RegistryError::NotAdmitted(handle.id()));
        }
        let previous = inner.detach(handle.id());
        if let Some(ref previous) = previous {
            debug!("connection {} left {} to join {}", handle.id(), previous, room_id);
        }

        let members = inner.rooms.entry(room_id.to_string()).or_default();
        members.insert(handle.id(), handle.clone());
        let member_connections: Vec<ConnectionId> = members.keys().copied().collect();
        inner.membership.insert(handle.id(), Some(room_id.to_string()));

        // Lock order is rooms before users, here and everywhere else.
        let mut member_sessions = Vec::with_capacity(member_connections.len());
        for connection_id in member_connections {
            let session_id = users
                .session_id_for(connection_id)
                .await
                .ok_or(RegistryError::MissingSession(connection_id))?;
            member_sessions.push(session_id);
        }

        Ok(RoomSnapshot {
            room_id: room_id.to_string(),
            users_count: member_sessions.len(),
            users: member_sessions,
        })
    }

    /// Remove a connection from its room; returns the room it left
    pub async fn leave(&self, connection_id: ConnectionId) -> Option<String> {
        self.inner.write().await.detach(connection_id)
    }

    /// Send a message to every live member of a room, except `exclude`.
    ///
    /// Returns the number of members the message was queued for. A missing
    /// room is a no-op: empty rooms never linger, so this is the normal case
    /// for a just-vacated room.
    pub async fn broadcast(
        &self,
        room_id: &str,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(room_id) else {
            return 0;
        };
        let mut delivered = 0;
        for (connection_id, handle) in members {
            if Some(*connection_id) == exclude {
                continue;
            }
            if handle.is_open() && handle.send(msg) {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn current_room(&self, connection_id: ConnectionId) -> Option<String> {
        self.inner
            .read()
            .await
            .membership
            .get(&connection_id)
            .and_then(|room| room.clone())
    }

    pub async fn is_member(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .is_some_and(|members| members.contains_key(&connection_id))
    }

    /// Resolve a room's members to session ids via the user registry
    pub async fn member_sessions(
        &self,
        room_id: &str,
        users: &UserRegistry,
    ) -> RegistryResult<Vec<SessionId>> {
        let member_connections: Vec<ConnectionId> = {
            let inner = self.inner.read().await;
            match inner.rooms.get(room_id) {
                Some(members) => members.keys().copied().collect(),
                None => return Ok(Vec::new()),
            }
        };
        let mut member_sessions = Vec::with_capacity(member_connections.len());
        for connection_id in member_connections {
            let session_id = users
                .session_id_for(connection_id)
                .await
                .ok_or(RegistryError::MissingSession(connection_id))?;
            member_sessions.push(session_id);
        }
        Ok(member_sessions)
    }

    /// Leave plus de-admission, used on disconnect; idempotent
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<String> {
        let mut inner = self.inner.write().await;
        let left = inner.detach(connection_id);
        inner.membership.remove(&connection_id);
        left
    }
}
