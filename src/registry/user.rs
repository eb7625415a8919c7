//! User registry
//!
//! Maps session identifiers to live connections and profile data. This is the
//! authoritative identity store: a session exists exactly as long as its
//! connection is registered, and the session-to-connection and
//! connection-to-session maps always agree.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ConnectionHandle, ConnectionId, SessionId};
use crate::server::ServerMessage;

/// Identity record for one connected client
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub handle: ConnectionHandle,
    pub profile: HashMap<String, String>,
}

#[derive(Default)]
struct UserMaps {
    sessions: HashMap<SessionId, Session>,
    by_connection: HashMap<ConnectionId, SessionId>,
}

/// Thread-safe store of all connected sessions
pub struct UserRegistry {
    inner: RwLock<UserMaps>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(UserMaps::default()),
        }
    }

    /// Register a connection and return its freshly assigned session id
    pub async fn register(&self, handle: ConnectionHandle) -> SessionId {
        let mut inner = self.inner.write().await;
        let mut session_id = Uuid::new_v4();
        while inner.sessions.contains_key(&session_id) {
            session_id = Uuid::new_v4();
        }
        inner.by_connection.insert(handle.id(), session_id);
        inner.sessions.insert(
            session_id,
            Session {
                session_id,
                handle,
                profile: HashMap::new(),
            },
        );
        debug!("registered session {}", session_id);
        session_id
    }

    /// Remove a session; no-op if it is already gone
    pub async fn unregister(&self, session_id: &SessionId) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.remove(session_id) {
            inner.by_connection.remove(&session.handle.id());
            debug!("unregistered session {}", session_id);
        }
    }

    pub async fn lookup_by_session(&self, session_id: &SessionId) -> Option<Session> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    pub async fn lookup_by_connection(&self, connection_id: ConnectionId) -> Option<Session> {
        let inner = self.inner.read().await;
        let session_id = inner.by_connection.get(&connection_id)?;
        inner.sessions.get(session_id).cloned()
    }

    /// Resolve a connection back to its session id
    pub async fn session_id_for(&self, connection_id: ConnectionId) -> Option<SessionId> {
        self.inner.read().await.by_connection.get(&connection_id).copied()
    }

    /// Merge fields into an existing profile; false if the session is gone
    pub async fn update_profile(&self, session_id: &SessionId, fields: HashMap<String, String>) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) => {
                session.profile.extend(fields);
                true
            }
            None => false,
        }
    }

    /// Send a message to a session's connection.
    ///
    /// Returns false, without error, if the session is unknown or its
    /// connection has closed. The message is dropped, never queued for later.
    pub async fn send(&self, session_id: &SessionId, msg: &ServerMessage) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(session_id) {
            Some(session) if session.handle.is_open() => session.handle.send(msg),
            _ => false,
        }
    }

    /// Snapshot of every session id and its profile
    pub async fn list_all(&self) -> Vec<(SessionId, HashMap<String, String>)> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .map(|s| (s.session_id, s.profile.clone()))
            .collect()
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{drain, test_handle};

    #[tokio::test]
    async fn register_and_lookup_are_consistent() {
        let registry = UserRegistry::new();
        let (handle, _rx) = test_handle();
        let id = registry.register(handle.clone()).await;

        let by_session = registry.lookup_by_session(&id).await.unwrap();
        assert_eq!(by_session.session_id, id);
        assert!(by_session.profile.is_empty());

        let by_connection = registry.lookup_by_connection(handle.id()).await.unwrap();
        assert_eq!(by_connection.session_id, id);
        assert_eq!(registry.session_id_for(handle.id()).await, Some(id));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = UserRegistry::new();
        let (handle, _rx) = test_handle();
        let connection_id = handle.id();
        let id = registry.register(handle).await;

        registry.unregister(&id).await;
        registry.unregister(&id).await;

        assert!(registry.lookup_by_session(&id).await.is_none());
        assert!(registry.lookup_by_connection(connection_id).await.is_none());
    }

    #[tokio::test]
    async fn update_profile_merges_fields() {
        let registry = UserRegistry::new();
        let (handle, _rx) = test_handle();
        let id = registry.register(handle).await;

        let mut first = HashMap::new();
        first.insert("nick".to_string(), "ada".to_string());
        assert!(registry.update_profile(&id, first).await);

        let mut second = HashMap::new();
        second.insert("color".to_string(), "green".to_string());
        assert!(registry.update_profile(&id, second).await);

        let session = registry.lookup_by_session(&id).await.unwrap();
        assert_eq!(session.profile.get("nick"), Some(&"ada".to_string()));
        assert_eq!(session.profile.get("color"), Some(&"green".to_string()));

        registry.unregister(&id).await;
        assert!(!registry.update_profile(&id, HashMap::new()).await);
    }

    #[tokio::test]
    async fn send_reports_delivery() {
        let registry = UserRegistry::new();
        let (handle, mut rx) = test_handle();
        let id = registry.register(handle).await;

        assert!(registry.send(&id, &ServerMessage::system("hello")).await);
        let received = drain(&mut rx);
        assert_eq!(received, vec![ServerMessage::system("hello")]);

        // Unknown session is a silent drop
        assert!(!registry.send(&Uuid::new_v4(), &ServerMessage::system("x")).await);

        // Closed connection is a silent drop too
        drop(rx);
        assert!(!registry.send(&id, &ServerMessage::system("y")).await);
    }

    #[tokio::test]
    async fn list_all_snapshots_every_session() {
        let registry = UserRegistry::new();
        let (a, _rx_a) = test_handle();
        let (b, _rx_b) = test_handle();
        let id_a = registry.register(a).await;
        let id_b = registry.register(b).await;

        let mut ids: Vec<SessionId> = registry.list_all().await.into_iter().map(|(id, _)| id).collect();
        ids.sort();
        let mut expected = vec![id_a, id_b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
