//! Session registry: who is online, and over which connection.
//!
//! The registry only maps identities to connection handles. It never
//! touches room state; cascading cleanup when a session goes away is the
//! supervisor's job.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lobby_net::{ConnectionHandle, ConnectionId, EncodedFrame, SendError};
use tokio::time::Instant;

use crate::protocol::UserId;

/// A user bound to a live connection.
#[derive(Debug)]
pub struct Session {
    pub user_id: UserId,
    pub display_name: String,
    pub connection: ConnectionHandle,
    pub entered_at: Instant,
}

impl Session {
    /// Whether the underlying connection is still usable.
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    /// Time since this session entered the lobby.
    pub fn online_for(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Queue an encoded frame for this session.
    pub fn send(&self, frame: EncodedFrame) -> Result<(), SendError> {
        self.connection.send_frame(frame)
    }
}

/// Concurrent map of `UserId -> Session`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `connection`, replacing any previous session.
    ///
    /// Returns the new session and the one it replaced. The replaced
    /// session's connection is left open; the liveness sweep deals with it.
    pub fn upsert(
        &self,
        user_id: UserId,
        display_name: &str,
        connection: ConnectionHandle,
    ) -> (Arc<Session>, Option<Arc<Session>>) {
        let session = Arc::new(Session {
            user_id,
            display_name: display_name.to_string(),
            connection,
            entered_at: Instant::now(),
        });
        let previous = self.sessions.insert(user_id, Arc::clone(&session));
        (session, previous)
    }

    /// Session for `user_id`, if any.
    pub fn lookup(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.get(&user_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Session whose display name matches exactly, preferring live ones.
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Session>> {
        let mut fallback = None;
        for entry in self.sessions.iter() {
            if entry.display_name == name {
                if entry.is_alive() {
                    return Some(Arc::clone(entry.value()));
                }
                fallback = Some(Arc::clone(entry.value()));
            }
        }
        fallback
    }

    /// Remove a session. Removing an absent user is a no-op.
    pub fn remove(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.remove(&user_id).map(|(_, session)| session)
    }

    /// Remove a session only if it is still bound to `connection`.
    ///
    /// Guards against a stale connection tearing down a session the user has
    /// since re-established elsewhere.
    pub fn remove_if_connection(
        &self,
        user_id: UserId,
        connection: ConnectionId,
    ) -> Option<Arc<Session>> {
        self.sessions
            .remove_if(&user_id, |_, session| session.connection.id() == connection)
            .map(|(_, session)| session)
    }

    /// Users currently bound to `connection`.
    pub fn users_for_connection(&self, connection: ConnectionId) -> Vec<UserId> {
        self.sessions
            .iter()
            .filter(|entry| entry.connection.id() == connection)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Snapshot of every session, live or not.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of sessions whose connection is still alive.
    ///
    /// Safe to call while other tasks mutate the registry; the result may be
    /// slightly stale.
    pub fn all_live(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.is_alive())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no one is online.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
