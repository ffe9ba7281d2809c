//! Session Directory
//!
//! Registry of live session replicas. The command log resolves its store
//! handle here on attach; a session that is not registered has no handle,
//! and attaching to it yields nothing rather than an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::game::state::PlayerId;
use crate::network::auth::{validate_room_id, ValidationError};
use crate::network::store::ReplicatedStore;

/// Shared handle to one session's replica.
pub type SessionHandle<S> = Arc<RwLock<S>>;

/// Session registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Session id is malformed.
    #[error("invalid session id: {0}")]
    InvalidId(#[from] ValidationError),
    /// A session with this id is already open.
    #[error("session already open: {0}")]
    AlreadyOpen(String),
    /// No session with this id.
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Active sessions and the players seated in them.
pub struct SessionDirectory<S> {
    /// Active sessions.
    sessions: RwLock<BTreeMap<String, SessionHandle<S>>>,
    /// Player to session mapping.
    player_sessions: RwLock<BTreeMap<PlayerId, String>>,
}

impl<S: ReplicatedStore> SessionDirectory<S> {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            player_sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open a session under a caller-chosen id (a room id).
    pub async fn open_session(&self, session_id: &str, store: S) -> Result<SessionHandle<S>, SessionError> {
        validate_room_id(session_id)?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyOpen(session_id.to_string()));
        }
        let handle = Arc::new(RwLock::new(store));
        sessions.insert(session_id.to_string(), handle.clone());
        info!(session_id, "Session opened");
        Ok(handle)
    }

    /// Get a session by id.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionHandle<S>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Seat a player in a session.
    pub async fn register_player(&self, player_id: PlayerId, session_id: &str) -> Result<(), SessionError> {
        if !self.sessions.read().await.contains_key(session_id) {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        }
        debug!(%player_id, session_id, "Player registered");
        self.player_sessions
            .write()
            .await
            .insert(player_id, session_id.to_string());
        Ok(())
    }

    /// Unseat a player.
    pub async fn unregister_player(&self, player_id: &PlayerId) {
        if self.player_sessions.write().await.remove(player_id).is_some() {
            debug!(%player_id, "Player unregistered");
        }
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Remove sessions nobody is seated in. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let occupied: Vec<String> = self.player_sessions.read().await.values().cloned().collect();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, _| occupied.contains(id));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "Idle sessions removed");
        }
        removed
    }
}

impl<S: ReplicatedStore> Default for SessionDirectory<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::store::MemoryStore;

    #[tokio::test]
    async fn test_open_and_get() {
        let directory = SessionDirectory::<MemoryStore>::new();
        directory.open_session("room-1", MemoryStore::new()).await.unwrap();

        assert!(directory.get_session("room-1").await.is_some());
        assert!(directory.get_session("room-2").await.is_none());
        assert_eq!(directory.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_ids() {
        let directory = SessionDirectory::<MemoryStore>::new();
        directory.open_session("room-1", MemoryStore::new()).await.unwrap();

        let dup = directory.open_session("room-1", MemoryStore::new()).await;
        assert_eq!(dup.err(), Some(SessionError::AlreadyOpen("room-1".into())));

        let bad = directory.open_session("no spaces", MemoryStore::new()).await;
        assert!(matches!(bad, Err(SessionError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_player_seating() {
        let directory = SessionDirectory::<MemoryStore>::new();
        directory.open_session("room-1", MemoryStore::new()).await.unwrap();
        let player = PlayerId::new("p1");

        directory.register_player(player.clone(), "room-1").await.unwrap();
        let err = directory.register_player(player.clone(), "missing").await.unwrap_err();
        assert_eq!(err, SessionError::UnknownSession("missing".into()));

        assert_eq!(directory.cleanup().await, 0);
        directory.unregister_player(&player).await;
        assert_eq!(directory.cleanup().await, 1);
        assert_eq!(directory.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_empty_sessions() {
        let directory = SessionDirectory::<MemoryStore>::new();
        directory.open_session("busy", MemoryStore::new()).await.unwrap();
        directory.open_session("idle", MemoryStore::new()).await.unwrap();
        directory.register_player(PlayerId::new("p1"), "busy").await.unwrap();

        assert_eq!(directory.cleanup().await, 1);
        assert!(directory.get_session("busy").await.is_some());
        assert!(directory.get_session("idle").await.is_none());
    }
}
