use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dao::{
    match_store::MatchStore,
    models::{JoinOutcome, MatchPlayer, MatchSession, SessionFilter, SessionUpdate, UpdateError},
    storage::{StorageError, StorageResult},
};

#[derive(Debug, Error)]
#[error("in-memory store switched offline")]
struct Offline;

/// Process-local store used when no database is configured and in tests.
///
/// Each operation runs under the write lock, which gives the same atomicity the
/// document database offers for single-document updates.
#[derive(Clone, Default)]
pub struct InMemoryMatchStore {
    sessions: Arc<RwLock<IndexMap<Uuid, MatchSession>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryMatchStore {
    /// Empty, online store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the backend were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("memory store offline".into(), Offline));
        }
        Ok(())
    }

    async fn insert(&self, session: MatchSession) -> StorageResult<Uuid> {
        self.ensure_online()?;
        let id = session.id;
        self.sessions.write().await.insert(id, session);
        Ok(id)
    }

    async fn push(&self, id: Uuid, player: MatchPlayer) -> StorageResult<JoinOutcome> {
        self.ensure_online()?;
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&id) else {
            return Ok(JoinOutcome::MissingSession);
        };
        if let Err(err) = session.check_join(&player.user_id) {
            return Ok(JoinOutcome::Rejected(err));
        }
        session.players.push(player);
        Ok(JoinOutcome::Joined)
    }

    async fn update(&self, id: Uuid, update: SessionUpdate) -> StorageResult<()> {
        self.ensure_online()?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or(StorageError::MissingSession { id })?;
        session
            .apply(&update)
            .map_err(|err| match err {
                UpdateError::MissingPlayer(user_id) => StorageError::MissingPlayer { id, user_id },
                UpdateError::ScoreOverflow(user_id) => StorageError::ScoreOverflow { id, user_id },
            })
    }

    async fn find(&self, id: Uuid) -> StorageResult<Option<MatchSession>> {
        self.ensure_online()?;
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: SessionFilter) -> StorageResult<Vec<MatchSession>> {
        self.ensure_online()?;
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| filter.matches(session))
            .cloned()
            .collect())
    }
}

impl MatchStore for InMemoryMatchStore {
    fn insert_session(&self, session: MatchSession) -> BoxFuture<'static, StorageResult<Uuid>> {
        let store = self.clone();
        Box::pin(async move { store.insert(session).await })
    }

    fn push_player(
        &self,
        id: Uuid,
        player: MatchPlayer,
    ) -> BoxFuture<'static, StorageResult<JoinOutcome>> {
        let store = self.clone();
        Box::pin(async move { store.push(id, player).await })
    }

    fn update_session(
        &self,
        id: Uuid,
        update: SessionUpdate,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.update(id, update).await })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<MatchSession>>> {
        let store = self.clone();
        Box::pin(async move { store.find(id).await })
    }

    fn find_sessions(
        &self,
        filter: SessionFilter,
    ) -> BoxFuture<'static, StorageResult<Vec<MatchSession>>> {
        let store = self.clone();
        Box::pin(async move { store.list(filter).await })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online() })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online() })
    }
}
