pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use crate::dao::models::{JoinOutcome, MatchPlayer, MatchSession, SessionFilter, SessionUpdate};
use crate::dao::storage::StorageResult;
use futures::future::BoxFuture;
use uuid::Uuid;

pub use memory::InMemoryMatchStore;

/// Abstraction over the document store holding match sessions.
///
/// Every mutation is a targeted update so the coordinator's periodic sync and the
/// per-connection action handling can write concurrently without losing updates.
pub trait MatchStore: Send + Sync {
    fn insert_session(&self, session: MatchSession) -> BoxFuture<'static, StorageResult<Uuid>>;
    /// Add `player` to the roster only if the session is still in the lobby, has room left,
    /// and does not already contain the user. Check and push happen atomically.
    fn push_player(
        &self,
        id: Uuid,
        player: MatchPlayer,
    ) -> BoxFuture<'static, StorageResult<JoinOutcome>>;
    fn update_session(
        &self,
        id: Uuid,
        update: SessionUpdate,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<MatchSession>>>;
    fn find_sessions(
        &self,
        filter: SessionFilter,
    ) -> BoxFuture<'static, StorageResult<Vec<MatchSession>>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
