use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{DateTime, Document, doc, serialize_to_bson},
    options::IndexOptions,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{MongoSessionDocument, doc_id, player_filter},
};
use crate::dao::{
    match_store::MatchStore,
    models::{
        JoinError, JoinOutcome, MatchPlayer, MatchSession, MatchState, SessionFilter,
        SessionUpdate,
    },
    storage::{StorageError, StorageResult},
};

const SESSION_COLLECTION_NAME: &str = "match_sessions";

/// MongoDB-backed [`MatchStore`]. Updates are expressed as `$set`/`$push`/`$inc` operators.
#[derive(Clone)]
pub struct MongoMatchStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = self.state.read().await.database.clone();
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoMatchStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let store = Self {
            inner: Arc::new(MongoInner {
                state: RwLock::new(MongoState { client, database }),
                config,
            }),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let index = IndexModel::builder()
            .keys(doc! {"room_id": 1, "state": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("match_room_state_idx".to_owned()))
                    .build(),
            )
            .build();

        self.collection()
            .await
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SESSION_COLLECTION_NAME,
                index: "room_id,state",
                source,
            })?;
        Ok(())
    }

    async fn collection(&self) -> Collection<MongoSessionDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoSessionDocument>(SESSION_COLLECTION_NAME)
    }

    async fn insert(&self, session: MatchSession) -> MongoResult<Uuid> {
        let id = session.id;
        let document: MongoSessionDocument = session.into();
        self.collection()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| MongoDaoError::SaveMatch { id, source })?;
        Ok(id)
    }

    async fn push(&self, id: Uuid, player: MatchPlayer) -> StorageResult<JoinOutcome> {
        let user_id = player.user_id.clone();
        let encoded = encode(id, "player", &player)?;
        let mut filter = doc_id(id);
        filter.insert("state", MatchState::Lobby.as_str());
        filter.insert("players.user_id", doc! {"$ne": user_id.as_str()});
        filter.insert(
            "$expr",
            doc! {"$lt": [{"$size": "$players"}, "$config.max_players"]},
        );

        let result = self
            .collection()
            .await
            .update_one(filter, doc! {"$push": {"players": encoded}})
            .await
            .map_err(|source| MongoDaoError::UpdateMatch { id, source })?;
        if result.matched_count == 1 {
            return Ok(JoinOutcome::Joined);
        }

        // The guard rejected the push; re-read to tell the caller which rule applied.
        match self.find(id).await? {
            None => Ok(JoinOutcome::MissingSession),
            Some(session) => Ok(match session.check_join(&user_id) {
                Err(reason) => JoinOutcome::Rejected(reason),
                Ok(()) => JoinOutcome::Rejected(JoinError::MatchFull),
            }),
        }
    }

    async fn update(&self, id: Uuid, update: SessionUpdate) -> StorageResult<()> {
        let collection = self.collection().await;
        let run = |filter: Document, change: Document| {
            let collection = collection.clone();
            async move {
                collection
                    .update_one(filter, change)
                    .await
                    .map_err(|source| MongoDaoError::UpdateMatch { id, source })
            }
        };

        match update {
            SessionUpdate::SetState(state) => {
                let result = run(doc_id(id), doc! {"$set": {"state": state.as_str()}}).await?;
                if result.matched_count == 0 {
                    return Err(StorageError::MissingSession { id });
                }
            }
            SessionUpdate::RecordEvent {
                user_id,
                event,
                points,
            } => {
                let encoded = encode(id, "event", &event)?;
                let result = run(
                    player_filter(id, &user_id),
                    doc! {
                        "$push": {"players.$.events": encoded},
                        "$inc": {"players.$.score": points},
                    },
                )
                .await?;
                if result.matched_count == 0 {
                    return Err(StorageError::MissingPlayer { id, user_id });
                }
            }
            SessionUpdate::MarkLeft { user_id, at } => {
                let at = encode(id, "timestamp", &at)?;
                let result = run(
                    player_filter(id, &user_id),
                    doc! {"$set": {"players.$.left_at": at}},
                )
                .await?;
                if result.matched_count == 0 {
                    return Err(StorageError::MissingPlayer { id, user_id });
                }
            }
            SessionUpdate::Complete {
                results,
                completed_at,
            } => {
                for ranking in &results.rankings {
                    run(
                        player_filter(id, &ranking.user_id),
                        doc! {"$set": {"players.$.rank": ranking.rank as i64}},
                    )
                    .await?;
                }
                let encoded = encode(id, "results", &results)?;
                let result = run(
                    doc_id(id),
                    doc! {"$set": {
                        "state": MatchState::Completed.as_str(),
                        "results": encoded,
                        "completed_at": DateTime::from_system_time(completed_at),
                    }},
                )
                .await?;
                if result.matched_count == 0 {
                    return Err(StorageError::MissingSession { id });
                }
            }
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> MongoResult<Option<MatchSession>> {
        let document = self
            .collection()
            .await
            .find_one(doc_id(id))
            .await
            .map_err(|source| MongoDaoError::LoadMatch { id, source })?;
        document.map(MatchSession::try_from).transpose()
    }

    async fn list(&self, filter: SessionFilter) -> MongoResult<Vec<MatchSession>> {
        let mut query = Document::new();
        if let Some(room_id) = filter.room_id {
            query.insert("room_id", room_id);
        }
        if filter.exclude_completed {
            query.insert("state", doc! {"$ne": MatchState::Completed.as_str()});
        }

        let documents: Vec<MongoSessionDocument> = self
            .collection()
            .await
            .find(query)
            .sort(doc! {"started_at": 1})
            .await
            .map_err(|source| MongoDaoError::ListMatches { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListMatches { source })?;

        documents.into_iter().map(MatchSession::try_from).collect()
    }
}

fn encode<T: serde::Serialize>(
    id: Uuid,
    what: &'static str,
    value: &T,
) -> MongoResult<mongodb::bson::Bson> {
    serialize_to_bson(value).map_err(|source| MongoDaoError::Encode { id, what, source })
}

impl MatchStore for MongoMatchStore {
    fn insert_session(&self, session: MatchSession) -> BoxFuture<'static, StorageResult<Uuid>> {
        let store = self.clone();
        Box::pin(async move { store.insert(session).await.map_err(Into::into) })
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
        Box::pin(async move { store.find(id).await.map_err(Into::into) })
    }

    fn find_sessions(
        &self,
        filter: SessionFilter,
    ) -> BoxFuture<'static, StorageResult<Vec<MatchSession>>> {
        let store = self.clone();
        Box::pin(async move { store.list(filter).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
