use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dao::models::{MatchConfig, MatchPlayer, MatchResult, MatchSession, MatchState};

use super::error::MongoDaoError;

/// Stored shape of a match session; ids are kept as strings so filters stay readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    id: String,
    game_id: String,
    room_id: String,
    players: Vec<MatchPlayer>,
    state: MatchState,
    config: MatchConfig,
    #[serde(default)]
    results: Option<MatchResult>,
    started_at: DateTime,
    #[serde(default)]
    completed_at: Option<DateTime>,
}

impl From<MatchSession> for MongoSessionDocument {
    fn from(value: MatchSession) -> Self {
        Self {
            id: value.id.to_string(),
            game_id: value.game_id,
            room_id: value.room_id,
            players: value.players,
            state: value.state,
            config: value.config,
            results: value.results,
            started_at: DateTime::from_system_time(value.started_at),
            completed_at: value.completed_at.map(DateTime::from_system_time),
        }
    }
}

impl TryFrom<MongoSessionDocument> for MatchSession {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&value.id)
            .map_err(|_| MongoDaoError::MalformedId { id: value.id.clone() })?;
        Ok(Self {
            id,
            game_id: value.game_id,
            room_id: value.room_id,
            players: value.players,
            state: value.state,
            config: value.config,
            results: value.results,
            started_at: value.started_at.to_system_time(),
            completed_at: value.completed_at.map(|at| at.to_system_time()),
        })
    }
}

pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

pub fn player_filter(id: Uuid, user_id: &str) -> Document {
    doc! {"_id": id.to_string(), "players.user_id": user_id}
}
