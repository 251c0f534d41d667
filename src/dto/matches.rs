use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{
        MatchConfig, MatchPlayer, MatchResult, MatchSession, MatchState, PlayerRanking,
    },
    dto::{format_system_time, validation::validate_identifier},
};

/// Largest roster accepted for a single match.
pub const MAX_PLAYERS_LIMIT: u32 = 100;

/// Payload used to open a new match in a room.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateMatchRequest {
    /// Game content to play.
    #[validate(custom(function = "validate_identifier"))]
    pub game_id: String,
    /// Room hosting the match.
    #[validate(custom(function = "validate_identifier"))]
    pub room_id: String,
    /// Pre-authenticated user opening the match; joined automatically.
    #[validate(custom(function = "validate_identifier"))]
    pub creator_id: String,
    /// Display name of the creator; defaults to `creator_id`.
    #[serde(default)]
    #[validate(length(max = 64))]
    pub creator_name: Option<String>,
    /// Avatar of the creator.
    #[serde(default)]
    pub creator_avatar: Option<String>,
    /// Match settings.
    #[validate(nested)]
    pub config: MatchConfigInput,
}

/// Match settings supplied at creation.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct MatchConfigInput {
    /// Game mode label, `classic` when omitted.
    #[serde(default = "default_mode")]
    #[validate(length(min = 1, max = 32))]
    pub mode: String,
    /// Roster size that unlocks the countdown.
    #[validate(range(min = 1, max = MAX_PLAYERS_LIMIT))]
    pub max_players: u32,
    /// Private flag, stored as given.
    #[serde(default)]
    pub private: bool,
    /// Play time in seconds once the match becomes active. Omit for no limit.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub duration_secs: Option<u64>,
}

fn default_mode() -> String {
    "classic".into()
}

impl From<MatchConfigInput> for MatchConfig {
    fn from(value: MatchConfigInput) -> Self {
        Self {
            mode: value.mode,
            max_players: value.max_players,
            private: value.private,
            duration_secs: value.duration_secs,
        }
    }
}

/// Payload used to add a player to a lobby.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JoinMatchRequest {
    /// Pre-authenticated user joining the lobby.
    #[validate(custom(function = "validate_identifier"))]
    pub user_id: String,
    /// Display name.
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    /// Avatar URL or key.
    #[serde(default)]
    pub avatar: String,
}

/// Public projection of a match session.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchSessionDto {
    /// Match identifier.
    pub id: String,
    /// Game content being played.
    pub game_id: String,
    /// Hosting room.
    pub room_id: String,
    /// Lifecycle state name.
    pub state: String,
    /// Roster in join order.
    pub players: Vec<MatchPlayerDto>,
    /// Settings chosen at creation.
    pub config: MatchConfigDto,
    /// Final standings once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<MatchResultDto>,
    /// Creation time, RFC3339.
    pub started_at: String,
    /// Completion time, RFC3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<&MatchSession> for MatchSessionDto {
    fn from(session: &MatchSession) -> Self {
        Self {
            id: session.id.to_string(),
            game_id: session.game_id.clone(),
            room_id: session.room_id.clone(),
            state: session.state.as_str().to_owned(),
            players: session.players.iter().map(MatchPlayerDto::from).collect(),
            config: (&session.config).into(),
            results: session.results.as_ref().map(MatchResultDto::from),
            started_at: format_system_time(session.started_at),
            completed_at: session.completed_at.map(format_system_time),
        }
    }
}

/// Roster entry exposed to clients; the raw event log stays server side.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchPlayerDto {
    /// Player identifier.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Avatar URL or key.
    pub avatar: String,
    /// Accumulated score.
    pub score: i64,
    /// Final rank, 0 before completion.
    pub rank: u32,
    /// Number of recorded events.
    pub events: usize,
    /// Join time, RFC3339.
    pub joined_at: String,
    /// Last disconnect time, RFC3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_at: Option<String>,
}

impl From<&MatchPlayer> for MatchPlayerDto {
    fn from(player: &MatchPlayer) -> Self {
        Self {
            user_id: player.user_id.clone(),
            name: player.name.clone(),
            avatar: player.avatar.clone(),
            score: player.score,
            rank: player.rank,
            events: player.events.len(),
            joined_at: format_system_time(player.joined_at),
            left_at: player.left_at.map(format_system_time),
        }
    }
}

/// Match settings as reported to clients.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchConfigDto {
    /// Game mode label.
    pub mode: String,
    /// Roster size.
    pub max_players: u32,
    /// Private flag.
    pub private: bool,
    /// Play time limit in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl From<&MatchConfig> for MatchConfigDto {
    fn from(config: &MatchConfig) -> Self {
        Self {
            mode: config.mode.clone(),
            max_players: config.max_players,
            private: config.private,
            duration_secs: config.duration_secs,
        }
    }
}

/// Final standings of a completed match.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchResultDto {
    /// Rank-1 player.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    /// Standings, best first.
    pub rankings: Vec<PlayerRankingDto>,
    /// Aggregate figures.
    #[schema(value_type = Object)]
    pub stats: Value,
}

impl From<&MatchResult> for MatchResultDto {
    fn from(result: &MatchResult) -> Self {
        Self {
            winner: result.winner.clone(),
            rankings: result.rankings.iter().map(PlayerRankingDto::from).collect(),
            stats: result.stats.clone(),
        }
    }
}

/// One row of the final standings.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PlayerRankingDto {
    /// Ranked player.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Final score.
    pub score: i64,
    /// 1-based position.
    pub rank: u32,
    /// Correct answers given.
    pub correct_answers: u32,
    /// Answers given.
    pub total_answers: u32,
    /// Percentage of correct answers.
    pub accuracy: f64,
}

impl From<&PlayerRanking> for PlayerRankingDto {
    fn from(ranking: &PlayerRanking) -> Self {
        Self {
            user_id: ranking.user_id.clone(),
            name: ranking.name.clone(),
            score: ranking.score,
            rank: ranking.rank,
            correct_answers: ranking.correct_answers,
            total_answers: ranking.total_answers,
            accuracy: ranking.accuracy,
        }
    }
}

/// Response of the lifecycle control endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct MatchStateResponse {
    /// Match identifier.
    pub id: String,
    /// State after the transition.
    pub state: String,
}

impl MatchStateResponse {
    /// Response for `id` now in `state`.
    pub fn new(id: Uuid, state: MatchState) -> Self {
        Self {
            id: id.to_string(),
            state: state.as_str().to_owned(),
        }
    }
}
