use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a match session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    /// Players are joining and marking themselves ready.
    Lobby,
    /// Everybody is ready; gameplay starts once the countdown elapses.
    Countdown,
    /// Gameplay in progress.
    Active,
    /// Gameplay suspended by the control plane.
    Paused,
    /// Final standings have been computed.
    Completed,
}

impl MatchState {
    /// Position of the state along the lifecycle. `Active` and `Paused` share a slot since
    /// the match moves freely between them.
    pub fn progress(self) -> u8 {
        match self {
            MatchState::Lobby => 0,
            MatchState::Countdown => 1,
            MatchState::Active | MatchState::Paused => 2,
            MatchState::Completed => 3,
        }
    }

    /// Wire name of the state, as stored and broadcast.
    pub fn as_str(self) -> &'static str {
        match self {
            MatchState::Lobby => "lobby",
            MatchState::Countdown => "countdown",
            MatchState::Active => "active",
            MatchState::Paused => "paused",
            MatchState::Completed => "completed",
        }
    }
}

/// Settings chosen when the match was created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchConfig {
    /// Free-form game mode label (e.g. "quiz", "speed").
    pub mode: String,
    /// Roster size required before the countdown can start.
    pub max_players: u32,
    /// Private flag, stored and reported as given.
    pub private: bool,
    /// Optional play time in seconds once the match is active.
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// Single gameplay event recorded for a player.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerEvent {
    /// Event type, e.g. `answer`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw payload sent by the client.
    pub data: Value,
    /// Arrival time at the server.
    pub timestamp: SystemTime,
}

impl PlayerEvent {
    /// Whether the payload flags this event as a correct answer.
    pub fn is_correct(&self) -> bool {
        self.data.get("correct").and_then(Value::as_bool) == Some(true)
    }
}

/// Roster entry of a match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchPlayer {
    /// Identifier issued by the authentication collaborator.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Avatar URL or key.
    pub avatar: String,
    /// Accumulated score.
    pub score: i64,
    /// Final rank, 0 until the match completes.
    pub rank: u32,
    /// Append-only list of gameplay events.
    pub events: Vec<PlayerEvent>,
    /// When the player joined the roster.
    pub joined_at: SystemTime,
    /// Last time the player's connection went away.
    pub left_at: Option<SystemTime>,
}

impl MatchPlayer {
    /// Build a fresh roster entry with no score.
    pub fn new(user_id: String, name: String, avatar: String) -> Self {
        Self {
            user_id,
            name,
            avatar,
            score: 0,
            rank: 0,
            events: Vec::new(),
            joined_at: SystemTime::now(),
            left_at: None,
        }
    }
}

/// Final standing of one player.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerRanking {
    /// Ranked user.
    pub user_id: String,
    /// Display name at completion time.
    pub name: String,
    /// Final score.
    pub score: i64,
    /// 1-based position; ties keep roster order.
    pub rank: u32,
    /// Answer events flagged as correct.
    pub correct_answers: u32,
    /// Answer events of any outcome.
    pub total_answers: u32,
    /// Percentage of correct answers, 0 when no answer was given.
    pub accuracy: f64,
}

/// Outcome of a completed match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    /// User id of the rank-1 player.
    pub winner: Option<String>,
    /// Every roster entry, best score first.
    pub rankings: Vec<PlayerRanking>,
    /// Aggregate figures (open map).
    pub stats: Value,
}

/// Persisted match session document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchSession {
    /// Match identifier, also the document key.
    pub id: Uuid,
    /// Game content being played.
    pub game_id: String,
    /// Room the match was created in.
    pub room_id: String,
    /// Roster in join order.
    pub players: Vec<MatchPlayer>,
    /// Current lifecycle state.
    pub state: MatchState,
    /// Settings chosen at creation.
    pub config: MatchConfig,
    /// Final standings, set on completion.
    pub results: Option<MatchResult>,
    /// Creation time of the session.
    pub started_at: SystemTime,
    /// Completion time, set together with `results`.
    pub completed_at: Option<SystemTime>,
}

impl MatchSession {
    /// Build a new lobby session with an empty roster.
    pub fn new(game_id: String, room_id: String, config: MatchConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_id,
            room_id,
            players: Vec::new(),
            state: MatchState::Lobby,
            config,
            results: None,
            started_at: SystemTime::now(),
            completed_at: None,
        }
    }

    /// Find a roster entry by user id.
    pub fn player(&self, user_id: &str) -> Option<&MatchPlayer> {
        self.players.iter().find(|player| player.user_id == user_id)
    }

    /// Whether the roster has reached the configured size.
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.config.max_players as usize
    }

    /// Check whether `user_id` may be added to the roster.
    pub fn check_join(&self, user_id: &str) -> Result<(), JoinError> {
        if self.state != MatchState::Lobby {
            return Err(JoinError::AlreadyStarted);
        }
        if self.is_full() {
            return Err(JoinError::MatchFull);
        }
        if self.player(user_id).is_some() {
            return Err(JoinError::AlreadyJoined);
        }
        Ok(())
    }

    /// Apply a partial update in memory, mirroring what the store does on its side.
    ///
    /// A score that would overflow rejects the whole update, leaving the player untouched.
    pub fn apply(&mut self, update: &SessionUpdate) -> Result<(), UpdateError> {
        match update {
            SessionUpdate::SetState(state) => self.state = *state,
            SessionUpdate::RecordEvent {
                user_id,
                event,
                points,
            } => {
                let player = self.player_mut(user_id)?;
                let score = player
                    .score
                    .checked_add(*points)
                    .ok_or_else(|| UpdateError::ScoreOverflow(user_id.clone()))?;
                player.events.push(event.clone());
                player.score = score;
            }
            SessionUpdate::MarkLeft { user_id, at } => {
                self.player_mut(user_id)?.left_at = Some(*at);
            }
            SessionUpdate::Complete {
                results,
                completed_at,
            } => {
                for ranking in &results.rankings {
                    if let Ok(player) = self.player_mut(&ranking.user_id) {
                        player.rank = ranking.rank;
                    }
                }
                self.state = MatchState::Completed;
                self.results = Some(results.clone());
                self.completed_at = Some(*completed_at);
            }
        }
        Ok(())
    }

    fn player_mut(&mut self, user_id: &str) -> Result<&mut MatchPlayer, UpdateError> {
        self.players
            .iter_mut()
            .find(|player| player.user_id == user_id)
            .ok_or_else(|| UpdateError::MissingPlayer(user_id.to_owned()))
    }
}

/// Targeted change applied to a stored session. Never a whole-document replace.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Set the lifecycle state.
    SetState(MatchState),
    /// Append an event to a player and increment their score in the same operation.
    RecordEvent {
        /// Roster entry receiving the event.
        user_id: String,
        /// Event appended to the player's history.
        event: PlayerEvent,
        /// Signed score increment.
        points: i64,
    },
    /// Stamp the time a player's connection went away.
    MarkLeft {
        /// Player whose connection closed.
        user_id: String,
        /// Disconnect time.
        at: SystemTime,
    },
    /// Store results, per-player ranks, and move to `completed`.
    Complete {
        /// Computed standings.
        results: MatchResult,
        /// Completion time.
        completed_at: SystemTime,
    },
}

/// Query used to list sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Restrict to one room.
    pub room_id: Option<String>,
    /// Skip sessions in `completed`.
    pub exclude_completed: bool,
}

impl SessionFilter {
    /// Sessions of `room_id` that have not completed yet.
    pub fn active_in_room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.into()),
            exclude_completed: true,
        }
    }

    /// Whether `session` satisfies this filter.
    pub fn matches(&self, session: &MatchSession) -> bool {
        self.room_id
            .as_deref()
            .is_none_or(|room_id| session.room_id == room_id)
            && !(self.exclude_completed && session.state == MatchState::Completed)
    }
}

/// Reasons a join request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The match left the lobby.
    #[error("match already started")]
    AlreadyStarted,
    /// The roster reached `max_players`.
    #[error("match is full")]
    MatchFull,
    /// The user is already on the roster.
    #[error("player already joined")]
    AlreadyJoined,
}

/// Result of a guarded roster push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The player was appended.
    Joined,
    /// The session exists but refused the player.
    Rejected(JoinError),
    /// No session with that id.
    MissingSession,
}

/// Why an in-memory [`SessionUpdate`] was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// Update targeted a user that is not on the roster.
    #[error("player `{0}` is not on the roster")]
    MissingPlayer(String),
    /// Adding the points would overflow the player's score.
    #[error("score of player `{0}` would overflow")]
    ScoreOverflow(String),
}
