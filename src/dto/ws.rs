use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use utoipa::ToSchema;
use validator::Validate;

use crate::dto::matches::{MatchResultDto, MatchSessionDto};

/// Message types carried over the match WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Inbound: a gameplay action, recorded and scored.
    PlayerAction,
    /// Inbound and outbound: chat line relayed to everybody.
    ChatMessage,
    /// Inbound: the sender is ready to start.
    Ready,
    /// A connection attached.
    PlayerJoined,
    /// A connection went away.
    PlayerLeft,
    /// A recorded action changed a score.
    ScoreUpdate,
    /// Periodic full snapshot.
    StateSync,
    /// Lifecycle transition.
    StateChanged,
    /// Final standings.
    MatchEnd,
}

/// JSON envelope wrapping every WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Envelope {
    /// Message type, serialized as `type`.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender user id, stamped by the server on inbound frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Restricts delivery to one user's connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Type-specific payload.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
    /// Send time. Inbound values that are not RFC3339 fall back to the arrival time.
    #[serde(
        default = "OffsetDateTime::now_utc",
        serialize_with = "time::serde::rfc3339::serialize",
        deserialize_with = "lenient_timestamp"
    )]
    #[schema(value_type = String, format = DateTime)]
    pub sent_at: OffsetDateTime,
}

/// Accepts any JSON value; only an RFC3339 string is kept.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        .unwrap_or_else(OffsetDateTime::now_utc))
}

impl Envelope {
    /// Build a server-originated envelope around `payload`.
    pub fn server<T: Serialize>(kind: MessageKind, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            from: None,
            to: None,
            data: serde_json::to_value(payload)?,
            sent_at: OffsetDateTime::now_utc(),
        })
    }

    /// Decode the `data` object into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

/// Largest score gain a single `player_action` may carry.
pub const MAX_ACTION_POINTS: i64 = 1_000_000;
/// Largest score loss a single `player_action` may carry.
pub const MIN_ACTION_POINTS: i64 = -MAX_ACTION_POINTS;

/// `data` of an inbound `player_action`.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct PlayerActionData {
    /// Recorded as the event type (e.g. `answer`).
    pub action: String,
    /// Whether the answer was right, when the action is gradable.
    #[serde(default)]
    pub correct: Option<bool>,
    /// Signed score increment.
    #[serde(default)]
    #[validate(range(min = MIN_ACTION_POINTS, max = MAX_ACTION_POINTS))]
    pub points: i64,
}

/// Broadcast when a connection attaches to the match.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlayerJoinedEvent {
    /// Owner of the new connection.
    pub user_id: String,
    /// Live connections after the join.
    pub connected: usize,
}

/// Broadcast when a connection goes away.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlayerLeftEvent {
    /// Owner of the closed connection.
    pub user_id: String,
    /// Live connections after the leave.
    pub connected: usize,
}

/// Broadcast after a `player_action` has been recorded.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScoreUpdateEvent {
    /// Player who acted.
    pub user_id: String,
    /// Action name as sent.
    pub action: String,
    /// Score increment applied.
    pub points: i64,
    /// Correctness flag, when given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct: Option<bool>,
}

/// Broadcast on every lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StateChangedEvent {
    /// State before the transition.
    pub previous: String,
    /// State after the transition.
    pub state: String,
}

/// Periodic full snapshot of the match.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(transparent)]
pub struct StateSyncEvent(pub MatchSessionDto);

/// Final standings sent once the match completes.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchEndEvent {
    /// Completed match.
    pub match_id: String,
    /// Final standings.
    pub results: MatchResultDto,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn inbound_without_timestamp_is_stamped() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"player_action","data":{"action":"answer","correct":true,"points":10}}"#)
                .unwrap();
        assert_eq!(envelope.kind, MessageKind::PlayerAction);
        assert!(envelope.from.is_none());

        let action: PlayerActionData = envelope.payload().unwrap();
        assert_eq!(action.action, "answer");
        assert_eq!(action.correct, Some(true));
        assert_eq!(action.points, 10);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Envelope>(r#"{"type":"teleport","data":{}}"#).is_err());
    }

    #[test]
    fn server_envelope_serializes_wire_shape() {
        let envelope = Envelope::server(
            MessageKind::PlayerLeft,
            &PlayerLeftEvent {
                user_id: "u1".into(),
                connected: 1,
            },
        )
        .unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "player_left");
        assert_eq!(value["data"], json!({"user_id": "u1", "connected": 1}));
        assert!(value.get("from").is_none());
        assert!(value["sent_at"].as_str().is_some());
    }

    #[test]
    fn non_rfc3339_sent_at_falls_back_to_arrival_time() {
        let before = OffsetDateTime::now_utc();
        for raw in [
            r#"{"type":"chat_message","data":{"text":"hi"},"sent_at":1700000000}"#,
            r#"{"type":"chat_message","data":{"text":"hi"},"sent_at":"yesterday"}"#,
            r#"{"type":"chat_message","data":{"text":"hi"},"sent_at":null}"#,
        ] {
            let envelope: Envelope = serde_json::from_str(raw).unwrap();
            assert_eq!(envelope.kind, MessageKind::ChatMessage);
            assert!(envelope.sent_at >= before);
        }

        let envelope: Envelope = serde_json::from_str(
            r#"{"type":"ready","data":{},"sent_at":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(envelope.sent_at.year(), 2024);
    }

    #[test]
    fn action_points_are_bounded() {
        let within: PlayerActionData =
            serde_json::from_value(json!({"action": "answer", "points": MAX_ACTION_POINTS}))
                .unwrap();
        assert!(within.validate().is_ok());

        let beyond: PlayerActionData =
            serde_json::from_value(json!({"action": "answer", "points": i64::MAX})).unwrap();
        assert!(beyond.validate().is_err());
        let below: PlayerActionData =
            serde_json::from_value(json!({"action": "answer", "points": MIN_ACTION_POINTS - 1}))
                .unwrap();
        assert!(below.validate().is_err());
    }
}
