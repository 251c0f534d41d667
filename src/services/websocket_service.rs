use std::{fmt::Display, time::{Duration, SystemTime}};

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{
    sync::mpsc,
    time::{Instant, interval_at, timeout, timeout_at},
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dao::models::{MatchState, PlayerEvent, SessionUpdate},
    dto::ws::{Envelope, MessageKind, PlayerActionData, ScoreUpdateEvent},
    error::ServiceError,
    state::{
        MatchHandle, SharedState,
        registry::{ConnectionId, MatchClosed, MatchSignal, PlayerConnection},
    },
};

/// Errors raised while handling one inbound frame. None of them end the connection.
#[derive(Debug, Error)]
enum InboundError {
    /// Frame is not a valid envelope or its payload has the wrong shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Payload parsed but breaks a field rule.
    #[error("invalid payload: {0}")]
    Invalid(#[from] ValidationErrors),
    /// Server-only message type sent by a client.
    #[error("unexpected inbound message type `{0:?}`")]
    Unexpected(MessageKind),
    /// Gameplay action outside the `active` state.
    #[error("player actions are ignored while the match is {0:?}")]
    NotActive(MatchState),
    /// Coordinator has terminated.
    #[error(transparent)]
    Closed(#[from] MatchClosed),
    /// Error from persistence.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Per-connection context shared by the inbound handlers.
struct InboundContext {
    state: SharedState,
    handle: MatchHandle,
    match_id: Uuid,
    user_id: String,
}

/// Registration of one connection with its coordinator. Unregisters on drop, so the
/// connection is detached even when a handler panics.
struct Attachment {
    handle: Option<MatchHandle>,
    connection_id: ConnectionId,
}

impl Attachment {
    /// Unregister and wait for the coordinator to accept the request.
    async fn detach(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.unregister(self.connection_id).await.is_err() {
                debug!(match_id = %handle.id(), "coordinator already stopped");
            }
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let connection_id = self.connection_id;
        warn!(match_id = %handle.id(), %connection_id, "connection task ended abnormally");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = handle.unregister(connection_id).await;
            });
        }
    }
}

/// Resolve the live match for `match_id` and check that `user_id` is on its roster.
pub async fn authorize(
    state: &SharedState,
    match_id: Uuid,
    user_id: &str,
) -> Result<MatchHandle, ServiceError> {
    let handle = state
        .registry()
        .get(match_id)
        .await
        .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` is not live")))?;

    let session = state
        .require_store()
        .await?
        .find_session(match_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` not found")))?;
    if session.player(user_id).is_none() {
        return Err(ServiceError::Unauthorized(format!(
            "user `{user_id}` has not joined match `{match_id}`"
        )));
    }

    Ok(handle)
}

/// Handle the full lifecycle of one player's WebSocket attachment to a match.
pub async fn handle_socket(
    state: SharedState,
    socket: WebSocket,
    handle: MatchHandle,
    user_id: String,
) {
    let (sink, stream) = socket.split();
    run_connection(state, handle, user_id, sink, stream).await;
}

/// Register with the coordinator, pump frames in both directions, and unregister once either
/// side stops.
async fn run_connection<Si, St, E>(
    state: SharedState,
    handle: MatchHandle,
    user_id: String,
    sink: Si,
    stream: St,
) where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let settings = state.config().coordinator().clone();
    let match_id = handle.id();
    let (connection, queue) = PlayerConnection::new(user_id.clone(), settings.send_queue_capacity);
    let connection_id = connection.id;

    if let Err(err) = handle.register(connection).await {
        warn!(%match_id, %user_id, error = %err, "cannot attach to match");
        return;
    }
    info!(%match_id, %user_id, %connection_id, "player socket attached");
    let attachment = Attachment {
        handle: Some(handle.clone()),
        connection_id,
    };

    let mut writer = tokio::spawn(write_loop(
        sink,
        queue,
        settings.ping_interval,
        settings.write_deadline,
    ));

    let ctx = InboundContext {
        state,
        handle,
        match_id,
        user_id,
    };

    let writer_finished = tokio::select! {
        _ = read_loop(&ctx, stream, settings.read_deadline) => false,
        _ = &mut writer => true,
    };

    // Closes the send queue, which lets the writer flush a close frame and exit.
    attachment.detach().await;
    if !writer_finished {
        let _ = writer.await;
    }
    info!(%match_id, user_id = %ctx.user_id, %connection_id, "player socket detached");
}

async fn read_loop<St, E>(ctx: &InboundContext, mut stream: St, read_deadline: Duration)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let match_id = ctx.match_id;
    let user_id = ctx.user_id.as_str();
    let mut deadline = Instant::now() + read_deadline;

    loop {
        let message = match timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                debug!(%match_id, %user_id, error = %err, "websocket receive error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(%match_id, %user_id, "read deadline exceeded");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if let Err(err) = handle_inbound(ctx, text.as_str()).await {
                    warn!(%match_id, %user_id, error = %err, "inbound message dropped");
                    if matches!(err, InboundError::Closed(_)) {
                        break;
                    }
                }
            }
            Message::Pong(_) => deadline = Instant::now() + read_deadline,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Binary(_) => {}
        }
    }
}

/// Drain the send queue into the socket, pinging periodically. Ends with a close frame once
/// the coordinator drops the queue, or on the first failed or slow write.
async fn write_loop<Si>(
    mut sink: Si,
    mut queue: mpsc::Receiver<Message>,
    ping_interval: Duration,
    write_deadline: Duration,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        let message = tokio::select! {
            next = queue.recv() => match next {
                Some(message) => message,
                None => {
                    let _ = timeout(write_deadline, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };

        match timeout(write_deadline, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "websocket write failed");
                break;
            }
            Err(_) => {
                warn!("websocket write deadline exceeded");
                break;
            }
        }
    }
}

/// Parse one text frame, stamp sender and arrival time, and dispatch it.
async fn handle_inbound(ctx: &InboundContext, text: &str) -> Result<(), InboundError> {
    let mut envelope: Envelope = serde_json::from_str(text)?;
    envelope.from = Some(ctx.user_id.clone());
    envelope.sent_at = OffsetDateTime::now_utc();

    match envelope.kind {
        MessageKind::PlayerAction => record_action(ctx, envelope).await,
        MessageKind::ChatMessage => Ok(ctx.handle.broadcast(envelope).await?),
        MessageKind::Ready => Ok(ctx
            .handle
            .signal(MatchSignal::Ready {
                user_id: ctx.user_id.clone(),
            })
            .await?),
        other => Err(InboundError::Unexpected(other)),
    }
}

/// Persist the action as a player event and announce the score change. Nothing is broadcast
/// when the write fails.
async fn record_action(ctx: &InboundContext, envelope: Envelope) -> Result<(), InboundError> {
    let state = ctx.handle.state();
    if state != MatchState::Active {
        return Err(InboundError::NotActive(state));
    }

    let action: PlayerActionData = envelope.payload()?;
    action.validate()?;
    let store = ctx.state.require_store().await?;
    let event = PlayerEvent {
        kind: action.action.clone(),
        data: envelope.data,
        timestamp: SystemTime::now(),
    };
    store
        .update_session(
            ctx.match_id,
            SessionUpdate::RecordEvent {
                user_id: ctx.user_id.clone(),
                event,
                points: action.points,
            },
        )
        .await
        .map_err(ServiceError::from)?;
    debug!(match_id = %ctx.match_id, user_id = %ctx.user_id, action = %action.action, points = action.points, "player action recorded");

    let update = Envelope::server(
        MessageKind::ScoreUpdate,
        &ScoreUpdateEvent {
            user_id: ctx.user_id.clone(),
            action: action.action,
            points: action.points,
            correct: action.correct,
        },
    )?;
    ctx.handle.broadcast(update).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::channel::mpsc as frames;
    use serde_json::{Value, json};

    use crate::{
        config::AppConfig,
        dao::match_store::{InMemoryMatchStore, MatchStore},
        dto::matches::{CreateMatchRequest, JoinMatchRequest, MatchConfigInput},
        services::match_service,
        state::AppState,
    };

    use super::*;

    struct Client {
        inbound: frames::UnboundedSender<Result<Message, axum::Error>>,
        outbound: frames::UnboundedReceiver<Message>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Client {
        fn send(&self, value: Value) {
            self.inbound
                .unbounded_send(Ok(Message::Text(value.to_string().into())))
                .unwrap();
        }

        async fn next_of(&mut self, kind: &str) -> Value {
            loop {
                match self.outbound.next().await {
                    Some(Message::Text(text)) => {
                        let value: Value = serde_json::from_str(text.as_str()).unwrap();
                        if value["type"] == kind {
                            return value;
                        }
                    }
                    Some(_) => {}
                    None => panic!("socket closed while waiting for {kind}"),
                }
            }
        }

        /// Collects every text frame currently buffered.
        fn drain_kinds(&mut self) -> Vec<String> {
            let mut kinds = Vec::new();
            while let Ok(Some(message)) = self.outbound.try_next() {
                if let Message::Text(text) = message {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    kinds.push(value["type"].as_str().unwrap().to_owned());
                }
            }
            kinds
        }
    }

    fn connect(state: &SharedState, handle: &MatchHandle, user_id: &str) -> Client {
        let (inbound, stream) = frames::unbounded();
        let (sink, outbound) = frames::unbounded();
        let task = tokio::spawn(run_connection(
            state.clone(),
            handle.clone(),
            user_id.to_owned(),
            sink,
            stream,
        ));
        Client {
            inbound,
            outbound,
            task,
        }
    }

    async fn lobby(
        store: InMemoryMatchStore,
        players: &[&str],
        max_players: u32,
    ) -> (SharedState, MatchHandle) {
        let state = AppState::with_store(AppConfig::default(), Arc::new(store)).await;
        let session = match_service::create_match(
            &state,
            CreateMatchRequest {
                game_id: "g1".into(),
                room_id: "r1".into(),
                creator_id: players[0].into(),
                creator_name: None,
                creator_avatar: None,
                config: MatchConfigInput {
                    mode: "quiz".into(),
                    max_players,
                    private: false,
                    duration_secs: None,
                },
            },
        )
        .await
        .unwrap();
        for user_id in &players[1..] {
            match_service::join_match(
                &state,
                session.id,
                JoinMatchRequest {
                    user_id: (*user_id).into(),
                    name: (*user_id).into(),
                    avatar: String::new(),
                },
            )
            .await
            .unwrap();
        }
        let handle = state.registry().get(session.id).await.unwrap();
        (state, handle)
    }

    async fn activate(clients: &[&Client], handle: &MatchHandle) {
        let mut states = handle.watch_state();
        for client in clients {
            client.send(json!({"type": "ready", "data": {}}));
        }
        states.wait_for(|s| *s == MatchState::Active).await.unwrap();
    }

    fn answer(points: i64) -> Value {
        json!({"type": "player_action", "data": {"action": "answer", "correct": true, "points": points}})
    }

    #[tokio::test(start_paused = true)]
    async fn player_action_is_recorded_and_broadcast() {
        let store = InMemoryMatchStore::new();
        let (state, handle) = lobby(store.clone(), &["a", "b"], 2).await;
        let mut a = connect(&state, &handle, "a");
        let mut b = connect(&state, &handle, "b");
        a.next_of("player_joined").await;
        activate(&[&a, &b], &handle).await;

        a.send(answer(10));
        let update = b.next_of("score_update").await;
        assert_eq!(update["data"]["user_id"], "a");
        assert_eq!(update["data"]["points"], 10);
        a.next_of("score_update").await;

        let stored = store.find_session(handle.id()).await.unwrap().unwrap();
        let player = stored.player("a").unwrap();
        assert_eq!(player.score, 10);
        assert_eq!(player.events.len(), 1);
        assert_eq!(player.events[0].kind, "answer");
        assert!(player.events[0].is_correct());
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_skips_score_update() {
        let store = InMemoryMatchStore::new();
        let (state, handle) = lobby(store.clone(), &["a"], 1).await;
        let mut a = connect(&state, &handle, "a");
        activate(&[&a], &handle).await;

        store.set_offline(true);
        a.send(answer(10));
        a.send(json!({"type": "chat_message", "data": {"text": "still here"}}));
        let chat = a.next_of("chat_message").await;
        assert_eq!(chat["from"], "a");
        assert!(!a.drain_kinds().contains(&"score_update".to_owned()));

        store.set_offline(false);
        let stored = store.find_session(handle.id()).await.unwrap().unwrap();
        assert_eq!(stored.player("a").unwrap().score, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn player_action_before_start_is_ignored() {
        let store = InMemoryMatchStore::new();
        let (state, handle) = lobby(store.clone(), &["a", "b"], 2).await;
        let mut a = connect(&state, &handle, "a");

        a.send(answer(10));
        a.send(json!({"type": "chat_message", "data": {"text": "hi"}}));
        a.next_of("chat_message").await;
        assert!(!a.drain_kinds().contains(&"score_update".to_owned()));

        let stored = store.find_session(handle.id()).await.unwrap().unwrap();
        assert_eq!(stored.player("a").unwrap().score, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_is_relayed_with_sender_stamped() {
        let (state, handle) = lobby(InMemoryMatchStore::new(), &["a", "b"], 2).await;
        let a = connect(&state, &handle, "a");
        let mut b = connect(&state, &handle, "b");

        a.send(json!({"type": "chat_message", "from": "mallory", "data": {"text": "hello"}}));
        let chat = b.next_of("chat_message").await;
        assert_eq!(chat["from"], "a");
        assert_eq!(chat["data"]["text"], "hello");
        assert!(chat["sent_at"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_and_server_only_frames_are_ignored() {
        let (state, handle) = lobby(InMemoryMatchStore::new(), &["a"], 1).await;
        let mut a = connect(&state, &handle, "a");

        a.inbound
            .unbounded_send(Ok(Message::Text("not json".into())))
            .unwrap();
        a.send(json!({"type": "teleport", "data": {}}));
        a.send(json!({"type": "match_end", "data": {}}));
        a.send(json!({"type": "chat_message", "data": {"text": "alive"}}));
        let chat = a.next_of("chat_message").await;
        assert_eq!(chat["data"]["text"], "alive");
        assert_eq!(handle.state(), MatchState::Lobby);
    }

    #[tokio::test(start_paused = true)]
    async fn close_frame_detaches_and_announces_departure() {
        let store = InMemoryMatchStore::new();
        let (state, handle) = lobby(store.clone(), &["a", "b"], 2).await;
        let a = connect(&state, &handle, "a");
        let mut b = connect(&state, &handle, "b");
        b.next_of("player_joined").await;

        a.inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        let left = b.next_of("player_left").await;
        assert_eq!(left["data"]["user_id"], "a");
        assert_eq!(left["data"]["connected"], 1);
        a.task.await.unwrap();

        // Departure is recorded in the background; scores and events stay.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stored = store.find_session(handle.id()).await.unwrap().unwrap();
        assert!(stored.player("a").unwrap().left_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_hits_read_deadline() {
        let (state, handle) = lobby(InMemoryMatchStore::new(), &["a"], 1).await;
        let mut a = connect(&state, &handle, "a");

        // Ping goes out before the deadline; without a pong the reader gives up.
        tokio::time::sleep(Duration::from_secs(61)).await;
        a.task.await.unwrap();
        let mut saw_ping = false;
        let mut saw_close = false;
        while let Some(message) = a.outbound.next().await {
            match message {
                Message::Ping(_) => saw_ping = true,
                Message::Close(_) => saw_close = true,
                _ => {}
            }
        }
        assert!(saw_ping);
        assert!(saw_close);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_read_deadline() {
        let (state, handle) = lobby(InMemoryMatchStore::new(), &["a"], 1).await;
        let mut a = connect(&state, &handle, "a");

        tokio::time::sleep(Duration::from_secs(50)).await;
        a.inbound
            .unbounded_send(Ok(Message::Pong(Default::default())))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(!a.task.is_finished());

        a.send(json!({"type": "chat_message", "data": {"text": "still here"}}));
        a.next_of("chat_message").await;
    }

    #[tokio::test(start_paused = true)]
    async fn authorize_requires_roster_membership() {
        let (state, handle) = lobby(InMemoryMatchStore::new(), &["a"], 2).await;

        assert!(authorize(&state, handle.id(), "a").await.is_ok());
        assert!(matches!(
            authorize(&state, handle.id(), "stranger").await,
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            authorize(&state, Uuid::new_v4(), "a").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_points_are_rejected() {
        let store = InMemoryMatchStore::new();
        let (state, handle) = lobby(store.clone(), &["a"], 1).await;
        let mut a = connect(&state, &handle, "a");
        activate(&[&a], &handle).await;

        a.send(answer(i64::MAX));
        a.send(answer(1));
        let update = a.next_of("score_update").await;
        assert_eq!(update["data"]["points"], 1);
        assert!(!a.task.is_finished());

        let stored = store.find_session(handle.id()).await.unwrap().unwrap();
        let player = stored.player("a").unwrap();
        assert_eq!(player.score, 1);
        assert_eq!(player.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_reader_still_announces_departure() {
        let (state, handle) = lobby(InMemoryMatchStore::new(), &["a", "b"], 2).await;
        let mut b = connect(&state, &handle, "b");
        b.next_of("player_joined").await;

        let (inbound, stream) = frames::unbounded::<Result<Message, axum::Error>>();
        let stream = stream.map(|frame| match frame {
            Ok(Message::Binary(_)) => panic!("reader blew up"),
            other => other,
        });
        let (sink, mut outbound) = frames::unbounded();
        let task = tokio::spawn(run_connection(
            state.clone(),
            handle.clone(),
            "a".to_owned(),
            sink,
            stream,
        ));
        let joined = b.next_of("player_joined").await;
        assert_eq!(joined["data"]["connected"], 2);

        inbound
            .unbounded_send(Ok(Message::Binary(Default::default())))
            .unwrap();
        assert!(task.await.unwrap_err().is_panic());

        let left = b.next_of("player_left").await;
        assert_eq!(left["data"]["user_id"], "a");
        assert_eq!(left["data"]["connected"], 1);
        // The orphaned writer flushes a close frame once the queue is dropped.
        let mut saw_close = false;
        while let Some(message) = outbound.next().await {
            saw_close |= matches!(message, Message::Close(_));
        }
        assert!(saw_close);
    }
}
