use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{JoinOutcome, MatchPlayer, MatchSession, MatchState, SessionFilter},
    dto::matches::{CreateMatchRequest, JoinMatchRequest},
    error::ServiceError,
    state::{SharedState, registry::MatchSignal},
};

/// Persist a new lobby session with its creator enrolled, then start its coordinator.
///
/// Nothing goes live unless the insert succeeds, so a storage failure leaves no orphan
/// coordinator behind.
pub async fn create_match(
    state: &SharedState,
    request: CreateMatchRequest,
) -> Result<MatchSession, ServiceError> {
    request.validate()?;
    let store = state.require_store().await?;

    let CreateMatchRequest {
        game_id,
        room_id,
        creator_id,
        creator_name,
        creator_avatar,
        config,
    } = request;

    let mut session = MatchSession::new(game_id, room_id, config.into());
    session.players.push(MatchPlayer::new(
        creator_id.clone(),
        creator_name.unwrap_or_else(|| creator_id.clone()),
        creator_avatar.unwrap_or_default(),
    ));
    let match_id = store.insert_session(session.clone()).await?;
    state
        .registry()
        .start(
            session.clone(),
            state.store_slot(),
            state.config().coordinator().clone(),
        )
        .await;
    info!(%match_id, %creator_id, "match created");

    Ok(session)
}

/// Add a player to a lobby. The store checks state, capacity, and duplicates atomically.
pub async fn join_match(
    state: &SharedState,
    match_id: Uuid,
    request: JoinMatchRequest,
) -> Result<MatchPlayer, ServiceError> {
    request.validate()?;
    let store = state.require_store().await?;

    let JoinMatchRequest {
        user_id,
        name,
        avatar,
    } = request;
    let player = MatchPlayer::new(user_id, name, avatar);

    match store.push_player(match_id, player.clone()).await? {
        JoinOutcome::Joined => {}
        JoinOutcome::Rejected(reason) => return Err(reason.into()),
        JoinOutcome::MissingSession => {
            return Err(ServiceError::NotFound(format!("match `{match_id}` not found")));
        }
    }
    info!(%match_id, user_id = %player.user_id, "player joined match");

    match state.registry().get(match_id).await {
        Some(handle) => {
            if let Err(err) = handle.signal(MatchSignal::Joined(player.clone())).await {
                warn!(%match_id, error = %err, "coordinator gone before roster update");
            }
        }
        None => warn!(%match_id, "joined a match without a live coordinator"),
    }

    Ok(player)
}

/// Fetch a session from storage.
pub async fn get_match(state: &SharedState, match_id: Uuid) -> Result<MatchSession, ServiceError> {
    let store = state.require_store().await?;
    store
        .find_session(match_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` not found")))
}

/// Sessions of `room_id` that have not completed.
pub async fn get_active_matches(
    state: &SharedState,
    room_id: &str,
) -> Result<Vec<MatchSession>, ServiceError> {
    let store = state.require_store().await?;
    Ok(store
        .find_sessions(SessionFilter::active_in_room(room_id))
        .await?)
}

/// Signal the coordinator that the match is over.
pub async fn end_match(state: &SharedState, match_id: Uuid) -> Result<(), ServiceError> {
    let handle = live_match(state, match_id).await?;
    handle.finish().await?;
    info!(%match_id, "match completion requested");
    Ok(())
}

/// Suspend gameplay of an active match.
pub async fn pause_match(state: &SharedState, match_id: Uuid) -> Result<MatchState, ServiceError> {
    let handle = live_match(state, match_id).await?;
    Ok(handle.pause().await??)
}

/// Resume gameplay of a paused match.
pub async fn resume_match(
    state: &SharedState,
    match_id: Uuid,
) -> Result<MatchState, ServiceError> {
    let handle = live_match(state, match_id).await?;
    Ok(handle.resume().await??)
}

async fn live_match(
    state: &SharedState,
    match_id: Uuid,
) -> Result<crate::state::MatchHandle, ServiceError> {
    state
        .registry()
        .get(match_id)
        .await
        .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` is not live")))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    use crate::{
        config::AppConfig,
        dao::{
            match_store::{InMemoryMatchStore, MatchStore},
            models::{JoinError, PlayerEvent, SessionUpdate},
        },
        dto::matches::MatchConfigInput,
        state::{AppState, registry::PlayerConnection},
    };

    use super::*;

    async fn app() -> (SharedState, InMemoryMatchStore) {
        let store = InMemoryMatchStore::new();
        let state = AppState::with_store(AppConfig::default(), Arc::new(store.clone())).await;
        (state, store)
    }

    fn create_request(max_players: u32) -> CreateMatchRequest {
        CreateMatchRequest {
            game_id: "g1".into(),
            room_id: "r1".into(),
            creator_id: "u1".into(),
            creator_name: Some("Ada".into()),
            creator_avatar: None,
            config: MatchConfigInput {
                mode: "quiz".into(),
                max_players,
                private: false,
                duration_secs: None,
            },
        }
    }

    fn join_request(user_id: &str) -> JoinMatchRequest {
        JoinMatchRequest {
            user_id: user_id.into(),
            name: user_id.to_uppercase(),
            avatar: String::new(),
        }
    }

    async fn connect(state: &SharedState, match_id: Uuid, user_id: &str) -> mpsc::Receiver<Message> {
        let handle = state.registry().get(match_id).await.unwrap();
        let (connection, queue) = PlayerConnection::new(user_id.into(), 64);
        handle.register(connection).await.unwrap();
        queue
    }

    async fn next_kind(queue: &mut mpsc::Receiver<Message>) -> String {
        let Some(Message::Text(text)) = queue.recv().await else {
            panic!("queue closed");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        value["type"].as_str().unwrap().to_owned()
    }

    async fn wait_for_kind(queue: &mut mpsc::Receiver<Message>, kind: &str) -> serde_json::Value {
        loop {
            let Some(Message::Text(text)) = queue.recv().await else {
                panic!("queue closed while waiting for {kind}");
            };
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_auto_joins_creator_and_third_join_is_full() {
        let (state, _) = app().await;

        let session = create_match(&state, create_request(2)).await.unwrap();
        assert_eq!(session.state, MatchState::Lobby);
        assert_eq!(session.players.len(), 1);
        assert_eq!(session.players[0].user_id, "u1");
        assert_eq!(session.players[0].name, "Ada");
        assert!(state.registry().get(session.id).await.is_some());

        join_match(&state, session.id, join_request("u2")).await.unwrap();
        let err = join_match(&state, session.id, join_request("u3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Join(JoinError::MatchFull)));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_join_is_rejected_and_roster_unchanged() {
        let (state, _) = app().await;
        let session = create_match(&state, create_request(4)).await.unwrap();

        let err = join_match(&state, session.id, join_request("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Join(JoinError::AlreadyJoined)));
        let err = join_match(&state, session.id, join_request("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Join(JoinError::AlreadyJoined)));

        let stored = get_match(&state, session.id).await.unwrap();
        assert_eq!(stored.players.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn join_unknown_match_is_not_found() {
        let (state, _) = app().await;
        let err = join_match(&state, Uuid::new_v4(), join_request("u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_request_is_rejected_without_mutation() {
        let (state, store) = app().await;
        let mut request = create_request(2);
        request.room_id = "bad room".into();
        let err = create_match(&state, request).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert!(store.find_sessions(SessionFilter::default()).await.unwrap().is_empty());
        assert!(state.registry().live_matches().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_mode_refuses_creation() {
        let state = AppState::new(AppConfig::default());
        let err = create_match(&state, create_request(2)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Degraded));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_players_start_countdown_then_activate() {
        let (state, store) = app().await;
        let session = create_match(&state, create_request(2)).await.unwrap();
        join_match(&state, session.id, join_request("u2")).await.unwrap();
        let handle = state.registry().get(session.id).await.unwrap();
        let mut states = handle.watch_state();

        let _q1 = connect(&state, session.id, "u1").await;
        let _q2 = connect(&state, session.id, "u2").await;
        handle
            .signal(MatchSignal::Ready { user_id: "u1".into() })
            .await
            .unwrap();
        handle
            .signal(MatchSignal::Ready { user_id: "u2".into() })
            .await
            .unwrap();

        states.wait_for(|s| *s == MatchState::Countdown).await.unwrap();
        let started = tokio::time::Instant::now();
        states.wait_for(|s| *s == MatchState::Active).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));

        let stored = store.find_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, MatchState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_without_full_roster_stays_in_lobby() {
        let (state, _) = app().await;
        let session = create_match(&state, create_request(3)).await.unwrap();
        join_match(&state, session.id, join_request("u2")).await.unwrap();
        let handle = state.registry().get(session.id).await.unwrap();

        let _q1 = connect(&state, session.id, "u1").await;
        let _q2 = connect(&state, session.id, "u2").await;
        for user_id in ["u1", "u2"] {
            handle
                .signal(MatchSignal::Ready { user_id: user_id.into() })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.state(), MatchState::Lobby);
    }

    #[tokio::test(start_paused = true)]
    async fn done_ranks_players_and_removes_match_after_grace() {
        let (state, store) = app().await;
        let session = create_match(&state, create_request(2)).await.unwrap();
        join_match(&state, session.id, join_request("u2")).await.unwrap();
        for (user_id, points) in [("u1", 30), ("u2", 50)] {
            store
                .update_session(
                    session.id,
                    SessionUpdate::RecordEvent {
                        user_id: user_id.into(),
                        event: PlayerEvent {
                            kind: "answer".into(),
                            data: serde_json::json!({"correct": true, "points": points}),
                            timestamp: std::time::SystemTime::now(),
                        },
                        points,
                    },
                )
                .await
                .unwrap();
        }
        let mut queue = connect(&state, session.id, "u1").await;

        end_match(&state, session.id).await.unwrap();
        let end = wait_for_kind(&mut queue, "match_end").await;
        assert_eq!(end["data"]["results"]["winner"], "u2");

        let stored = get_match(&state, session.id).await.unwrap();
        assert_eq!(stored.state, MatchState::Completed);
        let results = stored.results.clone().unwrap();
        assert_eq!(results.winner.as_deref(), Some("u2"));
        let ranked: Vec<_> = results
            .rankings
            .iter()
            .map(|r| (r.user_id.as_str(), r.rank, r.score))
            .collect();
        assert_eq!(ranked, vec![("u2", 1, 50), ("u1", 2, 30)]);
        assert_eq!(stored.player("u2").unwrap().rank, 1);
        assert!(stored.completed_at.is_some());

        // Still live during the grace period.
        assert!(state.registry().get(session.id).await.is_some());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(state.registry().get(session.id).await.is_none());
        // Connection queue is closed once the coordinator is gone.
        while queue.recv().await.is_some() {}

        assert!(
            get_active_matches(&state, "r1").await.unwrap().is_empty(),
            "completed matches are not listed as active"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn end_unknown_match_is_not_found() {
        let (state, _) = app().await;
        let err = end_match(&state, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_requires_active_match() {
        let (state, _) = app().await;
        let session = create_match(&state, create_request(1)).await.unwrap();
        let err = pause_match(&state, session.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_active_match() {
        let (state, store) = app().await;
        let session = create_match(&state, create_request(1)).await.unwrap();
        let handle = state.registry().get(session.id).await.unwrap();
        let mut states = handle.watch_state();
        let mut queue = connect(&state, session.id, "u1").await;
        assert_eq!(next_kind(&mut queue).await, "player_joined");

        handle
            .signal(MatchSignal::Ready { user_id: "u1".into() })
            .await
            .unwrap();
        states.wait_for(|s| *s == MatchState::Active).await.unwrap();

        assert_eq!(pause_match(&state, session.id).await.unwrap(), MatchState::Paused);
        let stored = store.find_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, MatchState::Paused);
        assert_eq!(resume_match(&state, session.id).await.unwrap(), MatchState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_completes_match_and_pause_freezes_clock() {
        let (state, _) = app().await;
        let mut request = create_request(1);
        request.config.duration_secs = Some(60);
        let session = create_match(&state, request).await.unwrap();
        let handle = state.registry().get(session.id).await.unwrap();
        let mut states = handle.watch_state();
        let _queue = connect(&state, session.id, "u1").await;

        handle
            .signal(MatchSignal::Ready { user_id: "u1".into() })
            .await
            .unwrap();
        states.wait_for(|s| *s == MatchState::Active).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        pause_match(&state, session.id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.state(), MatchState::Paused);

        resume_match(&state, session.id).await.unwrap();
        let resumed = tokio::time::Instant::now();
        states.wait_for(|s| *s == MatchState::Completed).await.unwrap();
        let waited = resumed.elapsed();
        assert!(waited >= Duration::from_secs(29) && waited <= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_coordinator() {
        let (state, _) = app().await;
        let first = create_match(&state, create_request(2)).await.unwrap();
        let second = create_match(&state, create_request(2)).await.unwrap();
        assert_eq!(state.registry().live_matches().await.len(), 2);

        state.registry().shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.registry().get(first.id).await.is_none());
        assert!(state.registry().get(second.id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_insert_starts_no_coordinator() {
        let (state, store) = app().await;
        store.set_offline(true);

        let err = create_match(&state, create_request(2)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        assert!(state.registry().live_matches().await.is_empty());

        store.set_offline(false);
        assert!(store.find_sessions(SessionFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn live_match_persists_to_replacement_store() {
        let (state, first) = app().await;
        let session = create_match(&state, create_request(1)).await.unwrap();

        let second = InMemoryMatchStore::new();
        let copied = first.find_session(session.id).await.unwrap().unwrap();
        second.insert_session(copied).await.unwrap();
        state.set_store(Arc::new(second.clone())).await;
        first.set_offline(true);

        let handle = state.registry().get(session.id).await.unwrap();
        end_match(&state, session.id).await.unwrap();
        handle
            .watch_state()
            .wait_for(|s| *s == MatchState::Completed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stored = second.find_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, MatchState::Completed);
        assert_eq!(
            stored.results.as_ref().and_then(|r| r.winner.as_deref()),
            Some("u1")
        );
    }
}
