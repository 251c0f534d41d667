use std::{
    collections::{HashSet, VecDeque},
    pin::Pin,
    sync::Arc,
    time::{Duration, SystemTime},
};

use axum::extract::ws::Message;
use indexmap::IndexMap;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, Sleep, interval, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    config::CoordinatorSettings,
    dao::{
        match_store::MatchStore,
        models::{MatchSession, MatchState, SessionUpdate},
    },
    dto::{
        matches::{MatchResultDto, MatchSessionDto},
        ws::{
            Envelope, MatchEndEvent, MessageKind, PlayerJoinedEvent, PlayerLeftEvent,
            StateChangedEvent, StateSyncEvent,
        },
    },
    services::ranking::calculate_rankings,
    state::{
        StoreSlot,
        registry::{ConnectionId, Inbox, MatchRegistry, MatchSignal, PlayerConnection},
        state_machine::{InvalidTransition, MatchEvent, next_state},
    },
};

type Timer = Option<Pin<Box<Sleep>>>;

/// Single owner of a live match's in-memory state.
///
/// Runs as one task per match; connections, the control plane and the timers only reach it
/// through the [`Inbox`] channels, so no lock protects the fields below.
pub(crate) struct Coordinator {
    snapshot: MatchSession,
    connections: IndexMap<ConnectionId, PlayerConnection>,
    ready: HashSet<String>,
    store: StoreSlot,
    registry: MatchRegistry,
    settings: CoordinatorSettings,
    state_tx: watch::Sender<MatchState>,
    countdown: Timer,
    deadline: Timer,
    /// Play time left when the match was paused with a duration limit.
    remaining: Option<Duration>,
    teardown: Timer,
}

impl Coordinator {
    pub(crate) fn new(
        snapshot: MatchSession,
        store: StoreSlot,
        settings: CoordinatorSettings,
        registry: MatchRegistry,
        state_tx: watch::Sender<MatchState>,
    ) -> Self {
        Self {
            snapshot,
            connections: IndexMap::new(),
            ready: HashSet::new(),
            store,
            registry,
            settings,
            state_tx,
            countdown: None,
            deadline: None,
            remaining: None,
            teardown: None,
        }
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) {
        let match_id = self.snapshot.id;
        info!(%match_id, "match coordinator started");

        let mut ticker = interval(self.settings.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            // Registrations first, so a connection is known before anything it sends.
            tokio::select! {
                biased;
                Some(connection) = inbox.register.recv() => self.register(connection),
                Some(connection_id) = inbox.unregister.recv() => self.unregister(connection_id),
                Some(envelope) = inbox.broadcast.recv() => self.broadcast(envelope),
                Some(signal) = inbox.signals.recv() => self.handle_signal(signal).await,
                Some(()) = inbox.done.recv() => self.complete().await,
                _ = ticker.tick() => self.sync().await,
                _ = wait(&mut self.countdown) => self.activate().await,
                _ = wait(&mut self.deadline) => {
                    self.deadline = None;
                    info!(%match_id, "match duration elapsed");
                    self.complete().await;
                }
                _ = wait(&mut self.teardown) => break,
                _ = stopped(&mut shutdown) => {
                    info!(%match_id, "server shutting down; closing match");
                    break;
                }
            }
        }

        self.close().await;
    }

    fn register(&mut self, connection: PlayerConnection) {
        let match_id = self.snapshot.id;
        if self.snapshot.state == MatchState::Completed {
            debug!(%match_id, user_id = %connection.user_id, "match completed; refusing connection");
            return;
        }

        let user_id = connection.user_id.clone();
        self.connections.insert(connection.id, connection);
        info!(%match_id, %user_id, connected = self.connections.len(), "player connected");

        let payload = PlayerJoinedEvent {
            user_id,
            connected: self.connections.len(),
        };
        if let Some(envelope) = server_envelope(MessageKind::PlayerJoined, &payload) {
            self.broadcast(envelope);
        }
    }

    fn unregister(&mut self, connection_id: ConnectionId) {
        let Some(connection) = self.connections.shift_remove(&connection_id) else {
            return;
        };
        if let Some(notice) = self.disconnected(connection) {
            self.broadcast(notice);
        }
    }

    /// Serialize once, then try-send to every recipient. Connections whose queue is full or
    /// closed are dropped on the spot and announced with `player_left`.
    fn broadcast(&mut self, envelope: Envelope) {
        let mut queue = VecDeque::from([envelope]);

        while let Some(envelope) = queue.pop_front() {
            let message = match serde_json::to_string(&envelope) {
                Ok(text) => Message::Text(text.into()),
                Err(err) => {
                    warn!(kind = ?envelope.kind, error = %err, "failed to serialize broadcast");
                    continue;
                }
            };

            let stalled: Vec<ConnectionId> = self
                .connections
                .values()
                .filter(|connection| {
                    envelope
                        .to
                        .as_deref()
                        .is_none_or(|to| connection.user_id == to)
                })
                .filter(|connection| connection.sender.try_send(message.clone()).is_err())
                .map(|connection| connection.id)
                .collect();

            for connection_id in stalled {
                let Some(connection) = self.connections.shift_remove(&connection_id) else {
                    continue;
                };
                warn!(
                    match_id = %self.snapshot.id,
                    user_id = %connection.user_id,
                    "send queue full or closed; dropping connection"
                );
                if let Some(notice) = self.disconnected(connection) {
                    queue.push_back(notice);
                }
            }
        }
    }

    /// Bookkeeping once `connection` is out of the map. Its send queue closes when it is
    /// dropped here, which ends the writer task.
    fn disconnected(&mut self, connection: PlayerConnection) -> Option<Envelope> {
        let match_id = self.snapshot.id;
        let PlayerConnection { user_id, .. } = connection;
        info!(%match_id, %user_id, connected = self.connections.len(), "player disconnected");

        let still_connected = self
            .connections
            .values()
            .any(|connection| connection.user_id == user_id);
        if !still_connected {
            self.ready.remove(&user_id);
            if self.snapshot.player(&user_id).is_some() {
                self.mark_left(user_id.clone());
            }
        }

        server_envelope(
            MessageKind::PlayerLeft,
            &PlayerLeftEvent {
                user_id,
                connected: self.connections.len(),
            },
        )
    }

    /// Record the departure time without holding up the loop; scores and events stay.
    fn mark_left(&mut self, user_id: String) {
        let update = SessionUpdate::MarkLeft {
            user_id,
            at: SystemTime::now(),
        };
        let _ = self.snapshot.apply(&update);

        let slot = self.store.clone();
        let match_id = self.snapshot.id;
        tokio::spawn(async move {
            let Some(store) = slot.get().await else {
                warn!(%match_id, "no match store installed; departure not recorded");
                return;
            };
            if let Err(err) = store.update_session(match_id, update).await {
                warn!(%match_id, error = %err, "failed to record player departure");
            }
        });
    }

    async fn handle_signal(&mut self, signal: MatchSignal) {
        match signal {
            MatchSignal::Joined(player) => {
                if self.snapshot.player(&player.user_id).is_none() {
                    self.snapshot.players.push(player);
                }
            }
            MatchSignal::Ready { user_id } => self.mark_ready(user_id).await,
            MatchSignal::Pause(reply) => {
                let result = self.transition(MatchEvent::Pause).await;
                if result.is_ok() {
                    if let Some(deadline) = self.deadline.take() {
                        self.remaining =
                            Some(deadline.deadline().saturating_duration_since(Instant::now()));
                    }
                }
                let _ = reply.send(result);
            }
            MatchSignal::Resume(reply) => {
                let result = self.transition(MatchEvent::Resume).await;
                if result.is_ok() {
                    if let Some(remaining) = self.remaining.take() {
                        self.deadline = Some(Box::pin(sleep(remaining)));
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn mark_ready(&mut self, user_id: String) {
        let match_id = self.snapshot.id;
        if self.snapshot.state != MatchState::Lobby {
            debug!(%match_id, %user_id, state = ?self.snapshot.state, "ready ignored outside lobby");
            return;
        }
        if self.snapshot.player(&user_id).is_none() {
            warn!(%match_id, %user_id, "ready from a user outside the roster");
            return;
        }

        self.ready.insert(user_id);
        if !self.everyone_ready() {
            return;
        }

        if self.transition(MatchEvent::AllReady).await.is_ok() {
            self.countdown = Some(Box::pin(sleep(self.settings.countdown)));
        }
    }

    /// Roster full and every connected player ready.
    fn everyone_ready(&self) -> bool {
        !self.connections.is_empty()
            && self.snapshot.players.len() == self.snapshot.config.max_players as usize
            && self
                .connections
                .values()
                .all(|connection| self.ready.contains(&connection.user_id))
    }

    async fn activate(&mut self) {
        self.countdown = None;
        if self.transition(MatchEvent::CountdownElapsed).await.is_ok() {
            if let Some(secs) = self.snapshot.config.duration_secs {
                self.deadline = Some(Box::pin(sleep(Duration::from_secs(secs))));
            }
        }
    }

    /// Apply `event`, persist the new state, and announce it.
    async fn transition(&mut self, event: MatchEvent) -> Result<MatchState, InvalidTransition> {
        let next = self.advance(event)?;
        let match_id = self.snapshot.id;
        let Some(store) = self.current_store().await else {
            return Ok(next);
        };
        if let Err(err) = store
            .update_session(match_id, SessionUpdate::SetState(next))
            .await
        {
            warn!(%match_id, state = ?next, error = %err, "failed to persist match state");
        }
        Ok(next)
    }

    /// In-memory half of a transition: snapshot, watchers, `state_changed` broadcast.
    fn advance(&mut self, event: MatchEvent) -> Result<MatchState, InvalidTransition> {
        let match_id = self.snapshot.id;
        let previous = self.snapshot.state;
        let next = next_state(previous, event).inspect_err(|err| {
            warn!(%match_id, error = %err, "rejected match transition");
        })?;

        self.snapshot.state = next;
        self.state_tx.send_replace(next);
        info!(%match_id, from = ?previous, to = ?next, "match state changed");

        let payload = StateChangedEvent {
            previous: previous.as_str().to_owned(),
            state: next.as_str().to_owned(),
        };
        if let Some(envelope) = server_envelope(MessageKind::StateChanged, &payload) {
            self.broadcast(envelope);
        }
        Ok(next)
    }

    /// Rank the roster, persist results, broadcast `match_end`, and arm the teardown timer.
    async fn complete(&mut self) {
        let match_id = self.snapshot.id;
        if self.snapshot.state == MatchState::Completed {
            debug!(%match_id, "match already completed");
            return;
        }

        // Scores are written by the connections directly; start from the stored roster.
        let store = self.current_store().await;
        if let Some(store) = &store {
            match store.find_session(match_id).await {
                Ok(Some(stored)) => self.snapshot.players = stored.players,
                Ok(None) => {
                    warn!(%match_id, "session missing from storage; ranking in-memory roster")
                }
                Err(err) => {
                    warn!(%match_id, error = %err, "failed to reload session; ranking in-memory roster")
                }
            }
        }

        if self.advance(MatchEvent::Finish).is_err() {
            return;
        }
        self.countdown = None;
        self.deadline = None;
        self.remaining = None;

        let results = calculate_rankings(&self.snapshot.players);
        let update = SessionUpdate::Complete {
            results: results.clone(),
            completed_at: SystemTime::now(),
        };
        let _ = self.snapshot.apply(&update);
        if let Some(store) = store {
            if let Err(err) = store.update_session(match_id, update).await {
                warn!(%match_id, error = %err, "failed to persist match results");
            }
        }

        info!(%match_id, winner = ?results.winner, "match completed");
        let payload = MatchEndEvent {
            match_id: match_id.to_string(),
            results: MatchResultDto::from(&results),
        };
        if let Some(envelope) = server_envelope(MessageKind::MatchEnd, &payload) {
            self.broadcast(envelope);
        }

        self.teardown = Some(Box::pin(sleep(self.settings.grace_period)));
    }

    /// Reload the stored session and push a `state_sync` to everybody. Storage errors skip
    /// the tick.
    async fn sync(&mut self) {
        if self.connections.is_empty() || self.snapshot.state == MatchState::Completed {
            return;
        }

        let match_id = self.snapshot.id;
        let Some(store) = self.current_store().await else {
            return;
        };
        match store.find_session(match_id).await {
            Ok(Some(stored)) => {
                // Lifecycle state is owned here; storage may lag behind it.
                let state = self.snapshot.state;
                self.snapshot = MatchSession { state, ..stored };
            }
            Ok(None) => {
                warn!(%match_id, "session missing from storage; skipping sync");
                return;
            }
            Err(err) => {
                debug!(%match_id, error = %err, "failed to reload session; skipping sync");
                return;
            }
        }

        let payload = StateSyncEvent(MatchSessionDto::from(&self.snapshot));
        if let Some(envelope) = server_envelope(MessageKind::StateSync, &payload) {
            self.broadcast(envelope);
        }
    }

    /// Store installed right now; `None` while the application is degraded.
    async fn current_store(&self) -> Option<Arc<dyn MatchStore>> {
        let store = self.store.get().await;
        if store.is_none() {
            debug!(match_id = %self.snapshot.id, "no match store installed");
        }
        store
    }

    async fn close(mut self) {
        let match_id = self.snapshot.id;
        let closed = self.connections.len();
        self.connections.clear();
        self.registry.remove(match_id).await;
        info!(%match_id, closed, "match coordinator stopped");
    }
}

fn server_envelope<T: serde::Serialize>(kind: MessageKind, payload: &T) -> Option<Envelope> {
    Envelope::server(kind, payload)
        .inspect_err(|err| warn!(?kind, error = %err, "failed to encode payload"))
        .ok()
}

/// Resolves once the registry asks every match to stop. Yields `()` so no watch guard is
/// held by the select output.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn wait(timer: &mut Timer) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
