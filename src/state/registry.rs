use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::Message;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::CoordinatorSettings,
    dao::models::{MatchPlayer, MatchSession, MatchState},
    dto::ws::Envelope,
    state::{StoreSlot, coordinator::Coordinator, state_machine::InvalidTransition},
};

/// Identifier of one WebSocket attachment; a user may hold several.
pub type ConnectionId = Uuid;

/// Reply channel for control-plane transitions.
pub type TransitionReply = oneshot::Sender<Result<MatchState, InvalidTransition>>;

/// Outbound side of a player's connection, owned by the coordinator once registered.
#[derive(Debug)]
pub struct PlayerConnection {
    /// Unique per attachment.
    pub id: ConnectionId,
    /// Roster member owning the socket.
    pub user_id: String,
    /// Bounded queue drained by the connection's writer task.
    pub sender: mpsc::Sender<Message>,
}

impl PlayerConnection {
    /// Create a connection for `user_id` together with the receiving end of its send queue.
    pub fn new(user_id: String, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                id: Uuid::new_v4(),
                user_id,
                sender,
            },
            receiver,
        )
    }
}

/// Requests that need the coordinator's view of the match.
#[derive(Debug)]
pub enum MatchSignal {
    /// A player was added to the persisted roster.
    Joined(MatchPlayer),
    /// A connected player declared themselves ready.
    Ready {
        /// Player who sent `ready`.
        user_id: String,
    },
    /// Control plane asks for active → paused.
    Pause(TransitionReply),
    /// Control plane asks for paused → active.
    Resume(TransitionReply),
}

/// The coordinator behind a handle has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("match `{0}` is no longer live")]
pub struct MatchClosed(pub Uuid);

/// Cloneable sending side of a live match. Every interaction with the coordinator goes
/// through these channels.
#[derive(Clone, Debug)]
pub struct MatchHandle {
    id: Uuid,
    register: mpsc::Sender<PlayerConnection>,
    unregister: mpsc::Sender<ConnectionId>,
    broadcast: mpsc::Sender<Envelope>,
    done: mpsc::Sender<()>,
    signals: mpsc::Sender<MatchSignal>,
    state: watch::Receiver<MatchState>,
}

/// Receiving side of the channels, consumed by the coordinator task.
pub(crate) struct Inbox {
    pub register: mpsc::Receiver<PlayerConnection>,
    pub unregister: mpsc::Receiver<ConnectionId>,
    pub broadcast: mpsc::Receiver<Envelope>,
    pub done: mpsc::Receiver<()>,
    pub signals: mpsc::Receiver<MatchSignal>,
}

impl MatchHandle {
    pub(crate) fn channel(
        id: Uuid,
        initial: MatchState,
        capacity: usize,
    ) -> (Self, Inbox, watch::Sender<MatchState>) {
        let (register, register_rx) = mpsc::channel(capacity);
        let (unregister, unregister_rx) = mpsc::channel(capacity);
        let (broadcast, broadcast_rx) = mpsc::channel(capacity);
        let (done, done_rx) = mpsc::channel(1);
        let (signals, signals_rx) = mpsc::channel(capacity);
        let (state_tx, state) = watch::channel(initial);

        let handle = Self {
            id,
            register,
            unregister,
            broadcast,
            done,
            signals,
            state,
        };
        let inbox = Inbox {
            register: register_rx,
            unregister: unregister_rx,
            broadcast: broadcast_rx,
            done: done_rx,
            signals: signals_rx,
        };
        (handle, inbox, state_tx)
    }

    /// Match this handle talks to.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Lifecycle state as last published by the coordinator.
    pub fn state(&self) -> MatchState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<MatchState> {
        self.state.clone()
    }

    /// Hand `connection` to the coordinator, which announces it with `player_joined`.
    pub async fn register(&self, connection: PlayerConnection) -> Result<(), MatchClosed> {
        self.register
            .send(connection)
            .await
            .map_err(|_| MatchClosed(self.id))
    }

    /// Detach a connection. Unknown or already removed ids are ignored.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Result<(), MatchClosed> {
        self.unregister
            .send(connection_id)
            .await
            .map_err(|_| MatchClosed(self.id))
    }

    /// Queue `envelope` for fan-out to every connection (or to `envelope.to` only).
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), MatchClosed> {
        self.broadcast
            .send(envelope)
            .await
            .map_err(|_| MatchClosed(self.id))
    }

    /// Ask the coordinator to complete the match. Repeated calls are harmless.
    pub async fn finish(&self) -> Result<(), MatchClosed> {
        match self.done.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(MatchClosed(self.id)),
        }
    }

    /// Forward a roster, readiness or control request to the coordinator.
    pub async fn signal(&self, signal: MatchSignal) -> Result<(), MatchClosed> {
        self.signals
            .send(signal)
            .await
            .map_err(|_| MatchClosed(self.id))
    }

    /// Request active → paused and wait for the outcome.
    pub async fn pause(&self) -> Result<Result<MatchState, InvalidTransition>, MatchClosed> {
        self.request(MatchSignal::Pause).await
    }

    /// Request paused → active and wait for the outcome.
    pub async fn resume(&self) -> Result<Result<MatchState, InvalidTransition>, MatchClosed> {
        self.request(MatchSignal::Resume).await
    }

    async fn request(
        &self,
        build: fn(TransitionReply) -> MatchSignal,
    ) -> Result<Result<MatchState, InvalidTransition>, MatchClosed> {
        let (reply, response) = oneshot::channel();
        self.signal(build(reply)).await?;
        response.await.map_err(|_| MatchClosed(self.id))
    }
}

/// Directory of live matches. Owned by the application state; the lock is only held for
/// lookups and map edits.
#[derive(Clone)]
pub struct MatchRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    matches: RwLock<HashMap<Uuid, MatchHandle>>,
    shutdown: watch::Sender<bool>,
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let (shutdown, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                matches: RwLock::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Spawn the coordinator task for `session` and publish its handle.
    pub async fn start(
        &self,
        session: MatchSession,
        store: StoreSlot,
        settings: CoordinatorSettings,
    ) -> MatchHandle {
        let id = session.id;
        let (handle, inbox, state_tx) =
            MatchHandle::channel(id, session.state, settings.channel_capacity);
        // Published before the task runs so the coordinator's own removal always finds it.
        self.inner.matches.write().await.insert(id, handle.clone());

        let coordinator = Coordinator::new(session, store, settings, self.clone(), state_tx);
        tokio::spawn(coordinator.run(inbox, self.inner.shutdown.subscribe()));
        debug!(match_id = %id, "match registered");
        handle
    }

    /// Handle of the live match `id`, if its coordinator is still running.
    pub async fn get(&self, id: Uuid) -> Option<MatchHandle> {
        self.inner.matches.read().await.get(&id).cloned()
    }

    /// Identifiers of every live match.
    pub async fn live_matches(&self) -> Vec<Uuid> {
        self.inner.matches.read().await.keys().copied().collect()
    }

    /// Drop the entry for `id`; only called by the match's own coordinator.
    pub(crate) async fn remove(&self, id: Uuid) -> bool {
        self.inner.matches.write().await.remove(&id).is_some()
    }

    /// Stop every coordinator: connections are closed without computing results.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }
}
