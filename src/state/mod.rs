mod coordinator;
pub mod registry;
pub mod state_machine;

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::{config::AppConfig, dao::match_store::MatchStore, error::ServiceError};

pub use self::registry::{MatchHandle, MatchRegistry};

/// Application state shared across handlers and background tasks.
pub type SharedState = Arc<AppState>;

/// Shared slot holding the currently installed match store.
///
/// Coordinators keep a clone and resolve the store on every use, so a store swapped in by the
/// supervisor is picked up by live matches too.
#[derive(Clone, Default)]
pub struct StoreSlot(Arc<RwLock<Option<Arc<dyn MatchStore>>>>);

impl StoreSlot {
    /// Slot with `store` already installed.
    pub fn installed(store: Arc<dyn MatchStore>) -> Self {
        Self(Arc::new(RwLock::new(Some(store))))
    }

    /// Current store, if any.
    pub async fn get(&self) -> Option<Arc<dyn MatchStore>> {
        self.0.read().await.as_ref().cloned()
    }

    /// Replace the installed store.
    pub async fn set(&self, store: Arc<dyn MatchStore>) {
        *self.0.write().await = Some(store);
    }
}

/// Central application state: the storage handle, the live-match registry and configuration.
pub struct AppState {
    store: StoreSlot,
    registry: MatchRegistry,
    config: AppConfig,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            store: StoreSlot::default(),
            registry: MatchRegistry::new(),
            config,
            degraded: degraded_tx,
        })
    }

    /// Convenience constructor with a store already installed.
    pub async fn with_store(config: AppConfig, store: Arc<dyn MatchStore>) -> SharedState {
        let state = Self::new(config);
        state.set_store(store).await;
        state
    }

    /// Obtain a handle to the current store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn MatchStore>> {
        self.store.get().await
    }

    /// Slot handed to coordinators so they follow store replacements.
    pub fn store_slot(&self) -> StoreSlot {
        self.store.clone()
    }

    /// Current store, or [`ServiceError::Degraded`] when none is installed.
    pub async fn require_store(&self) -> Result<Arc<dyn MatchStore>, ServiceError> {
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new store implementation and leave degraded mode.
    pub async fn set_store(&self, store: Arc<dyn MatchStore>) {
        self.store.set(store).await;
        self.update_degraded(false).await;
    }

    /// Current degraded flag.
    pub async fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub async fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Directory of live matches.
    pub fn registry(&self) -> &MatchRegistry {
        &self.registry
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
