use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{match_store::MatchStore, storage::StorageError},
    state::SharedState,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Connect to the match store, then poll its health for as long as the process runs.
///
/// The shared state stays in degraded mode while no healthy store is available; a store whose
/// reconnect attempts are exhausted is replaced by a fresh connection.
pub async fn run<F, Fut>(state: SharedState, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn MatchStore>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(store) => {
                state.set_store(store.clone()).await;
                info!("match store connected; leaving degraded mode");
                delay = INITIAL_DELAY;

                monitor(&state, store.as_ref()).await;
                warn!("match store lost; reconnecting from scratch");
            }
            Err(err) => warn!(error = %err, "match store connection attempt failed"),
        }

        sleep(delay).await;
        delay = next_delay(delay);
    }
}

/// Poll `store` until it fails and cannot be revived in place.
async fn monitor(state: &SharedState, store: &dyn MatchStore) {
    loop {
        if store.health_check().await.is_ok() {
            if state.is_degraded().await {
                info!("match store healthy again; leaving degraded mode");
                state.update_degraded(false).await;
            }
            sleep(HEALTH_POLL_INTERVAL).await;
            continue;
        }

        if !reconnect(state, store).await {
            return;
        }
        state.update_degraded(false).await;
        sleep(HEALTH_POLL_INTERVAL).await;
    }
}

/// Retry `try_reconnect` with backoff. Degraded mode is entered on the first failure.
async fn reconnect(state: &SharedState, store: &dyn MatchStore) -> bool {
    let mut delay = INITIAL_DELAY;

    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        match store.try_reconnect().await {
            Ok(()) => {
                info!(attempt, "match store reconnected after failed health check");
                return true;
            }
            Err(err) => {
                warn!(attempt, error = %err, "match store reconnect attempt failed");
                if attempt == 0 {
                    state.update_degraded(true).await;
                }
                sleep(delay).await;
                delay = next_delay(delay);
            }
        }
    }

    warn!("exhausted match store reconnect attempts; staying in degraded mode");
    false
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use crate::{config::AppConfig, dao::match_store::InMemoryMatchStore, state::AppState};

    use super::*;

    #[test]
    fn backoff_is_capped() {
        let mut delay = INITIAL_DELAY;
        for _ in 0..10 {
            delay = next_delay(delay);
        }
        assert_eq!(delay, MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_flag_follows_store_health() {
        let state = AppState::new(AppConfig::default());
        assert!(state.is_degraded().await);

        let store = InMemoryMatchStore::new();
        let connected = store.clone();
        tokio::spawn(run(state.clone(), move || {
            let store = connected.clone();
            async move { Ok(Arc::new(store) as Arc<dyn MatchStore>) }
        }));

        let mut degraded = state.degraded_watcher();
        degraded.wait_for(|value| !*value).await.unwrap();
        assert!(state.store().await.is_some());

        store.set_offline(true);
        degraded.wait_for(|value| *value).await.unwrap();

        store.set_offline(false);
        degraded.wait_for(|value| !*value).await.unwrap();
    }
}
