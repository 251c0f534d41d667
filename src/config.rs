//! Application-level configuration loading, mostly the live-match timings.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "STUDY_ARENA_CONFIG_PATH";

/// Timings and capacities used by match coordinators and player connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Delay between `countdown` and `active`.
    pub countdown: Duration,
    /// How long a completed match keeps its connections open before tearing down.
    pub grace_period: Duration,
    /// Period of the storage re-sync / `state_sync` broadcast.
    pub sync_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
    /// Capacity of the coordinator's inbound channels.
    pub channel_capacity: usize,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Read deadline, refreshed whenever a pong arrives.
    pub read_deadline: Duration,
    /// Deadline for writing a single frame.
    pub write_deadline: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(3),
            grace_period: Duration::from_secs(5),
            sync_interval: Duration::from_secs(1),
            send_queue_capacity: 256,
            channel_capacity: 256,
            ping_interval: Duration::from_secs(54),
            read_deadline: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    coordinator: CoordinatorSettings,
}

impl AppConfig {
    /// Build a configuration around explicit coordinator settings.
    pub fn new(coordinator: CoordinatorSettings) -> Self {
        Self { coordinator }
    }

    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        settings = ?app_config.coordinator,
                        "loaded coordinator settings from config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Settings handed to every coordinator and connection.
    pub fn coordinator(&self) -> &CoordinatorSettings {
        &self.coordinator
    }
}

#[derive(Debug, Default, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde(default)]
    coordinator: RawCoordinator,
}

#[derive(Debug, Default, Deserialize)]
/// Millisecond-based overrides; absent keys keep their defaults.
struct RawCoordinator {
    countdown_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    sync_interval_ms: Option<u64>,
    send_queue_capacity: Option<usize>,
    channel_capacity: Option<usize>,
    ping_interval_ms: Option<u64>,
    read_deadline_ms: Option<u64>,
    write_deadline_ms: Option<u64>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let raw = value.coordinator;
        let defaults = CoordinatorSettings::default();
        let millis = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        Self {
            coordinator: CoordinatorSettings {
                countdown: millis(raw.countdown_ms, defaults.countdown),
                grace_period: millis(raw.grace_period_ms, defaults.grace_period),
                sync_interval: millis(raw.sync_interval_ms, defaults.sync_interval),
                send_queue_capacity: raw
                    .send_queue_capacity
                    .filter(|capacity| *capacity > 0)
                    .unwrap_or(defaults.send_queue_capacity),
                channel_capacity: raw
                    .channel_capacity
                    .filter(|capacity| *capacity > 0)
                    .unwrap_or(defaults.channel_capacity),
                ping_interval: millis(raw.ping_interval_ms, defaults.ping_interval),
                read_deadline: millis(raw.read_deadline_ms, defaults.read_deadline),
                write_deadline: millis(raw.write_deadline_ms, defaults.write_deadline),
            },
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
