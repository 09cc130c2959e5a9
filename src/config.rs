//! Application-level configuration loading for the server and the observing clients.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

use crate::rules::{
    rotation::{DEFAULT_CROWD_LIMIT, RotationPolicy},
    streak::DEFAULT_STREAK_THRESHOLD,
};

/// Default location on disk where the binaries look for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PELADA_LIVE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Streak and crowd rules.
    pub rules: RuleSettings,
    /// Match clock, read from the `match` section.
    #[serde(rename = "match")]
    pub clock: ClockSettings,
    /// Client sync cadence.
    pub sync: SyncSettings,
    /// Server tunables.
    pub server: ServerSettings,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    let config = config.normalized();
                    info!(
                        path = %path.display(),
                        threshold = config.rules.streak_threshold,
                        crowd_limit = config.rules.crowd_limit,
                        "loaded configuration"
                    );
                    config
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

    fn normalized(mut self) -> Self {
        self.rules.streak_threshold = self.rules.streak_threshold.max(1);
        self.sync.failure_cap = self.sync.failure_cap.max(1);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Streak and rotation tunables.
pub struct RuleSettings {
    /// Consecutive wins after which a streak saturates (floored to 1).
    pub streak_threshold: u32,
    /// Head count above which everybody rotates.
    pub crowd_limit: usize,
    /// Default value of the "many-present" override.
    pub many_present: bool,
}

impl RuleSettings {
    /// Rotation policy for one finish, with the override chosen at finish time.
    pub fn policy(&self, many_present: bool) -> RotationPolicy {
        RotationPolicy {
            many_present,
            streak_threshold: self.streak_threshold.max(1),
            crowd_limit: self.crowd_limit,
        }
    }
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            streak_threshold: DEFAULT_STREAK_THRESHOLD,
            crowd_limit: DEFAULT_CROWD_LIMIT,
            many_present: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Match clock and overtime alarm.
pub struct ClockSettings {
    /// Regulation time; the alarm starts after it.
    pub duration_secs: u64,
    /// Clock refresh cadence.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "tick_ms")]
    pub tick: Duration,
    /// Interval between overtime alarm sounds.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "alarm_cadence_ms")]
    pub alarm_cadence: Duration,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            duration_secs: 600,
            tick: Duration::from_millis(1_000),
            alarm_cadence: Duration::from_millis(1_200),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Live sync channel and offline queue cadence.
pub struct SyncSettings {
    /// Fallback poll cadence.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Consecutive stream failures before the fallback poll starts.
    pub poll_after_failures: u32,
    /// Upper bound of the failure counter.
    pub failure_cap: u32,
    /// Periodic offline queue drain.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "drain_interval_ms")]
    pub drain_interval: Duration,
    /// Delay before re-reading a finished match.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "finish_refresh_delay_ms")]
    pub finish_refresh_delay: Duration,
    /// First reconnect delay; doubles per failure.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "reconnect_base_ms")]
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "reconnect_max_ms")]
    pub reconnect_max: Duration,
    /// Weight of each new sample in the clock-skew moving average.
    pub skew_weight: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(4_000),
            poll_after_failures: 5,
            failure_cap: 10,
            drain_interval: Duration::from_millis(5_000),
            finish_refresh_delay: Duration::from_millis(2_000),
            reconnect_base: Duration::from_millis(1_000),
            reconnect_max: Duration::from_secs(10),
            skew_weight: 0.2,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Authoritative server tunables.
pub struct ServerSettings {
    /// Keep-alive ping cadence on every stream.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "ping_interval_ms")]
    pub ping_interval: Duration,
    /// Capacity of each per-match broadcast channel.
    pub channel_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            channel_capacity: 64,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config: AppConfig = serde_json::from_str(
            r#"{ "rules": { "streak_threshold": 0 }, "sync": { "poll_interval_ms": 2500 } }"#,
        )
        .unwrap();
        let config = config.normalized();

        assert_eq!(config.rules.streak_threshold, 1);
        assert_eq!(config.rules.crowd_limit, DEFAULT_CROWD_LIMIT);
        assert_eq!(config.sync.poll_interval, Duration::from_millis(2_500));
        assert_eq!(config.sync.drain_interval, Duration::from_secs(5));
        assert_eq!(config.clock.alarm_cadence, Duration::from_millis(1_200));
    }

    #[test]
    fn policy_carries_override_choice() {
        let rules = RuleSettings::default();
        let policy = rules.policy(true);
        assert!(policy.many_present);
        assert_eq!(policy.streak_threshold, 3);
        assert_eq!(policy.crowd_limit, 17);
    }
}
