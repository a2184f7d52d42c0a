//! Engine configuration loading: default time control, clock cadence, rating and matchmaking knobs.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};
use validator::{Validate, ValidationError};

use crate::state::session::TimeControl;

/// Default location on disk where the engine looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/engine.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "CHESS_DUEL_CONFIG_PATH";

/// Immutable runtime configuration shared across the engine.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Time control applied to sessions created without an explicit one.
    #[validate(nested)]
    pub time_control: TimeControl,
    /// Local clock cadence.
    #[validate(nested)]
    pub clock: ClockConfig,
    /// Elo settings.
    #[validate(nested)]
    pub rating: RatingConfig,
    /// Random pairing settings.
    #[validate(nested)]
    pub matchmaking: MatchmakingConfig,
}

/// Cadence of the local clock driver.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_clock"))]
pub struct ClockConfig {
    /// Interval between local clock evaluations.
    #[validate(range(min = 10))]
    pub tick_ms: u64,
    /// How often the mover pushes its remaining time to the store.
    pub sync_interval_ms: u64,
}

impl ClockConfig {
    /// [`Self::tick_ms`] as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// [`Self::sync_interval_ms`] as a duration.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            sync_interval_ms: 1_000,
        }
    }
}

fn validate_clock(clock: &ClockConfig) -> Result<(), ValidationError> {
    if clock.sync_interval_ms < clock.tick_ms {
        return Err(ValidationError::new("sync_interval_below_tick"));
    }
    Ok(())
}

/// Elo parameters.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct RatingConfig {
    /// Rating assumed for players without a rating record.
    #[validate(range(min = 0))]
    pub initial: i32,
    /// Largest rating change a single game can cause.
    #[validate(range(min = 1.0, max = 100.0))]
    pub k_factor: f64,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            initial: 1200,
            k_factor: 32.0,
        }
    }
}

/// Random pairing knobs.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// How long a search waits for an opponent.
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    /// Upper bound of the random pause after losing a pairing race.
    pub retry_jitter_ms: u64,
    /// Widest accepted rating difference; unlimited when absent.
    pub max_rating_gap: Option<u32>,
}

impl MatchmakingConfig {
    /// [`Self::timeout_ms`] as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            retry_jitter_ms: 250,
            max_rating_gap: None,
        }
    }
}

impl EngineConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        base_ms = config.time_control.base_ms,
                        increment_ms = config.time_control.increment_ms,
                        "loaded engine config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "invalid engine config; falling back to defaults"
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

    /// Parse and validate a JSON document.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}

/// Reasons a configuration file is rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Not valid JSON for the config shape.
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    /// Values outside their accepted ranges.
    #[error("config validation failed: {0}")]
    Invalid(#[from] validator::ValidationErrors),
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
    fn partial_file_keeps_other_defaults() {
        let config = EngineConfig::parse(
            r#"{"time_control": {"baseMs": 180000, "incrementMs": 2000},
                "matchmaking": {"max_rating_gap": 300}}"#,
        )
        .unwrap();
        assert_eq!(config.time_control.base_ms, 180_000);
        assert_eq!(config.time_control.increment_ms, 2_000);
        assert_eq!(config.matchmaking.max_rating_gap, Some(300));
        assert_eq!(config.matchmaking.timeout_ms, 120_000);
        assert_eq!(config.clock.tick_ms, 100);
        assert_eq!(config.rating.initial, 1200);
    }

    #[test]
    fn empty_object_is_the_default_config() {
        let config = EngineConfig::parse("{}").unwrap();
        assert_eq!(config.time_control, TimeControl::default());
        assert_eq!(config.rating.k_factor, 32.0);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = EngineConfig::parse(r#"{"time_control": {"baseMs": 10, "incrementMs": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::parse(r#"{"clock": {"tick_ms": 500, "sync_interval_ms": 100}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::parse("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
