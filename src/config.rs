//! Runtime configuration for sessions, commands and the job scheduler.
//!
//! Every knob has a default, so `LrConfig::default()` is a working setup.
//! A TOML file may override any subset of the fields:
//!
//! ```toml
//! max_workers = 4
//! keepalive_sessions = true
//!
//! [command]
//! interval_secs = 0.25
//! timeout_secs = 60
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{CbError, Result};

/// Controls how often and for how long a resource is polled until it reaches
/// a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// How long to wait between consecutive poll requests.
    pub interval: Duration,
    /// Maximum total time to spend polling before returning a timeout error.
    pub timeout: Duration,
}

impl PollConfig {
    /// Creates a new `PollConfig` with the specified interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        PollConfig { interval, timeout }
    }

    /// Command polling defaults: every 0.5s for up to 2 minutes.
    pub fn command() -> Self {
        PollConfig::new(Duration::from_millis(500), Duration::from_secs(120))
    }

    /// Session start defaults: every second for up to 6 minutes.
    pub fn session() -> Self {
        PollConfig::new(Duration::from_secs(1), Duration::from_secs(360))
    }

    fn overridden_by(self, file: PollConfigFile) -> Self {
        PollConfig {
            interval: file.interval_secs.unwrap_or(self.interval),
            timeout: file.timeout_secs.unwrap_or(self.timeout),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig::command()
    }
}

/// A `[command]` or `[session]` table; missing keys keep the section's
/// defaults.
#[derive(Deserialize)]
struct PollConfigFile {
    #[serde(default, deserialize_with = "deserialize_opt_secs")]
    interval_secs: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_secs")]
    timeout_secs: Option<Duration>,
}

fn deserialize_command_poll<'de, D>(deserializer: D) -> std::result::Result<PollConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(PollConfig::command().overridden_by(PollConfigFile::deserialize(deserializer)?))
}

fn deserialize_session_poll<'de, D>(deserializer: D) -> std::result::Result<PollConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(PollConfig::session().overridden_by(PollConfigFile::deserialize(deserializer)?))
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
}

fn deserialize_opt_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_secs(deserializer).map(Some)
}

/// Top-level configuration for an [`LrManager`](crate::manager::LrManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LrConfig {
    /// Polling of submitted commands.
    #[serde(deserialize_with = "deserialize_command_poll")]
    pub command: PollConfig,
    /// Polling of a freshly created session until it is active.
    #[serde(deserialize_with = "deserialize_session_poll")]
    pub session: PollConfig,
    /// Number of submission attempts for a command when the session keeps
    /// being reported as gone.
    pub submit_retries: u32,
    /// Upper bound on concurrently running job workers.
    pub max_workers: usize,
    /// Cache sessions across `request_session` calls and keep them alive.
    pub keepalive_sessions: bool,
    /// Delay between keepalive rounds.
    #[serde(rename = "keepalive_interval_secs", deserialize_with = "deserialize_secs")]
    pub keepalive_interval: Duration,
    /// Base delay before respawning a worker whose session failed to start.
    #[serde(rename = "spawn_backoff_secs", deserialize_with = "deserialize_secs")]
    pub spawn_backoff: Duration,
    /// Consecutive establishment failures after which an endpoint's queued
    /// jobs are failed.
    pub max_spawn_failures: u32,
    /// Ask the server to hold command status requests until completion.
    pub command_wait: bool,
}

impl Default for LrConfig {
    fn default() -> Self {
        LrConfig {
            command: PollConfig::command(),
            session: PollConfig::session(),
            submit_retries: 5,
            max_workers: 10,
            keepalive_sessions: false,
            keepalive_interval: Duration::from_secs(30),
            spawn_backoff: Duration::from_secs(1),
            max_spawn_failures: 3,
            command_wait: false,
        }
    }
}

impl LrConfig {
    /// Parses a TOML document, filling unspecified fields with defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LrConfig = toml::from_str(text).map_err(|e| CbError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(CbError::Config {
                message: "max_workers must be at least 1".to_string(),
            });
        }
        if self.submit_retries == 0 {
            return Err(CbError::Config {
                message: "submit_retries must be at least 1".to_string(),
            });
        }
        if self.max_spawn_failures == 0 {
            return Err(CbError::Config {
                message: "max_spawn_failures must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
