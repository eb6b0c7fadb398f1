//! Configuration management for the sync agent.

use std::env;
use std::time::Duration;

use crate::coordinator::SyncConfig;

const DEFAULT_DATABASE_URL: &str = "sqlite://tally.db?mode=rwc";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the sync and query endpoints; only needed to sync
    pub server_url: Option<String>,
    /// SQLite connection URL of the local store
    pub database_url: String,
    /// Time between periodic sync passes
    pub sync_interval: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_url = lookup("TALLY_SERVER_URL").filter(|v| !v.trim().is_empty());

        let database_url =
            lookup("TALLY_DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let sync_interval = seconds(
            &lookup,
            "TALLY_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        )?;
        let request_timeout = seconds(
            &lookup,
            "TALLY_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;

        let auth_token = lookup("TALLY_AUTH_TOKEN").filter(|v| !v.is_empty());

        Ok(Self {
            server_url,
            database_url,
            sync_interval,
            request_timeout,
            auth_token,
        })
    }

    /// The server URL, for commands that talk to the server.
    pub fn require_server_url(&self) -> Result<&str, ConfigError> {
        self.server_url
            .as_deref()
            .ok_or(ConfigError::MissingServerUrl)
    }

    /// Coordinator settings derived from this configuration.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: self.sync_interval,
            ..SyncConfig::default()
        }
    }
}

fn seconds<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => secs,
            _ => return Err(ConfigError::InvalidDuration { name, value: raw }),
        },
    };
    Ok(Duration::from_secs(secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TALLY_SERVER_URL environment variable is required")]
    MissingServerUrl,

    #[error("{name} must be a positive number of seconds, got '{value}'")]
    InvalidDuration { name: &'static str, value: String },
}
