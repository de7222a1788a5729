//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Orchestration engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts per non-terminal step before the run is marked failed.
    pub max_step_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_backoff: Duration,
    /// Edit cycles allowed before the run fails.
    pub max_revisions: u32,
    /// Supervisor visits allowed within one writer cycle.
    pub max_supervisor_visits: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            max_revisions: 3,
            max_supervisor_visits: 8,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `AGENT_INBOX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_step_attempts: env_parse("AGENT_INBOX_MAX_ATTEMPTS", defaults.max_step_attempts)?
                .max(1),
            retry_backoff: Duration::from_millis(env_parse(
                "AGENT_INBOX_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )?),
            max_revisions: env_parse("AGENT_INBOX_MAX_REVISIONS", defaults.max_revisions)?,
            max_supervisor_visits: defaults.max_supervisor_visits,
        })
    }
}

/// Ingestion poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often the scheduler invokes `poll()`.
    pub interval: Duration,
    /// Most-recent messages fetched per poll.
    pub batch_limit: usize,
    /// Sender allowlist. Empty means everyone.
    pub allowed_senders: Vec<String>,
    /// The mailbox's own address; messages from it are skipped.
    pub own_address: Option<String>,
    /// How long an ingestion claim holds before another poller may take it.
    pub claim_lease: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_limit: 10,
            allowed_senders: Vec::new(),
            own_address: None,
            claim_lease: Duration::from_secs(600),
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let allowed_senders = std::env::var("AGENT_INBOX_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            interval: Duration::from_secs(env_parse(
                "AGENT_INBOX_POLL_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            batch_limit: env_parse("AGENT_INBOX_POLL_LIMIT", defaults.batch_limit)?,
            allowed_senders,
            own_address: std::env::var("EMAIL_FROM_ADDRESS").ok(),
            claim_lease: Duration::from_secs(env_parse(
                "AGENT_INBOX_CLAIM_LEASE_SECS",
                defaults.claim_lease.as_secs(),
            )?),
        })
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
