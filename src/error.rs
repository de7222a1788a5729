//! Error types for Agent Inbox.

use std::time::Duration;

use uuid::Uuid;

use crate::workflow::state::{RunStatus, StepName};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors for the checkpoint, dedup and run-history stores.
///
/// Any of these leaves a run in its last durable state; the whole operation
/// is safe to retry.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to fetch from mailbox {name}: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send on mailbox {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A source message that cannot start a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message is missing required field: {0}")]
    MissingField(&'static str),
}

/// Failure inside a single step execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    /// Text generation or collaborator call failed; worth retrying.
    #[error("Transient failure in {step}: {reason}")]
    Transient { step: StepName, reason: String },

    /// The step produced output that could not be interpreted.
    #[error("Malformed output from {step}: {reason}")]
    Malformed { step: StepName, reason: String },

    /// The external side effect failed. Never retried.
    #[error("Side effect failed in {step}: {reason}")]
    SideEffect { step: StepName, reason: String },
}

impl StepError {
    /// Whether the engine may re-run the step.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::SideEffect { .. })
    }

    pub fn transient(step: StepName, reason: impl Into<String>) -> Self {
        Self::Transient {
            step,
            reason: reason.into(),
        }
    }

    pub fn malformed(step: StepName, reason: impl Into<String>) -> Self {
        Self::Malformed {
            step,
            reason: reason.into(),
        }
    }
}

/// Orchestration engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Run {id} not found")]
    NotFound { id: Uuid },

    #[error("Run {id} is {status}, cannot {operation}")]
    InvalidState {
        id: Uuid,
        status: RunStatus,
        operation: String,
    },

    #[error("Invariant violated in run {id}: {reason}")]
    InvariantViolation { id: Uuid, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
