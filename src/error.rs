//! Error types for PageForge.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// External collaborator errors (completion, keyword, and embedding providers).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} temporarily overloaded")]
    Overloaded { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl ProviderError {
    /// Whether retrying the same call can reasonably be expected to succeed.
    ///
    /// Rate limits, overload, and plain request failures clear on their own;
    /// malformed responses and bad credentials do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RequestFailed { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Overloaded { .. }
        )
    }
}

/// Task execution errors, as seen by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown task type: {0}")]
    UnknownType(String),

    #[error("Upstream task {kind} not ready for job {job_id}")]
    UpstreamNotReady { job_id: Uuid, kind: String },

    #[error("Invalid job payload: {reason}")]
    InvalidPayload { reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl TaskError {
    /// Whether the scheduler's retry envelope applies.
    ///
    /// `UpstreamNotReady` counts as transient: the dependency may complete
    /// between attempts. Unknown types and malformed payloads never will.
    pub fn is_transient(&self) -> bool {
        match self {
            TaskError::Provider(e) => e.is_transient(),
            TaskError::UpstreamNotReady { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
