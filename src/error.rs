//! Error types for AI Digest.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
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

    #[error("Call to {operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline errors.
///
/// Each variant is scoped to one unit of work (a source, a batch, a block,
/// a channel). Only `StorageUnavailable` on the seen index stops a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Storage unavailable for {source_id}: {reason}")]
    StorageUnavailable { source_id: String, reason: String },

    #[error("Classification failed for {source_id} batch {batch}: {reason}")]
    Classification {
        source_id: String,
        batch: usize,
        reason: String,
    },

    #[error("Narrative update failed for {channel_id} block {block_number}: {reason}")]
    NarrativeUpdate {
        channel_id: String,
        block_number: u64,
        reason: String,
    },

    #[error("Digest reduction failed for {channel_id}: {reason}")]
    DigestReduction { channel_id: String, reason: String },

    #[error("Transport error on {source_id}: {reason}")]
    Transport { source_id: String, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Channel {channel_id} is locked by another run")]
    ChannelBusy { channel_id: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

impl PipelineError {
    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProtocolViolation(_) => true,
            Self::Llm(LlmError::AuthFailed { .. }) => false,
            Self::Llm(_) => true,
            _ => false,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
