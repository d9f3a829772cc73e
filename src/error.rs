//! Error types for the automation hub.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the hub.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

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
}

/// Ledger persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Ledger entry {identity} is not pending, cannot mark {target}")]
    InvalidTransition { identity: String, target: String },
}

/// Single-instance lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Another hub instance is already running (pid {pid}, lock {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("Lock file IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

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

/// Errors raised by source clients (listing or fetching payloads).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {name} request failed: {reason}")]
    RequestFailed { name: String, reason: String },

    #[error("Source {name} returned HTTP {status}: {body}")]
    Http {
        name: String,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for source {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Malformed payload from {name}: {reason}")]
    Malformed { name: String, reason: String },

    #[error("Unsupported content in {name}: {reason}")]
    Unsupported { name: String, reason: String },

    #[error("Mailbox protocol error: {0}")]
    Imap(String),
}

/// Errors raised by sink clients.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink {name} request failed: {reason}")]
    RequestFailed { name: String, reason: String },

    #[error("Sink {name} returned HTTP {status}: {body}")]
    Http {
        name: String,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Sink {name} rejected the delivery: {reason}")]
    Rejected { name: String, reason: String },

    #[error("Sink {name} rate limited, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("Sink {name} is misconfigured: {reason}")]
    Misconfigured { name: String, reason: String },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Payload fetch failed: {0}")]
    Fetch(String),

    #[error("Summarization failed: {0}")]
    Summarize(String),

    #[error("Chunk {index} of {total} failed: {reason}")]
    ChunkFailed {
        index: usize,
        total: usize,
        reason: String,
    },

    #[error("Work queue closed")]
    QueueClosed,

    #[error("Hub is shutting down")]
    Shutdown,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the hub.
pub type Result<T> = std::result::Result<T, Error>;
