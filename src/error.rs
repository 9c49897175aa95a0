//! Unified error handling for the collection and processing core.
//!
//! The variants follow the error taxonomy used across the pipeline:
//! transient failures are retried by the layer that owns the retry
//! budget (request-level in the HTTP/LLM clients, task-level in the
//! task queue), everything else is surfaced to the caller.

use std::fmt;

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AtlasError {
    /// Transport-level timeout (HTTP, LLM, rate-limit wait).
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Operation cancelled through the caller's cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// DNS resolution failed.
    #[error("DNS error for {0}")]
    Dns(String),

    /// TCP connect failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// TLS negotiation or certificate verification failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Underlying HTTP machinery failed in a way that is not one of
    /// the classified transport errors above.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Collector failure, carries the source that produced it.
    #[error("collector error for source '{source_id}': {message}")]
    Collector { source_id: String, message: String },

    /// Feed or HTML parsing failed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Document failed validation with at least one error-level finding.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Structural failure inside the deduplicator.
    #[error("dedup error: {0}")]
    Dedup(String),

    /// Bounded queue refused a submission.
    #[error("backpressure: queue at capacity ({0})")]
    Backpressure(usize),

    /// The adaptive controller has opened the circuit to the LLM.
    #[error("circuit open: LLM submissions rejected")]
    CircuitOpen,

    /// LLM gateway failure.
    #[error("LLM {kind} error: {message}")]
    Llm { kind: LlmErrorKind, message: String },

    /// Persistence backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration, fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {message}")]
    Cron { expression: String, message: String },

    /// Task queue bookkeeping error (unknown id, terminal transition).
    #[error("task error: {0}")]
    Task(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing failed (source list files).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// URL parsing failed.
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Classification of LLM gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Connection,
    Timeout,
    Protocol,
    ServerError,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmErrorKind::Connection => write!(f, "connection"),
            LlmErrorKind::Timeout => write!(f, "timeout"),
            LlmErrorKind::Protocol => write!(f, "protocol"),
            LlmErrorKind::ServerError => write!(f, "server"),
        }
    }
}

impl AtlasError {
    /// Create a collector error with source context.
    pub fn collector(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Collector {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// Create an LLM error of the given kind.
    pub fn llm(kind: LlmErrorKind, message: impl fmt::Display) -> Self {
        Self::Llm {
            kind,
            message: message.to_string(),
        }
    }

    /// Create a cron parse error.
    pub fn cron(expression: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Cron {
            expression: expression.into(),
            message: message.to_string(),
        }
    }

    /// Whether the request-level retry loop should retry this failure.
    ///
    /// Covers transport timeouts and connect failures; HTTP status
    /// retries (5xx, 429) are decided from the response, not from here.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_) | Self::Http(_))
    }
}

/// Map a reqwest failure into the transport error taxonomy.
impl From<reqwest::Error> for AtlasError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(std::time::Duration::ZERO);
        }
        let msg = err.to_string();
        if err.is_connect() {
            // reqwest folds DNS and TCP failures into `connect`; keep
            // the DNS classification when the message makes it clear.
            if msg.contains("dns") || msg.contains("resolve") {
                return Self::Dns(msg);
            }
            return Self::Connect(msg);
        }
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            return Self::Tls(msg);
        }
        Self::Http(msg)
    }
}
