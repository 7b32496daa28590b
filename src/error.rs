/// codecell error types and handling utilities
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to callers of the execution core.
///
/// Execution-phase outcomes (timeouts, limit breaches, sandbox faults) are
/// never reported through this type; they come back as an
/// [`ExecutionResult`](crate::report::ExecutionResult).
#[derive(Debug, Error)]
pub enum ExecError {
    /// Language identifier does not resolve to an enabled adapter and image
    #[error("unknown language: {0}")]
    UnknownLanguage(String),
    /// Source cannot be turned into a runnable artifact
    #[error("invalid source: {0}")]
    InvalidSource(String),
    /// Request fields outside accepted bounds (timeout, input file)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Every slot stayed busy for the whole queue-wait budget
    #[error("sandbox capacity exhausted (waited {waited_ms} ms, {queued} queued)")]
    Overloaded { waited_ms: u64, queued: usize },
    /// Caller cancelled the request before a result was produced
    #[error("execution cancelled")]
    Cancelled,
    /// Fault outside any session (closed slot pool, broken transport)
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Stable tag used on the wire and as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownLanguage(_) => "unknown_language",
            Self::InvalidSource(_) => "invalid_source",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Overloaded { .. } => "overloaded",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller sent something that can never succeed
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownLanguage(_) | Self::InvalidSource(_) | Self::InvalidRequest(_)
        )
    }

    /// Rebuild an error from its wire tag and message
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "unknown_language" => Self::UnknownLanguage(message),
            "invalid_source" => Self::InvalidSource(message),
            "invalid_request" => Self::InvalidRequest(message),
            "overloaded" => Self::Overloaded {
                waited_ms: 0,
                queued: 0,
            },
            "cancelled" => Self::Cancelled,
            _ => Self::Internal(message),
        }
    }
}

/// Wire shape of an error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&ExecError> for ErrorBody {
    fn from(err: &ExecError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorBody> for ExecError {
    fn from(body: ErrorBody) -> Self {
        ExecError::from_kind(&body.kind, body.message)
    }
}

/// Helper to determine if an error is retryable
pub fn is_retryable(err: &ExecError) -> bool {
    match err {
        ExecError::Overloaded { .. } => true,
        ExecError::UnknownLanguage(_) => false,
        ExecError::InvalidSource(_) => false,
        ExecError::InvalidRequest(_) => false,
        ExecError::Cancelled => false,
        ExecError::Internal(_) => false,
    }
}

/// Retry configuration for callers backing off from `Overloaded`
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // ±20% jitter, clamped to max
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter)
        .max(0.0)
        .min(config.max_backoff_ms as f64) as u64
}
