//! Error taxonomy shared by every layer of the client.

use thiserror::Error;

use crate::bulk::ChunkFailure;

/// Coarse classification used by retry and circuit-breaker policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    RateLimited,
    Network,
    Server,
    CircuitOpen,
    Bulk,
    Configuration,
}

/// Client error type covering transport, policy, and configuration failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("server failure (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("circuit for '{service}' is open; retry in {retry_after_ms}ms")]
    CircuitOpen {
        service: String,
        retry_after_ms: u64,
    },

    /// Wraps the last retryable error once the retry budget is exhausted.
    /// `kind()` and `is_retryable()` see through the wrapper so callers keep
    /// matching on the original classification.
    #[error("{source} (gave up after {attempts} attempts over {elapsed_ms}ms)")]
    RetriesExhausted {
        attempts: u32,
        elapsed_ms: u64,
        source: Box<ApiError>,
    },

    #[error("bulk operation failed: all {} chunk(s) failed", failures.len())]
    BulkFailed { failures: Vec<ChunkFailure> },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl ApiError {
    /// Classification of this error, looking through the retry wrapper.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Network(_) => ErrorKind::Network,
            Self::Server { .. } => ErrorKind::Server,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::BulkFailed { .. } => ErrorKind::Bulk,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether another attempt at the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::Network | ErrorKind::Server
        )
    }

    /// Map an upstream HTTP status into the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        let excerpt = excerpt(body);
        match status {
            401 | 403 => Self::Authentication(format!("upstream returned status {status}")),
            429 => Self::RateLimited(format!("upstream returned status 429: {excerpt}")),
            500..=599 => Self::Server {
                status,
                message: excerpt,
            },
            _ => Self::Validation(format!("upstream rejected request (status {status}): {excerpt}")),
        }
    }

    /// Stable machine-readable code for envelopes and logs.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "api.validation",
            ErrorKind::Authentication => "api.authentication",
            ErrorKind::RateLimited => "api.rate_limited",
            ErrorKind::Network => "api.network",
            ErrorKind::Server => "api.server",
            ErrorKind::CircuitOpen => "api.circuit_open",
            ErrorKind::Bulk => "api.bulk_failed",
            ErrorKind::Configuration => "api.configuration",
        }
    }
}

const EXCERPT_MAX: usize = 120;

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= EXCERPT_MAX {
        return trimmed.to_owned();
    }
    let mut cut = EXCERPT_MAX;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}
