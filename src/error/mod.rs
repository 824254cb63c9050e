use thiserror::Error;

use crate::consensus::ConsensusResult;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rate limit exceeded for caller '{caller}'")]
    RateLimited { caller: String },

    #[error("Circuit breaker is open for backend '{backend}'")]
    CircuitOpen { backend: String },

    #[error("Timed out waiting for a pooled client for backend '{backend}' after {waited_ms}ms")]
    AcquireTimeout { backend: String, waited_ms: u64 },

    #[error("Failed to construct client for backend '{backend}': {reason}")]
    Construction { backend: String, reason: String },

    #[error("Backend '{backend}' error: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Backend '{backend}' timed out after {elapsed_ms}ms")]
    Timeout { backend: String, elapsed_ms: u64 },

    #[error("Unknown backend or model: {0}")]
    UnknownBackend(String),

    #[error("No backends available for this request")]
    NoBackendsAvailable,

    #[error("No valid responses to merge")]
    NoValidResponses,

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Merged confidence {confidence:.3} below required minimum {required:.3}")]
    LowConfidence {
        confidence: f64,
        required: f64,
        result: Box<ConsensusResult>,
    },

    #[error("Client pool is shut down")]
    PoolClosed,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Backend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn construction(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Construction {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn consensus(msg: impl Into<String>) -> Self {
        Error::Consensus(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Failures that count against a backend's circuit breaker.
    /// Caller mistakes and pool saturation do not.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Error::Backend { .. }
                | Error::Timeout { .. }
                | Error::Construction { .. }
                | Error::Http(_)
        )
    }
}
