//! Error types for the limiter.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::Breach;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid configuration detected at registration or startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A rate limit expression could not be parsed.
    #[error("Malformed rate limit: {0}")]
    MalformedLimit(String),

    /// A request exceeded one of its active limits.
    #[error("Rate limit exceeded: {}", .0.message)]
    RateLimitExceeded(Box<Breach>),

    /// The counting backend could not be reached.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A user supplied callback failed.
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    /// A deferred deduction failed after the response was produced. Carries
    /// the rate limit headers rendered for that response.
    #[error("Deferred deduction failed: {source}")]
    Deduction {
        source: Box<LimiterError>,
        headers: Vec<(String, String)>,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Returns the breach details if this error is a rate limit breach.
    pub fn breach(&self) -> Option<&Breach> {
        match self {
            LimiterError::RateLimitExceeded(breach) => Some(breach),
            _ => None,
        }
    }

    /// Rate limit headers still owed to the response, if this error came
    /// out of a deferred deduction.
    pub fn headers(&self) -> Option<&[(String, String)]> {
        match self {
            LimiterError::Deduction { headers, .. } => Some(headers),
            _ => None,
        }
    }
}

/// Failures of the counting backend.
///
/// Timeouts and connection failures are handled identically by the limiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure raised from inside a key function, predicate or breach callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
