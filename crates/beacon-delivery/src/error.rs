//! Error types for payload delivery and controller lifecycle.
//!
//! Transport failures are categorised here so the worker can decide between
//! retrying, reporting an API rejection and giving up. Lifecycle errors cover
//! misuse of the controller (double init, start before init, stop timeouts).

use std::time::Duration;

use beacon_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for payload delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Collector rejected the payload (4xx other than 429).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Collector failed to process the payload (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Collector asked us to slow down (429).
    #[error("rate limited by collector")]
    RateLimited {
        /// Seconds from the Retry-After header, if one was sent
        retry_after_seconds: Option<u64>,
    },

    /// All retry attempts exhausted.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Queue store operation failed.
    #[error("storage error: {message}")]
    StorageError {
        /// Storage error message
        message: String,
    },

    /// Payload could not be serialised for transmission.
    #[error("serialization error: {message}")]
    SerializationError {
        /// Serialization error message
        message: String,
    },

    /// Invalid controller or transport configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// `init` was called on a controller that already has a configuration.
    #[error("queue controller already initialized")]
    AlreadyInitialized,

    /// Operation requires `init` to have been called first.
    #[error("queue controller not initialized")]
    NotInitialized,

    /// Workers did not finish within the stop timeout.
    #[error("workers did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with optional retry guidance.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Maps a non-success HTTP status onto the matching error.
    ///
    /// Returns `None` for 2xx. Statuses outside 4xx are treated as server
    /// errors so they are retried.
    pub fn from_status(
        status_code: u16,
        body: impl Into<String>,
        retry_after_seconds: Option<u64>,
    ) -> Option<Self> {
        match status_code {
            200..=299 => None,
            429 => Some(Self::rate_limited(retry_after_seconds)),
            400..=499 => Some(Self::client_error(status_code, body)),
            _ => Some(Self::server_error(status_code, body)),
        }
    }

    /// Determines if this error represents a temporary failure that should be
    /// retried.
    ///
    /// Returns `true` for network errors, timeouts, server errors (5xx) and
    /// collector rate limits (429).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. } => true,

            Self::ClientError { .. }
            | Self::RetriesExhausted { .. }
            | Self::StorageError { .. }
            | Self::SerializationError { .. }
            | Self::ConfigurationError { .. }
            | Self::AlreadyInitialized
            | Self::NotInitialized
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Returns the collector-provided retry delay in seconds, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// HTTP status attached to the error, if it came from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Serialization(message) => Self::serialization(message),
            other => Self::storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
