//! Error types surfaced by the client facade.
//!
//! Delivery failures never reach callers of `log`; they are reported through
//! the outcome bus. What remains here is misconfiguration, lifecycle misuse
//! and the blocking-log timeout.

use std::time::Duration;

use beacon_core::{CoreError, PayloadId};
use beacon_delivery::DeliveryError;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by the client, logger and bootstrap.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// Queue controller lifecycle failure.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Queue store could not be opened.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// No outcome was observed for a blocking log within the timeout.
    ///
    /// The payload stays queued and is delivered asynchronously.
    #[error("no outcome for payload {payload_id} within {timeout:?}")]
    BlockingTimeout {
        /// Payload still waiting for delivery
        payload_id: PayloadId,
        /// How long the caller waited
        timeout: Duration,
    },

    /// The destination queue still held payloads when a close timed out.
    #[error("{remaining} payloads still queued after {timeout:?}")]
    DrainTimeout {
        /// Payloads left in the queue
        remaining: usize,
        /// How long the close waited
        timeout: Duration,
    },

    /// The client was closed and accepts no more items.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// True if a blocking log gave up waiting.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::BlockingTimeout { .. } | Self::DrainTimeout { .. })
    }
}

impl From<figment::Error> for ClientError {
    fn from(error: figment::Error) -> Self {
        Self::configuration(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_pass_through() {
        let error = ClientError::from(DeliveryError::AlreadyInitialized);
        assert!(matches!(error, ClientError::Delivery(DeliveryError::AlreadyInitialized)));
        assert_eq!(error.to_string(), DeliveryError::AlreadyInitialized.to_string());
    }

    #[test]
    fn blocking_timeout_names_the_payload() {
        let payload_id = PayloadId::new();
        let error =
            ClientError::BlockingTimeout { payload_id, timeout: Duration::from_millis(250) };

        assert!(error.is_timeout());
        assert!(error.to_string().contains(&payload_id.to_string()));
        assert!(!ClientError::Closed.is_timeout());
    }
}
