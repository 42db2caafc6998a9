//! Domain models for queued telemetry payloads.
//!
//! A `Destination` names a remote collector by endpoint and access token.
//! Every composed payload is queued against exactly one destination and
//! carries the attempt counter the delivery workers maintain.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Strongly-typed identifier for queued payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadId(pub Uuid);

impl PayloadId {
    /// Creates a new random payload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PayloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for PayloadId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for PayloadId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Project access token used to authenticate against a collector.
///
/// The `Debug` output never contains the token itself so destinations can be
/// logged freely.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token for transmission.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the token is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Remote collection target.
///
/// Identity is the `(endpoint, access_token)` pair: two destinations with the
/// same endpoint but different tokens are delivered by separate workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Collector URL payloads are posted to.
    pub endpoint: String,
    /// Credential sent alongside every payload.
    pub access_token: AccessToken,
}

impl Destination {
    /// Creates a destination from an endpoint URL and access token.
    pub fn new(endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), access_token: AccessToken::new(access_token) }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)
    }
}

/// A composed, scrubbed payload waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPayload {
    /// Unique payload identifier.
    pub id: PayloadId,
    /// Enqueue time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Where the payload is delivered.
    pub destination: Destination,
    /// Payload document, already scrubbed.
    pub body: serde_json::Value,
    /// Number of delivery attempts made so far.
    pub attempt_count: u32,
}

impl QueuedPayload {
    /// Creates a payload that has not been attempted yet.
    pub fn new(destination: Destination, body: serde_json::Value, timestamp: i64) -> Self {
        Self { id: PayloadId::new(), timestamp, destination, body, attempt_count: 0 }
    }
}

/// Payload that exhausted its delivery attempts under `DropPolicy::DeadLetter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The payload as it was queued.
    pub payload: QueuedPayload,
    /// Why delivery was abandoned.
    pub reason: String,
    /// When the payload was moved, in milliseconds since the Unix epoch.
    pub failed_at: i64,
}

/// What happens to a payload once retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Delete the payload.
    #[default]
    Drop,
    /// Keep the payload in the dead-letter table for inspection.
    DeadLetter,
}

/// Severity attached to every reported item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    /// Verbose diagnostics.
    Debug,
    /// Informational message.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// An operation failed.
    Error,
    /// The process cannot continue normally.
    Critical,
}

impl ErrorLevel {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(CoreError::InvalidInput(format!("unknown error level: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_identity_includes_token() {
        let a = Destination::new("https://collector.test/api/1/item/", "token-a");
        let b = Destination::new("https://collector.test/api/1/item/", "token-b");

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn access_token_debug_is_masked() {
        let destination = Destination::new("https://collector.test", "super-secret");
        let rendered = format!("{destination:?}");

        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn payload_id_parses_from_display() {
        let id = PayloadId::new();
        let parsed: PayloadId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn error_level_round_trips_through_str() {
        for level in [
            ErrorLevel::Debug,
            ErrorLevel::Info,
            ErrorLevel::Warning,
            ErrorLevel::Error,
            ErrorLevel::Critical,
        ] {
            assert_eq!(level.as_str().parse::<ErrorLevel>().unwrap(), level);
        }
        assert!("fatal".parse::<ErrorLevel>().is_err());
    }
}
