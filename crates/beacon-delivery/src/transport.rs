//! Transmission of serialised payloads to a destination.
//!
//! The worker only sees the `Transport` trait. `HttpTransport` posts JSON
//! over reqwest with the destination's access token in a header; the `mock`
//! module scripts responses for tests.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use beacon_core::Destination;
use bytes::Bytes;
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

pub mod mock;

/// Header carrying the destination's access token.
pub const ACCESS_TOKEN_HEADER: &str = "X-Beacon-Access-Token";

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_REPORTED_BODY_SIZE: usize = 1024;

/// Sends one payload and reports what the collector answered.
///
/// Implementations return `Ok` for every HTTP response, including error
/// statuses, and `Err` only when no response was obtained.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Posts `body` to `destination`.
    async fn send(&self, destination: &Destination, body: Bytes) -> Result<TransportResponse>;
}

/// Collector response to one transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Parsed Retry-After header, in seconds.
    pub retry_after_seconds: Option<u64>,
    /// Round-trip time.
    pub duration: Duration,
}

impl TransportResponse {
    /// Creates a response with no Retry-After hint.
    pub fn new(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            body: body.into(),
            retry_after_seconds: None,
            duration: Duration::ZERO,
        }
    }

    /// True for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Error equivalent of a non-2xx response.
    pub fn error(&self) -> Option<DeliveryError> {
        DeliveryError::from_status(self.status_code, self.body.clone(), self.retry_after_seconds)
    }
}

/// Configuration for the HTTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Timeout for each request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("beacon/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    /// Creates a transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a transport with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(TransportConfig::default())
    }

    async fn read_response(response: Response, duration: Duration) -> TransportResponse {
        let status_code = response.status().as_u16();
        let retry_after_seconds = parse_retry_after(response.headers());

        let body = match response.bytes().await {
            Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
                let suffix = "... (truncated)";
                let max_content = MAX_REPORTED_BODY_SIZE - suffix.len();
                let truncated = String::from_utf8_lossy(&bytes[..max_content]);
                format!("{truncated}{suffix}")
            },
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                format!("[failed to read response body: {e}]")
            },
        };

        TransportResponse { status_code, body, retry_after_seconds, duration }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, destination: &Destination, body: Bytes) -> Result<TransportResponse> {
        let span = info_span!("payload_transmit", endpoint = %destination.endpoint);

        async move {
            let start = Instant::now();
            let result = self
                .client
                .post(&destination.endpoint)
                .header("content-type", "application/json")
                .header(ACCESS_TOKEN_HEADER, destination.access_token.expose())
                .body(body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        duration_ms = start.elapsed().as_millis(),
                        error = %e,
                        "request failed"
                    );
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let response = Self::read_response(response, start.elapsed()).await;
            tracing::debug!(
                status = response.status_code,
                duration_ms = response.duration.as_millis(),
                "received response"
            );
            Ok(response)
        }
        .instrument(span)
        .await
    }
}

/// Reads a Retry-After header given in seconds.
///
/// HTTP-date values and garbage fall back to 60 seconds so a 429 is never
/// retried immediately.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let value = headers.get(reqwest::header::RETRY_AFTER)?;
    Some(
        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER),
    )
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), Some(120));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(60));
    }

    #[test]
    fn response_classification() {
        assert!(TransportResponse::new(200, "").error().is_none());
        assert!(TransportResponse::new(201, "").is_success());

        let limited =
            TransportResponse { retry_after_seconds: Some(5), ..TransportResponse::new(429, "") };
        assert_eq!(limited.error().and_then(|e| e.retry_after_seconds()), Some(5));

        assert!(matches!(
            TransportResponse::new(401, "bad token").error(),
            Some(DeliveryError::ClientError { status_code: 401, .. })
        ));
    }
}
