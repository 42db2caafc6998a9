//! Scripted in-process transport.
//!
//! Replies are consumed in order; once the script runs out the fallback
//! reply is used for every further request. Every request is recorded.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use beacon_core::Destination;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{Transport, TransportResponse};
use crate::error::{DeliveryError, Result};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Respond with a status and body.
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
    /// Respond 429 with an optional Retry-After value.
    RateLimited {
        /// Retry-After in seconds
        retry_after: Option<u64>,
    },
    /// Fail as if the connection was refused.
    NetworkError,
    /// Fail as if the request timed out.
    Timeout,
    /// Never answer.
    Hang,
}

impl MockReply {
    /// `200 OK` with an empty JSON body.
    pub fn ok() -> Self {
        Self::status(200)
    }

    /// Response with the given status and an empty body.
    pub fn status(status: u16) -> Self {
        Self::Status { status, body: String::new() }
    }
}

/// A request observed by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Destination the payload was sent to.
    pub destination: Destination,
    /// Raw request body.
    pub body: Bytes,
}

impl RecordedRequest {
    /// Request body parsed as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Transport double with scripted replies.
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    latency: Duration,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Mock answering `fallback` to every request.
    pub fn new(fallback: MockReply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Mock answering `200 OK` to every request.
    pub fn accepting() -> Self {
        Self::new(MockReply::ok())
    }

    /// Queues replies that take precedence over the fallback.
    #[must_use]
    pub fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self { script: Mutex::new(replies.into_iter().collect()), ..self }
    }

    /// Delays every reply by `latency` of real time.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        Self { latency, ..self }
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, destination: &Destination, body: Bytes) -> Result<TransportResponse> {
        self.requests
            .lock()
            .await
            .push(RecordedRequest { destination: destination.clone(), body });

        let reply = self.script.lock().await.pop_front().unwrap_or_else(|| self.fallback.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            MockReply::Status { status, body } => Ok(TransportResponse::new(status, body)),
            MockReply::RateLimited { retry_after } => Ok(TransportResponse {
                retry_after_seconds: retry_after,
                ..TransportResponse::new(429, "")
            }),
            MockReply::NetworkError => Err(DeliveryError::network("connection refused")),
            MockReply::Timeout => Err(DeliveryError::timeout(30)),
            MockReply::Hang => std::future::pending().await,
        }
    }
}
