//! Delivery outcome notifications and the bus that carries them.
//!
//! Workers publish a `QueueEvent` for every outcome they observe. Publishing
//! never waits: the bus is a bounded `tokio::sync::broadcast` channel, so a
//! subscriber that falls behind loses the oldest events instead of stalling a
//! worker.
//!
//! ```text
//! ┌──────────────────┐  publish (non-blocking)  ┌──────────┐
//! │ DestinationWorker│ ───────────────────────▶ │ EventBus │
//! └──────────────────┘                          └──────────┘
//!                                                │       │
//!                                    subscribe() │       │ attach(handler)
//!                                                ▼       ▼
//!                                       log_blocking   EventHandler task
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::models::{Destination, PayloadId};

/// Default number of outcome events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Outcome notifications emitted by the queue controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// Collector accepted the payload.
    Delivered(DeliveredEvent),

    /// Collector rejected the payload permanently (4xx).
    ApiError(ApiErrorEvent),

    /// Transmission failed in a way that may succeed later.
    CommunicationError(CommunicationErrorEvent),

    /// Something inside the pipeline failed unexpectedly.
    InternalError(InternalErrorEvent),

    /// Payload was abandoned after exhausting its attempts.
    Dropped(DroppedEvent),
}

/// Emitted when a payload is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredEvent {
    /// Delivered payload.
    pub payload_id: PayloadId,
    /// Destination that accepted it.
    pub destination: Destination,
    /// HTTP status returned by the collector.
    pub status_code: u16,
    /// Attempt that succeeded (1-based).
    pub attempt_number: u32,
    /// When delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when the collector rejects a payload with a non-retryable status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorEvent {
    /// Rejected payload.
    pub payload_id: PayloadId,
    /// Destination that rejected it.
    pub destination: Destination,
    /// HTTP status returned by the collector.
    pub status_code: u16,
    /// Response body, truncated by the transport.
    pub body: String,
    /// Attempt that was rejected (1-based).
    pub attempt_number: u32,
}

/// Emitted for network errors, timeouts and 5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationErrorEvent {
    /// Payload whose transmission failed.
    pub payload_id: PayloadId,
    /// Destination that could not be reached.
    pub destination: Destination,
    /// Failure description.
    pub error: String,
    /// Attempt that failed (1-based).
    pub attempt_number: u32,
    /// Whether another attempt is scheduled.
    pub will_retry: bool,
}

/// Emitted when composing, scrubbing, queueing or storage fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalErrorEvent {
    /// Payload involved, if one was identified.
    pub payload_id: Option<PayloadId>,
    /// Destination involved, if one was identified.
    pub destination: Option<Destination>,
    /// Failure description.
    pub error: String,
    /// True if the payload left the queue because of this failure. Otherwise
    /// it stays queued and will be attempted again.
    #[serde(default)]
    pub evicted: bool,
}

/// Emitted when a payload is removed without being delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedEvent {
    /// Abandoned payload.
    pub payload_id: PayloadId,
    /// Destination it was queued for.
    pub destination: Destination,
    /// Why it was abandoned.
    pub reason: String,
    /// Attempts made before giving up.
    pub attempt_number: u32,
    /// True if the payload was kept in the dead-letter table.
    pub dead_lettered: bool,
}

impl QueueEvent {
    /// Payload this event refers to, if any.
    pub fn payload_id(&self) -> Option<PayloadId> {
        match self {
            Self::Delivered(e) => Some(e.payload_id),
            Self::ApiError(e) => Some(e.payload_id),
            Self::CommunicationError(e) => Some(e.payload_id),
            Self::InternalError(e) => e.payload_id,
            Self::Dropped(e) => Some(e.payload_id),
        }
    }

    /// Destination this event refers to, if any.
    pub fn destination(&self) -> Option<&Destination> {
        match self {
            Self::Delivered(e) => Some(&e.destination),
            Self::ApiError(e) => Some(&e.destination),
            Self::CommunicationError(e) => Some(&e.destination),
            Self::InternalError(e) => e.destination.as_ref(),
            Self::Dropped(e) => Some(&e.destination),
        }
    }

    /// True when no further events will follow for this payload.
    ///
    /// Communication errors are never terminal: they precede either a retry
    /// or a `Dropped` event. Internal errors are terminal only when the named
    /// payload was evicted from the queue.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Delivered(_) | Self::ApiError(_) | Self::Dropped(_) => true,
            Self::CommunicationError(_) => false,
            Self::InternalError(e) => e.evicted && e.payload_id.is_some(),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delivered(_) => "delivered",
            Self::ApiError(_) => "api_error",
            Self::CommunicationError(_) => "communication_error",
            Self::InternalError(_) => "internal_error",
            Self::Dropped(_) => "dropped",
        }
    }
}

/// Receives outcome events on a dedicated task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. Slow handlers only delay themselves.
    async fn handle_event(&self, event: QueueEvent);

    /// Handler name used in lag warnings.
    fn name(&self) -> &'static str {
        "anonymous"
    }
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventHandler;

#[async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: QueueEvent) {}

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Bounded publish/subscribe channel for `QueueEvent`s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event without waiting on subscribers.
    pub fn publish(&self, event: QueueEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            debug!(kind, "no subscribers for queue event");
        }
    }

    /// Returns a receiver that sees every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Runs `handler` on its own task for every future event.
    ///
    /// The task ends when the bus and all its clones are dropped.
    pub fn attach(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(handler = handler.name(), skipped, "event handler lagged behind");
                    },
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
