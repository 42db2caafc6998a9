//! Per-destination delivery worker.
//!
//! One worker drains one destination's queue in FIFO order: peek the oldest
//! payload, wait out its backoff deadline, take a rate-limit token, bump the
//! stored attempt counter, transmit, then act on the outcome. Store failures
//! are reported as internal errors and never end the loop; only cancellation
//! does.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use beacon_core::{
    events::{
        ApiErrorEvent, CommunicationErrorEvent, DeliveredEvent, DroppedEvent, InternalErrorEvent,
    },
    CoreError, Clock, Destination, DropPolicy, EventBus, PayloadId, QueueEvent, QueueStore,
    QueuedPayload,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    controller::{ControllerStats, QueueConfig, WorkerState},
    error::DeliveryError,
    rate_limit::RateLimiter,
    retry::{RetryContext, RetryDecision},
    transport::Transport,
};

/// What the loop does after handling one payload.
enum Step {
    /// Look at the queue again right away.
    Continue,
    /// Something in the store failed; wait a poll interval first.
    Pause,
}

/// Worker owning delivery for a single destination.
pub(crate) struct DestinationWorker {
    destination: Destination,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    config: Arc<QueueConfig>,
    events: EventBus,
    stats: Arc<RwLock<ControllerStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
    state: Arc<watch::Sender<WorkerState>>,
    backoff: Option<(PayloadId, Instant)>,
}

impl DestinationWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        destination: Destination,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        config: Arc<QueueConfig>,
        events: EventBus,
        stats: Arc<RwLock<ControllerStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
        state: Arc<watch::Sender<WorkerState>>,
    ) -> Self {
        Self {
            destination,
            store,
            transport,
            config,
            events,
            stats,
            cancellation_token,
            clock,
            state,
            backoff: None,
        }
    }

    /// Drains the destination until cancelled.
    pub(crate) async fn run(mut self) {
        info!(endpoint = %self.destination.endpoint, "destination worker starting");
        self.state.send_replace(WorkerState::Running);

        let mut limiter =
            RateLimiter::per_minute(self.config.max_reports_per_minute, self.clock.clone());

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let payload = match self.store.peek_oldest(&self.destination).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    if !self.pause(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                },
                Err(CoreError::CorruptPayload { key, message }) => {
                    if self.evict_corrupt(&key, &message).await {
                        continue;
                    }
                    if !self.pause(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                },
                Err(e) => {
                    self.internal_error(None, &e.to_string(), false).await;
                    if !self.pause(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                },
            };

            if let Some(wait) = self.backoff_remaining(payload.id) {
                if !self.pause(wait).await {
                    break;
                }
                continue;
            }

            tokio::select! {
                () = limiter.acquire() => {},
                () = self.cancellation_token.cancelled() => break,
            }

            match self.process(payload).await {
                Step::Continue => {},
                Step::Pause => {
                    if !self.pause(self.config.poll_interval).await {
                        break;
                    }
                },
            }
        }

        self.state.send_replace(WorkerState::Stopped);
        {
            let mut stats = self.stats.write().await;
            stats.active_workers = stats.active_workers.saturating_sub(1);
        }
        info!(endpoint = %self.destination.endpoint, "destination worker stopped");
    }

    /// Sleeps on the clock; returns false if cancelled first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.clock.sleep(duration) => true,
            () = self.cancellation_token.cancelled() => false,
        }
    }

    /// Time left before `id` may be attempted again.
    ///
    /// A deadline held for a different payload is stale (the payload it
    /// belonged to is gone) and is discarded.
    fn backoff_remaining(&mut self, id: PayloadId) -> Option<Duration> {
        let (held, deadline) = self.backoff?;
        if held != id {
            self.backoff = None;
            return None;
        }
        let now = self.clock.now();
        if now >= deadline {
            self.backoff = None;
            return None;
        }
        Some(deadline - now)
    }

    async fn process(&mut self, payload: QueuedPayload) -> Step {
        let attempt_number = match self.store.record_attempt(payload.id).await {
            Ok(attempt_number) => attempt_number,
            Err(CoreError::PayloadNotFound(_)) => {
                debug!(payload_id = %payload.id, "payload removed before attempt");
                return Step::Continue;
            },
            Err(e) => {
                self.internal_error(Some(payload.id), &e.to_string(), false).await;
                return Step::Pause;
            },
        };

        let body = match serde_json::to_vec(&payload.body) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                let evicted = self.discard(payload.id).await;
                let message = format!("failed to serialize payload: {e}");
                self.internal_error(Some(payload.id), &message, evicted).await;
                return Step::Continue;
            },
        };

        debug!(
            payload_id = %payload.id,
            endpoint = %self.destination.endpoint,
            attempt_number,
            "transmitting payload"
        );

        self.stats.write().await.in_flight += 1;
        let result = self.transport.send(&self.destination, body).await;
        self.stats.write().await.in_flight -= 1;

        let error = match result {
            Ok(response) => match response.error() {
                None => {
                    self.delivered(&payload, response.status_code, attempt_number).await;
                    return Step::Continue;
                },
                Some(error) => error,
            },
            Err(error) => error,
        };

        self.failed(&payload, attempt_number, error).await
    }

    async fn delivered(&mut self, payload: &QueuedPayload, status_code: u16, attempt_number: u32) {
        self.backoff = None;
        self.discard(payload.id).await;
        self.stats.write().await.delivered += 1;

        info!(
            payload_id = %payload.id,
            endpoint = %self.destination.endpoint,
            status_code,
            attempt_number,
            "payload delivered"
        );

        self.events.publish(QueueEvent::Delivered(DeliveredEvent {
            payload_id: payload.id,
            destination: self.destination.clone(),
            status_code,
            attempt_number,
            delivered_at: DateTime::<Utc>::from(self.clock.now_system()),
        }));
    }

    async fn failed(
        &mut self,
        payload: &QueuedPayload,
        attempt_number: u32,
        error: DeliveryError,
    ) -> Step {
        if error.is_retryable() {
            return self.communication_error(payload, attempt_number, error).await;
        }

        self.backoff = None;
        let evicted = self.discard(payload.id).await;

        match error {
            DeliveryError::ClientError { status_code, body } => {
                warn!(
                    payload_id = %payload.id,
                    endpoint = %self.destination.endpoint,
                    status_code,
                    "collector rejected payload"
                );
                self.stats.write().await.api_errors += 1;
                self.events.publish(QueueEvent::ApiError(ApiErrorEvent {
                    payload_id: payload.id,
                    destination: self.destination.clone(),
                    status_code,
                    body,
                    attempt_number,
                }));
            },
            other => {
                self.internal_error(Some(payload.id), &other.to_string(), evicted).await;
            },
        }
        Step::Continue
    }

    async fn communication_error(
        &mut self,
        payload: &QueuedPayload,
        attempt_number: u32,
        error: DeliveryError,
    ) -> Step {
        let decision = RetryContext::new(
            attempt_number,
            error.clone(),
            self.clock.now(),
            self.config.retry_policy.clone(),
        )
        .decide_retry();
        let will_retry = matches!(decision, RetryDecision::Retry { .. });

        self.stats.write().await.communication_errors += 1;
        self.events.publish(QueueEvent::CommunicationError(CommunicationErrorEvent {
            payload_id: payload.id,
            destination: self.destination.clone(),
            error: error.to_string(),
            attempt_number,
            will_retry,
        }));

        match decision {
            RetryDecision::Retry { next_attempt_at } => {
                let retry_in = next_attempt_at.saturating_duration_since(self.clock.now());
                warn!(
                    payload_id = %payload.id,
                    endpoint = %self.destination.endpoint,
                    attempt_number,
                    retry_in_ms = retry_in.as_millis(),
                    error = %error,
                    "transmission failed, retry scheduled"
                );
                self.backoff = Some((payload.id, next_attempt_at));
                Step::Continue
            },
            RetryDecision::GiveUp { reason } => {
                self.backoff = None;
                self.give_up(payload, attempt_number, reason).await
            },
        }
    }

    async fn give_up(&self, payload: &QueuedPayload, attempt_number: u32, reason: String) -> Step {
        let dead_lettered = self.config.drop_policy == DropPolicy::DeadLetter;
        let result = if dead_lettered {
            self.store.dead_letter(payload.id, reason.clone(), self.clock.unix_millis()).await
        } else {
            self.store.remove(payload.id).await
        };

        if let Err(e) = result {
            let message = format!("failed to drop payload: {e}");
            self.internal_error(Some(payload.id), &message, false).await;
            return Step::Pause;
        }

        error!(
            payload_id = %payload.id,
            endpoint = %self.destination.endpoint,
            attempt_number,
            reason = %reason,
            dead_lettered,
            "payload dropped"
        );

        {
            let mut stats = self.stats.write().await;
            stats.dropped += 1;
            if dead_lettered {
                stats.dead_lettered += 1;
            }
        }

        self.events.publish(QueueEvent::Dropped(DroppedEvent {
            payload_id: payload.id,
            destination: self.destination.clone(),
            reason,
            attempt_number,
            dead_lettered,
        }));
        Step::Continue
    }

    /// Removes a payload, reporting store failures as internal errors.
    ///
    /// Returns false if the payload may still be queued.
    async fn discard(&self, id: PayloadId) -> bool {
        match self.store.remove(id).await {
            Ok(_) => true,
            Err(e) => {
                let message = format!("failed to remove payload: {e}");
                self.internal_error(Some(id), &message, false).await;
                false
            },
        }
    }

    /// Deletes the undecodable row at the head of the queue.
    ///
    /// Returns false if the row could not be removed; the worker then backs
    /// off like on any other store failure.
    async fn evict_corrupt(&self, key: &str, reason: &str) -> bool {
        let payload_id = key.parse::<PayloadId>().ok();
        match self.store.remove_corrupt(&self.destination, key).await {
            Ok(removed) => {
                let message = format!("discarded undecodable payload {key}: {reason}");
                self.internal_error(payload_id, &message, removed).await;
                true
            },
            Err(e) => {
                let message = format!("failed to remove undecodable payload {key}: {e}");
                self.internal_error(payload_id, &message, false).await;
                false
            },
        }
    }

    async fn internal_error(&self, payload_id: Option<PayloadId>, message: &str, evicted: bool) {
        error!(
            payload_id = ?payload_id,
            endpoint = %self.destination.endpoint,
            error = message,
            evicted,
            "internal delivery error"
        );
        self.stats.write().await.internal_errors += 1;
        self.events.publish(QueueEvent::InternalError(InternalErrorEvent {
            payload_id,
            destination: Some(self.destination.clone()),
            error: message.to_string(),
            evicted,
        }));
    }
}
