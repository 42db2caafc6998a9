//! Client facade: compose, scrub, enqueue.
//!
//! `log` returns as soon as the item is durably queued; delivery happens on
//! the controller's workers. `log_blocking` additionally waits for the
//! item's outcome on the event bus.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use beacon_core::{
    events::InternalErrorEvent, scrubbing::BodyOutcome, Destination, ErrorLevel, PayloadId,
    PayloadScrubber, QueueEvent, ScrubRules,
};
use beacon_delivery::QueueController;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, Result},
    package::{RenderContext, Report},
    telemetry::{TelemetryEvent, TelemetryQueue},
};

/// How often `close` looks at the queue while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Per-client settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Where items are delivered.
    pub destination: Destination,
    /// Environment name stamped on every item.
    pub environment: String,
    /// Rules applied before an item is queued.
    pub scrub_rules: ScrubRules,
    /// Default wait of `log_blocking_default`.
    pub blocking_timeout: Duration,
    /// Attach recent telemetry events to every item.
    pub telemetry_enabled: bool,
    /// Telemetry events kept for the next item.
    pub telemetry_queue_depth: usize,
}

struct ClientInner {
    controller: Arc<QueueController>,
    settings: ClientSettings,
    scrubber: PayloadScrubber,
    telemetry: Option<TelemetryQueue>,
    closed: AtomicBool,
}

/// Entry point for reporting items.
///
/// Cloning is cheap; clones share the same closed flag.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("destination", &self.inner.settings.destination)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client queuing through `controller`.
    pub fn new(controller: Arc<QueueController>, settings: ClientSettings) -> Self {
        let scrubber = PayloadScrubber::new(settings.scrub_rules.clone());
        let telemetry = settings
            .telemetry_enabled
            .then(|| TelemetryQueue::new(settings.telemetry_queue_depth));
        Self {
            inner: Arc::new(ClientInner {
                controller,
                settings,
                scrubber,
                telemetry,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Destination this client reports to.
    pub fn destination(&self) -> &Destination {
        &self.inner.settings.destination
    }

    /// Settings the client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Controller the client queues through.
    pub fn controller(&self) -> &Arc<QueueController> {
        &self.inner.controller
    }

    /// True if this client keeps a telemetry trail.
    pub fn telemetry_enabled(&self) -> bool {
        self.inner.telemetry.is_some()
    }

    /// Adds an event to the trail sent with later items. Ignored when
    /// telemetry is disabled.
    pub fn record_telemetry(&self, event: TelemetryEvent) {
        if let Some(telemetry) = &self.inner.telemetry {
            telemetry.record(event);
        }
    }

    /// The current trail, oldest first.
    pub fn telemetry(&self) -> Vec<TelemetryEvent> {
        self.inner.telemetry.as_ref().map(TelemetryQueue::snapshot).unwrap_or_default()
    }

    /// Milliseconds since the Unix epoch on the controller's clock.
    pub fn unix_millis(&self) -> i64 {
        self.inner.controller.clock().unix_millis()
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queues an item and returns its id.
    ///
    /// Never fails: an item that cannot be queued is reported as an
    /// `InternalError` event and `None` is returned. A closed client queues
    /// nothing.
    pub async fn log(&self, level: ErrorLevel, report: impl Into<Report>) -> Option<PayloadId> {
        if self.is_closed() {
            debug!(endpoint = %self.destination().endpoint, "client closed, item ignored");
            return None;
        }

        let document = self.compose(level, &report.into());
        match self.inner.controller.enqueue(self.destination().clone(), document).await {
            Ok(payload_id) => {
                debug!(payload_id = %payload_id, level = %level, "item queued");
                Some(payload_id)
            },
            Err(e) => {
                warn!(endpoint = %self.destination().endpoint, error = %e, "failed to queue item");
                self.inner.controller.events().publish(QueueEvent::InternalError(
                    InternalErrorEvent {
                        payload_id: None,
                        destination: Some(self.destination().clone()),
                        error: e.to_string(),
                        evicted: false,
                    },
                ));
                None
            },
        }
    }

    /// Queues an item and waits until its outcome is observed.
    ///
    /// Delivery, API rejection, drop and internal errors that evicted the
    /// item all count as outcomes; retries and transient store failures do
    /// not. Returns `Ok(None)` if the item could not be
    /// queued (reported as an `InternalError` event).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::BlockingTimeout` if no outcome arrives within
    /// `timeout`; the item stays queued. Returns `ClientError::Closed` on a
    /// closed client.
    pub async fn log_blocking(
        &self,
        level: ErrorLevel,
        report: impl Into<Report>,
        timeout: Duration,
    ) -> Result<Option<PayloadId>> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        // Subscribe first so the outcome cannot be published unseen.
        let mut events = self.inner.controller.subscribe();
        let Some(payload_id) = self.log(level, report).await else {
            return Ok(None);
        };

        let outcome = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.payload_id() == Some(payload_id) && event.is_terminal() => {
                        return;
                    },
                    Ok(_) => {},
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(payload_id = %payload_id, skipped, "outcome receiver lagged");
                        if let Ok(false) = self.inner.controller.contains(payload_id).await {
                            return;
                        }
                    },
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };

        match tokio::time::timeout(timeout, outcome).await {
            Ok(()) => Ok(Some(payload_id)),
            Err(_) => {
                warn!(
                    payload_id = %payload_id,
                    timeout_ms = timeout.as_millis(),
                    "blocking log timed out, item stays queued"
                );
                Err(ClientError::BlockingTimeout { payload_id, timeout })
            },
        }
    }

    /// `log_blocking` with the configured blocking timeout.
    ///
    /// # Errors
    ///
    /// See [`Client::log_blocking`].
    pub async fn log_blocking_default(
        &self,
        level: ErrorLevel,
        report: impl Into<Report>,
    ) -> Result<Option<PayloadId>> {
        self.log_blocking(level, report, self.inner.settings.blocking_timeout).await
    }

    /// Stops accepting items and waits for this destination's queue to
    /// drain.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::DrainTimeout` if items remain after
    /// `drain_timeout`; they stay queued.
    pub async fn close(&self, drain_timeout: Duration) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!(endpoint = %self.destination().endpoint, "client closing");
        }

        let drained = tokio::time::timeout(drain_timeout, async {
            loop {
                match self.inner.controller.payload_count(self.destination()).await {
                    Ok(0) => return,
                    Ok(_) => {},
                    Err(e) => warn!(error = %e, "failed to count queued items"),
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        if drained.is_ok() {
            return Ok(());
        }
        let remaining = self.inner.controller.payload_count(self.destination()).await?;
        if remaining == 0 {
            return Ok(());
        }
        warn!(
            endpoint = %self.destination().endpoint,
            remaining,
            "client closed with items still queued"
        );
        Err(ClientError::DrainTimeout { remaining, timeout: drain_timeout })
    }

    /// Renders and scrubs the document for one item.
    fn compose(&self, level: ErrorLevel, report: &Report) -> serde_json::Value {
        let settings = &self.inner.settings;
        let now = DateTime::<Utc>::from(self.inner.controller.clock().now_system());
        let telemetry = self.telemetry();
        let mut document = report.render(&RenderContext {
            access_token: settings.destination.access_token.expose(),
            environment: &settings.environment,
            level,
            timestamp: now.timestamp(),
            telemetry: &telemetry,
        });
        let scrubbed = self.inner.scrubber.scrub_in_place(&mut document);
        if scrubbed.request_body == BodyOutcome::UnsupportedFormat
            || scrubbed.response_body == BodyOutcome::UnsupportedFormat
        {
            debug!("http body is not json, body rules skipped");
        }
        document
    }
}
