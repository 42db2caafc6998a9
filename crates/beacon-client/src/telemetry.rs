//! Trail of recent events attached to every reported item.
//!
//! A client with telemetry enabled keeps the last `queue_depth` events in a
//! ring; each item it reports carries a copy under `data.body.telemetry`,
//! oldest first. Loggers record one `log` (or `error`) event per reported
//! call, after handing the call's own item to the client.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use beacon_core::ErrorLevel;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Events kept when the configuration does not say otherwise.
pub const DEFAULT_TELEMETRY_QUEUE_DEPTH: usize = 5;

/// Kind of a telemetry event, as the collector groups them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryType {
    /// A log call.
    Log,
    /// An outgoing request and its status.
    Network,
    /// A change of location within the application.
    Navigation,
    /// An error that was observed.
    Error,
    /// Anything recorded explicitly by the application.
    Manual,
}

/// Side of the system an event originated on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySource {
    /// A client application.
    Client,
    /// A server process.
    #[default]
    Server,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Severity of the event.
    pub level: ErrorLevel,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: TelemetryType,
    /// Where the event originated.
    pub source: TelemetrySource,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Kind-specific details.
    pub body: Value,
}

impl TelemetryEvent {
    /// Creates a server-side event.
    pub fn new(kind: TelemetryType, level: ErrorLevel, body: Value, timestamp_ms: i64) -> Self {
        Self { level, kind, source: TelemetrySource::default(), timestamp_ms, body }
    }

    /// A log message.
    pub fn log(level: ErrorLevel, message: impl Into<String>, timestamp_ms: i64) -> Self {
        let body = json!({ "message": message.into() });
        Self::new(TelemetryType::Log, level, body, timestamp_ms)
    }

    /// An observed error.
    pub fn error(level: ErrorLevel, message: impl Into<String>, timestamp_ms: i64) -> Self {
        let body = json!({ "message": message.into() });
        Self::new(TelemetryType::Error, level, body, timestamp_ms)
    }

    /// An outgoing request.
    pub fn network(
        method: impl Into<String>,
        url: impl Into<String>,
        status_code: u16,
        timestamp_ms: i64,
    ) -> Self {
        let level = if status_code >= 500 { ErrorLevel::Error } else { ErrorLevel::Info };
        let body = json!({
            "method": method.into(),
            "url": url.into(),
            "status_code": status_code.to_string(),
        });
        Self::new(TelemetryType::Network, level, body, timestamp_ms)
    }

    /// A move from one location to another.
    pub fn navigation(from: impl Into<String>, to: impl Into<String>, timestamp_ms: i64) -> Self {
        let body = json!({ "from": from.into(), "to": to.into() });
        Self::new(TelemetryType::Navigation, ErrorLevel::Info, body, timestamp_ms)
    }

    /// Sets where the event originated.
    pub fn with_source(mut self, source: TelemetrySource) -> Self {
        self.source = source;
        self
    }
}

/// Ring of the most recent events; the oldest is evicted when full.
#[derive(Debug)]
pub struct TelemetryQueue {
    depth: usize,
    events: Mutex<VecDeque<TelemetryEvent>>,
}

impl TelemetryQueue {
    /// Creates a queue keeping at most `depth` events.
    pub fn new(depth: usize) -> Self {
        Self { depth, events: Mutex::new(VecDeque::with_capacity(depth)) }
    }

    /// Maximum number of events kept.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Appends an event, evicting the oldest beyond `depth`.
    pub fn record(&self, event: TelemetryEvent) {
        if self.depth == 0 {
            return;
        }
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.depth {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copy of the kept events, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    /// Number of kept events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every kept event.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_events_are_evicted_beyond_depth() {
        let queue = TelemetryQueue::new(3);
        for n in 0..5 {
            queue.record(TelemetryEvent::log(ErrorLevel::Info, format!("event {n}"), n));
        }

        let kept = queue.snapshot().iter().map(|e| e.timestamp_ms).collect::<Vec<_>>();
        assert_eq!(kept, [2, 3, 4]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn zero_depth_keeps_nothing() {
        let queue = TelemetryQueue::new(0);
        queue.record(TelemetryEvent::log(ErrorLevel::Info, "dropped", 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn events_render_in_collector_shape() {
        let event =
            TelemetryEvent::network("GET", "https://api.test/orders", 503, 1_700_000_000_000);

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "level": "error",
                "type": "network",
                "source": "server",
                "timestamp_ms": 1_700_000_000_000_i64,
                "body": {"method": "GET", "url": "https://api.test/orders", "status_code": "503"},
            })
        );
    }

    #[test]
    fn clear_empties_the_ring() {
        let queue = TelemetryQueue::new(2);
        queue.record(TelemetryEvent::navigation("/cart", "/checkout", 1));
        queue.clear();
        assert!(queue.snapshot().is_empty());
    }
}
