//! Logger front end: level filtering, scope admission and item composition.
//!
//! A `Logger` turns `(level, event id, state, error, formatter)` calls into
//! reports for its client. Items are counted against the current scope and a
//! scope that reaches `max_items` reports one warning and then goes quiet.

use std::{error::Error, time::Duration};

use beacon_core::{ErrorLevel, PayloadId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    client::Client,
    error::Result,
    package::{Package, Report},
    scope::{self, Admission, ScopeGuard},
    telemetry::TelemetryEvent,
};

/// Text of the item reported when a scope reaches its item limit.
pub const MAX_ITEMS_REACHED_WARNING: &str =
    "maximum number of items per scope reached, further items in this scope are suppressed";

/// Custom key holding the rendered event id.
pub const LOG_EVENT_ID_KEY: &str = "LogEventID";

/// Custom key holding the formatted message of an error item.
pub const LOG_MESSAGE_KEY: &str = "LogMessage";

/// Custom key holding the logger name.
pub const LOGGER_NAME_KEY: &str = "RollbarLoggerName";

/// Formats a log state, and the error if any, into a message.
pub type Formatter<S> = dyn Fn(&S, Option<&(dyn Error + 'static)>) -> String;

/// Logger-side severity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Most verbose.
    #[default]
    Trace,
    /// Debugging detail.
    Debug,
    /// Normal operation.
    Information,
    /// Unexpected but handled.
    Warning,
    /// A failed operation.
    Error,
    /// Failure requiring immediate attention.
    Critical,
    /// Disables logging.
    None,
}

impl LogLevel {
    /// Severity reported to the collector, `None` for `LogLevel::None`.
    pub fn to_error_level(self) -> Option<ErrorLevel> {
        match self {
            Self::Trace | Self::Debug => Some(ErrorLevel::Debug),
            Self::Information => Some(ErrorLevel::Info),
            Self::Warning => Some(ErrorLevel::Warning),
            Self::Error => Some(ErrorLevel::Error),
            Self::Critical => Some(ErrorLevel::Critical),
            Self::None => None,
        }
    }
}

/// Identifier of a log call site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LogEventId {
    /// Numeric id.
    pub id: i32,
    /// Optional name shown next to the id.
    pub name: Option<String>,
}

impl LogEventId {
    /// An id without a name.
    pub fn new(id: i32) -> Self {
        Self { id, name: None }
    }

    /// An id with a name.
    pub fn named(id: i32, name: impl Into<String>) -> Self {
        Self { id, name: Some(name.into()) }
    }

    /// `"{id}"`, or `"{id} ({name})"` when the name is not blank.
    pub fn render(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{} ({name})", self.id),
            _ => self.id.to_string(),
        }
    }
}

impl From<i32> for LogEventId {
    fn from(id: i32) -> Self {
        Self::new(id)
    }
}

/// Filtering applied by a logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerOptions {
    /// Lowest level reported.
    pub min_level: LogLevel,
    /// Items per scope before the scope is silenced; zero disables the limit.
    pub max_items: u32,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self { min_level: LogLevel::Trace, max_items: 10 }
    }
}

/// Client a logger reports through.
#[derive(Debug, Clone)]
pub enum LoggerClient {
    /// Private to the logger and closed with it.
    Owned(Client),
    /// Process-wide default; a logger never closes it.
    Shared(Client),
}

impl LoggerClient {
    /// The underlying client.
    pub fn client(&self) -> &Client {
        match self {
            Self::Owned(client) | Self::Shared(client) => client,
        }
    }
}

/// Named logger feeding a client.
#[derive(Debug, Clone)]
pub struct Logger {
    name: String,
    client: LoggerClient,
    options: LoggerOptions,
}

impl Logger {
    /// Creates a logger.
    pub fn new(name: impl Into<String>, client: LoggerClient, options: LoggerOptions) -> Self {
        Self { name: name.into(), client, options }
    }

    /// Logger name, reported as `RollbarLoggerName`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client items are handed to.
    pub fn client(&self) -> &LoggerClient {
        &self.client
    }

    /// True if `level` passes the logger's filter.
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::None && level >= self.options.min_level
    }

    /// Reports one log call.
    ///
    /// Returns the id of the queued item, which is the limit warning when
    /// this call hit the scope's item limit. Returns `None` if the call was
    /// filtered, suppressed, had nothing to report or could not be queued.
    pub async fn log<S>(
        &self,
        level: LogLevel,
        event_id: impl Into<LogEventId>,
        state: &S,
        error: Option<&(dyn Error + 'static)>,
        formatter: Option<&Formatter<S>>,
    ) -> Option<PayloadId>
    where
        S: Default + PartialEq,
    {
        let error_level = level.to_error_level().filter(|_| self.is_enabled(level))?;
        if *state == S::default() && error.is_none() {
            return None;
        }

        match scope::admit(self.options.max_items) {
            Admission::Admitted => {},
            Admission::LimitReached => {
                warn!(
                    logger = %self.name,
                    max_items = self.options.max_items,
                    "scope item limit reached, suppressing further items"
                );
                let warning = Package::message(MAX_ITEMS_REACHED_WARNING);
                return self.client.client().log(ErrorLevel::Warning, warning).await;
            },
            Admission::OverLimit => return None,
        }

        let report = self.compose(&event_id.into(), state, error, formatter)?;
        let client = self.client.client();
        let trail = client
            .telemetry_enabled()
            .then(|| trail_event(error_level, &report, client.unix_millis()));

        let queued = client.log(error_level, report).await;
        if let Some(event) = trail {
            client.record_telemetry(event);
        }
        queued
    }

    /// Builds the report for one call without queuing it.
    ///
    /// An error becomes an exception package; otherwise a non-blank message
    /// becomes a message package; otherwise there is nothing to report.
    pub fn compose<S>(
        &self,
        event_id: &LogEventId,
        state: &S,
        error: Option<&(dyn Error + 'static)>,
        formatter: Option<&Formatter<S>>,
    ) -> Option<Report> {
        let message = formatter.map(|format| format(state, error));

        let package = match (error, message.as_deref()) {
            (Some(error), _) => Package::exception(error).with_description(error.to_string()),
            (None, Some(message)) if !message.trim().is_empty() => Package::message(message),
            _ => return None,
        };

        let mut report = Report::new(package).with_custom(LOG_EVENT_ID_KEY, event_id.render());
        if let (Some(_), Some(message)) = (error, message) {
            report = report.with_custom(LOG_MESSAGE_KEY, message);
        }
        if !self.name.trim().is_empty() {
            report = report.with_custom(LOGGER_NAME_KEY, self.name.clone());
        }
        Some(report)
    }

    /// Opens a scope named after this logger.
    pub fn begin_scope(&self, state: impl Serialize) -> ScopeGuard {
        let state = serde_json::to_value(state).unwrap_or_default();
        scope::push_scope(self.name.clone(), state)
    }

    /// Closes an owned client, waiting up to `drain_timeout` for its queue.
    /// A shared client is left running.
    ///
    /// # Errors
    ///
    /// Propagates `ClientError::DrainTimeout` from the owned client.
    pub async fn close(&self, drain_timeout: Duration) -> Result<()> {
        match &self.client {
            LoggerClient::Owned(client) => client.close(drain_timeout).await,
            LoggerClient::Shared(_) => {
                debug!(logger = %self.name, "shared client left open");
                Ok(())
            },
        }
    }
}

/// Telemetry entry standing for one reported log call.
fn trail_event(level: ErrorLevel, report: &Report, timestamp_ms: i64) -> TelemetryEvent {
    match report.package() {
        Package::Exception { chain, .. } => {
            let message = chain.first().map(|frame| frame.message.clone()).unwrap_or_default();
            TelemetryEvent::error(level, message, timestamp_ms)
        },
        Package::Message { body } | Package::Object { body, .. } => {
            TelemetryEvent::log(level, body.clone(), timestamp_ms)
        },
    }
}
