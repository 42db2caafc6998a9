//! Reportable items and the document they render to.
//!
//! A [`Package`] is the body of one item: an error with its source chain, a
//! plain message, or a message with a structured value. A [`Report`] adds the
//! custom key/value metadata that ends up under `data.custom`.

use std::error::Error;

use beacon_core::ErrorLevel;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::telemetry::TelemetryEvent;

/// Name reported in the `notifier` block.
pub const NOTIFIER_NAME: &str = "beacon-rs";

/// Language reported with every item.
pub const LANGUAGE: &str = "rust";

/// One error of a reported chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrame {
    /// Best-effort type name taken from the error's `Debug` output.
    pub class: String,
    /// The error's `Display` output.
    pub message: String,
}

impl ErrorFrame {
    fn capture(error: &(dyn Error + 'static)) -> Self {
        Self { class: error_class(error), message: error.to_string() }
    }

    fn render(&self, description: Option<&str>) -> Value {
        let mut exception = json!({
            "class": self.class,
            "message": self.message,
        });
        if let (Some(description), Some(exception)) = (description, exception.as_object_mut()) {
            exception.insert("description".to_string(), Value::from(description));
        }
        json!({ "frames": [], "exception": exception })
    }
}

/// Leading identifier of the `Debug` output, e.g. `Os` for
/// `Os { code: 2, .. }`.
fn error_class(error: &(dyn Error + 'static)) -> String {
    let debug = format!("{error:?}");
    let class: String =
        debug.chars().take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':').collect();
    if class.is_empty() {
        "Error".to_string()
    } else {
        class
    }
}

/// Body of a reported item.
#[derive(Debug, Clone, PartialEq)]
pub enum Package {
    /// An error and its `source()` chain, outermost first.
    Exception {
        /// The captured chain; never empty.
        chain: Vec<ErrorFrame>,
        /// Extra text shown with the outermost error.
        description: Option<String>,
    },
    /// A plain message.
    Message {
        /// Message text.
        body: String,
    },
    /// A message with structured data attached.
    Object {
        /// Message text.
        body: String,
        /// Structured data reported next to the message.
        value: Value,
    },
}

impl Package {
    /// Captures `error` and every error in its `source()` chain.
    pub fn exception(error: &(dyn Error + 'static)) -> Self {
        let mut chain = vec![ErrorFrame::capture(error)];
        let mut source = error.source();
        while let Some(error) = source {
            chain.push(ErrorFrame::capture(error));
            source = error.source();
        }
        Self::Exception { chain, description: None }
    }

    /// A plain message item.
    pub fn message(body: impl Into<String>) -> Self {
        Self::Message { body: body.into() }
    }

    /// A message item carrying structured data.
    pub fn object(body: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or_else(|e| Value::from(e.to_string()));
        Self::Object { body: body.into(), value }
    }

    /// Attaches a description to an exception package; other packages are
    /// returned unchanged.
    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        if let Self::Exception { description, .. } = &mut self {
            *description = Some(text.into());
        }
        self
    }

    /// Renders the `data.body` section.
    ///
    /// A single error renders as `trace`; an error with sources as
    /// `trace_chain`.
    pub fn render_body(&self) -> Value {
        match self {
            Self::Exception { chain, description } => match chain.as_slice() {
                [single] => json!({ "trace": single.render(description.as_deref()) }),
                [outer, sources @ ..] => {
                    let mut traces = vec![outer.render(description.as_deref())];
                    traces.extend(sources.iter().map(|frame| frame.render(None)));
                    json!({ "trace_chain": traces })
                },
                [] => json!({ "message": { "body": "" } }),
            },
            Self::Message { body } => json!({ "message": { "body": body } }),
            Self::Object { body, value } => {
                json!({ "message": { "body": body, "value": value } })
            },
        }
    }
}

/// A package plus its custom metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    package: Package,
    custom: Map<String, Value>,
}

impl Report {
    /// Wraps a package without metadata.
    pub fn new(package: Package) -> Self {
        Self { package, custom: Map::new() }
    }

    /// Sets one metadata entry, replacing an earlier value for `key`.
    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// The wrapped package.
    pub fn package(&self) -> &Package {
        &self.package
    }

    /// Metadata rendered under `data.custom`.
    pub fn custom(&self) -> &Map<String, Value> {
        &self.custom
    }

    /// Renders the full document posted to the collector.
    ///
    /// Telemetry from the context, if any, goes to `data.body.telemetry`.
    pub fn render(&self, context: &RenderContext<'_>) -> Value {
        let mut body = self.package.render_body();
        if !context.telemetry.is_empty() {
            if let Some(body) = body.as_object_mut() {
                let events =
                    context.telemetry.iter().filter_map(|event| serde_json::to_value(event).ok());
                body.insert("telemetry".to_string(), Value::Array(events.collect()));
            }
        }

        let mut data = json!({
            "environment": context.environment,
            "level": context.level,
            "timestamp": context.timestamp,
            "platform": std::env::consts::OS,
            "language": LANGUAGE,
            "notifier": {
                "name": NOTIFIER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "body": body,
        });
        if !self.custom.is_empty() {
            if let Some(data) = data.as_object_mut() {
                data.insert("custom".to_string(), Value::Object(self.custom.clone()));
            }
        }
        json!({ "access_token": context.access_token, "data": data })
    }
}

impl From<Package> for Report {
    fn from(package: Package) -> Self {
        Self::new(package)
    }
}

/// Per-item values the document needs besides the report.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// Token of the destination the item is queued for.
    pub access_token: &'a str,
    /// Environment name from configuration.
    pub environment: &'a str,
    /// Severity of the item.
    pub level: ErrorLevel,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Recent events to send along, oldest first.
    pub telemetry: &'a [TelemetryEvent],
}
