//! Client facade for the beacon telemetry agent.
//!
//! Items flow through this crate in order:
//!
//! 1. **Logger** - level filter and scope admission (`max_items` per scope)
//! 2. **Composer** - exception, message or object package plus custom keys
//! 3. **Client** - render the document with the telemetry trail, scrub it,
//!    queue it durably
//! 4. **Controller** - per-destination workers deliver in the background
//!
//! # Example
//!
//! ```no_run
//! use beacon_client::{Config, Infrastructure, LogLevel};
//!
//! # async fn example() -> beacon_client::Result<()> {
//! let beacon = Infrastructure::init(Config::load()?).await?;
//! let logger = beacon.logger("checkout");
//!
//! let _scope = logger.begin_scope(serde_json::json!({"order": 42}));
//! let state = "payment declined".to_string();
//! let format: &beacon_client::logger::Formatter<String> = &|state, _| state.clone();
//! logger.log(LogLevel::Warning, 7, &state, None, Some(format)).await;
//!
//! beacon.shutdown(std::time::Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;
pub mod package;
pub mod scope;
pub mod telemetry;

pub use client::{Client, ClientSettings};
pub use config::Config;
pub use error::{ClientError, Result};
pub use infrastructure::Infrastructure;
pub use logger::{LogEventId, LogLevel, Logger, LoggerClient, LoggerOptions};
pub use package::{Package, Report};
pub use scope::{Admission, ScopeGuard};
pub use telemetry::{TelemetryEvent, TelemetryQueue, TelemetryType};
