//! Core domain types for the beacon telemetry agent.
//!
//! Provides the destination and queued payload models, the outcome event
//! bus, the payload scrubber and the durable queue store. The delivery and
//! client crates build on these primitives.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod scrubbing;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{EventBus, EventHandler, NoOpEventHandler, QueueEvent};
pub use models::{AccessToken, Destination, DropPolicy, ErrorLevel, PayloadId, QueuedPayload};
pub use scrubbing::{filter_out_critical_fields, PayloadScrubber, ScrubRules, SCRUB_MASK};
pub use storage::{InMemoryQueueStore, QueueStore, SqliteQueueStore};
pub use time::{Clock, RealClock, TestClock};
