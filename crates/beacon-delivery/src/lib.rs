//! Reliable delivery of queued telemetry payloads.
//!
//! The `QueueController` runs one worker task per destination. Each worker
//! drains its destination's queue from the persistent store in FIFO order:
//!
//! 1. **Peek** - oldest payload for the destination, or sleep a poll interval
//! 2. **Backoff** - wait out the retry deadline of a previously failed payload
//! 3. **Rate limit** - take a token from the destination's bucket
//! 4. **Transmit** - post through the `Transport`
//! 5. **Settle** - remove, retry, dead-letter or drop, and publish the outcome
//!
//! Delivery is at-least-once: a payload leaves the store only after the
//! collector answered, so a crash mid-transmission resends it after restart.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use beacon_core::{Destination, InMemoryQueueStore, RealClock};
//! use beacon_delivery::{HttpTransport, QueueConfig, QueueController};
//!
//! # async fn example() -> beacon_delivery::Result<()> {
//! let controller = QueueController::new(
//!     Arc::new(InMemoryQueueStore::new()),
//!     Arc::new(HttpTransport::with_defaults()?),
//!     Arc::new(RealClock::new()),
//! );
//! controller.init(QueueConfig::default()).await?;
//! controller.start().await?;
//!
//! let destination = Destination::new("https://collector.example/api/1/item/", "token");
//! controller.enqueue(destination, serde_json::json!({"data": {}})).await?;
//!
//! controller.stop(true).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod controller;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod transport;
mod worker;

pub use controller::{ControllerStats, QueueConfig, QueueController, WorkerState};
pub use error::{DeliveryError, Result};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use transport::{HttpTransport, Transport, TransportConfig, TransportResponse};

/// Default sleep of an idle worker between queue checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default bound on joining workers during an immediate stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);
