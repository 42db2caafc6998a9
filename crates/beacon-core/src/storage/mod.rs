//! Durable queue of composed payloads, keyed by destination.
//!
//! `QueueStore` is the only state shared between callers enqueueing payloads
//! and the per-destination workers draining them. Implementations must accept
//! concurrent enqueues from any task while one worker per destination peeks
//! and removes.
//!
//! Two implementations ship with the crate:
//!
//! - `SqliteQueueStore`: survives process restarts.
//! - `InMemoryQueueStore`: process-local, used when no store path is
//!   configured and throughout the test suites.

use std::{future::Future, pin::Pin};

use crate::{
    error::Result,
    models::{DeadLetter, Destination, PayloadId, QueuedPayload},
};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryQueueStore;
pub use sqlite::SqliteQueueStore;

/// Boxed future returned by every `QueueStore` operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the queue controller.
pub trait QueueStore: Send + Sync + 'static {
    /// Appends a payload to its destination's queue.
    fn enqueue(&self, payload: QueuedPayload) -> StoreFuture<'_, ()>;

    /// Returns the oldest queued payload for `destination` without removing it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::CorruptPayload` if the oldest row cannot be
    /// decoded. It keeps failing until that row is removed with
    /// [`QueueStore::remove_corrupt`].
    fn peek_oldest<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> StoreFuture<'a, Option<QueuedPayload>>;

    /// Removes a payload. Returns false if it was not queued.
    fn remove(&self, id: PayloadId) -> StoreFuture<'_, bool>;

    /// Number of payloads queued for `destination`.
    fn count_by_destination<'a>(&'a self, destination: &'a Destination) -> StoreFuture<'a, usize>;

    /// Number of payloads queued across all destinations.
    fn total_count(&self) -> StoreFuture<'_, usize>;

    /// Increments a payload's attempt counter and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::PayloadNotFound` if the payload is not queued.
    fn record_attempt(&self, id: PayloadId) -> StoreFuture<'_, u32>;

    /// True if the payload is still queued.
    fn contains(&self, id: PayloadId) -> StoreFuture<'_, bool>;

    /// Destinations that currently have queued payloads.
    fn destinations(&self) -> StoreFuture<'_, Vec<Destination>>;

    /// Moves a payload out of the queue into the dead-letter table.
    ///
    /// Returns false if the payload was not queued.
    fn dead_letter(&self, id: PayloadId, reason: String, failed_at: i64) -> StoreFuture<'_, bool>;

    /// Deletes a row of `destination` that cannot be decoded, by stored id.
    ///
    /// Returns false if no such row exists.
    fn remove_corrupt<'a>(
        &'a self,
        destination: &'a Destination,
        key: &'a str,
    ) -> StoreFuture<'a, bool>;

    /// Dead-lettered payloads for `destination`, oldest first.
    fn dead_letters<'a>(&'a self, destination: &'a Destination)
        -> StoreFuture<'a, Vec<DeadLetter>>;
}
