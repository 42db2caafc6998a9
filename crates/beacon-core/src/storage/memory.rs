//! Process-local queue store.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::sync::RwLock;

use super::{QueueStore, StoreFuture};
use crate::{
    error::CoreError,
    models::{DeadLetter, Destination, PayloadId, QueuedPayload},
};

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<Destination, VecDeque<QueuedPayload>>,
    locations: HashMap<PayloadId, Destination>,
    dead_letters: Vec<DeadLetter>,
    injected_failure: Option<String>,
    injected_attempt_failure: Option<String>,
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), CoreError> {
        match self.injected_failure.take() {
            Some(message) => Err(CoreError::Database(message)),
            None => Ok(()),
        }
    }

    fn take_attempt_failure(&mut self) -> Result<(), CoreError> {
        match self.injected_attempt_failure.take() {
            Some(message) => Err(CoreError::Database(message)),
            None => Ok(()),
        }
    }

    fn take_payload(&mut self, id: PayloadId) -> Option<QueuedPayload> {
        let destination = self.locations.remove(&id)?;
        let queue = self.queues.get_mut(&destination)?;
        let position = queue.iter().position(|p| p.id == id)?;
        let payload = queue.remove(position);
        if queue.is_empty() {
            self.queues.remove(&destination);
        }
        payload
    }
}

/// Queue store kept entirely in memory.
///
/// Clones share the same queues. Contents are lost when the last clone is
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next peek fail with a database error.
    ///
    /// Used to exercise the workers' internal-error path.
    pub async fn inject_failure(&self, message: impl Into<String>) {
        self.state.write().await.injected_failure = Some(message.into());
    }

    /// Makes the next `record_attempt` fail with a database error. The
    /// payload stays queued.
    pub async fn inject_attempt_failure(&self, message: impl Into<String>) {
        self.state.write().await.injected_attempt_failure = Some(message.into());
    }
}

impl QueueStore for InMemoryQueueStore {
    fn enqueue(&self, payload: QueuedPayload) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.locations.contains_key(&payload.id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "payload {} already queued",
                    payload.id
                )));
            }
            state.locations.insert(payload.id, payload.destination.clone());
            state.queues.entry(payload.destination.clone()).or_default().push_back(payload);
            Ok(())
        })
    }

    fn peek_oldest<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> StoreFuture<'a, Option<QueuedPayload>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.take_failure()?;
            Ok(state.queues.get(destination).and_then(|queue| queue.front().cloned()))
        })
    }

    fn remove(&self, id: PayloadId) -> StoreFuture<'_, bool> {
        Box::pin(async move { Ok(self.state.write().await.take_payload(id).is_some()) })
    }

    fn count_by_destination<'a>(&'a self, destination: &'a Destination) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            Ok(self.state.read().await.queues.get(destination).map_or(0, VecDeque::len))
        })
    }

    fn total_count(&self) -> StoreFuture<'_, usize> {
        Box::pin(async move { Ok(self.state.read().await.locations.len()) })
    }

    fn record_attempt(&self, id: PayloadId) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.take_attempt_failure()?;
            let destination =
                state.locations.get(&id).cloned().ok_or(CoreError::PayloadNotFound(id))?;
            let payload = state
                .queues
                .get_mut(&destination)
                .and_then(|queue| queue.iter_mut().find(|p| p.id == id))
                .ok_or(CoreError::PayloadNotFound(id))?;
            payload.attempt_count += 1;
            Ok(payload.attempt_count)
        })
    }

    fn contains(&self, id: PayloadId) -> StoreFuture<'_, bool> {
        Box::pin(async move { Ok(self.state.read().await.locations.contains_key(&id)) })
    }

    fn destinations(&self) -> StoreFuture<'_, Vec<Destination>> {
        Box::pin(async move {
            Ok(self.state.read().await.queues.keys().cloned().collect::<Vec<_>>())
        })
    }

    fn dead_letter(&self, id: PayloadId, reason: String, failed_at: i64) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(payload) = state.take_payload(id) else {
                return Ok(false);
            };
            state.dead_letters.push(DeadLetter { payload, reason, failed_at });
            Ok(true)
        })
    }

    fn remove_corrupt<'a>(
        &'a self,
        destination: &'a Destination,
        key: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let Ok(id) = key.parse::<PayloadId>() else {
                return Ok(false);
            };
            let mut state = self.state.write().await;
            if state.locations.get(&id) != Some(destination) {
                return Ok(false);
            }
            Ok(state.take_payload(id).is_some())
        })
    }

    fn dead_letters<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> StoreFuture<'a, Vec<DeadLetter>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .dead_letters
                .iter()
                .filter(|letter| &letter.payload.destination == destination)
                .cloned()
                .collect::<Vec<_>>())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn destination(token: &str) -> Destination {
        Destination::new("https://collector.test/api/1/item/", token)
    }

    #[tokio::test]
    async fn peek_returns_oldest_per_destination() {
        let store = InMemoryQueueStore::new();
        let first = QueuedPayload::new(destination("a"), json!({"n": 1}), 1);
        let second = QueuedPayload::new(destination("a"), json!({"n": 2}), 2);
        let other = QueuedPayload::new(destination("b"), json!({"n": 3}), 3);

        store.enqueue(first.clone()).await.unwrap();
        store.enqueue(second.clone()).await.unwrap();
        store.enqueue(other.clone()).await.unwrap();

        assert_eq!(store.peek_oldest(&destination("a")).await.unwrap(), Some(first.clone()));
        assert_eq!(store.peek_oldest(&destination("b")).await.unwrap(), Some(other));
        assert_eq!(store.total_count().await.unwrap(), 3);

        assert!(store.remove(first.id).await.unwrap());
        assert!(!store.remove(first.id).await.unwrap());
        assert_eq!(store.peek_oldest(&destination("a")).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = InMemoryQueueStore::new();
        let payload = QueuedPayload::new(destination("a"), json!({}), 1);

        store.enqueue(payload.clone()).await.unwrap();
        assert!(matches!(
            store.enqueue(payload).await,
            Err(CoreError::ConstraintViolation(_))
        ));
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let store = InMemoryQueueStore::new();
        store.inject_failure("disk full").await;

        assert!(store.peek_oldest(&destination("a")).await.is_err());
        assert!(store.peek_oldest(&destination("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_attempt_failure_keeps_the_payload() {
        let store = InMemoryQueueStore::new();
        let payload = QueuedPayload::new(destination("a"), json!({}), 1);
        store.enqueue(payload.clone()).await.unwrap();
        store.inject_attempt_failure("database is locked").await;

        assert!(matches!(store.record_attempt(payload.id).await, Err(CoreError::Database(_))));
        assert!(store.contains(payload.id).await.unwrap());
        assert_eq!(store.record_attempt(payload.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_corrupt_is_scoped_to_the_destination() {
        let store = InMemoryQueueStore::new();
        let payload = QueuedPayload::new(destination("a"), json!({}), 1);
        store.enqueue(payload.clone()).await.unwrap();
        let key = payload.id.to_string();

        assert!(!store.remove_corrupt(&destination("b"), &key).await.unwrap());
        assert!(!store.remove_corrupt(&destination("a"), "not-an-id").await.unwrap());
        assert!(store.remove_corrupt(&destination("a"), &key).await.unwrap());
        assert_eq!(store.total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn emptied_destinations_are_forgotten() {
        let store = InMemoryQueueStore::new();
        let payload = QueuedPayload::new(destination("a"), json!({}), 1);
        store.enqueue(payload.clone()).await.unwrap();

        assert_eq!(store.destinations().await.unwrap(), vec![destination("a")]);
        store.remove(payload.id).await.unwrap();
        assert!(store.destinations().await.unwrap().is_empty());
    }
}
