//! Queue controller: owns the per-destination workers.
//!
//! The controller is built explicitly with its collaborators (store,
//! transport, clock) and shared behind an `Arc`. Its lifecycle is:
//!
//! ```text
//!  new ──▶ init(config) ──▶ start ──▶ stop(graceful) ──▶ start ...
//!                               │
//!                               └──▶ stop(immediate): join ≤ stop_timeout,
//!                                    abort stragglers, complete_processing
//! ```
//!
//! `init` succeeds once. Workers are spawned on `start` for destinations that
//! already have persisted payloads, and lazily on `enqueue` for new ones.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use beacon_core::{
    events::EventBus, models::DeadLetter, Clock, Destination, DropPolicy, EventHandler, PayloadId,
    QueueEvent, QueueStore, QueuedPayload,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, watch, Mutex, RwLock},
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    retry::RetryPolicy,
    transport::Transport,
    worker::DestinationWorker,
    DEFAULT_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT,
};

/// Controller configuration, fixed by `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Payloads each destination may send per minute.
    pub max_reports_per_minute: u32,

    /// Backoff and attempt budget for transient failures.
    pub retry_policy: RetryPolicy,

    /// What happens to payloads that exhaust their attempts.
    pub drop_policy: DropPolicy,

    /// How long an idle worker sleeps before looking at its queue again.
    pub poll_interval: Duration,

    /// Upper bound on joining workers during an immediate stop.
    pub stop_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_reports_per_minute: 60,
            retry_policy: RetryPolicy::default(),
            drop_policy: DropPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl QueueConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a zero rate budget, a
    /// zero poll interval or an invalid retry policy.
    pub fn validate(&self) -> Result<()> {
        if self.max_reports_per_minute == 0 {
            return Err(DeliveryError::configuration("max_reports_per_minute must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("poll_interval must be positive"));
        }
        self.retry_policy.validate()
    }
}

/// Lifecycle of one destination worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Spawned, not yet polling.
    Idle,
    /// Draining its queue.
    Running,
    /// Cancellation requested; finishing the current transmission.
    Cancelling,
    /// Exited or aborted.
    Stopped,
}

/// Counters for controller monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Workers currently running.
    pub active_workers: usize,
    /// Transmissions currently awaiting a response.
    pub in_flight: u64,
    /// Payloads accepted by a collector.
    pub delivered: u64,
    /// Payloads rejected with a 4xx.
    pub api_errors: u64,
    /// Failed transmissions (each retry counts).
    pub communication_errors: u64,
    /// Payloads abandoned after exhausting their attempts.
    pub dropped: u64,
    /// Subset of `dropped` kept in the dead-letter table.
    pub dead_lettered: u64,
    /// Internal errors reported.
    pub internal_errors: u64,
}

struct WorkerHandle {
    state: Arc<watch::Sender<WorkerState>>,
    task: Option<JoinHandle<()>>,
    run_token: Option<CancellationToken>,
}

impl WorkerHandle {
    fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self { state: Arc::new(state), task: None, run_token: None }
    }

    /// True if the task belongs to the current run and has not exited.
    ///
    /// A worker of a stopped run may still be finishing its transmission;
    /// it is not live, but its successor has to wait for it.
    fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
            && self.run_token.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    fn mark_cancelling(&self) {
        self.state.send_if_modified(|state| match state {
            WorkerState::Idle | WorkerState::Running => {
                *state = WorkerState::Cancelling;
                true
            },
            WorkerState::Cancelling | WorkerState::Stopped => false,
        });
    }
}

struct Lifecycle {
    config: Option<Arc<QueueConfig>>,
    running: bool,
    cancellation_token: CancellationToken,
    workers: HashMap<Destination, WorkerHandle>,
}

/// Owns the per-destination delivery workers.
pub struct QueueController {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    stats: Arc<RwLock<ControllerStats>>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for QueueController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueController").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl QueueController {
    /// Creates an uninitialised controller with a default-sized event bus.
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Self::with_events(store, transport, clock, EventBus::default())
    }

    /// Creates an uninitialised controller publishing on `events`.
    pub fn with_events(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            clock,
            events,
            stats: Arc::new(RwLock::new(ControllerStats::default())),
            lifecycle: Mutex::new(Lifecycle {
                config: None,
                running: false,
                cancellation_token: CancellationToken::new(),
                workers: HashMap::new(),
            }),
        })
    }

    /// Fixes the controller configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::AlreadyInitialized` on every call after the
    /// first successful one, leaving the existing configuration in place, and
    /// `DeliveryError::ConfigurationError` if `config` is invalid.
    pub async fn init(&self, config: QueueConfig) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.config.is_some() {
            warn!("queue controller init called more than once");
            return Err(DeliveryError::AlreadyInitialized);
        }
        config.validate()?;

        info!(
            max_reports_per_minute = config.max_reports_per_minute,
            max_attempts = config.retry_policy.max_attempts,
            "queue controller initialized"
        );
        lifecycle.config = Some(Arc::new(config));
        Ok(())
    }

    /// Configuration set by `init`.
    pub async fn config(&self) -> Option<Arc<QueueConfig>> {
        self.lifecycle.lock().await.config.clone()
    }

    /// Starts workers for every destination with persisted payloads.
    ///
    /// Calling `start` while running is a no-op. Workers of a previous run
    /// that are still finishing are not waited for here: each new worker
    /// joins its predecessor (bounded by `stop_timeout`, then aborted) before
    /// it polls, so `start` and `enqueue` never block on them.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotInitialized` before `init`, or a storage
    /// error if the persisted destinations cannot be listed.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(config) = lifecycle.config.clone() else {
            return Err(DeliveryError::NotInitialized);
        };
        if lifecycle.running {
            return Ok(());
        }

        if lifecycle.cancellation_token.is_cancelled() {
            lifecycle.cancellation_token = CancellationToken::new();
        }

        let destinations = self.store.destinations().await?;
        lifecycle.running = true;
        for destination in destinations {
            self.ensure_worker(&mut lifecycle, &config, destination).await;
        }

        info!(workers = lifecycle.workers.len(), "queue controller started");
        Ok(())
    }

    /// True between `start` and `stop`.
    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    /// Persists a payload for `destination`.
    ///
    /// When the controller is running, a worker for the destination is
    /// spawned if none is live.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a destination without
    /// endpoint or token, or a storage error if the payload cannot be saved.
    pub async fn enqueue(
        &self,
        destination: Destination,
        body: serde_json::Value,
    ) -> Result<PayloadId> {
        if destination.endpoint.trim().is_empty() {
            return Err(DeliveryError::configuration("destination endpoint is empty"));
        }
        if destination.access_token.is_blank() {
            return Err(DeliveryError::configuration("destination access token is empty"));
        }

        let payload = QueuedPayload::new(destination.clone(), body, self.clock.unix_millis());
        let id = payload.id;
        self.store.enqueue(payload).await?;

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            if let Some(config) = lifecycle.config.clone() {
                self.ensure_worker(&mut lifecycle, &config, destination).await;
            }
        }
        Ok(id)
    }

    /// Stops the workers.
    ///
    /// Graceful: cancellation is signalled and the call returns; each worker
    /// finishes its current transmission and exits on its own. Immediate:
    /// workers are joined for at most `stop_timeout`, stragglers are aborted
    /// and worker bookkeeping is cleared.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if an immediate stop had to
    /// abort workers.
    pub async fn stop(&self, immediate: bool) -> Result<()> {
        let (tasks, timeout) = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.running = false;
            lifecycle.cancellation_token.cancel();
            for worker in lifecycle.workers.values() {
                worker.mark_cancelling();
            }

            if !immediate {
                info!("queue controller stopping gracefully");
                return Ok(());
            }

            let timeout =
                lifecycle.config.as_ref().map_or(DEFAULT_STOP_TIMEOUT, |c| c.stop_timeout);
            let tasks = lifecycle
                .workers
                .values_mut()
                .filter_map(|worker| worker.task.take())
                .collect::<Vec<_>>();
            (tasks, timeout)
        };

        info!(workers = tasks.len(), timeout_ms = timeout.as_millis(), "queue controller stopping");
        let joined = join_or_abort(tasks, timeout).await;
        self.complete_processing().await;

        if joined {
            info!("queue controller stopped");
            Ok(())
        } else {
            error!(
                timeout_ms = timeout.as_millis(),
                "worker shutdown timed out, stragglers aborted"
            );
            Err(DeliveryError::ShutdownTimeout { timeout })
        }
    }

    /// Clears worker bookkeeping once workers are gone.
    ///
    /// Every known worker is marked `Stopped` and its task handle released.
    pub async fn complete_processing(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        for worker in lifecycle.workers.values_mut() {
            if let Some(task) = worker.task.take() {
                task.abort();
            }
            worker.state.send_replace(WorkerState::Stopped);
        }
        self.stats.write().await.active_workers = 0;
    }

    /// Payloads queued across all destinations.
    pub async fn total_payload_count(&self) -> Result<usize> {
        Ok(self.store.total_count().await?)
    }

    /// Payloads queued for `destination`.
    pub async fn payload_count(&self, destination: &Destination) -> Result<usize> {
        Ok(self.store.count_by_destination(destination).await?)
    }

    /// True while the payload is still queued.
    pub async fn contains(&self, id: PayloadId) -> Result<bool> {
        Ok(self.store.contains(id).await?)
    }

    /// Dead-lettered payloads for `destination`.
    pub async fn dead_letters(&self, destination: &Destination) -> Result<Vec<DeadLetter>> {
        Ok(self.store.dead_letters(destination).await?)
    }

    /// Current state of the worker for `destination`, if one was ever spawned.
    pub async fn worker_state(&self, destination: &Destination) -> Option<WorkerState> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.workers.get(destination).map(|worker| *worker.state.borrow())
    }

    /// Receiver following the worker state for `destination`.
    pub async fn watch_worker(
        &self,
        destination: &Destination,
    ) -> Option<watch::Receiver<WorkerState>> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.workers.get(destination).map(|worker| worker.state.subscribe())
    }

    /// Snapshot of the controller counters.
    pub async fn stats(&self) -> ControllerStats {
        self.stats.read().await.clone()
    }

    /// Clock the controller and its workers run on.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Bus the workers publish outcomes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Receiver for every outcome published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Runs `handler` on its own task for every future outcome.
    pub fn add_subscriber(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        self.events.attach(handler)
    }

    async fn ensure_worker(
        &self,
        lifecycle: &mut Lifecycle,
        config: &Arc<QueueConfig>,
        destination: Destination,
    ) {
        let token = lifecycle.cancellation_token.clone();
        let worker = lifecycle.workers.entry(destination.clone()).or_insert_with(WorkerHandle::new);
        if worker.is_live() {
            return;
        }

        let predecessor = worker.task.take().filter(|task| !task.is_finished());
        worker.state.send_replace(WorkerState::Idle);
        worker.run_token = Some(token.clone());
        let run = DestinationWorker::new(
            destination,
            self.store.clone(),
            self.transport.clone(),
            config.clone(),
            self.events.clone(),
            self.stats.clone(),
            token,
            self.clock.clone(),
            worker.state.clone(),
        )
        .run();
        worker.task = Some(tokio::spawn(after_predecessor(predecessor, config.stop_timeout, run)));
        self.stats.write().await.active_workers += 1;
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs a worker once the previous worker of its destination is gone.
///
/// Aborting the successor aborts the predecessor too, so an immediate stop
/// never leaves a previous-run worker behind.
async fn after_predecessor(
    predecessor: Option<JoinHandle<()>>,
    timeout: Duration,
    run: impl Future<Output = ()>,
) {
    if let Some(previous) = predecessor {
        let _abort = AbortOnDrop(previous.abort_handle());
        if !join_or_abort(vec![previous], timeout).await {
            warn!(timeout_ms = timeout.as_millis(), "worker from the previous run was aborted");
        }
    }
    run.await;
}

/// Joins `tasks` for at most `timeout`, aborting whatever is left.
///
/// Returns false if any task had to be aborted.
async fn join_or_abort(tasks: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    if tasks.is_empty() {
        return true;
    }

    let aborts = tasks.iter().map(JoinHandle::abort_handle).collect::<Vec<AbortHandle>>();
    match tokio::time::timeout(timeout, futures::future::join_all(tasks)).await {
        Ok(results) => {
            for join_error in results.into_iter().filter_map(std::result::Result::err) {
                if join_error.is_panic() {
                    error!(error = %join_error, "destination worker panicked");
                }
            }
            true
        },
        Err(_elapsed) => {
            aborts.iter().for_each(AbortHandle::abort);
            false
        },
    }
}

impl Drop for QueueController {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if lifecycle.running {
                warn!("queue controller dropped while running, cancelling workers");
                lifecycle.cancellation_token.cancel();
            }
        }
    }
}
