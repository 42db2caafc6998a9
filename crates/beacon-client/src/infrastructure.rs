//! Bootstraps the delivery stack from a `Config`.
//!
//! `Infrastructure` owns the queue controller and the shared default client.
//! Loggers handed out by it report through the shared client unless they
//! are created with their own.

use std::{sync::Arc, time::Duration};

use beacon_core::{EventBus, InMemoryQueueStore, QueueStore, RealClock, SqliteQueueStore};
use beacon_delivery::{HttpTransport, QueueController, Transport};
use tracing::info;

use crate::{
    client::{Client, ClientSettings},
    config::Config,
    error::Result,
    logger::{Logger, LoggerClient},
};

/// Running delivery stack: controller plus default client.
#[derive(Debug)]
pub struct Infrastructure {
    config: Config,
    controller: Arc<QueueController>,
    client: Client,
}

impl Infrastructure {
    /// Opens the configured store, builds the HTTP transport and starts the
    /// controller.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` for an invalid config, or the
    /// store, transport or controller error that stopped the bootstrap.
    pub async fn init(config: Config) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn QueueStore> = match &config.store_path {
            Some(path) => Arc::new(SqliteQueueStore::open(path).await?),
            None => Arc::new(InMemoryQueueStore::new()),
        };
        let transport = Arc::new(HttpTransport::new(config.to_transport_config())?);

        Self::with_components(config, store, transport).await
    }

    /// Starts the stack on caller-provided collaborators.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` for an invalid config, or the
    /// controller error from `init` or `start`.
    pub async fn with_components(
        config: Config,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let controller = QueueController::with_events(
            store,
            transport,
            Arc::new(RealClock::new()),
            EventBus::new(config.event_channel_capacity),
        );
        controller.init(config.to_queue_config()).await?;
        controller.start().await?;

        let client = Client::new(controller.clone(), config.to_client_settings());
        info!(
            endpoint = %config.endpoint,
            environment = %config.environment,
            persistent = config.store_path.is_some(),
            "beacon started"
        );

        Ok(Self { config, controller, client })
    }

    /// Configuration the stack was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The queue controller.
    pub fn controller(&self) -> &Arc<QueueController> {
        &self.controller
    }

    /// The shared default client.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// A client with its own settings on the shared controller.
    pub fn new_client(&self, settings: ClientSettings) -> Client {
        Client::new(self.controller.clone(), settings)
    }

    /// A logger reporting through the shared client.
    pub fn logger(&self, name: impl Into<String>) -> Logger {
        Logger::new(name, LoggerClient::Shared(self.client()), self.config.to_logger_options())
    }

    /// A logger owning a private client with `settings`.
    ///
    /// Closing the logger closes that client.
    pub fn owned_logger(&self, name: impl Into<String>, settings: ClientSettings) -> Logger {
        let client = LoggerClient::Owned(self.new_client(settings));
        Logger::new(name, client, self.config.to_logger_options())
    }

    /// Stops delivery, immediately or gracefully as configured.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` (wrapped) when an immediate
    /// stop had to abort workers.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(self.config.stop_immediately).await
    }

    /// Stops delivery, overriding the configured stop mode.
    ///
    /// # Errors
    ///
    /// See [`Infrastructure::stop`].
    pub async fn stop_with(&self, immediate: bool) -> Result<()> {
        info!(immediate, "beacon stopping");
        self.controller.stop(immediate).await?;
        Ok(())
    }

    /// Closes the shared client, waiting for its queue to drain, then stops
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns the drain timeout or stop error; delivery is stopped either
    /// way.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        let drained = self.client.close(drain_timeout).await;
        self.stop().await?;
        drained
    }
}
