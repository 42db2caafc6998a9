//! Shared setup for the client integration suites.

#![allow(dead_code)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{error::Error, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use beacon_client::{Config, Infrastructure};
use beacon_core::InMemoryQueueStore;
use beacon_delivery::{
    transport::mock::{MockTransport, RecordedRequest},
    BackoffStrategy,
};
use tracing_subscriber::EnvFilter;

pub const TOKEN: &str = "project-token";
pub const ENDPOINT: &str = "https://collector.test/api/1/item/";

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,beacon_client=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Configuration with millisecond-scale delays and `max_items = 3`.
pub fn test_config() -> Config {
    Config {
        access_token: TOKEN.to_string(),
        endpoint: ENDPOINT.to_string(),
        environment: "test".to_string(),
        max_items: 3,
        max_reports_per_minute: 6_000,
        poll_interval_ms: 5,
        max_attempts: 3,
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        retry_jitter_factor: 0.0,
        backoff_strategy: BackoffStrategy::Fixed,
        stop_timeout_secs: 2,
        blocking_timeout_ms: 2_000,
        ..Config::default()
    }
}

pub struct Harness {
    pub beacon: Infrastructure,
    pub store: InMemoryQueueStore,
    pub transport: Arc<MockTransport>,
}

/// Starts the stack on an in-memory store and a mock transport.
pub async fn start(transport: MockTransport, config: Config) -> Result<Harness> {
    init_tracing();
    let store = InMemoryQueueStore::new();
    let transport = Arc::new(transport);
    let beacon =
        Infrastructure::with_components(config, Arc::new(store.clone()), transport.clone())
            .await?;
    Ok(Harness { beacon, store, transport })
}

/// Waits until the transport has seen `count` requests.
pub async fn wait_for_requests(
    transport: &MockTransport,
    count: usize,
) -> Result<Vec<RecordedRequest>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let requests = transport.requests().await;
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("transport did not receive {count} requests"))
}

/// Formatter reporting the state string as the message.
pub fn format_state(state: &String, _error: Option<&(dyn Error + 'static)>) -> String {
    state.clone()
}
