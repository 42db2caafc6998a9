//! Full stack: logger → client → SQLite queue → HTTP transport → collector.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use anyhow::{anyhow, Result};
use beacon_client::{
    logger::Formatter, scope::with_scope_stack, Config, Infrastructure, LogLevel,
};
use beacon_delivery::transport::ACCESS_TOKEN_HEADER;
use common::{format_state, init_tracing, test_config, TOKEN};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, store: &std::path::Path) -> Config {
    Config {
        endpoint: format!("{}/api/1/item/", server.uri()),
        store_path: Some(store.join("queue.db")),
        ..test_config()
    }
}

async fn wait_until_drained(beacon: &Infrastructure) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while beacon.controller().total_payload_count().await? > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|_| anyhow!("queue did not drain"))?
}

#[tokio::test]
async fn logged_items_reach_the_collector() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/1/item/"))
        .and(matchers::header(ACCESS_TOKEN_HEADER, TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"err":0}"#))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let beacon = Infrastructure::init(config_for(&server, dir.path())).await?;
    let logger = beacon.logger("checkout");
    let format: &Formatter<String> = &format_state;

    with_scope_stack(async {
        let _scope = logger.begin_scope(serde_json::json!({"order": 42}));
        let state = "payment declined".to_string();
        logger.log(LogLevel::Warning, 7, &state, None, Some(format)).await;
        logger.log(LogLevel::Error, 8, &state, None, Some(format)).await;
    })
    .await;

    wait_until_drained(&beacon).await?;
    beacon.shutdown(Duration::from_secs(2)).await?;

    let received = server.received_requests().await.expect("recording is enabled");
    let levels = received
        .iter()
        .map(|request| serde_json::from_slice::<serde_json::Value>(&request.body))
        .map(|document| document.map(|d| d["data"]["level"].clone()))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(levels, ["warning", "error"]);
    Ok(())
}

#[tokio::test]
async fn queued_items_survive_a_restart() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let config = Config { max_attempts: 1_000, ..config_for(&server, dir.path()) };

    let first = Infrastructure::init(config.clone()).await?;
    let client = first.client();
    for body in ["one", "two", "three"] {
        client.log(beacon_core::ErrorLevel::Error, beacon_client::Package::message(body)).await;
    }
    assert_eq!(first.controller().total_payload_count().await?, 3);
    first.stop_with(true).await?;
    drop(first);

    server.reset().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let second = Infrastructure::init(config).await?;
    wait_until_drained(&second).await?;
    second.stop_with(true).await?;

    let bodies = server
        .received_requests()
        .await
        .expect("recording is enabled")
        .iter()
        .map(|request| serde_json::from_slice::<serde_json::Value>(&request.body))
        .map(|document| document.map(|d| d["data"]["body"]["message"]["body"].clone()))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(bodies, ["one", "two", "three"]);
    Ok(())
}
