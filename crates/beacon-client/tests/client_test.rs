//! Client facade: scrubbing, blocking logs and close.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use std::{
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use beacon_client::{
    Client, ClientError, ClientSettings, Config, Package, Report, TelemetryEvent,
};
use beacon_core::{Destination, ErrorLevel, InMemoryQueueStore, QueueEvent, QueueStore, TestClock};
use beacon_delivery::{
    transport::mock::{MockReply, MockTransport},
    QueueController,
};
use common::{start, test_config, wait_for_requests, ENDPOINT, TOKEN};
use serde_json::json;

#[tokio::test]
async fn items_are_scrubbed_before_they_leave() -> Result<()> {
    let config = Config {
        scrub_fields: vec![
            "password".to_string(),
            "access_token".to_string(),
            "data.custom.card.number".to_string(),
        ],
        ..test_config()
    };
    let h = start(MockTransport::accepting(), config).await?;

    let report = Report::new(Package::object(
        "signup failed",
        json!({"user": "ada", "password": "hunter2", "access_token": "user-token"}),
    ))
    .with_custom("card", json!({"number": "4111111111111111", "brand": "visa"}));

    h.beacon.client().log_blocking(ErrorLevel::Error, report, Duration::from_secs(2)).await?;

    let requests = wait_for_requests(&h.transport, 1).await?;
    let document = requests[0].json()?;
    let value = &document["data"]["body"]["message"]["value"];
    assert_eq!(value["user"], "ada");
    assert_eq!(value["password"], "***");
    assert_eq!(value["access_token"], "user-token", "critical fields are never scrubbed");
    assert_eq!(document["data"]["custom"]["card"]["number"], "***");
    assert_eq!(document["data"]["custom"]["card"]["brand"], "visa");
    assert_eq!(document["access_token"], TOKEN);
    Ok(())
}

#[tokio::test]
async fn blocking_log_returns_once_delivered() -> Result<()> {
    let h = start(MockTransport::accepting(), test_config()).await?;
    let client = h.beacon.client();

    let id = client
        .log_blocking(ErrorLevel::Info, Package::message("deployed"), Duration::from_secs(2))
        .await?
        .expect("item was queued");

    assert!(!h.beacon.controller().contains(id).await?);
    assert_eq!(h.beacon.controller().stats().await.delivered, 1);
    Ok(())
}

#[tokio::test]
async fn blocking_log_returns_on_api_error() -> Result<()> {
    let h = start(MockTransport::new(MockReply::status(422)), test_config()).await?;
    let mut events = h.beacon.controller().subscribe();

    let id = h
        .beacon
        .client()
        .log_blocking_default(ErrorLevel::Error, Package::message("rejected"))
        .await?
        .expect("item was queued");

    let event = events.recv().await?;
    assert!(matches!(event, QueueEvent::ApiError(ref e) if e.payload_id == id));
    assert!(!h.beacon.controller().contains(id).await?);
    Ok(())
}

#[tokio::test]
async fn blocking_log_times_out_and_keeps_the_item() -> Result<()> {
    let h = start(MockTransport::new(MockReply::Hang), test_config()).await?;

    let started = std::time::Instant::now();
    let result = h
        .beacon
        .client()
        .log_blocking(ErrorLevel::Error, Package::message("stuck"), Duration::from_millis(100))
        .await;

    let Err(ClientError::BlockingTimeout { payload_id, timeout }) = result else {
        return Err(anyhow!("expected a blocking timeout, got {result:?}"));
    };
    assert_eq!(timeout, Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(h.beacon.controller().contains(payload_id).await?);
    Ok(())
}

#[tokio::test]
async fn queue_failures_become_internal_error_events() -> Result<()> {
    let h = start(MockTransport::accepting(), test_config()).await?;
    let mut events = h.beacon.controller().subscribe();

    let client = h.beacon.new_client(ClientSettings {
        destination: Destination::new(ENDPOINT, "   "),
        ..h.beacon.config().to_client_settings()
    });

    assert!(client.log(ErrorLevel::Error, Package::message("lost")).await.is_none());
    let blocking = client
        .log_blocking(ErrorLevel::Error, Package::message("lost"), Duration::from_millis(100))
        .await?;
    assert!(blocking.is_none());

    let QueueEvent::InternalError(event) = events.recv().await? else {
        return Err(anyhow!("expected an internal error event"));
    };
    assert!(event.payload_id.is_none());
    assert_eq!(event.destination.map(|d| d.endpoint), Some(ENDPOINT.to_string()));
    Ok(())
}

#[tokio::test]
async fn closed_client_accepts_nothing() -> Result<()> {
    let h = start(MockTransport::accepting(), test_config()).await?;
    let client = h.beacon.client();

    client.log(ErrorLevel::Info, Package::message("before close")).await;
    client.close(Duration::from_secs(2)).await?;

    assert!(client.is_closed());
    assert_eq!(h.beacon.controller().total_payload_count().await?, 0);
    assert!(client.log(ErrorLevel::Info, Package::message("after close")).await.is_none());
    let blocking =
        client.log_blocking(ErrorLevel::Info, Package::message("after"), Duration::from_secs(1));
    assert!(matches!(blocking.await, Err(ClientError::Closed)));
    assert_eq!(h.transport.request_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn close_reports_items_left_behind() -> Result<()> {
    let h = start(MockTransport::new(MockReply::Hang), test_config()).await?;
    let client = h.beacon.client();

    client.log(ErrorLevel::Error, Package::message("never answered")).await;
    let result = client.close(Duration::from_millis(100)).await;

    assert!(matches!(result, Err(ClientError::DrainTimeout { remaining: 1, .. })));
    Ok(())
}

#[tokio::test]
async fn blocking_log_waits_through_transient_store_failures() -> Result<()> {
    let h = start(MockTransport::accepting(), test_config()).await?;
    let mut events = h.beacon.controller().subscribe();
    h.store.inject_attempt_failure("database is locked").await;

    let id = h
        .beacon
        .client()
        .log_blocking(ErrorLevel::Error, Package::message("retried"), Duration::from_secs(2))
        .await?
        .expect("item was queued");

    let first = events.recv().await?;
    assert!(
        matches!(first, QueueEvent::InternalError(ref e) if e.payload_id == Some(id) && !e.evicted),
        "the failed bookkeeping is reported, got {first:?}"
    );
    assert!(!h.beacon.controller().contains(id).await?, "returned only after delivery");
    assert_eq!(h.beacon.controller().stats().await.delivered, 1);
    Ok(())
}

#[tokio::test]
async fn item_timestamp_comes_from_the_controller_clock() -> Result<()> {
    let store = InMemoryQueueStore::new();
    let clock = TestClock::starting_at(UNIX_EPOCH + Duration::from_secs(1_600_000_000));
    let controller = QueueController::new(
        Arc::new(store.clone()),
        Arc::new(MockTransport::accepting()),
        Arc::new(clock.clone()),
    );
    controller.init(test_config().to_queue_config()).await?;
    let client = Client::new(controller, test_config().to_client_settings());

    client.log(ErrorLevel::Info, Package::message("at a fixed time")).await;
    clock.advance(Duration::from_secs(90));
    client.log(ErrorLevel::Info, Package::message("later")).await;

    let destination = test_config().destination();
    let first = store.peek_oldest(&destination).await?.expect("item was queued");
    assert_eq!(first.body["data"]["timestamp"], 1_600_000_000);
    store.remove(first.id).await?;
    let second = store.peek_oldest(&destination).await?.expect("item was queued");
    assert_eq!(second.body["data"]["timestamp"], 1_600_000_090);
    Ok(())
}

#[tokio::test]
async fn telemetry_trail_travels_with_later_items() -> Result<()> {
    let config = Config { telemetry_enabled: true, telemetry_queue_depth: 2, ..test_config() };
    let h = start(MockTransport::accepting(), config).await?;
    let client = h.beacon.client();
    let now = client.unix_millis();

    client.record_telemetry(TelemetryEvent::navigation("/", "/cart", now));
    client.record_telemetry(TelemetryEvent::network("POST", "https://pay.test/charge", 502, now));
    client.record_telemetry(TelemetryEvent::log(ErrorLevel::Info, "cart loaded", now));
    assert_eq!(client.telemetry().len(), 2, "oldest event was evicted");

    client.log_blocking_default(ErrorLevel::Error, Package::message("charge failed")).await?;

    let requests = wait_for_requests(&h.transport, 1).await?;
    let trail = requests[0].json()?["data"]["body"]["telemetry"].clone();
    let kinds = trail.as_array().expect("trail is an array").iter().map(|e| e["type"].clone());
    assert_eq!(kinds.collect::<Vec<_>>(), ["network", "log"]);
    assert_eq!(trail[0]["body"]["status_code"], "502");
    Ok(())
}

#[tokio::test]
async fn telemetry_is_off_by_default() -> Result<()> {
    let h = start(MockTransport::accepting(), test_config()).await?;
    let client = h.beacon.client();

    client.record_telemetry(TelemetryEvent::log(ErrorLevel::Info, "ignored", 0));
    assert!(!client.telemetry_enabled());
    assert!(client.telemetry().is_empty());

    client.log_blocking_default(ErrorLevel::Info, Package::message("plain")).await?;
    let requests = wait_for_requests(&h.transport, 1).await?;
    assert!(requests[0].json()?["data"]["body"].get("telemetry").is_none());
    Ok(())
}
