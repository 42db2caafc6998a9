//! HTTP transport against a wiremock collector.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use anyhow::Result;
use beacon_core::Destination;
use beacon_delivery::{
    transport::ACCESS_TOKEN_HEADER, DeliveryError, HttpTransport, Transport, TransportConfig,
};
use bytes::Bytes;
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn destination(server: &MockServer) -> Destination {
    Destination::new(format!("{}/api/1/item/", server.uri()), "project-token")
}

fn body() -> Bytes {
    Bytes::from(json!({"data": {"level": "error"}}).to_string())
}

#[tokio::test]
async fn posts_json_with_access_token_header() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/1/item/"))
        .and(matchers::header(ACCESS_TOKEN_HEADER, "project-token"))
        .and(matchers::header("content-type", "application/json"))
        .and(matchers::body_json(json!({"data": {"level": "error"}})))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"err":0}"#))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::with_defaults()?;
    let response = transport.send(&destination(&server), body()).await?;

    assert!(response.is_success());
    assert_eq!(response.body, r#"{"err":0}"#);
    assert!(response.error().is_none());
    Ok(())
}

#[tokio::test]
async fn error_statuses_are_responses_not_errors() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("invalid access token"))
        .mount(&server)
        .await;

    let transport = HttpTransport::with_defaults()?;
    let response = transport.send(&destination(&server), body()).await?;

    assert_eq!(response.status_code, 403);
    assert!(matches!(
        response.error(),
        Some(DeliveryError::ClientError { status_code: 403, ref body })
            if body == "invalid access token"
    ));
    Ok(())
}

#[tokio::test]
async fn rate_limit_carries_retry_after() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "17"))
        .mount(&server)
        .await;

    let transport = HttpTransport::with_defaults()?;
    let response = transport.send(&destination(&server), body()).await?;

    assert_eq!(response.retry_after_seconds, Some(17));
    let error = response.error().expect("429 is an error");
    assert!(error.is_retryable());
    assert_eq!(error.retry_after_seconds(), Some(17));
    Ok(())
}

#[tokio::test]
async fn slow_collector_times_out() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(TransportConfig {
        timeout: Duration::from_millis(100),
        ..TransportConfig::default()
    })?;
    let result = transport.send(&destination(&server), body()).await;

    assert!(matches!(result, Err(DeliveryError::Timeout { .. })));
    Ok(())
}

#[tokio::test]
async fn unreachable_collector_is_a_network_error() -> Result<()> {
    let server = MockServer::start().await;
    let destination = destination(&server);
    drop(server);

    let transport = HttpTransport::with_defaults()?;
    let error = transport.send(&destination, body()).await.expect_err("server is gone");

    assert!(matches!(error, DeliveryError::NetworkError { .. }));
    assert!(error.is_retryable());
    Ok(())
}

#[tokio::test]
async fn oversized_bodies_are_truncated() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(100 * 1024)))
        .mount(&server)
        .await;

    let transport = HttpTransport::with_defaults()?;
    let response = transport.send(&destination(&server), body()).await?;

    assert!(response.body.len() <= 1024);
    assert!(response.body.ends_with("... (truncated)"));
    Ok(())
}
