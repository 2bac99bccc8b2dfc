// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;
use crate::runtime::RetryableStatuses;
use serde::Deserialize;
use std::sync::Arc;
use tracing_test::traced_test;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport(max_attempts: u32) -> HttpTransport {
    let config = TransportConfig::new()
        .with_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicyFactory::new(max_attempts, Duration::from_millis(1), 2.0));
    HttpTransport::with_proxy_source(config, Arc::new(StaticProxySource(None))).unwrap()
}

#[derive(Debug, Deserialize)]
struct Validation {
    valid: bool,
}

#[test]
fn test_status_hints() {
    assert_eq!(status_hint(403), "API key might be invalid");
    assert_eq!(status_hint(400), "request URL might be invalid");
    assert_eq!(status_hint(404), "request URL might be invalid");
    assert!(status_hint(409).contains("409"));
}

#[test]
fn test_http_response_helpers() {
    let response = HttpResponse::new(200, Bytes::from_static(br#"{"valid":true}"#));
    assert!(response.is_success());
    assert_eq!(response.text(), r#"{"valid":true}"#);
    assert!(response.json::<Validation>().unwrap().valid);

    let response = HttpResponse::new(204, Bytes::new());
    assert!(response.is_success());
    assert!(response.json::<Validation>().is_err());
    assert!(!HttpResponse::new(302, Bytes::new()).is_success());
}

#[test]
fn test_invalid_header_name_is_config_error() {
    let mut headers = Headers::new();
    headers.insert("bad header".to_string(), "x".to_string());
    let err = build_headers(&headers, None).unwrap_err();
    assert!(matches!(err, ReporterError::Config(_)));
}

#[tokio::test]
async fn test_get_parses_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/validate"))
        .and(header("DD-API-KEY", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"valid":true}"#))
        .expect(1)
        .mount(&server)
        .await;

    let mut headers = Headers::new();
    headers.insert("DD-API-KEY".to_string(), "secret".to_string());

    let valid = transport(3)
        .get(&format!("{}/api/v1/validate", server.uri()), &headers, |r| {
            Ok(r.json::<Validation>()?.valid)
        })
        .await
        .unwrap();
    assert!(valid);
}

#[tokio::test]
async fn test_post_sends_body_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/input"))
        .and(header("content-type", "application/json"))
        .and(body_string("[1,2]"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let status = transport(1)
        .post(
            &format!("{}/v1/input", server.uri()),
            &Headers::new(),
            "application/json",
            Bytes::from_static(b"[1,2]"),
            |r| Ok(r.status),
        )
        .await
        .unwrap();
    assert_eq!(status, 202);
}

#[tokio::test]
async fn test_always_500_makes_exactly_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&server)
        .await;

    let transport = transport(5);
    let err = transport
        .post(&server.uri(), &Headers::new(), "application/json", Bytes::from_static(b"[]"), |_| Ok(()))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("giving up after 5 attempts"));
    assert_eq!(transport.metrics().failed_requests(), 5);
}

#[tokio::test]
async fn test_retries_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transport = transport(5);
    let status = transport
        .get(&server.uri(), &Headers::new(), |r| Ok(r.status))
        .await
        .unwrap();

    assert_eq!(status, 200);
    assert_eq!(transport.metrics().total_requests(), 3);
    assert_eq!(transport.metrics().successful_requests(), 1);
}

#[tokio::test]
async fn test_429_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let err = transport(3)
        .get(&server.uri(), &Headers::new(), |r| Ok(r.status))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(429));
}

#[tokio::test]
async fn test_forbidden_is_terminal_with_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let err = transport(5)
        .post(&server.uri(), &Headers::new(), "application/json", Bytes::new(), |_| Ok(()))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(403));
    assert!(err.to_string().contains("API key might be invalid"));
}

#[tokio::test]
async fn test_not_found_is_terminal_with_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = transport(5)
        .get(&server.uri(), &Headers::new(), |_| Ok(()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("request URL might be invalid"));
}

#[tokio::test]
async fn test_custom_retryable_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let config = TransportConfig::new()
        .with_retry(RetryPolicyFactory::new(4, Duration::from_millis(1), 1.0))
        .with_retryable(RetryableStatuses::none());
    let transport = HttpTransport::with_proxy_source(config, Arc::new(StaticProxySource(None))).unwrap();

    let err = transport
        .get(&server.uri(), &Headers::new(), |_| Ok(()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));
}

#[tokio::test]
async fn test_connection_failure_is_retried_then_reported() {
    // Bind then drop a listener so the port is closed.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = transport(3);
    let err = transport
        .get(&format!("http://{addr}/info"), &Headers::new(), |_| Ok(()))
        .await
        .unwrap_err();

    assert_eq!(err.status(), None);
    assert!(err.to_string().contains("giving up after 3 attempts"));
    assert_eq!(transport.metrics().failed_requests(), 3);
}

#[tokio::test]
async fn test_per_attempt_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&server)
        .await;

    let config = TransportConfig::new()
        .with_timeout(Duration::from_millis(50))
        .with_retry(RetryPolicyFactory::new(2, Duration::from_millis(1), 1.0));
    let transport = HttpTransport::with_proxy_source(config, Arc::new(StaticProxySource(None))).unwrap();

    let err = transport
        .get(&server.uri(), &Headers::new(), |_| Ok(()))
        .await
        .unwrap_err();
    assert!(matches!(err, ReporterError::Request { status: None, .. }));
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = TransportConfig::new().with_retry(RetryPolicyFactory::new(5, Duration::from_secs(30), 1.0));
    let transport = HttpTransport::with_proxy_source(config, Arc::new(StaticProxySource(None))).unwrap();

    let scoped = transport.scoped();
    let url = server.uri();
    let task = tokio::spawn(async move { scoped.get(&url, &Headers::new(), |_| Ok(())).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ReporterError::Interrupted(_)));
}

#[tokio::test]
async fn test_scoped_cancel_leaves_parent_usable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transport = transport(1);
    let scoped = transport.scoped();
    scoped.cancel();

    let err = scoped.get(&server.uri(), &Headers::new(), |_| Ok(())).await.unwrap_err();
    assert!(matches!(err, ReporterError::Interrupted(_)));
    assert!(!transport.is_cancelled());
    transport.get(&server.uri(), &Headers::new(), |_| Ok(())).await.unwrap();
}

#[tokio::test]
async fn test_post_asynchronously_retries_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let handle = transport(3).post_asynchronously(
        &server.uri(),
        &Headers::new(),
        "application/json",
        Bytes::from_static(b"[]"),
    );
    handle.await.unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
#[traced_test]
async fn test_post_asynchronously_logs_final_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let handle = transport(3).post_asynchronously(
        &server.uri(),
        &Headers::new(),
        "application/json",
        Bytes::from_static(b"[]"),
    );
    assert!(handle.await.is_ok());
    assert!(logs_contain("Asynchronous request failed"));
    assert!(logs_contain("request URL might be invalid"));
}
