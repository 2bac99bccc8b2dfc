// SPDX-License-Identifier: MIT OR Apache-2.0

use datadog_ci_transport::config::{ReportMode, ReporterConfig};
use datadog_ci_transport::runtime::CircuitState;
use datadog_ci_transport::testkit::{decode_body, is_gzip};
use datadog_ci_transport::{json_mapper, Reporter, ReporterError};
use serde::Serialize;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Serialize)]
struct LogLine {
    message: String,
    build: u32,
}

fn api_config(server: &MockServer) -> ReporterConfig {
    let uri = server.uri();
    let mut config = ReporterConfig {
        api_key: Some("test-key".to_string()),
        api_url: format!("{uri}/api/"),
        logs_intake_url: format!("{uri}/v1/input/"),
        webhook_intake_url: format!("{uri}/"),
        ..ReporterConfig::default()
    };
    config.retry.base_delay_ms = 1;
    config
}

fn agent_config(server: &MockServer) -> ReporterConfig {
    let mut config = ReporterConfig {
        mode: ReportMode::Agent,
        agent_host: "127.0.0.1".to_string(),
        agent_trace_port: server.address().port(),
        ..ReporterConfig::default()
    };
    config.retry.base_delay_ms = 1;
    config
}

async fn mount_validate(server: &MockServer, valid: bool) {
    Mock::given(method("GET"))
        .and(path("/api/v1/validate"))
        .and(header("DD-API-KEY", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "valid": valid })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_api_mode_logs_are_batched_and_compressed() {
    let server = MockServer::start().await;
    mount_validate(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/v1/input/"))
        .and(header("DD-API-KEY", "test-key"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let reporter = Reporter::connect(api_config(&server)).await.unwrap();
    let logs = reporter.logs::<LogLine>(json_mapper()).unwrap();

    let lines = (1..=3)
        .map(|build| LogLine {
            message: format!("step {build} done"),
            build,
        })
        .collect();
    logs.send(lines).await;

    let requests = server.received_requests().await.unwrap();
    let batch = requests
        .iter()
        .find(|r| r.url.path() == "/v1/input/")
        .unwrap();
    assert!(is_gzip(&batch.headers));
    let items = decode_body(&batch.body, true).unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[2], json!({ "message": "step 3 done", "build": 3 }));
    assert!(reporter.metrics().successful_requests() >= 2);
}

#[tokio::test]
async fn test_api_mode_traces_go_to_webhook_intake() {
    let server = MockServer::start().await;
    mount_validate(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/api/v2/webhook"))
        .and(header("DD-CI-PROVIDER-NAME", "jenkins"))
        .and(header("DD-API-KEY", "test-key"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = api_config(&server);
    config.traces.compression = false;
    let reporter = Reporter::connect(config).await.unwrap();
    let traces = reporter.traces::<serde_json::Value>(json_mapper()).unwrap();

    traces.send(vec![json!({ "level": "pipeline", "name": "build" })]).await;

    let requests = server.received_requests().await.unwrap();
    let webhook = requests
        .iter()
        .find(|r| r.url.path() == "/api/v2/webhook")
        .unwrap();
    assert!(!is_gzip(&webhook.headers));
    assert_eq!(webhook.body, br#"[{"level":"pipeline","name":"build"}]"#);
}

#[tokio::test]
async fn test_invalid_api_key_is_rejected() {
    let server = MockServer::start().await;
    mount_validate(&server, false).await;

    let err = Reporter::connect(api_config(&server)).await.unwrap_err();

    assert!(matches!(err, ReporterError::Config(_)));
    assert!(err.to_string().contains("API key is invalid"));
}

#[tokio::test]
async fn test_forbidden_validation_hints_at_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/validate"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let err = Reporter::connect(api_config(&server)).await.unwrap_err();

    assert!(matches!(err, ReporterError::Config(_)));
    assert!(err.to_string().contains("API key might be invalid"));
}

#[tokio::test]
async fn test_wrong_api_url_hints_at_url() {
    let server = MockServer::start().await;

    // Nothing mounted: every path answers 404.
    let err = Reporter::connect(api_config(&server)).await.unwrap_err();

    assert!(err.to_string().contains("request URL might be invalid"));
}

#[tokio::test]
async fn test_agent_mode_traces_use_evp_proxy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "version": "7.50.0" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/evp_proxy/v1/api/v2/webhook"))
        .and(header("X-Datadog-EVP-Subdomain", "webhook-intake"))
        .and(header("Content-Encoding", "gzip"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let reporter = Reporter::connect(agent_config(&server)).await.unwrap();
    assert!(reporter.logs::<u32>(json_mapper()).is_err());

    let traces = reporter.traces::<u32>(json_mapper()).unwrap();
    traces.send(vec![7, 8]).await;

    let requests = server.received_requests().await.unwrap();
    let webhook = requests.iter().find(|r| r.method.as_str() == "POST").unwrap();
    assert!(!webhook.headers.contains_key("DD-API-KEY"));
    assert_eq!(decode_body(&webhook.body, true).unwrap(), vec![json!(7), json!(8)]);
}

#[tokio::test]
async fn test_unreachable_agent_is_config_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = ReporterConfig {
        mode: ReportMode::Agent,
        agent_host: "127.0.0.1".to_string(),
        agent_trace_port: port,
        ..ReporterConfig::default()
    };
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;

    let err = Reporter::connect(config).await.unwrap_err();

    assert!(matches!(err, ReporterError::Config(_)));
    assert!(err.to_string().contains("Unable to reach the Datadog Agent"));
}

#[tokio::test]
async fn test_sustained_failures_open_the_circuit() {
    let server = MockServer::start().await;
    mount_validate(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/api/v2/webhook"))
        .respond_with(ResponseTemplate::new(503))
        .expect(6)
        .mount(&server)
        .await;

    let mut config = api_config(&server);
    config.retry.max_attempts = 2;
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.min_health_check_delay_ms = 60_000;
    config.circuit_breaker.max_health_check_delay_ms = 120_000;
    let reporter = Reporter::connect(config).await.unwrap();
    let traces = reporter.traces::<u32>(json_mapper()).unwrap();

    for build in 0..10 {
        traces.send(vec![build]).await;
    }

    // 3 failing sends of 2 attempts each; the other 7 are short-circuited.
    assert_eq!(traces.circuit_state(), CircuitState::Open);
    assert_eq!(traces.circuit_breaker().total_rejections(), 7);
}

#[tokio::test]
async fn test_reporter_close_drops_later_sends() {
    let server = MockServer::start().await;
    mount_validate(&server, true).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&server)
        .await;

    let reporter = Reporter::connect(api_config(&server)).await.unwrap();
    let logs = reporter.logs::<u32>(json_mapper()).unwrap();

    reporter.close();
    logs.send(vec![1]).await;

    assert_eq!(logs.circuit_breaker().total_failures(), 1);
}
