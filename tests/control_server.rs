use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use heartbeat_agent::agent::{CorrelationMode, ScheduleStatus};
use heartbeat_agent::error::TransportError;
use heartbeat_agent::transport::{OutboundRequest, Transport};
use heartbeat_agent::{AgentConfig, AgentRuntime, BuildOptions};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accepts every send; replies only arrive through `POST /reply`.
struct SilentTransport;

#[async_trait]
impl Transport for SilentTransport {
    fn name(&self) -> &str {
        "silent"
    }

    async fn send(&self, _request: &OutboundRequest) -> Result<(), TransportError> {
        Ok(())
    }
}

fn config(correlation: CorrelationMode) -> AgentConfig {
    AgentConfig {
        base_url: "http://localhost:8000".to_string(),
        interval: Duration::from_secs(30),
        reply_timeout: Duration::from_secs(60),
        max_attempts: 10,
        retry_delay: Duration::from_secs(1),
        health_period: Duration::from_secs(60),
        event_history: 100,
        control_addr: "127.0.0.1:0".parse().unwrap(),
        correlation,
        hooks_file: None,
        required_capabilities: vec!["dom_interface".to_string()],
        routes: BTreeMap::from([("summarize".to_string(), "/summarize".to_string())]),
    }
}

fn runtime(correlation: CorrelationMode) -> AgentRuntime {
    heartbeat_agent::build(
        config(correlation),
        BuildOptions {
            transport: Some(Arc::new(SilentTransport)),
            payloads: None,
        },
    )
    .unwrap()
}

fn app(runtime: &AgentRuntime) -> axum::Router {
    heartbeat_agent::control::router(Arc::clone(&runtime.surface))
}

/// Send a request via `oneshot` and return (status, parsed JSON body).
async fn send(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = axum::http::Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn settings_and_interval_bounds() {
    let runtime = runtime(CorrelationMode::Exact);

    let (status, settings) = send(app(&runtime), "GET", "/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["intervalSecs"], 30);
    assert_eq!(settings["maxAttempts"], 10);

    let (status, settings) = send(
        app(&runtime),
        "PUT",
        "/settings/interval",
        Some(json!({"seconds": 300})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["intervalSecs"], 300);

    // The scheduler's own view agrees as soon as the PUT returns.
    let (_, scheduler) = send(app(&runtime), "GET", "/status", None).await;
    assert_eq!(scheduler["intervalSecs"], 300);

    let (status, body) = send(
        app(&runtime),
        "PUT",
        "/settings/interval",
        Some(json!({"seconds": 301})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("301"));

    let (_, settings) = send(app(&runtime), "GET", "/settings", None).await;
    assert_eq!(settings["intervalSecs"], 300);
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn routes_include_configured_and_defaults() {
    let runtime = runtime(CorrelationMode::Exact);

    let (status, routes) = send(app(&runtime), "GET", "/routes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(routes["reflect"], "/reflect");
    assert_eq!(routes["summarize"], "/summarize");

    let (status, routes) = send(
        app(&runtime),
        "POST",
        "/routes",
        Some(json!({"action": "translate", "path": "translate"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(routes["translate"], "/translate");

    let (status, _) = send(app(&runtime), "DELETE", "/routes/translate", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(app(&runtime), "DELETE", "/routes/translate", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        app(&runtime),
        "POST",
        "/routes",
        Some(json!({"action": "", "path": "/x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_then_recovers_after_repair() {
    let runtime = runtime(CorrelationMode::Exact);

    let (status, report) = send(app(&runtime), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(report["checks"]["dom_interface.present"], false);

    let cycle = runtime.health.run_once().await;
    assert_eq!(cycle.repairs.len(), 1);
    assert!(runtime.registry.is_fallback("dom_interface"));

    let (status, report) = send(app(&runtime), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["overall"], true);
}

// ---------------------------------------------------------------------------
// Replies and RPC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn anonymous_reply_resolves_single_slot_tick() {
    let runtime = runtime(CorrelationMode::SingleSlot);
    let mut status_rx = runtime.scheduler.watch_status();

    let (_, response) = send(
        app(&runtime),
        "POST",
        "/rpc",
        Some(json!({"type": "AGENT_COMMAND", "method": "start", "correlationId": 1})),
    )
    .await;
    assert_eq!(response["success"], true);
    assert_eq!(response["correlationId"], 1);

    status_rx
        .wait_for(|s| s.status == ScheduleStatus::Waiting)
        .await
        .unwrap();

    let (status, body) = send(
        app(&runtime),
        "POST",
        "/reply",
        Some(json!({"body": {"reflection": "all good"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["delivered"], true);

    let state = status_rx
        .wait_for(|s| s.response_count == 1)
        .await
        .unwrap()
        .clone();
    assert_eq!(state.attempt_count, 0);
    assert!(state.next_run_at.is_some());
    assert_eq!(state.recent_events, 1);

    let (status, events) = send(app(&runtime), "GET", "/events?count=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events.as_array().unwrap().len(), 1);
    assert_eq!(events[0]["outcome"], "replied");
    assert_eq!(events[0]["requestId"], 1);

    let (status, body) = send(
        app(&runtime),
        "POST",
        "/reply",
        Some(json!({"body": "nobody is waiting"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["delivered"], false);

    runtime.shutdown().await;
}

#[tokio::test]
async fn rpc_unknown_method_is_reported() {
    let runtime = runtime(CorrelationMode::Exact);
    let (status, response) = send(
        app(&runtime),
        "POST",
        "/rpc",
        Some(json!({"action": "teleport", "messageId": "m-9"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["type"], "AGENT_RESPONSE");
    assert_eq!(response["method"], "teleport");
    assert_eq!(response["correlationId"], "m-9");
    assert_eq!(response["success"], false);
}

#[tokio::test]
async fn status_endpoint_reflects_scheduler() {
    let runtime = runtime(CorrelationMode::Exact);

    let (status, body) = send(app(&runtime), "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["running"], false);
    assert_eq!(body["intervalSecs"], 30);
    assert_eq!(body["pendingReplies"], 0);
    assert!(body["uptimeSecs"].is_null());
}
