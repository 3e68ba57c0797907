//! Tests for the operations endpoints.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::fixtures::{self, entity, event};
use integration_tests::setup::{test_router, TestPipeline};
use telemetry::health;

/// Test /health endpoint returns proper structure
#[tokio::test]
async fn test_health_endpoint_structure() {
    let server = TestServer::new(test_router("orders")).expect("Failed to create test server");

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    for field in ["status", "pipeline", "epoch", "uptime_secs", "components", "pending_facts", "queue_depth"] {
        assert!(body.get(field).is_some(), "Response should have '{}' field", field);
    }
    assert_eq!(body["pipeline"], "orders");

    let status = body["status"].as_str().unwrap_or("");
    assert!(
        status == "healthy" || status == "degraded" || status == "unhealthy",
        "Status should be 'healthy', 'degraded', or 'unhealthy', got '{}'",
        status
    );

    let names: Vec<&str> = body["components"]
        .as_array()
        .expect("components array")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(names, vec!["redpanda", "clickhouse", "pipeline"]);
}

/// Test /health/live always succeeds
#[tokio::test]
async fn test_liveness_always_ok() {
    let server = TestServer::new(test_router("orders")).expect("Failed to create test server");
    server.get("/health/live").await.assert_status_ok();
}

/// Test /health/ready follows the pipeline and sink components
#[tokio::test]
async fn test_readiness_follows_components() {
    let server = TestServer::new(test_router("orders")).expect("Failed to create test server");

    health().clickhouse.set_unhealthy("Connection failed");
    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    health().clickhouse.set_healthy();
    let pipeline = TestPipeline::new(fixtures::pipeline_config(2000));
    pipeline.source("entities").push(entity(1, "Ada", 90, 0));
    pipeline.source("events").push(event(1, "click", 1000));
    let running = pipeline.start().unwrap();
    pipeline
        .wait_for_document("1", |_| true)
        .await
        .expect("pipeline running");

    server.get("/health/ready").await.assert_status_ok();

    running.stop().await.unwrap();
    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

/// Test /metrics returns a snapshot of the pipeline counters
#[tokio::test]
async fn test_metrics_snapshot() {
    let server = TestServer::new(test_router("orders")).expect("Failed to create test server");
    let response = server.get("/metrics").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    for field in [
        "records_consumed",
        "malformed_records",
        "facts_enriched",
        "facts_partial",
        "late_records_dropped",
        "sink_documents_written",
        "offsets_committed",
        "pending_facts",
        "combined_watermark_ms",
    ] {
        assert!(body[field].is_u64(), "Snapshot should have numeric '{}'", field);
    }
}
