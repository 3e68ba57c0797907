//! End-to-end join behaviour through the coordinator, join task and sink loop.
//!
//! Sources, document store and checkpoint store are in memory; everything
//! between them is the production pipeline.

use engine_core::{DocumentIdentity, EnrichmentStatus, LatePolicy};
use integration_tests::fixtures::{self, entity, event, event_for_team, team};
use integration_tests::mocks::MemoryCheckpointStore;
use integration_tests::setup::{eventually, TestPipeline, SETTLE};
use std::sync::Arc;
use std::time::Duration;

/// Fact arrives first and waits for its entity.
#[tokio::test]
async fn test_fact_before_dimension_is_enriched() {
    let pipeline = TestPipeline::new(fixtures::pipeline_config(2000));
    pipeline.source("events").push(event(1004, "click", 1000));

    let running = pipeline.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline.store.get("1004").is_none(), "fact must wait for its entity");

    pipeline.source("entities").push(entity(1004, "Ada", 90, 500));

    let doc = pipeline
        .wait_for_document("1004", |_| true)
        .await
        .expect("document for 1004");
    assert_eq!(doc.status, EnrichmentStatus::Enriched);
    assert_eq!(doc.entity_key, "1004");
    assert_eq!(doc.body["key"], 1004);
    assert_eq!(doc.body["action"], "click");
    assert_eq!(doc.body["name"], "Ada");
    assert_eq!(doc.body["hourly_rate"], 90);
    assert!(doc.body["team"].is_null());
    assert!(doc.body.get("late").is_none());

    running.stop().await.unwrap();
}

/// Entity arrives first; the fact is enriched on arrival.
#[tokio::test]
async fn test_dimension_before_fact_is_enriched() {
    let pipeline = TestPipeline::new(fixtures::pipeline_config(2000));
    pipeline.source("entities").push(entity(1004, "Ada", 90, 500));

    let running = pipeline.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.source("events").push(event(1004, "click", 1000));

    let doc = pipeline
        .wait_for_document("1004", |_| true)
        .await
        .expect("document for 1004");
    assert_eq!(doc.status, EnrichmentStatus::Enriched);
    assert_eq!(doc.body["name"], "Ada");

    let summary = running.stop().await.unwrap();
    assert_eq!(summary.documents_written, 1);
    assert_eq!(pipeline.committed("events"), Some(1));
    assert_eq!(pipeline.committed("entities"), Some(1));
}

/// Shutdown flushes a batch the flush timer has not reached yet and commits it.
#[tokio::test]
async fn test_shutdown_flushes_pending_batch() {
    let mut config = fixtures::pipeline_config(2000);
    config.batch_flush_interval_ms = 60_000;
    config.batch_size = 100;
    let pipeline = TestPipeline::new(config);
    pipeline.source("entities").push(entity(1004, "Ada", 90, 500));
    pipeline.source("events").push(event(1004, "click", 1000));

    let running = pipeline.start().unwrap();
    eventually(SETTLE, || (pipeline.source("events").position() == 1).then_some(()))
        .await
        .expect("fact fetched");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pipeline.store.get("1004").is_none(), "batch must still be open");

    let summary = running.stop().await.unwrap();
    let doc = pipeline.store.get("1004").expect("document flushed on shutdown");
    assert_eq!(doc.status, EnrichmentStatus::Enriched);
    assert_eq!(doc.body["name"], "Ada");
    assert_eq!(summary.documents_written, 1);
    assert_eq!(pipeline.committed("events"), Some(1));
    assert_eq!(pipeline.committed("entities"), Some(1));
}

/// A fact whose entity never shows up is emitted as partial after the horizon.
#[tokio::test]
async fn test_unmatched_fact_emitted_partial() {
    let pipeline = TestPipeline::new(fixtures::pipeline_config(200));
    pipeline.source("events").push(event(9999, "view", 1000));

    let running = pipeline.start().unwrap();

    let doc = pipeline
        .wait_for_document("9999", |_| true)
        .await
        .expect("partial document for 9999");
    assert_eq!(doc.status, EnrichmentStatus::Partial);
    assert_eq!(doc.body["action"], "view");
    assert!(doc.body["name"].is_null());
    assert!(doc.body["hourly_rate"].is_null());

    running.stop().await.unwrap();
    assert_eq!(pipeline.committed("events"), Some(1));
}

/// Optional dimensions are joined on their own foreign key when present.
#[tokio::test]
async fn test_optional_dimension_joined_by_foreign_key() {
    let pipeline = TestPipeline::new(fixtures::pipeline_config(2000));
    pipeline.source("entities").push(entity(7, "Grace", 120, 0));
    pipeline.source("metadata").push(team(42, "core", 0));

    let running = pipeline.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline
        .source("events")
        .push(event_for_team(7, "deploy", 42, 1000));

    let doc = pipeline
        .wait_for_document("7", |_| true)
        .await
        .expect("document for 7");
    assert_eq!(doc.status, EnrichmentStatus::Enriched);
    assert_eq!(doc.body["name"], "Grace");
    assert_eq!(doc.body["team"], "core");
    assert_eq!(doc.body["team_id"], 42);

    running.stop().await.unwrap();
}

/// Buffered facts for one key are released in arrival order.
#[tokio::test]
async fn test_buffered_facts_keep_per_key_order() {
    let mut config = fixtures::pipeline_config(2000);
    config.document_id = DocumentIdentity::Origin;
    let pipeline = TestPipeline::new(config);
    let events = pipeline.source("events");
    events.push(event(5, "first", 1000));
    events.push(event(5, "second", 1100));
    events.push(event(5, "third", 1200));

    let running = pipeline.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline.store.is_empty());
    pipeline.source("entities").push(entity(5, "Linus", 70, 0));

    let store = pipeline.store.clone();
    eventually(SETTLE, || (store.len() == 3).then_some(()))
        .await
        .expect("three documents");

    for (offset, action) in ["first", "second", "third"].iter().enumerate() {
        let doc = pipeline
            .store
            .get(&format!("events-0-{offset}"))
            .expect("document per fact occurrence");
        assert_eq!(doc.body["action"], *action);
        assert_eq!(doc.body["name"], "Linus");
    }

    running.stop().await.unwrap();
}

/// Under the key identity, later facts overwrite the document for that key.
#[tokio::test]
async fn test_key_identity_keeps_latest_fact() {
    let pipeline = TestPipeline::new(fixtures::pipeline_config(2000));
    pipeline.source("entities").push(entity(5, "Linus", 70, 0));
    let events = pipeline.source("events");
    events.push(event(5, "first", 1000));
    events.push(event(5, "second", 1100));

    let running = pipeline.start().unwrap();
    let doc = pipeline
        .wait_for_document("5", |d| d.body["action"] == "second")
        .await
        .expect("document updated by the second fact");
    assert_eq!(doc.status, EnrichmentStatus::Enriched);
    assert_eq!(pipeline.store.len(), 1);

    running.stop().await.unwrap();
}

fn late_scenario(policy: LatePolicy) -> TestPipeline {
    let pipeline = TestPipeline::new(fixtures::with_late_policy(
        fixtures::pipeline_config(2000),
        policy,
    ));
    pipeline.source("entities").push(entity(1, "on-time", 1, 0));
    pipeline.source("entities").push(entity(2, "late", 2, 0));
    let events = pipeline.source("events");
    events.push(event(1, "on-time", 10_000));
    // Behind the events watermark of 10_000 - 2000.
    events.push(event(2, "late", 1000));
    pipeline
}

#[tokio::test]
async fn test_late_fact_dropped() {
    let pipeline = late_scenario(LatePolicy::Drop);
    let running = pipeline.start().unwrap();

    pipeline
        .wait_for_document("1", |_| true)
        .await
        .expect("on-time document");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline.store.get("2").is_none());

    running.stop().await.unwrap();
    // The dropped fact is still consumed.
    assert_eq!(pipeline.committed("events"), Some(2));
}

#[tokio::test]
async fn test_late_fact_emitted_with_flag() {
    let pipeline = late_scenario(LatePolicy::EmitWithFlag);
    let running = pipeline.start().unwrap();

    let doc = pipeline
        .wait_for_document("2", |_| true)
        .await
        .expect("late document");
    assert_eq!(doc.body["late"], true);
    assert_eq!(doc.body["name"], "late");

    let on_time = pipeline
        .wait_for_document("1", |_| true)
        .await
        .expect("on-time document");
    assert!(on_time.body.get("late").is_none());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_late_fact_routed_to_side_output() {
    let pipeline = late_scenario(LatePolicy::SideOutput);
    let (running, mut late_rx) = pipeline.start_with_late_output().unwrap();

    let late = tokio::time::timeout(SETTLE, late_rx.recv())
        .await
        .expect("late record within timeout")
        .expect("late output open");
    assert_eq!(late.fact.key.to_string(), "2");
    assert_eq!(late.position.offset, 1);
    assert_eq!(late.watermark.0, 8000);

    pipeline
        .wait_for_document("1", |_| true)
        .await
        .expect("on-time document");
    assert!(pipeline.store.get("2").is_none());

    running.stop().await.unwrap();
    assert_eq!(pipeline.committed("events"), Some(2));
}

/// Malformed records are skipped without stalling offsets.
#[tokio::test]
async fn test_malformed_records_skipped() {
    let pipeline = TestPipeline::new(fixtures::pipeline_config(2000));
    pipeline.source("entities").push(entity(3, "Barbara", 50, 0));
    let events = pipeline.source("events");
    events.push_raw("not json");
    events.push(serde_json::json!({ "key": 3, "ts": 1000 }));
    events.push(serde_json::json!({ "action": "orphan", "ts": 1000 }));
    events.push(event(3, "valid", 1000));

    let running = pipeline.start().unwrap();
    let doc = pipeline
        .wait_for_document("3", |_| true)
        .await
        .expect("valid record joined");
    assert_eq!(doc.body["action"], "valid");

    running.stop().await.unwrap();
    assert_eq!(pipeline.store.len(), 1);
    assert_eq!(pipeline.committed("events"), Some(4));
}

/// Restarting with committed offsets does not reprocess facts; restarting
/// without them redelivers everything and converges on the same documents.
#[tokio::test]
async fn test_restart_is_idempotent() {
    let mut pipeline = TestPipeline::new(fixtures::pipeline_config(2000));
    for key in 1..=5 {
        pipeline
            .source("entities")
            .push(entity(key, &format!("entity-{key}"), key * 10, 0));
        pipeline.source("events").push(event(key, "view", 1000 + key));
    }

    let running = pipeline.start().unwrap();
    let store = pipeline.store.clone();
    eventually(SETTLE, || (store.len() == 5).then_some(()))
        .await
        .expect("five documents");
    let first = running.stop().await.unwrap();
    assert_eq!(first.documents_written, 5);
    assert_eq!(pipeline.committed("events"), Some(5));
    let snapshot = pipeline.store.documents();

    // Resume from committed offsets: dimensions replay, facts do not.
    let running = pipeline.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = running.stop().await.unwrap();
    assert_ne!(second.epoch, first.epoch);
    assert_eq!(second.documents_written, 0);

    // Lose the commits: every fact is redelivered and upserted again.
    pipeline.checkpoints = Arc::new(MemoryCheckpointStore::new());
    let running = pipeline.start().unwrap();
    let store = pipeline.store.clone();
    eventually(SETTLE, || (store.written() >= 10).then_some(()))
        .await
        .expect("redelivered documents");
    running.stop().await.unwrap();

    assert_eq!(pipeline.store.documents(), snapshot);
}
