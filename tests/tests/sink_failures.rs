//! Sink and checkpoint failure handling.
//!
//! A batch that exhausts its retries stops the pipeline without committing
//! the offsets it covered, so a restart redelivers it.

use engine_core::{EnrichmentStatus, Error};
use integration_tests::fixtures::{self, entity, event};
use integration_tests::mocks::MockDocumentStore;
use integration_tests::setup::{eventually, TestPipeline, SETTLE};

fn scenario(store: MockDocumentStore) -> TestPipeline {
    let mut config = fixtures::pipeline_config(2000);
    config.max_retries = 3;
    let pipeline = TestPipeline::new(config).with_store(store);
    pipeline.source("entities").push(entity(1004, "Ada", 90, 0));
    pipeline.source("events").push(event(1004, "click", 1000));
    pipeline
}

#[tokio::test]
async fn test_retries_exhausted_is_fatal_and_not_committed() {
    let pipeline = scenario(MockDocumentStore::failing(3));

    let err = pipeline.start().unwrap().join().await.unwrap_err();
    assert!(err.is_fatal());
    match err {
        Error::SinkExhausted {
            records,
            first_key,
            last_key,
            attempts,
            ..
        } => {
            assert_eq!(records, 1);
            assert_eq!(first_key, "1004");
            assert_eq!(last_key, "1004");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(pipeline.store.attempts(), 3);
    assert!(pipeline.store.is_empty());
    // Nothing past the failed fact may be committed.
    assert_eq!(pipeline.committed("events").unwrap_or(0), 0);

    // Sink is back: the fact is redelivered on restart.
    pipeline.store.set_fail_times(0);
    let running = pipeline.start().unwrap();
    let doc = pipeline
        .wait_for_document("1004", |_| true)
        .await
        .expect("redelivered document");
    assert_eq!(doc.status, EnrichmentStatus::Enriched);
    assert_eq!(doc.body["name"], "Ada");

    running.stop().await.unwrap();
    assert_eq!(pipeline.committed("events"), Some(1));
}

#[tokio::test]
async fn test_transient_sink_failures_are_retried() {
    let pipeline = scenario(MockDocumentStore::failing(2));

    let running = pipeline.start().unwrap();
    pipeline
        .wait_for_document("1004", |_| true)
        .await
        .expect("document after retries");
    assert_eq!(pipeline.store.attempts(), 3);

    let summary = running.stop().await.unwrap();
    assert_eq!(summary.documents_written, 1);
    assert_eq!(pipeline.committed("events"), Some(1));
}

#[tokio::test]
async fn test_checkpoint_failures_are_not_fatal() {
    let pipeline = scenario(MockDocumentStore::new());
    pipeline.checkpoints.set_failing(true);

    let running = pipeline.start().unwrap();
    pipeline
        .wait_for_document("1004", |_| true)
        .await
        .expect("document written while commits fail");
    assert_eq!(pipeline.committed("events"), None);
    assert!(!running.handle.is_finished());

    pipeline.checkpoints.set_failing(false);
    eventually(SETTLE, || pipeline.committed("events").filter(|o| *o == 1))
        .await
        .expect("commit retried on a later tick");

    running.stop().await.unwrap();
}
