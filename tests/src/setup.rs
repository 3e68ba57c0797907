//! Common test setup functions.

use api::{router, AppState};
use axum::Router;
use clickhouse_client::{CheckpointStore, DocumentStore};
use engine_core::{LateRecord, PipelineConfig, Result, SourceId, StreamId};
use redpanda::SourceAdapter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use worker::{PipelineCoordinator, PipelineSummary, ShutdownHandle};

use crate::fixtures::PIPELINE;
use crate::mocks::{MemoryCheckpointStore, MemorySource, MockDocumentStore};

/// Default wait for asynchronous pipeline effects.
pub const SETTLE: Duration = Duration::from_secs(5);

/// In-memory sources and stores for one pipeline topology.
///
/// Sources and stores outlive individual runs, so a test can stop the
/// pipeline and start it again over the same data to exercise restarts.
pub struct TestPipeline {
    pub config: PipelineConfig,
    pub sources: HashMap<StreamId, Arc<MemorySource>>,
    pub store: Arc<MockDocumentStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

impl TestPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        telemetry::init_test_tracing();

        let sources = config
            .streams
            .iter()
            .map(|spec| {
                let id = SourceId::new(spec.id.clone(), spec.partition);
                (spec.id.clone(), Arc::new(MemorySource::new(id)))
            })
            .collect();

        Self {
            config,
            sources,
            store: Arc::new(MockDocumentStore::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn with_store(mut self, store: MockDocumentStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Source for a stream id of the topology.
    pub fn source(&self, stream: &str) -> &Arc<MemorySource> {
        &self.sources[&StreamId::new(stream)]
    }

    pub fn source_id(&self, stream: &str) -> SourceId {
        self.source(stream).source_id().clone()
    }

    /// Committed offset of a stream's source, if any.
    pub fn committed(&self, stream: &str) -> Option<i64> {
        self.checkpoints.offset(PIPELINE, &self.source_id(stream))
    }

    fn coordinator(&self) -> Result<PipelineCoordinator> {
        let sources = self
            .config
            .streams
            .iter()
            .map(|spec| self.sources[&spec.id].clone() as Arc<dyn SourceAdapter>)
            .collect();

        PipelineCoordinator::new(
            self.config.clone(),
            sources,
            self.store.clone() as Arc<dyn DocumentStore>,
            self.checkpoints.clone() as Arc<dyn CheckpointStore>,
        )
    }

    /// Starts a run in the background.
    pub fn start(&self) -> Result<RunningPipeline> {
        Ok(RunningPipeline::spawn(self.coordinator()?))
    }

    /// Starts a run that routes late facts to the returned receiver.
    pub fn start_with_late_output(
        &self,
    ) -> Result<(RunningPipeline, mpsc::Receiver<LateRecord>)> {
        let (tx, rx) = mpsc::channel(64);
        let coordinator = self.coordinator()?.with_late_output(tx);
        Ok((RunningPipeline::spawn(coordinator), rx))
    }

    /// Polls until a document with `id` exists and satisfies `check`.
    pub async fn wait_for_document(
        &self,
        id: &str,
        check: impl Fn(&engine_core::Document) -> bool,
    ) -> Option<engine_core::Document> {
        let store = self.store.clone();
        let id = id.to_string();
        eventually(SETTLE, move || store.get(&id).filter(|d| check(d))).await
    }
}

/// A coordinator run in progress.
pub struct RunningPipeline {
    pub handle: JoinHandle<Result<PipelineSummary>>,
    pub shutdown: ShutdownHandle,
    pub epoch: Uuid,
}

impl RunningPipeline {
    fn spawn(coordinator: PipelineCoordinator) -> Self {
        let shutdown = coordinator.shutdown_handle();
        let epoch = coordinator.epoch();
        Self {
            handle: tokio::spawn(coordinator.run()),
            shutdown,
            epoch,
        }
    }

    /// Requests a graceful stop and waits for the run to finish.
    pub async fn stop(self) -> Result<PipelineSummary> {
        self.shutdown.shutdown();
        self.join().await
    }

    /// Waits for the run to finish on its own.
    pub async fn join(self) -> Result<PipelineSummary> {
        match tokio::time::timeout(SETTLE, self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => panic!("pipeline task panicked: {e}"),
            Err(_) => panic!("pipeline did not finish within {:?}", SETTLE),
        }
    }
}

/// Polls `check` every 10ms until it yields a value or `timeout` elapses.
pub async fn eventually<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Operations router for a named pipeline.
pub fn test_router(pipeline: &str) -> Router {
    router(AppState::new(pipeline, Uuid::new_v4()))
}
