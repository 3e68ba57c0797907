//! Pipeline coordinator.
//!
//! Owns one run (epoch) of the enrichment pipeline:
//! 1. Load committed offsets and position every source
//! 2. Spawn one worker per source and the join task
//! 3. Run the sink loop: batch, write, acknowledge, commit
//! 4. Shut down in order: flush, commit, stop sources, drain the join task
//!
//! Offsets are committed only up to the first record whose effect is not yet
//! durable, so a crash or a fatal sink error never loses data; at worst a
//! restart redelivers records and the sink re-upserts them.

use clickhouse_client::{CheckpointStore, DocumentStore};
use engine_core::{
    EnrichedRecord, Envelope, Error, LateRecord, PipelineConfig, RecordDecoder, Result, SourceId,
    StartFrom,
};
use join_engine::{JoinConfig, JoinEngine, JoinOutput, KeyedStateStore};
use redpanda::{SourceAdapter, StartOffset};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::{health, metrics};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ingest::{SourceWorker, SourceWorkerConfig};
use crate::offsets::OffsetLedger;
use crate::sink::{SinkConfig, SinkWriter};

/// Requests a graceful stop of a running coordinator.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub epoch: Uuid,
    pub documents_written: u64,
    pub batches_flushed: u64,
    /// Last committed offset per source.
    pub committed: Vec<(SourceId, i64)>,
}

/// Runs the enrichment pipeline over a set of sources.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    sources: Vec<Arc<dyn SourceAdapter>>,
    store: Arc<dyn DocumentStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    late_output: Option<mpsc::Sender<LateRecord>>,
    worker_config: SourceWorkerConfig,
    shutdown: Arc<watch::Sender<bool>>,
    epoch: Uuid,
}

impl PipelineCoordinator {
    /// Validates the configuration and checks that every source belongs to a
    /// stream in the topology.
    pub fn new(
        config: PipelineConfig,
        sources: Vec<Arc<dyn SourceAdapter>>,
        store: Arc<dyn DocumentStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.check()?;

        for source in &sources {
            let id = source.source_id();
            if config.stream(&id.stream).is_none() {
                return Err(Error::config(format!(
                    "source {} does not belong to any configured stream",
                    id
                )));
            }
        }

        let fact = config
            .fact_stream()
            .ok_or_else(|| Error::config("topology has no fact stream"))?;
        if !sources.iter().any(|s| s.source_id().stream == fact.id) {
            return Err(Error::config(format!("no source for fact stream '{}'", fact.id)));
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            sources,
            store,
            checkpoints,
            late_output: None,
            worker_config: SourceWorkerConfig::default(),
            shutdown: Arc::new(shutdown),
            epoch: Uuid::new_v4(),
        })
    }

    /// Routes late facts here under the side-output policy.
    pub fn with_late_output(mut self, tx: mpsc::Sender<LateRecord>) -> Self {
        self.late_output = Some(tx);
        self
    }

    pub fn with_worker_config(mut self, config: SourceWorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    async fn position_sources(&self, ledger: &OffsetLedger) -> Result<()> {
        let committed = self.checkpoints.load(&self.config.pipeline_name).await?;

        for source in &self.sources {
            let id = source.source_id();
            let is_fact = self
                .config
                .stream(&id.stream)
                .is_some_and(|s| s.is_fact());
            let last = committed.get(id).copied();

            let start = match last {
                _ if !is_fact && self.config.replay_dimensions_on_start => StartOffset::Earliest,
                Some(offset) => StartOffset::At(offset),
                None => match self.config.start_from {
                    StartFrom::Earliest => StartOffset::Earliest,
                    StartFrom::Latest => StartOffset::Latest,
                },
            };

            source.seek(start).await?;
            ledger.register(id.clone(), last);
            info!(
                epoch = %self.epoch,
                stream = %id.stream,
                partition = id.partition,
                start = ?start,
                "Source positioned"
            );
        }

        Ok(())
    }

    /// Runs until shutdown is requested, every source is exhausted and closed,
    /// or a fatal error occurs.
    pub async fn run(self) -> Result<PipelineSummary> {
        info!(
            epoch = %self.epoch,
            pipeline = %self.config.pipeline_name,
            sources = self.sources.len(),
            "Pipeline starting"
        );

        let ledger = Arc::new(OffsetLedger::new());
        if let Err(e) = self.position_sources(&ledger).await {
            health().pipeline.set_unhealthy(e.to_string());
            return Err(e);
        }

        let decoder = Arc::new(RecordDecoder::new(&self.config.streams)?);
        let join_config = JoinConfig::from_pipeline(&self.config)?;
        let state = Arc::new(
            KeyedStateStore::new(
                self.config.state_shards,
                self.config.max_resident_keys,
                join_config.required_streams(),
            )
            .with_merge_order(join_config.dimension_streams()),
        );
        let engine = JoinEngine::new(join_config, state, Instant::now());

        let (stop_tx, stop_rx) = watch::channel(false);
        let (envelope_tx, envelope_rx) = mpsc::channel::<Envelope>(self.config.queue_capacity);
        let (enriched_tx, mut enriched_rx) =
            mpsc::channel::<EnrichedRecord>(self.config.queue_capacity);

        let mut source_handles = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let worker = SourceWorker::new(
                source.clone(),
                decoder.clone(),
                ledger.clone(),
                envelope_tx.clone(),
            )
            .with_config(self.worker_config.clone());
            source_handles.push(tokio::spawn(worker.run(stop_rx.clone())));
        }
        drop(envelope_tx);

        let join_task = JoinTask {
            engine,
            rx: envelope_rx,
            tx: enriched_tx,
            ledger: ledger.clone(),
            late_output: self.late_output.clone(),
            tick: expiry_tick(self.config.allowed_lateness()),
        };
        let join_handle = tokio::spawn(join_task.run());

        health().pipeline.set_healthy();

        let mut sink = SinkWriter::new(self.store.clone(), SinkConfig::from_pipeline(&self.config));
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut flush_ticker = interval(self.config.batch_flush_interval());
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commit_ticker = interval(self.config.commit_interval());
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome: Result<()> = loop {
            if *shutdown_rx.borrow() {
                info!(epoch = %self.epoch, "Shutdown requested");
                break self.flush(&mut sink, &ledger).await;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                maybe = enriched_rx.recv() => match maybe {
                    Some(record) => {
                        if sink.push(record) {
                            if let Err(e) = self.flush(&mut sink, &ledger).await {
                                break Err(e);
                            }
                        }
                    }
                    None => {
                        info!(epoch = %self.epoch, "Join task finished, draining");
                        break self.flush(&mut sink, &ledger).await;
                    }
                },
                _ = flush_ticker.tick() => {
                    if sink.is_due() {
                        if let Err(e) = self.flush(&mut sink, &ledger).await {
                            break Err(e);
                        }
                    }
                }
                _ = commit_ticker.tick() => self.commit(&ledger).await,
            }
        };

        if let Err(ref e) = outcome {
            error!(epoch = %self.epoch, error = %e, "Pipeline failed");
            health().pipeline.set_unhealthy(e.to_string());
        }

        // Stop sources, then let the join task run dry.
        stop_tx.send_replace(true);
        for handle in source_handles {
            log_join_error(handle.await);
        }
        drop(enriched_rx);
        log_join_error(join_handle.await);

        outcome?;
        health().pipeline.set_unhealthy("stopped");

        let mut committed: Vec<(SourceId, i64)> = self
            .sources
            .iter()
            .filter_map(|s| {
                let id = s.source_id();
                ledger.committed(id).map(|o| (id.clone(), o))
            })
            .collect();
        committed.sort();

        info!(
            epoch = %self.epoch,
            documents = sink.documents_written(),
            batches = sink.batches_flushed(),
            "Pipeline stopped"
        );

        Ok(PipelineSummary {
            epoch: self.epoch,
            documents_written: sink.documents_written(),
            batches_flushed: sink.batches_flushed(),
            committed,
        })
    }

    /// Writes the pending batch, acknowledges it and commits. A fatal sink
    /// error halts commits for the sources in the failed batch.
    async fn flush(&self, sink: &mut SinkWriter, ledger: &OffsetLedger) -> Result<()> {
        let sources = sink.batch_sources();
        match sink.flush().await {
            Ok(positions) => {
                for position in &positions {
                    ledger.ack(position);
                }
                self.commit(ledger).await;
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    ledger.halt(&sources);
                }
                Err(e)
            }
        }
    }

    async fn commit(&self, ledger: &OffsetLedger) {
        let offsets = ledger.committable();
        if offsets.is_empty() {
            return;
        }

        match self
            .checkpoints
            .commit(&self.config.pipeline_name, &offsets)
            .await
        {
            Ok(()) => {
                ledger.mark_committed(&offsets);
                metrics().offsets_committed.inc_by(offsets.len() as u64);
                debug!(epoch = %self.epoch, sources = offsets.len(), "Offsets committed");
            }
            Err(e) => {
                // Retried on the next commit.
                metrics().checkpoint_errors.inc();
                warn!(epoch = %self.epoch, error = %e, "Offset commit failed");
            }
        }
    }
}

/// Expiry check cadence: a quarter of the lateness horizon within [10ms, 1s].
fn expiry_tick(allowed_lateness: Duration) -> Duration {
    (allowed_lateness / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

fn log_join_error(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Pipeline task panicked");
    }
}

/// Owns the join engine; the only writer of join state.
struct JoinTask {
    engine: JoinEngine,
    rx: mpsc::Receiver<Envelope>,
    tx: mpsc::Sender<EnrichedRecord>,
    ledger: Arc<OffsetLedger>,
    late_output: Option<mpsc::Sender<LateRecord>>,
    tick: Duration,
}

impl JoinTask {
    async fn run(mut self) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outputs = tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(envelope) => self.engine.process(envelope, Instant::now()),
                    None => break,
                },
                _ = ticker.tick() => self.engine.expire(Instant::now()),
            };

            if !self.dispatch(outputs).await {
                break;
            }
        }

        debug!(pending = self.engine.pending_len(), "Join task finished");
    }

    /// Returns `false` once the sink loop is gone.
    async fn dispatch(&mut self, outputs: Vec<JoinOutput>) -> bool {
        for output in outputs {
            match output {
                JoinOutput::Emit(record) => {
                    if self.tx.send(record).await.is_err() {
                        return false;
                    }
                }
                JoinOutput::Applied(position) | JoinOutput::Dropped(position) => {
                    self.ledger.ack(&position);
                }
                JoinOutput::Late(late) => {
                    let position = late.position.clone();
                    match &self.late_output {
                        Some(tx) => {
                            if tx.send(late).await.is_err() {
                                warn!(position = %position, "Late output closed, late fact discarded");
                            }
                        }
                        None => {
                            warn!(position = %position, "No late output configured, late fact discarded");
                        }
                    }
                    self.ledger.ack(&position);
                }
            }
        }
        true
    }
}
