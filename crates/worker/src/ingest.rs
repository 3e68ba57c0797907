//! Source worker: fetch, decode and forward records from one source.
//!
//! Each source partition gets its own worker task:
//! 1. Fetch raw messages from the adapter
//! 2. Track each offset in the ledger
//! 3. Decode into a fact or dimension record (malformed records are skipped)
//! 4. Forward to the join task over a bounded channel (backpressure)

use engine_core::{Envelope, RecordDecoder, SourcePosition};
use redpanda::SourceAdapter;
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::offsets::OffsetLedger;

/// Source worker configuration.
#[derive(Debug, Clone)]
pub struct SourceWorkerConfig {
    /// Pause after a failed fetch before resetting the connection
    pub error_backoff: Duration,
    /// Pause after an empty fetch
    pub idle_poll: Duration,
}

impl Default for SourceWorkerConfig {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_secs(1),
            idle_poll: Duration::from_millis(20),
        }
    }
}

/// Reads one source and feeds decoded records to the join task.
pub struct SourceWorker {
    source: Arc<dyn SourceAdapter>,
    decoder: Arc<RecordDecoder>,
    ledger: Arc<OffsetLedger>,
    tx: mpsc::Sender<Envelope>,
    config: SourceWorkerConfig,
}

impl SourceWorker {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        decoder: Arc<RecordDecoder>,
        ledger: Arc<OffsetLedger>,
        tx: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            source,
            decoder,
            ledger,
            tx,
            config: SourceWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SourceWorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs until `stop` flips to `true` or the join task goes away.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let id = self.source.source_id().clone();
        info!(stream = %id.stream, partition = id.partition, "Source worker starting");

        loop {
            if *stop.borrow() {
                break;
            }

            let fetched = tokio::select! {
                _ = stop.changed() => break,
                fetched = self.source.fetch() => fetched,
            };

            let messages = match fetched {
                Ok(messages) => messages,
                Err(e) => {
                    metrics().source_errors.inc();
                    warn!(
                        stream = %id.stream,
                        partition = id.partition,
                        error = %e,
                        "Fetch failed, backing off"
                    );
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    self.source.reset().await;
                    continue;
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(self.config.idle_poll) => {}
                }
                continue;
            }

            metrics().records_consumed.inc_by(messages.len() as u64);
            for raw in messages {
                let position = SourcePosition {
                    source: id.clone(),
                    offset: raw.offset,
                };
                self.ledger.track(&position);

                let record = match self.decoder.decode(&id.stream, &raw) {
                    Ok(record) => record,
                    Err(e) => {
                        metrics().malformed_records.inc();
                        warn!(
                            stream = %id.stream,
                            partition = id.partition,
                            offset = raw.offset,
                            error_code = e.error_code().unwrap_or("UNKNOWN"),
                            error = %e,
                            "Skipping malformed record"
                        );
                        self.ledger.ack(&position);
                        continue;
                    }
                };

                let envelope = Envelope { position, record };
                tokio::select! {
                    _ = stop.changed() => {
                        info!(stream = %id.stream, partition = id.partition, "Source worker stopped");
                        return;
                    }
                    sent = self.tx.send(envelope) => {
                        if sent.is_err() {
                            debug!(stream = %id.stream, "Join task gone, stopping source worker");
                            return;
                        }
                    }
                }

                let capacity = self.tx.max_capacity();
                metrics()
                    .queue_depth
                    .set(capacity.saturating_sub(self.tx.capacity()) as u64);
            }
        }

        info!(stream = %id.stream, partition = id.partition, "Source worker stopped");
    }
}
