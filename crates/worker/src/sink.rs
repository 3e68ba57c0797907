//! Batched, retrying writer in front of the document store.

use clickhouse_client::DocumentStore;
use engine_core::{Document, EnrichedRecord, Error, PipelineConfig, Result, SourceId, SourcePosition};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tracing::{debug, error, warn};

/// Sink writer configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Records per batch before a flush is forced
    pub batch_size: usize,
    /// Batch age before a flush is due
    pub flush_interval: Duration,
    /// Total write attempts per batch
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::from_pipeline(&PipelineConfig::default())
    }
}

impl SinkConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.batch_flush_interval(),
            max_attempts: config.max_retries.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(config.max_retry_backoff_ms),
        }
    }

    /// Pause before the `retry`-th retry (1-based): base * 2^(retry - 1), capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

/// Records waiting for the next flush.
#[derive(Debug)]
struct EnrichedBatch {
    records: Vec<EnrichedRecord>,
    created_at: Instant,
}

impl EnrichedBatch {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            created_at: Instant::now(),
        }
    }

    fn push(&mut self, record: EnrichedRecord) {
        if self.records.is_empty() {
            self.created_at = Instant::now();
        }
        self.records.push(record);
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn take(&mut self) -> Vec<EnrichedRecord> {
        self.created_at = Instant::now();
        std::mem::take(&mut self.records)
    }
}

/// Accumulates enriched records and writes them in batches with retries.
pub struct SinkWriter {
    store: Arc<dyn DocumentStore>,
    config: SinkConfig,
    batch: EnrichedBatch,
    documents_written: u64,
    batches_flushed: u64,
}

impl SinkWriter {
    pub fn new(store: Arc<dyn DocumentStore>, config: SinkConfig) -> Self {
        Self {
            store,
            config,
            batch: EnrichedBatch::new(),
            documents_written: 0,
            batches_flushed: 0,
        }
    }

    /// Adds a record. Returns `true` when the batch is full.
    pub fn push(&mut self, record: EnrichedRecord) -> bool {
        self.batch.push(record);
        self.batch.records.len() >= self.config.batch_size
    }

    /// The batch is non-empty and older than the flush interval.
    pub fn is_due(&self) -> bool {
        !self.batch.records.is_empty() && self.batch.age() >= self.config.flush_interval
    }

    pub fn len(&self) -> usize {
        self.batch.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.records.is_empty()
    }

    pub fn documents_written(&self) -> u64 {
        self.documents_written
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed
    }

    /// Sources with records in the current batch.
    pub fn batch_sources(&self) -> BTreeSet<SourceId> {
        self.batch
            .records
            .iter()
            .map(|r| r.origin.source.clone())
            .collect()
    }

    /// Writes the current batch and returns the positions it covered.
    ///
    /// On failure the batch is kept, so nothing is acknowledged for it.
    pub async fn flush(&mut self) -> Result<Vec<SourcePosition>> {
        if self.batch.records.is_empty() {
            return Ok(Vec::new());
        }

        let documents: Vec<Document> = self.batch.records.iter().map(|r| r.to_document()).collect();
        let written = self.write_with_retry(&documents).await?;

        let records = self.batch.take();
        self.documents_written += written as u64;
        self.batches_flushed += 1;
        metrics().sink_documents_written.inc_by(written as u64);
        metrics().sink_batches_flushed.inc();

        debug!(documents = written, "Flushed batch");
        Ok(records.into_iter().map(|r| r.origin).collect())
    }

    async fn write_with_retry(&self, documents: &[Document]) -> Result<usize> {
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                let backoff = self.config.backoff_for(attempt - 1);
                metrics().sink_retries.inc();
                warn!(
                    attempt = attempt,
                    backoff_ms = %backoff.as_millis(),
                    "Retrying sink write"
                );
                tokio::time::sleep(backoff).await;
            }

            match self.store.upsert_batch(documents).await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Sink write failed");
                    last_error = Some(e);
                }
            }
        }

        metrics().sink_failures.inc();
        let first_key = documents.iter().map(|d| d.id.as_str()).min().unwrap_or_default();
        let last_key = documents.iter().map(|d| d.id.as_str()).max().unwrap_or_default();
        let err = Error::SinkExhausted {
            records: documents.len(),
            first_key: first_key.to_string(),
            last_key: last_key.to_string(),
            attempts: self.config.max_attempts,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        };
        error!(error = %err, "Sink retries exhausted");
        Err(err)
    }
}
