//! Redpanda source adapter.
//!
//! Uses rskafka to read a single topic partition with:
//! - Explicit positioning (earliest, latest or a committed offset)
//! - Offsets owned by the pipeline, never committed to the broker
//! - Lazy (re)connection after errors

use crate::config::RedpandaConfig;
use crate::source::{SourceAdapter, StartOffset};
use async_trait::async_trait;
use bytes::Bytes;
use engine_core::{Error, EventTime, RawMessage, Result, SourceId};
use parking_lot::Mutex;
use rskafka::client::{
    partition::{OffsetAt, PartitionClient, UnknownTopicHandling},
    ClientBuilder, Credentials, SaslConfig,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Sentinel for "resolve the start position on the next fetch".
const UNRESOLVED: i64 = -1;

/// Creates a TLS configuration for Redpanda Cloud.
pub(crate) fn tls_config() -> Arc<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
}

/// Reads one partition of one stream from Redpanda.
pub struct KafkaSource {
    id: SourceId,
    topic: String,
    config: RedpandaConfig,
    partition_client: RwLock<Option<Arc<PartitionClient>>>,
    /// Next offset to read, or [`UNRESOLVED`].
    next_offset: AtomicI64,
    start: Mutex<StartOffset>,
}

impl KafkaSource {
    pub fn new(id: SourceId, topic: impl Into<String>, config: RedpandaConfig) -> Self {
        let topic = topic.into();
        info!(
            stream = %id.stream,
            topic = %topic,
            partition = id.partition,
            "Creating Redpanda source"
        );

        Self {
            id,
            topic,
            config,
            partition_client: RwLock::new(None),
            next_offset: AtomicI64::new(UNRESOLVED),
            start: Mutex::new(StartOffset::Earliest),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next offset that will be fetched, if already resolved.
    pub fn next_offset(&self) -> Option<i64> {
        match self.next_offset.load(Ordering::SeqCst) {
            UNRESOLVED => None,
            offset => Some(offset),
        }
    }

    async fn ensure_connected(&self) -> Result<Arc<PartitionClient>> {
        {
            let client = self.partition_client.read().await;
            if let Some(ref c) = *client {
                return Ok(c.clone());
            }
        }

        let mut builder = ClientBuilder::new(vec![self.config.broker_string()]);

        if let Some((username, password)) = self.config.credentials() {
            builder = builder
                .tls_config(tls_config())
                .sasl_config(SaslConfig::ScramSha256(Credentials::new(
                    username.to_string(),
                    password.to_string(),
                )));
        }

        let client = builder
            .build()
            .await
            .map_err(|e| Error::source(format!("failed to connect to Redpanda: {}", e)))?;

        let partition_client = client
            .partition_client(self.topic.clone(), self.id.partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| Error::source(format!("failed to get partition client: {}", e)))?;

        let partition_client = Arc::new(partition_client);
        {
            let mut guard = self.partition_client.write().await;
            *guard = Some(partition_client.clone());
        }

        debug!(stream = %self.id.stream, partition = self.id.partition, "Connected to Redpanda");
        Ok(partition_client)
    }

    async fn resolve_start(&self, client: &PartitionClient) -> Result<i64> {
        let current = self.next_offset.load(Ordering::SeqCst);
        if current != UNRESOLVED {
            return Ok(current);
        }

        let start = *self.start.lock();
        let offset = match start {
            StartOffset::At(offset) => offset,
            StartOffset::Earliest => client
                .get_offset(OffsetAt::Earliest)
                .await
                .map_err(|e| Error::source(format!("failed to get earliest offset: {}", e)))?,
            StartOffset::Latest => client
                .get_offset(OffsetAt::Latest)
                .await
                .map_err(|e| Error::source(format!("failed to get latest offset: {}", e)))?,
        };

        self.next_offset.store(offset, Ordering::SeqCst);
        info!(
            stream = %self.id.stream,
            partition = self.id.partition,
            offset = offset,
            "Source positioned"
        );
        Ok(offset)
    }
}

#[async_trait]
impl SourceAdapter for KafkaSource {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    async fn seek(&self, start: StartOffset) -> Result<()> {
        *self.start.lock() = start;
        let next = match start {
            StartOffset::At(offset) => offset,
            _ => UNRESOLVED,
        };
        self.next_offset.store(next, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<RawMessage>> {
        let client = self.ensure_connected().await?;
        let current = self.resolve_start(&client).await?;
        let started = Instant::now();

        let (records, _high_watermark) = client
            .fetch_records(
                current,
                1..self.config.fetch_max_bytes.max(2),
                self.config.fetch_max_wait_ms,
            )
            .await
            .map_err(|e| Error::source(format!("failed to fetch records: {}", e)))?;

        metrics()
            .fetch_latency_ms
            .observe(started.elapsed().as_millis() as u64);

        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut max_offset = current;
        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            // A fetch may start inside a compressed batch and return earlier offsets.
            if record.offset < current {
                continue;
            }
            max_offset = max_offset.max(record.offset);
            messages.push(RawMessage {
                offset: record.offset,
                payload: Bytes::from(record.record.value.unwrap_or_default()),
                timestamp: Some(EventTime::from(record.record.timestamp)),
            });
        }

        if !messages.is_empty() {
            self.next_offset.store(max_offset + 1, Ordering::SeqCst);
        }

        debug!(
            stream = %self.id.stream,
            partition = self.id.partition,
            records = messages.len(),
            offset_start = current,
            offset_end = max_offset,
            "Fetched records from Redpanda"
        );

        Ok(messages)
    }

    async fn reset(&self) {
        let mut client = self.partition_client.write().await;
        *client = None;
        warn!(
            stream = %self.id.stream,
            partition = self.id.partition,
            "Source connection reset"
        );
    }
}
