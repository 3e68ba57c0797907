//! Document store boundary and its ClickHouse implementation.

use crate::client::ClickHouseClient;
use async_trait::async_trait;
use clickhouse::Row;
use engine_core::{Document, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use telemetry::metrics;
use tracing::debug;

/// Sink for enriched documents. Writes are upserts keyed by document id, and
/// a call returns only after the store has durably accepted the write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts or replaces a single document.
    async fn upsert(&self, document: &Document) -> Result<()>;

    /// Upserts a batch; returns the number of documents written.
    async fn upsert_batch(&self, documents: &[Document]) -> Result<usize> {
        for document in documents {
            self.upsert(document).await?;
        }
        Ok(documents.len())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Row written to the documents table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct DocumentRow {
    pub doc_id: String,
    pub entity_key: String,
    pub body: String,
    /// milliseconds since epoch
    pub event_time: i64,
    pub status: String,
    pub version: u64,
}

/// Strictly increasing row versions, seeded from the wall clock so a later
/// process still writes higher versions than an earlier one.
#[derive(Debug, Default)]
struct VersionClock(AtomicU64);

impl VersionClock {
    fn next(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self
                .0
                .compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Documents stored in a ClickHouse ReplacingMergeTree.
pub struct ClickHouseDocumentStore {
    client: ClickHouseClient,
    table: String,
    versions: VersionClock,
}

impl ClickHouseDocumentStore {
    pub fn new(client: ClickHouseClient) -> Self {
        let table = client.documents_table();
        Self {
            client,
            table,
            versions: VersionClock::default(),
        }
    }

    fn to_row(&self, document: &Document) -> Result<DocumentRow> {
        Ok(DocumentRow {
            doc_id: document.id.clone(),
            entity_key: document.entity_key.clone(),
            body: serde_json::to_string(&document.body)?,
            event_time: document.event_time.as_millis(),
            status: document.status.as_str().to_string(),
            version: self.versions.next(),
        })
    }
}

#[async_trait]
impl DocumentStore for ClickHouseDocumentStore {
    async fn upsert(&self, document: &Document) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(document)).await?;
        Ok(())
    }

    async fn upsert_batch(&self, documents: &[Document]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let rows = documents
            .iter()
            .map(|d| self.to_row(d))
            .collect::<Result<Vec<_>>>()?;

        let mut insert = self
            .client
            .inner()
            .insert(&self.table)
            .map_err(|e| Error::sink(format!("insert error: {}", e)))?;

        for row in &rows {
            insert
                .write(row)
                .await
                .map_err(|e| Error::sink(format!("write error: {}", e)))?;
        }

        insert
            .end()
            .await
            .map_err(|e| Error::sink(format!("end error: {}", e)))?;

        let elapsed = start.elapsed();
        metrics().sink_latency_ms.observe(elapsed.as_millis() as u64);

        debug!(
            count = rows.len(),
            latency_ms = %elapsed.as_millis(),
            "Upserted documents to ClickHouse"
        );

        Ok(rows.len())
    }

    async fn is_healthy(&self) -> bool {
        crate::health::check_connection(&self.client).await
    }
}
