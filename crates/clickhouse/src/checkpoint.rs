//! Checkpoint store boundary and its ClickHouse implementation.

use crate::client::ClickHouseClient;
use async_trait::async_trait;
use clickhouse::Row;
use engine_core::{Error, Result, SourceId, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Durable store for the next offset to read per source.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Committed offsets for `pipeline`; sources never committed are absent.
    async fn load(&self, pipeline: &str) -> Result<HashMap<SourceId, i64>>;

    async fn commit(&self, pipeline: &str, offsets: &[(SourceId, i64)]) -> Result<()>;
}

#[derive(Debug, Clone, Row, Serialize)]
struct OffsetRow {
    pipeline: String,
    stream: String,
    partition: i32,
    offset: i64,
    committed_at: i64,
}

#[derive(Debug, Clone, Row, Deserialize)]
struct CommittedRow {
    stream: String,
    partition: i32,
    offset: i64,
}

/// Offsets stored in a ClickHouse ReplacingMergeTree.
pub struct ClickHouseCheckpointStore {
    client: ClickHouseClient,
    table: String,
}

impl ClickHouseCheckpointStore {
    pub fn new(client: ClickHouseClient) -> Self {
        let table = client.offsets_table();
        Self { client, table }
    }
}

#[async_trait]
impl CheckpointStore for ClickHouseCheckpointStore {
    async fn load(&self, pipeline: &str) -> Result<HashMap<SourceId, i64>> {
        let sql = format!(
            "SELECT stream, partition, argMax(offset, committed_at) AS offset \
             FROM {} WHERE pipeline = ? GROUP BY stream, partition",
            self.table
        );

        let rows: Vec<CommittedRow> = self
            .client
            .inner()
            .query(&sql)
            .bind(pipeline)
            .fetch_all()
            .await
            .map_err(|e| Error::checkpoint(format!("offset load error: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| (SourceId::new(StreamId::new(r.stream), r.partition), r.offset))
            .collect())
    }

    async fn commit(&self, pipeline: &str, offsets: &[(SourceId, i64)]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let committed_at = chrono::Utc::now().timestamp_millis();
        let mut insert = self
            .client
            .inner()
            .insert(&self.table)
            .map_err(|e| Error::checkpoint(format!("insert error: {}", e)))?;

        for (source, offset) in offsets {
            let row = OffsetRow {
                pipeline: pipeline.to_string(),
                stream: source.stream.as_str().to_string(),
                partition: source.partition,
                offset: *offset,
                committed_at,
            };
            insert
                .write(&row)
                .await
                .map_err(|e| Error::checkpoint(format!("write error: {}", e)))?;
        }

        insert
            .end()
            .await
            .map_err(|e| Error::checkpoint(format!("end error: {}", e)))?;

        debug!(pipeline = pipeline, sources = offsets.len(), "Committed offsets");
        Ok(())
    }
}
