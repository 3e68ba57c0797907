//! In-memory stand-ins for the broker source, document store and checkpoint store.

use async_trait::async_trait;
use bytes::Bytes;
use clickhouse_client::{CheckpointStore, DocumentStore};
use engine_core::{Document, Error, EventTime, RawMessage, Result, SourceId};
use parking_lot::Mutex;
use redpanda::{SourceAdapter, StartOffset};
use std::collections::HashMap;

/// Append-only partition held in memory. Offsets are list indices.
pub struct MemorySource {
    id: SourceId,
    messages: Mutex<Vec<RawMessage>>,
    cursor: Mutex<i64>,
    fetch_size: usize,
}

impl MemorySource {
    pub fn new(id: SourceId) -> Self {
        Self {
            id,
            messages: Mutex::new(Vec::new()),
            cursor: Mutex::new(0),
            fetch_size: 16,
        }
    }

    /// Appends a JSON record and returns its offset.
    pub fn push(&self, value: serde_json::Value) -> i64 {
        self.push_raw(value.to_string())
    }

    /// Appends raw bytes (possibly not JSON) and returns the offset.
    pub fn push_raw(&self, payload: impl Into<String>) -> i64 {
        let mut messages = self.messages.lock();
        let offset = messages.len() as i64;
        messages.push(RawMessage {
            offset,
            payload: Bytes::from(payload.into()),
            timestamp: Some(EventTime(offset)),
        });
        offset
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Next offset the source will hand out.
    pub fn position(&self) -> i64 {
        *self.cursor.lock()
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    async fn seek(&self, start: StartOffset) -> Result<()> {
        let end = self.messages.lock().len() as i64;
        *self.cursor.lock() = match start {
            StartOffset::Earliest => 0,
            StartOffset::Latest => end,
            StartOffset::At(offset) => offset.clamp(0, end),
        };
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<RawMessage>> {
        let messages = self.messages.lock();
        let mut cursor = self.cursor.lock();
        let start = usize::try_from(*cursor).unwrap_or(0).min(messages.len());
        let end = (start + self.fetch_size).min(messages.len());
        let batch = messages[start..end].to_vec();
        *cursor = end as i64;
        Ok(batch)
    }

    async fn reset(&self) {}
}

/// Document store keyed by document id. Can be told to fail the next N writes.
#[derive(Default)]
pub struct MockDocumentStore {
    docs: Mutex<HashMap<String, Document>>,
    fail_times: Mutex<u32>,
    attempts: Mutex<u32>,
    written: Mutex<u64>,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        let store = Self::default();
        store.set_fail_times(times);
        store
    }

    pub fn set_fail_times(&self, times: u32) {
        *self.fail_times.lock() = times;
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }

    /// Snapshot of all documents, by id.
    pub fn documents(&self) -> HashMap<String, Document> {
        self.docs.lock().clone()
    }

    /// Batch write attempts, failed ones included.
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }

    /// Documents accepted across all successful writes, rewrites included.
    pub fn written(&self) -> u64 {
        *self.written.lock()
    }

    fn try_attempt(&self) -> Result<()> {
        *self.attempts.lock() += 1;
        let mut remaining = self.fail_times.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(Error::sink("mock store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn upsert(&self, document: &Document) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(document)).await.map(|_| ())
    }

    async fn upsert_batch(&self, documents: &[Document]) -> Result<usize> {
        self.try_attempt()?;
        let mut docs = self.docs.lock();
        for document in documents {
            docs.insert(document.id.clone(), document.clone());
        }
        *self.written.lock() += documents.len() as u64;
        Ok(documents.len())
    }

    async fn is_healthy(&self) -> bool {
        *self.fail_times.lock() == 0
    }
}

/// Committed offsets per pipeline and source.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    offsets: Mutex<HashMap<(String, SourceId), i64>>,
    fail: Mutex<bool>,
    commits: Mutex<u32>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self, pipeline: &str, source: &SourceId) -> Option<i64> {
        self.offsets
            .lock()
            .get(&(pipeline.to_string(), source.clone()))
            .copied()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Successful commit calls.
    pub fn commits(&self) -> u32 {
        *self.commits.lock()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, pipeline: &str) -> Result<HashMap<SourceId, i64>> {
        Ok(self
            .offsets
            .lock()
            .iter()
            .filter(|((p, _), _)| p == pipeline)
            .map(|((_, source), offset)| (source.clone(), *offset))
            .collect())
    }

    async fn commit(&self, pipeline: &str, offsets: &[(SourceId, i64)]) -> Result<()> {
        if *self.fail.lock() {
            return Err(Error::checkpoint("mock checkpoint store unavailable"));
        }
        let mut stored = self.offsets.lock();
        for (source, offset) in offsets {
            stored.insert((pipeline.to_string(), source.clone()), *offset);
        }
        *self.commits.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_seek_and_fetch() {
        let source = MemorySource::new(SourceId::new("events", 0));
        for i in 0..20 {
            source.push(serde_json::json!({ "key": i }));
        }

        let first = source.fetch().await.unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(source.fetch().await.unwrap().len(), 4);
        assert!(source.fetch().await.unwrap().is_empty());

        source.seek(StartOffset::At(18)).await.unwrap();
        let tail = source.fetch().await.unwrap();
        assert_eq!(tail.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![18, 19]);

        source.seek(StartOffset::Latest).await.unwrap();
        assert_eq!(source.position(), 20);
    }

    #[tokio::test]
    async fn test_mock_store_fails_then_recovers() {
        let store = MockDocumentStore::failing(1);
        let doc = Document {
            id: "1".into(),
            entity_key: "1".into(),
            body: serde_json::json!({ "key": 1 }),
            event_time: EventTime(0),
            status: engine_core::EnrichmentStatus::Enriched,
        };

        assert!(store.upsert(&doc).await.is_err());
        store.upsert(&doc).await.unwrap();
        assert_eq!(store.attempts(), 2);
        assert_eq!(store.len(), 1);
    }
}
