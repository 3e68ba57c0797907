//! Source adapter boundary.
//!
//! A source adapter reads one partition of one stream and hands back raw
//! messages in offset order. Decoding into facts and dimensions happens above
//! this boundary.

use async_trait::async_trait;
use engine_core::{RawMessage, Result, SourceId};

/// Where a source starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Earliest,
    Latest,
    /// Next offset to read.
    At(i64),
}

/// One partition of one input stream.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// The `(stream, partition)` this adapter reads.
    fn source_id(&self) -> &SourceId;

    /// Positions the adapter; the next fetch starts there.
    async fn seek(&self, start: StartOffset) -> Result<()>;

    /// Fetches the next messages. An empty vector means nothing arrived within
    /// the adapter's wait time.
    async fn fetch(&self) -> Result<Vec<RawMessage>>;

    /// Drops the connection after an error so the next call reconnects.
    async fn reset(&self);
}
