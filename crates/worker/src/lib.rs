//! Pipeline workers for the enrichment engine.
//!
//! - Source workers (fetch, decode, forward)
//! - Offset ledger (what is safe to commit)
//! - Sink writer (batching, retries)
//! - Coordinator (one pipeline run end to end)

pub mod coordinator;
pub mod ingest;
pub mod offsets;
pub mod sink;

pub use coordinator::*;
pub use ingest::*;
pub use offsets::*;
pub use sink::*;
