//! Stateful core of the enrichment engine.
//!
//! - State store (latest dimension payload per key, sharded and bounded)
//! - Watermarks (per-stream event-time progress, idle stream exclusion)
//! - Join engine (fact buffering, release, expiry and late handling)

pub mod engine;
pub mod state;
pub mod watermark;

pub use engine::*;
pub use state::*;
pub use watermark::*;
