//! Internal telemetry for the enrichment engine: metrics, component health,
//! and structured logging setup.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
