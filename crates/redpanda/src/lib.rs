//! Redpanda source adapter for the enrichment engine.

pub mod config;
pub mod consumer;
pub mod health;
pub mod source;

pub use config::*;
pub use consumer::*;
pub use source::*;
