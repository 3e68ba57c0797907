//! Shared harness for the pipeline integration tests.
//!
//! Runs the real coordinator, join task and sink loop against in-memory
//! sources, document store and checkpoint store.

pub mod fixtures;
pub mod mocks;
pub mod setup;
