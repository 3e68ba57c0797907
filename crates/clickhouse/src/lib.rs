//! ClickHouse document and checkpoint stores for the enrichment engine.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod health;
pub mod query;
pub mod schema;
pub mod store;

pub use checkpoint::*;
pub use client::*;
pub use config::*;
pub use query::*;
pub use store::*;
