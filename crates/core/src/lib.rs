//! Core types, configuration, and record decoding for the enrichment engine.

pub mod config;
pub mod error;
pub mod limits;
pub mod records;
pub mod schema;

pub use config::*;
pub use error::{Error, MalformedErrorCode, Result};
pub use records::*;
pub use schema::*;
