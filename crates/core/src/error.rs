//! Unified error types for the enrichment engine.
//!
//! Error codes:
//! - MALFORMED_001-007: Malformed records (skipped, never fatal)
//! - SOURCE_001: Transient source errors
//! - SINK_001: Sink write exhaustion (fatal)
//! - SINK_002: Transient sink write errors
//! - CKPT_001: Checkpoint store errors
//! - CONFIG_001: Invalid configuration

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed record error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedErrorCode {
    /// MALFORMED_001: Payload is not a JSON object
    InvalidJson,
    /// MALFORMED_002: Required field missing
    MissingField,
    /// MALFORMED_003: Field value does not match its declared type
    InvalidType,
    /// MALFORMED_004: Value outside the supported variants (float, bool, array, object)
    UnsupportedValue,
    /// MALFORMED_005: No event time could be assigned
    MissingEventTime,
    /// MALFORMED_006: Empty record value
    EmptyRecord,
    /// MALFORMED_007: Record exceeds size limits
    Oversized,
}

impl MalformedErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson => "MALFORMED_001",
            Self::MissingField => "MALFORMED_002",
            Self::InvalidType => "MALFORMED_003",
            Self::UnsupportedValue => "MALFORMED_004",
            Self::MissingEventTime => "MALFORMED_005",
            Self::EmptyRecord => "MALFORMED_006",
            Self::Oversized => "MALFORMED_007",
        }
    }
}

/// Unified error type for the enrichment engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A record that does not match its stream's shape.
    #[error("[{code}] {message}")]
    Malformed { code: &'static str, message: String },

    /// Broker unreachable or fetch failed.
    #[error("[SOURCE_001] {0}")]
    Source(String),

    /// A single sink write attempt failed.
    #[error("[SINK_002] {0}")]
    Sink(String),

    /// Sink retries exhausted for a batch.
    #[error(
        "[SINK_001] sink write failed after {attempts} attempts for {records} records \
         (keys {first_key}..{last_key}): {message}"
    )]
    SinkExhausted {
        records: usize,
        first_key: String,
        last_key: String,
        attempts: u32,
        message: String,
    },

    #[error("[CKPT_001] {0}")]
    Checkpoint(String),

    #[error("[CONFIG_001] {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed record error.
    pub fn malformed(code: MalformedErrorCode, msg: impl Into<String>) -> Self {
        Self::Malformed {
            code: code.code(),
            message: msg.into(),
        }
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Retried with backoff at the adapter or sink boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Sink(_) | Self::Checkpoint(_))
    }

    /// The offending record is skipped and counted.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Requires operator intervention; the pipeline stops.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SinkExhausted { .. } | Self::Internal(_))
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Malformed { code, .. } => Some(code),
            Self::Source(_) => Some("SOURCE_001"),
            Self::Sink(_) => Some("SINK_002"),
            Self::SinkExhausted { .. } => Some("SINK_001"),
            Self::Checkpoint(_) => Some("CKPT_001"),
            Self::Config(_) => Some("CONFIG_001"),
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Config(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_error_carries_code() {
        let err = Error::malformed(MalformedErrorCode::MissingField, "missing key field 'id'");
        assert_eq!(err.error_code(), Some("MALFORMED_002"));
        assert_eq!(err.to_string(), "[MALFORMED_002] missing key field 'id'");
        assert!(err.is_malformed());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_sink_exhausted_is_fatal() {
        let err = Error::SinkExhausted {
            records: 2,
            first_key: "1004".into(),
            last_key: "9999".into(),
            attempts: 3,
            message: "connection refused".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_transient());
        assert_eq!(err.error_code(), Some("SINK_001"));
        assert!(err.to_string().contains("keys 1004..9999"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::source("broker down").is_transient());
        assert!(Error::sink("timeout").is_transient());
        assert!(!Error::config("bad").is_transient());
    }
}
