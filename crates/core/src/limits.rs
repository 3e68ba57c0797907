//! Size limits applied when decoding records at the source boundary.
//!
//! Records over these limits are treated as malformed and skipped, so a single
//! oversized message cannot pin memory in the state store or pending queues.

/// Maximum raw record size in bytes (64KB).
pub const MAX_RECORD_SIZE_BYTES: usize = 64 * 1024;

/// Maximum number of payload fields per record.
pub const MAX_FIELDS_PER_RECORD: usize = 256;

/// Maximum string field length (chars).
pub const MAX_STRING_FIELD_CHARS: usize = 8192;
