//! Response bodies.

use serde::{Deserialize, Serialize};
use telemetry::ComponentHealthReport;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pipeline: String,
    pub epoch: String,
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealthReport>,
    pub pending_facts: u64,
    pub queue_depth: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_watermark_ms: Option<u64>,
}
