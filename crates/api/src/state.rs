//! Application state shared across handlers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline_name: Arc<str>,
    /// Epoch of the pipeline run this process hosts.
    pub epoch: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(pipeline_name: impl Into<String>, epoch: Uuid) -> Self {
        Self {
            pipeline_name: Arc::from(pipeline_name.into()),
            epoch,
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
