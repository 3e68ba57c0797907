//! Pipeline configuration.
//!
//! A single explicit configuration struct is handed to the pipeline
//! coordinator at construction; nothing about the pipeline lives in
//! process-wide state.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::error::Result;
use crate::records::StreamId;
use crate::schema::{default_topology, validate_topology, StreamSpec};

/// What happens to a fact that arrives behind its stream's watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Skip the record (counted).
    #[default]
    Drop,
    /// Join it normally and flag the output document as late.
    EmitWithFlag,
    /// Hand it to the side output unjoined.
    SideOutput,
}

/// How the sink document id is derived from a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentIdentity {
    /// One document per fact key, upserted with the latest enrichment.
    #[default]
    Key,
    /// One document per fact occurrence: `<stream>-<partition>-<offset>`.
    Origin,
}

/// Where a source starts when no offset has been committed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    #[default]
    Earliest,
    Latest,
}

/// Enrichment pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    /// Name used to key committed offsets
    #[serde(default = "default_pipeline_name")]
    #[validate(length(min = 1, max = 128))]
    pub pipeline_name: String,
    /// Tolerated out-of-orderness, also the pending-fact horizon
    #[serde(default = "default_allowed_lateness_ms")]
    pub allowed_lateness_ms: u64,
    /// Streams silent for longer than this are excluded from the combined watermark
    #[serde(default = "default_idle_stream_timeout_ms")]
    #[validate(range(min = 1))]
    pub idle_stream_timeout_ms: u64,
    /// Maximum dimension keys held in memory
    #[serde(default = "default_max_resident_keys")]
    #[validate(range(min = 1))]
    pub max_resident_keys: usize,
    /// Number of state store shards
    #[serde(default = "default_state_shards")]
    #[validate(range(min = 1, max = 1024))]
    pub state_shards: usize,
    /// Sink batch size (records)
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 100000))]
    pub batch_size: usize,
    /// Sink batch age before flush
    #[serde(default = "default_batch_flush_interval_ms")]
    #[validate(range(min = 1))]
    pub batch_flush_interval_ms: u64,
    /// Total sink write attempts per batch
    #[serde(default = "default_max_retries")]
    #[validate(range(min = 1, max = 100))]
    pub max_retries: u32,
    /// Initial sink retry backoff
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Cap for the exponential sink retry backoff
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
    /// Capacity of the bounded queues between stages
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    /// Offset commit interval when no batch is flushed
    #[serde(default = "default_commit_interval_ms")]
    #[validate(range(min = 1))]
    pub commit_interval_ms: u64,
    #[serde(default)]
    pub late_data_policy: LatePolicy,
    #[serde(default)]
    pub document_id: DocumentIdentity,
    /// Rebuild dimension state by replaying dimension streams from the earliest offset
    #[serde(default = "default_replay_dimensions_on_start")]
    pub replay_dimensions_on_start: bool,
    #[serde(default)]
    pub start_from: StartFrom,
    /// Stream topology
    #[serde(default = "default_topology")]
    pub streams: Vec<StreamSpec>,
}

fn default_pipeline_name() -> String {
    "enrichment".to_string()
}

fn default_allowed_lateness_ms() -> u64 {
    5000
}

fn default_idle_stream_timeout_ms() -> u64 {
    60_000
}

fn default_max_resident_keys() -> usize {
    1_000_000
}

fn default_state_shards() -> usize {
    16
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_flush_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_max_retry_backoff_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_commit_interval_ms() -> u64 {
    5000
}

fn default_replay_dimensions_on_start() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: default_pipeline_name(),
            allowed_lateness_ms: default_allowed_lateness_ms(),
            idle_stream_timeout_ms: default_idle_stream_timeout_ms(),
            max_resident_keys: default_max_resident_keys(),
            state_shards: default_state_shards(),
            batch_size: default_batch_size(),
            batch_flush_interval_ms: default_batch_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            queue_capacity: default_queue_capacity(),
            commit_interval_ms: default_commit_interval_ms(),
            late_data_policy: LatePolicy::default(),
            document_id: DocumentIdentity::default(),
            replay_dimensions_on_start: default_replay_dimensions_on_start(),
            start_from: StartFrom::default(),
            streams: default_topology(),
        }
    }
}

impl PipelineConfig {
    /// Validates field ranges and the stream topology.
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        validate_topology(&self.streams)?;
        if self.max_retry_backoff_ms < self.retry_backoff_ms {
            return Err(crate::Error::config(
                "max_retry_backoff_ms must not be below retry_backoff_ms",
            ));
        }
        Ok(())
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_millis(self.allowed_lateness_ms)
    }

    pub fn idle_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_stream_timeout_ms)
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn fact_stream(&self) -> Option<&StreamSpec> {
        self.streams.iter().find(|s| s.is_fact())
    }

    pub fn dimension_streams(&self) -> impl Iterator<Item = &StreamSpec> {
        self.streams.iter().filter(|s| !s.is_fact())
    }

    pub fn stream(&self, id: &StreamId) -> Option<&StreamSpec> {
        self.streams.iter().find(|s| &s.id == id)
    }
}
