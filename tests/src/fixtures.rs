//! Test topology, configuration and record generators.

use engine_core::{FieldKind, FieldSpec, LatePolicy, PipelineConfig, StreamSpec};

pub const PIPELINE: &str = "test-pipeline";

/// Entities (required), events (fact) and metadata (optional, joined on `team_id`).
pub fn topology() -> Vec<StreamSpec> {
    vec![
        StreamSpec::dimension("entities", "entities")
            .with_event_time_field("ts")
            .with_field(FieldSpec::new("name", FieldKind::String))
            .with_field(FieldSpec::new("hourly_rate", FieldKind::Int)),
        StreamSpec::fact("events", "events")
            .with_event_time_field("ts")
            .with_field(FieldSpec::new("action", FieldKind::String).required()),
        StreamSpec::dimension("metadata", "metadata")
            .with_event_time_field("ts")
            .with_fact_key_field("team_id")
            .with_field(FieldSpec::new("team", FieldKind::String))
            .optional(),
    ]
}

/// Pipeline configuration with short timers so tests settle quickly.
pub fn pipeline_config(allowed_lateness_ms: u64) -> PipelineConfig {
    PipelineConfig {
        pipeline_name: PIPELINE.to_string(),
        allowed_lateness_ms,
        batch_size: 10,
        batch_flush_interval_ms: 20,
        retry_backoff_ms: 5,
        max_retry_backoff_ms: 20,
        commit_interval_ms: 50,
        streams: topology(),
        ..PipelineConfig::default()
    }
}

pub fn with_late_policy(mut config: PipelineConfig, policy: LatePolicy) -> PipelineConfig {
    config.late_data_policy = policy;
    config
}

pub fn entity(key: i64, name: &str, hourly_rate: i64, ts: i64) -> serde_json::Value {
    serde_json::json!({
        "key": key,
        "name": name,
        "hourly_rate": hourly_rate,
        "ts": ts,
    })
}

pub fn event(key: i64, action: &str, ts: i64) -> serde_json::Value {
    serde_json::json!({
        "key": key,
        "action": action,
        "ts": ts,
    })
}

pub fn event_for_team(key: i64, action: &str, team_id: i64, ts: i64) -> serde_json::Value {
    serde_json::json!({
        "key": key,
        "action": action,
        "team_id": team_id,
        "ts": ts,
    })
}

pub fn team(key: i64, team: &str, ts: i64) -> serde_json::Value {
    serde_json::json!({
        "key": key,
        "team": team,
        "ts": ts,
    })
}
