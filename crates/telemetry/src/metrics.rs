//! Internal metrics collection.
//!
//! Counters, gauges and latency histograms kept in memory and exposed as a
//! serialisable snapshot on the operations endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the enrichment engine.
#[derive(Debug, Default)]
pub struct Metrics {
    // Source metrics
    pub records_consumed: Counter,
    pub malformed_records: Counter,
    pub source_errors: Counter,

    // State store metrics
    pub dimension_updates: Counter,
    pub stale_dimension_updates: Counter,
    pub state_evictions: Counter,

    // Join metrics
    pub facts_received: Counter,
    pub facts_enriched: Counter,
    pub facts_partial: Counter,
    pub facts_buffered: Counter,
    pub late_records_dropped: Counter,
    pub late_records_flagged: Counter,
    pub late_records_side_output: Counter,
    pub idle_stream_transitions: Counter,

    // Sink metrics
    pub sink_documents_written: Counter,
    pub sink_batches_flushed: Counter,
    pub sink_retries: Counter,
    pub sink_failures: Counter,

    // Checkpoint metrics
    pub offsets_committed: Counter,
    pub checkpoint_errors: Counter,

    // Latency histograms
    pub fetch_latency_ms: Histogram,
    pub sink_latency_ms: Histogram,
    pub pending_wait_ms: Histogram,

    // Gauges
    pub pending_facts: Gauge,
    pub resident_keys: Gauge,
    pub queue_depth: Gauge,
    pub combined_watermark_ms: Gauge,
    pub idle_streams: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub records_consumed: u64,
    pub malformed_records: u64,
    pub source_errors: u64,
    pub dimension_updates: u64,
    pub stale_dimension_updates: u64,
    pub state_evictions: u64,
    pub facts_received: u64,
    pub facts_enriched: u64,
    pub facts_partial: u64,
    pub facts_buffered: u64,
    pub late_records_dropped: u64,
    pub late_records_flagged: u64,
    pub late_records_side_output: u64,
    pub sink_documents_written: u64,
    pub sink_batches_flushed: u64,
    pub sink_retries: u64,
    pub sink_failures: u64,
    pub offsets_committed: u64,
    pub checkpoint_errors: u64,
    pub fetch_latency_mean_ms: f64,
    pub sink_latency_mean_ms: f64,
    pub pending_wait_mean_ms: f64,
    pub pending_facts: u64,
    pub resident_keys: u64,
    pub queue_depth: u64,
    pub combined_watermark_ms: u64,
    pub idle_streams: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            records_consumed: self.records_consumed.get(),
            malformed_records: self.malformed_records.get(),
            source_errors: self.source_errors.get(),
            dimension_updates: self.dimension_updates.get(),
            stale_dimension_updates: self.stale_dimension_updates.get(),
            state_evictions: self.state_evictions.get(),
            facts_received: self.facts_received.get(),
            facts_enriched: self.facts_enriched.get(),
            facts_partial: self.facts_partial.get(),
            facts_buffered: self.facts_buffered.get(),
            late_records_dropped: self.late_records_dropped.get(),
            late_records_flagged: self.late_records_flagged.get(),
            late_records_side_output: self.late_records_side_output.get(),
            sink_documents_written: self.sink_documents_written.get(),
            sink_batches_flushed: self.sink_batches_flushed.get(),
            sink_retries: self.sink_retries.get(),
            sink_failures: self.sink_failures.get(),
            offsets_committed: self.offsets_committed.get(),
            checkpoint_errors: self.checkpoint_errors.get(),
            fetch_latency_mean_ms: self.fetch_latency_ms.mean(),
            sink_latency_mean_ms: self.sink_latency_ms.mean(),
            pending_wait_mean_ms: self.pending_wait_ms.mean(),
            pending_facts: self.pending_facts.get(),
            resident_keys: self.resident_keys.get(),
            queue_depth: self.queue_depth.get(),
            combined_watermark_ms: self.combined_watermark_ms.get(),
            idle_streams: self.idle_streams.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
