//! Per-stream watermark tracking.
//!
//! Each stream's watermark is its maximum observed event time minus the allowed
//! lateness and never recedes. The combined watermark is the minimum across
//! active streams. Streams that stay silent past the idle timeout are excluded
//! from the minimum until they produce again, so a stalled stream cannot hold
//! pending facts forever.

use engine_core::{EventTime, StreamId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tracing::{info, warn};

struct StreamWatermark {
    max_seen: Option<EventTime>,
    watermark: Option<EventTime>,
    last_activity: Instant,
    idle: bool,
}

impl StreamWatermark {
    fn new(now: Instant) -> Self {
        Self {
            max_seen: None,
            watermark: None,
            last_activity: now,
            idle: false,
        }
    }
}

/// Tracks watermarks for every stream in the topology.
pub struct WatermarkTracker {
    streams: BTreeMap<StreamId, StreamWatermark>,
    allowed_lateness_ms: i64,
    idle_timeout: Duration,
    combined: Option<EventTime>,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness: Duration, idle_timeout: Duration) -> Self {
        Self {
            streams: BTreeMap::new(),
            allowed_lateness_ms: i64::try_from(allowed_lateness.as_millis()).unwrap_or(i64::MAX),
            idle_timeout,
            combined: None,
        }
    }

    /// Registers a stream. Its idle clock starts at `now`.
    pub fn register(&mut self, stream: StreamId, now: Instant) {
        self.streams
            .entry(stream)
            .or_insert_with(|| StreamWatermark::new(now));
    }

    /// Observes an event time on `stream`. Returns `true` when the stream's
    /// watermark moved forward.
    pub fn advance(&mut self, stream: &StreamId, event_time: EventTime, now: Instant) -> bool {
        let lateness = self.allowed_lateness_ms;
        let sw = self
            .streams
            .entry(stream.clone())
            .or_insert_with(|| StreamWatermark::new(now));

        sw.last_activity = now;
        if sw.idle {
            sw.idle = false;
            info!(stream = %stream, "Stream resumed, rejoining combined watermark");
        }

        let mut advanced = false;
        if sw.max_seen.map_or(true, |max| event_time > max) {
            sw.max_seen = Some(event_time);
            let candidate = event_time.saturating_sub_millis(lateness);
            if sw.watermark.map_or(true, |wm| candidate > wm) {
                sw.watermark = Some(candidate);
                advanced = true;
            }
        }

        self.recompute();
        advanced
    }

    pub fn watermark(&self, stream: &StreamId) -> Option<EventTime> {
        self.streams.get(stream).and_then(|sw| sw.watermark)
    }

    /// `true` when `event_time` falls behind the stream's watermark.
    pub fn is_late(&self, stream: &StreamId, event_time: EventTime) -> bool {
        matches!(self.watermark(stream), Some(wm) if event_time < wm)
    }

    /// Minimum watermark over active streams; `None` until every active stream
    /// has observed at least one record.
    pub fn combined(&self) -> Option<EventTime> {
        self.combined
    }

    /// Marks streams silent for longer than the idle timeout as idle and
    /// returns the ones that just transitioned.
    pub fn refresh(&mut self, now: Instant) -> Vec<StreamId> {
        let mut newly_idle = Vec::new();
        for (id, sw) in self.streams.iter_mut() {
            if !sw.idle && now.saturating_duration_since(sw.last_activity) >= self.idle_timeout {
                sw.idle = true;
                warn!(
                    stream = %id,
                    idle_for_ms = now.saturating_duration_since(sw.last_activity).as_millis() as u64,
                    "Stream idle, excluded from combined watermark"
                );
                metrics().idle_stream_transitions.inc();
                newly_idle.push(id.clone());
            }
        }

        if !newly_idle.is_empty() {
            self.recompute();
        }
        newly_idle
    }

    pub fn idle_streams(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, sw)| sw.idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_idle(&self, stream: &StreamId) -> bool {
        self.streams.get(stream).is_some_and(|sw| sw.idle)
    }

    fn recompute(&mut self) {
        let mut min: Option<EventTime> = None;
        for sw in self.streams.values().filter(|sw| !sw.idle) {
            match sw.watermark {
                // An active stream without a watermark holds the minimum back.
                None => return,
                Some(wm) => min = Some(min.map_or(wm, |m| m.min(wm))),
            }
        }

        if let Some(candidate) = min {
            if self.combined.map_or(true, |current| candidate > current) {
                self.combined = Some(candidate);
            }
        }
    }
}
