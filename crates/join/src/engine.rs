//! Multi-way enrichment join.
//!
//! Facts are joined with the latest dimension state for their foreign keys.
//! A fact whose required dimensions are not all known yet is buffered in a
//! per-key queue and released when the missing state arrives, when it expires,
//! or when a key it waits on is evicted from the state store. Facts for the
//! same key are always emitted in arrival order.

use engine_core::{
    DimensionRecord, DimensionSlot, DocumentIdentity, EnrichedRecord, EnrichmentStatus, EntityKey,
    Envelope, Error, EventTime, FactRecord, LatePolicy, LateRecord, PipelineConfig, Result,
    SourcePosition, SourceRecord, StreamId,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tracing::{debug, warn};

use crate::state::KeyedStateStore;
use crate::watermark::WatermarkTracker;

/// A dimension stream as seen by the join.
#[derive(Debug, Clone)]
pub struct DimensionBinding {
    pub stream: StreamId,
    pub required: bool,
    pub declared_fields: Vec<String>,
}

/// Join engine settings derived from the pipeline configuration.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub fact_stream: StreamId,
    /// Field name the fact key is emitted under.
    pub key_field: String,
    pub dimensions: Vec<DimensionBinding>,
    pub allowed_lateness: Duration,
    pub idle_timeout: Duration,
    pub late_policy: LatePolicy,
    pub document_id: DocumentIdentity,
}

impl JoinConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Result<Self> {
        let fact = config
            .fact_stream()
            .ok_or_else(|| Error::config("topology has no fact stream"))?;

        Ok(Self {
            fact_stream: fact.id.clone(),
            key_field: fact.key_field.clone(),
            dimensions: config
                .dimension_streams()
                .map(|s| DimensionBinding {
                    stream: s.id.clone(),
                    required: s.required,
                    declared_fields: s.declared_field_names(),
                })
                .collect(),
            allowed_lateness: config.allowed_lateness(),
            idle_timeout: config.idle_stream_timeout(),
            late_policy: config.late_data_policy,
            document_id: config.document_id,
        })
    }

    /// Dimension streams in topology order.
    pub fn dimension_streams(&self) -> Vec<StreamId> {
        self.dimensions.iter().map(|d| d.stream.clone()).collect()
    }

    /// Required dimension streams.
    pub fn required_streams(&self) -> Vec<StreamId> {
        self.dimensions
            .iter()
            .filter(|d| d.required)
            .map(|d| d.stream.clone())
            .collect()
    }

    fn lateness_ms(&self) -> i64 {
        i64::try_from(self.allowed_lateness.as_millis()).unwrap_or(i64::MAX)
    }
}

/// What the engine produced for the records it was given.
#[derive(Debug, Clone)]
pub enum JoinOutput {
    /// An enriched (or partially enriched) fact ready for the sink.
    Emit(EnrichedRecord),
    /// A late fact routed to the side output.
    Late(LateRecord),
    /// A late fact skipped under the drop policy.
    Dropped(SourcePosition),
    /// A dimension record that has been applied (or was stale).
    Applied(SourcePosition),
}

struct PendingFact {
    fact: FactRecord,
    origin: SourcePosition,
    late: bool,
    buffered_at: Instant,
    deadline: EventTime,
}

#[derive(Default)]
struct PendingQueue {
    facts: VecDeque<PendingFact>,
    /// `(stream, dimension key)` pairs this queue is registered under.
    awaiting: HashSet<(StreamId, EntityKey)>,
    /// Deadline and buffering instant of the front fact as indexed.
    indexed: Option<(EventTime, Instant)>,
}

fn unindex<T: Ord>(index: &mut BTreeMap<T, HashSet<EntityKey>>, at: T, key: &EntityKey) {
    if let Some(keys) = index.get_mut(&at) {
        keys.remove(key);
        if keys.is_empty() {
            index.remove(&at);
        }
    }
}

/// Dimension slots for a fact plus the required `(stream, key)` pairs still missing.
fn resolve(
    store: &KeyedStateStore,
    dimensions: &[DimensionBinding],
    fact: &FactRecord,
) -> (Vec<(StreamId, DimensionSlot)>, Vec<(StreamId, EntityKey)>) {
    let mut slots = Vec::with_capacity(dimensions.len());
    let mut missing = Vec::new();

    for dim in dimensions {
        let payload = match fact.foreign_keys.get(&dim.stream) {
            Some(fk) => {
                let found = store.lookup(&dim.stream, fk).map(|v| v.payload);
                if found.is_none() && dim.required {
                    missing.push((dim.stream.clone(), fk.clone()));
                }
                found
            }
            // No reference on the fact: this can never resolve, so it never blocks.
            None => None,
        };

        slots.push((
            dim.stream.clone(),
            DimensionSlot {
                declared_fields: dim.declared_fields.clone(),
                payload,
            },
        ));
    }

    (slots, missing)
}

/// Stateful join between the fact stream and the dimension streams.
pub struct JoinEngine {
    config: JoinConfig,
    store: Arc<KeyedStateStore>,
    watermarks: WatermarkTracker,
    pending: HashMap<EntityKey, PendingQueue>,
    /// Fact keys waiting on a dimension `(stream, key)`.
    waiting: HashMap<(StreamId, EntityKey), HashSet<EntityKey>>,
    /// Queue fronts by event-time deadline.
    deadlines: BTreeMap<EventTime, HashSet<EntityKey>>,
    /// Queue fronts by the instant they were buffered.
    arrivals: BTreeMap<Instant, HashSet<EntityKey>>,
    pending_count: usize,
}

impl JoinEngine {
    pub fn new(config: JoinConfig, store: Arc<KeyedStateStore>, now: Instant) -> Self {
        let mut watermarks = WatermarkTracker::new(config.allowed_lateness, config.idle_timeout);
        watermarks.register(config.fact_stream.clone(), now);
        for dim in &config.dimensions {
            watermarks.register(dim.stream.clone(), now);
        }

        Self {
            config,
            store,
            watermarks,
            pending: HashMap::new(),
            waiting: HashMap::new(),
            deadlines: BTreeMap::new(),
            arrivals: BTreeMap::new(),
            pending_count: 0,
        }
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KeyedStateStore> {
        &self.store
    }

    pub fn watermarks(&self) -> &WatermarkTracker {
        &self.watermarks
    }

    /// Number of buffered facts.
    pub fn pending_len(&self) -> usize {
        self.pending_count
    }

    /// Source positions of every buffered fact.
    pub fn pending_positions(&self) -> Vec<SourcePosition> {
        self.pending
            .values()
            .flat_map(|q| q.facts.iter().map(|p| p.origin.clone()))
            .collect()
    }

    /// Routes a decoded record to the fact or dimension path.
    pub fn process(&mut self, envelope: Envelope, now: Instant) -> Vec<JoinOutput> {
        let before = self.watermarks.combined();
        let mut out = match envelope.record {
            SourceRecord::Fact(fact) => self.on_fact(fact, envelope.position, now),
            SourceRecord::Dimension(dim) => self.on_dimension(dim, envelope.position, now),
        };

        if self.pending_count > 0 && self.watermarks.combined() > before {
            self.expire_into(now, &mut out);
        }
        self.publish_gauges();
        out
    }

    /// Applies a dimension record and releases facts it unblocks.
    pub fn on_dimension(
        &mut self,
        record: DimensionRecord,
        origin: SourcePosition,
        now: Instant,
    ) -> Vec<JoinOutput> {
        let stream = origin.source.stream.clone();
        let mut out = Vec::new();
        metrics().dimension_updates.inc();
        self.watermarks.advance(&stream, record.event_time, now);

        let key = record.key.clone();
        match self
            .store
            .put(&stream, record.key, record.payload, record.event_time)
        {
            Ok(receipt) => {
                for evicted in receipt.evicted {
                    metrics().state_evictions.inc();
                    self.flush_evicted(&evicted, now, &mut out);
                }

                if let Some(fact_keys) = self.waiting.remove(&(stream, key)) {
                    for fact_key in fact_keys {
                        self.drain(&fact_key, now, &mut out);
                    }
                }
            }
            Err(stale) => {
                metrics().stale_dimension_updates.inc();
                debug!(
                    stream = %stale.stream,
                    key = %stale.key,
                    incoming = stale.incoming.as_millis(),
                    current = stale.current.as_millis(),
                    "Ignoring stale dimension update"
                );
            }
        }

        out.push(JoinOutput::Applied(origin));
        out
    }

    /// Joins a fact, buffering it when required dimension state is missing.
    pub fn on_fact(
        &mut self,
        fact: FactRecord,
        origin: SourcePosition,
        now: Instant,
    ) -> Vec<JoinOutput> {
        metrics().facts_received.inc();
        let stream = origin.source.stream.clone();

        let mut late = false;
        if let Some(watermark) = self
            .watermarks
            .watermark(&stream)
            .filter(|wm| fact.event_time < *wm)
        {
            match self.config.late_policy {
                LatePolicy::Drop => {
                    metrics().late_records_dropped.inc();
                    debug!(
                        stream = %stream,
                        offset = origin.offset,
                        event_time = fact.event_time.as_millis(),
                        watermark = watermark.as_millis(),
                        "Dropping late fact"
                    );
                    return vec![JoinOutput::Dropped(origin)];
                }
                LatePolicy::SideOutput => {
                    metrics().late_records_side_output.inc();
                    return vec![JoinOutput::Late(LateRecord {
                        fact,
                        position: origin,
                        watermark,
                    })];
                }
                LatePolicy::EmitWithFlag => {
                    metrics().late_records_flagged.inc();
                    late = true;
                }
            }
        }

        self.watermarks.advance(&stream, fact.event_time, now);

        let key = fact.key.clone();
        let pending = PendingFact {
            deadline: fact
                .event_time
                .saturating_add_millis(self.config.lateness_ms()),
            fact,
            origin,
            late,
            buffered_at: now,
        };

        let mut out = Vec::new();
        let queued = self.pending.get(&key).is_some_and(|q| !q.facts.is_empty());
        if queued {
            self.enqueue(pending);
            self.drain(&key, now, &mut out);
            return out;
        }

        let (slots, missing) = resolve(&self.store, &self.config.dimensions, &pending.fact);
        if missing.is_empty() {
            out.push(JoinOutput::Emit(self.build(
                pending,
                slots,
                EnrichmentStatus::Enriched,
                now,
            )));
        } else {
            self.enqueue(pending);
            self.drain(&key, now, &mut out);
        }
        out
    }

    /// Advances idle detection and releases expired facts.
    pub fn expire(&mut self, now: Instant) -> Vec<JoinOutput> {
        self.watermarks.refresh(now);
        let mut out = Vec::new();
        self.expire_into(now, &mut out);
        self.publish_gauges();
        out
    }

    fn expire_into(&mut self, now: Instant, out: &mut Vec<JoinOutput>) {
        for key in self.due_keys(now) {
            self.drain(&key, now, out);
        }
    }

    /// Keys whose front fact has passed its event-time deadline or has been
    /// buffered for the allowed lateness, oldest first.
    fn due_keys(&self, now: Instant) -> Vec<EntityKey> {
        let mut seen = HashSet::new();
        let mut due = Vec::new();

        if let Some(wm) = self.watermarks.combined() {
            for keys in self.deadlines.range(..=wm).map(|(_, keys)| keys) {
                due.extend(keys.iter().filter(|k| seen.insert(*k)).cloned());
            }
        }
        if let Some(cutoff) = now.checked_sub(self.config.allowed_lateness) {
            for keys in self.arrivals.range(..=cutoff).map(|(_, keys)| keys) {
                due.extend(keys.iter().filter(|k| seen.insert(*k)).cloned());
            }
        }
        due
    }

    fn enqueue(&mut self, pending: PendingFact) {
        metrics().facts_buffered.inc();
        self.pending_count += 1;
        let key = pending.fact.key.clone();
        self.pending
            .entry(key.clone())
            .or_default()
            .facts
            .push_back(pending);
        self.index_front(&key);
    }

    /// Keeps the deadline and arrival indexes in line with the queue front.
    fn index_front(&mut self, key: &EntityKey) {
        let Some(queue) = self.pending.get_mut(key) else {
            return;
        };
        let front = queue.facts.front().map(|p| (p.deadline, p.buffered_at));
        if queue.indexed == front {
            return;
        }

        if let Some((deadline, at)) = queue.indexed.take() {
            unindex(&mut self.deadlines, deadline, key);
            unindex(&mut self.arrivals, at, key);
        }
        if let Some((deadline, at)) = front {
            self.deadlines.entry(deadline).or_default().insert(key.clone());
            self.arrivals.entry(at).or_default().insert(key.clone());
        }
        queue.indexed = front;
    }

    fn is_expired(&self, pending: &PendingFact, now: Instant) -> bool {
        self.watermarks
            .combined()
            .is_some_and(|wm| wm >= pending.deadline)
            || now.saturating_duration_since(pending.buffered_at) >= self.config.allowed_lateness
    }

    /// Emits queued facts for `key` front to back while the front is
    /// resolvable or expired, then registers what the new front waits on.
    fn drain(&mut self, key: &EntityKey, now: Instant, out: &mut Vec<JoinOutput>) {
        loop {
            let Some(front) = self.pending.get(key).and_then(|q| q.facts.front()) else {
                break;
            };

            let (slots, missing) = resolve(&self.store, &self.config.dimensions, &front.fact);
            let status = if missing.is_empty() {
                EnrichmentStatus::Enriched
            } else if self.is_expired(front, now) {
                EnrichmentStatus::Partial
            } else {
                let Some(queue) = self.pending.get_mut(key) else {
                    break;
                };
                for pair in missing {
                    self.waiting
                        .entry(pair.clone())
                        .or_default()
                        .insert(key.clone());
                    queue.awaiting.insert(pair);
                }
                self.index_front(key);
                return;
            };

            let Some(pending) = self.pending.get_mut(key).and_then(|q| q.facts.pop_front()) else {
                break;
            };
            self.pending_count -= 1;
            out.push(JoinOutput::Emit(self.build(pending, slots, status, now)));
        }

        self.release(key);
    }

    /// Drops the queue for `key` and its registrations.
    fn release(&mut self, key: &EntityKey) {
        let Some(queue) = self.pending.remove(key) else {
            return;
        };
        if let Some((deadline, at)) = queue.indexed {
            unindex(&mut self.deadlines, deadline, key);
            unindex(&mut self.arrivals, at, key);
        }
        for pair in queue.awaiting {
            if let Some(keys) = self.waiting.get_mut(&pair) {
                keys.remove(key);
                if keys.is_empty() {
                    self.waiting.remove(&pair);
                }
            }
        }
    }

    /// Emits every queue waiting on an evicted dimension key as partial.
    fn flush_evicted(&mut self, evicted: &EntityKey, now: Instant, out: &mut Vec<JoinOutput>) {
        let mut affected: Vec<EntityKey> = Vec::new();
        for dim in &self.config.dimensions {
            if let Some(keys) = self.waiting.get(&(dim.stream.clone(), evicted.clone())) {
                affected.extend(keys.iter().cloned());
            }
        }
        if affected.is_empty() {
            return;
        }

        warn!(
            key = %evicted,
            pending_keys = affected.len(),
            "Evicted dimension key had pending facts, emitting partial"
        );

        for fact_key in affected {
            let facts = match self.pending.get_mut(&fact_key) {
                Some(queue) => std::mem::take(&mut queue.facts),
                None => continue,
            };
            for pending in facts {
                self.pending_count -= 1;
                let (slots, _) = resolve(&self.store, &self.config.dimensions, &pending.fact);
                out.push(JoinOutput::Emit(self.build(
                    pending,
                    slots,
                    EnrichmentStatus::Partial,
                    now,
                )));
            }
            self.release(&fact_key);
        }
    }

    fn build(
        &self,
        pending: PendingFact,
        dimensions: Vec<(StreamId, DimensionSlot)>,
        status: EnrichmentStatus,
        now: Instant,
    ) -> EnrichedRecord {
        match status {
            EnrichmentStatus::Enriched => metrics().facts_enriched.inc(),
            EnrichmentStatus::Partial => metrics().facts_partial.inc(),
        }
        metrics()
            .pending_wait_ms
            .observe(now.saturating_duration_since(pending.buffered_at).as_millis() as u64);

        let primary_key = match self.config.document_id {
            DocumentIdentity::Key => pending.fact.key.to_string(),
            DocumentIdentity::Origin => format!(
                "{}-{}-{}",
                pending.origin.source.stream, pending.origin.source.partition, pending.origin.offset
            ),
        };

        EnrichedRecord {
            primary_key,
            key_field: self.config.key_field.clone(),
            key: pending.fact.key,
            fact: pending.fact.payload,
            dimensions,
            ts: pending.fact.event_time,
            status,
            late: pending.late,
            origin: pending.origin,
        }
    }

    fn publish_gauges(&self) {
        let m = metrics();
        m.pending_facts.set(self.pending_count as u64);
        m.resident_keys.set(self.store.len() as u64);
        m.idle_streams
            .set(self.watermarks.idle_streams().len() as u64);
        if let Some(wm) = self.watermarks.combined() {
            m.combined_watermark_ms.set(wm.as_millis().max(0) as u64);
        }
    }
}
