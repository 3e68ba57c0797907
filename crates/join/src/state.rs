//! Sharded keyed state store holding the latest dimension payload per stream
//! and key.
//!
//! Keys are routed to a shard by hash, so every update for a key goes through
//! the same shard lock and is applied in arrival order. The resident-key limit
//! is global: once it is reached, a new key evicts the least recently updated
//! key of the shard it lands in, or of the next non-empty shard when its own
//! shard is empty. Only one shard lock is held at a time.

use engine_core::{EntityKey, EventTime, Payload, StreamId};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Computes the shard for a key.
pub fn shard_for(key: &EntityKey, num_shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_shards.max(1) as u64) as usize
}

/// A dimension payload with the event time it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedPayload {
    pub payload: Payload,
    pub event_time: EventTime,
}

/// All dimension state known for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub key: EntityKey,
    pub payloads: BTreeMap<StreamId, VersionedPayload>,
    pub last_updated: EventTime,
}

/// Merged view of a key across dimension streams.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub key: EntityKey,
    pub payloads: BTreeMap<StreamId, Payload>,
    pub last_updated: EventTime,
    /// Required streams with no state for this key yet.
    pub missing: Vec<StreamId>,
    /// Streams in `payloads`, in merge precedence order.
    pub order: Vec<StreamId>,
}

impl Composite {
    pub fn is_resolved(&self) -> bool {
        self.missing.is_empty()
    }

    /// Flattens the per-stream payloads. On name collisions the stream earlier
    /// in `order` wins, matching how enriched documents are built.
    pub fn merged(&self) -> Payload {
        let mut merged = Payload::new();
        for payload in self.order.iter().filter_map(|s| self.payloads.get(s)) {
            for (name, value) in payload {
                merged.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        merged
    }
}

/// Returned when an update is older than the stored state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stale update for key {key} on stream {stream}: {incoming} is older than {current}")]
pub struct StaleUpdate {
    pub stream: StreamId,
    pub key: EntityKey,
    pub incoming: EventTime,
    pub current: EventTime,
}

/// Result of an applied update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutReceipt {
    /// The key had no state before this update.
    pub created: bool,
    /// Keys evicted to stay within capacity.
    pub evicted: Vec<EntityKey>,
}

struct Resident {
    entry: StateEntry,
    touched: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<EntityKey, Resident>,
    /// Update tick to key, oldest first.
    recency: BTreeMap<u64, EntityKey>,
    clock: u64,
}

/// Bounded, sharded latest-value store for dimension records.
pub struct KeyedStateStore {
    shards: Vec<RwLock<Shard>>,
    max_resident_keys: usize,
    required: Vec<StreamId>,
    /// Merge precedence for composites; streams not listed follow in id order.
    merge_order: Vec<StreamId>,
    resident: AtomicUsize,
    evictions: AtomicU64,
}

impl KeyedStateStore {
    /// Creates a store holding at most `max_resident_keys` keys across all
    /// shards. `required` lists the streams a composite needs to be resolved.
    pub fn new(num_shards: usize, max_resident_keys: usize, required: Vec<StreamId>) -> Self {
        let num_shards = num_shards.max(1);

        Self {
            shards: (0..num_shards).map(|_| RwLock::new(Shard::default())).collect(),
            max_resident_keys: max_resident_keys.max(1),
            merge_order: required.clone(),
            required,
            resident: AtomicUsize::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Sets the stream precedence used by [`Composite::merged`], normally the
    /// topology order of the dimension streams.
    pub fn with_merge_order(mut self, order: Vec<StreamId>) -> Self {
        self.merge_order = order;
        self
    }

    fn shard(&self, key: &EntityKey) -> &RwLock<Shard> {
        &self.shards[shard_for(key, self.shards.len())]
    }

    /// Takes one slot back from the resident count if it is over the limit.
    fn take_excess(&self) -> bool {
        self.resident
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > self.max_resident_keys).then(|| n - 1)
            })
            .is_ok()
    }

    /// Evicts from the shards after `from` until the store is back within
    /// its limit.
    fn reclaim(&self, from: usize, evicted: &mut Vec<EntityKey>) {
        let n = self.shards.len();
        for step in 1..n {
            if self.resident.load(Ordering::Acquire) <= self.max_resident_keys {
                return;
            }
            let mut shard = self.shards[(from + step) % n].write();
            while self.take_excess() {
                let Some((_, oldest)) = shard.recency.pop_first() else {
                    self.resident.fetch_add(1, Ordering::AcqRel);
                    break;
                };
                shard.entries.remove(&oldest);
                evicted.push(oldest);
            }
        }
    }

    /// Inserts or updates the payload for `key` under `stream`.
    ///
    /// Updates with an event time equal to or later than the stored one win;
    /// older updates are rejected with [`StaleUpdate`] and leave state untouched.
    pub fn put(
        &self,
        stream: &StreamId,
        key: EntityKey,
        payload: Payload,
        event_time: EventTime,
    ) -> Result<PutReceipt, StaleUpdate> {
        let index = shard_for(&key, self.shards.len());
        let mut guard = self.shards[index].write();
        let shard = &mut *guard;
        shard.clock += 1;
        let tick = shard.clock;
        let value = VersionedPayload {
            payload,
            event_time,
        };

        if let Some(resident) = shard.entries.get_mut(&key) {
            if let Some(current) = resident.entry.payloads.get(stream) {
                if event_time < current.event_time {
                    return Err(StaleUpdate {
                        stream: stream.clone(),
                        key,
                        incoming: event_time,
                        current: current.event_time,
                    });
                }
            }

            resident.entry.payloads.insert(stream.clone(), value);
            resident.entry.last_updated = resident.entry.last_updated.max(event_time);
            shard.recency.remove(&resident.touched);
            resident.touched = tick;
            shard.recency.insert(tick, key);

            return Ok(PutReceipt::default());
        }

        let mut evicted = Vec::new();
        if self.resident.load(Ordering::Acquire) >= self.max_resident_keys {
            if let Some((_, oldest)) = shard.recency.pop_first() {
                shard.entries.remove(&oldest);
                evicted.push(oldest);
            }
        }

        let mut payloads = BTreeMap::new();
        payloads.insert(stream.clone(), value);
        shard.entries.insert(
            key.clone(),
            Resident {
                entry: StateEntry {
                    key: key.clone(),
                    payloads,
                    last_updated: event_time,
                },
                touched: tick,
            },
        );
        shard.recency.insert(tick, key);
        if evicted.is_empty() {
            self.resident.fetch_add(1, Ordering::AcqRel);
        }
        drop(guard);

        // Nothing to give up in this shard: make room elsewhere.
        if evicted.is_empty() {
            self.reclaim(index, &mut evicted);
        }
        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }

        Ok(PutReceipt {
            created: true,
            evicted,
        })
    }

    /// Best-known merge of all dimension state for `key`.
    pub fn get(&self, key: &EntityKey) -> Option<Composite> {
        let shard = self.shard(key).read();
        let resident = shard.entries.get(key)?;

        let payloads: BTreeMap<StreamId, Payload> = resident
            .entry
            .payloads
            .iter()
            .map(|(stream, v)| (stream.clone(), v.payload.clone()))
            .collect();
        let missing = self
            .required
            .iter()
            .filter(|s| !payloads.contains_key(*s))
            .cloned()
            .collect();
        let mut order: Vec<StreamId> = self
            .merge_order
            .iter()
            .filter(|s| payloads.contains_key(*s))
            .cloned()
            .collect();
        order.extend(
            payloads
                .keys()
                .filter(|s| !self.merge_order.contains(s))
                .cloned(),
        );

        Some(Composite {
            key: key.clone(),
            payloads,
            last_updated: resident.entry.last_updated,
            missing,
            order,
        })
    }

    /// State for a single stream.
    pub fn lookup(&self, stream: &StreamId, key: &EntityKey) -> Option<VersionedPayload> {
        let shard = self.shard(key).read();
        shard
            .entries
            .get(key)
            .and_then(|r| r.entry.payloads.get(stream))
            .cloned()
    }

    /// Full entry for a key.
    pub fn entry(&self, key: &EntityKey) -> Option<StateEntry> {
        self.shard(key)
            .read()
            .entries
            .get(key)
            .map(|r| r.entry.clone())
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.shard(key).read().entries.contains_key(key)
    }

    /// Number of resident keys.
    pub fn len(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Maximum number of resident keys.
    pub fn capacity(&self) -> usize {
        self.max_resident_keys
    }
}
