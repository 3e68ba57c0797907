//! Per-source offset ledger.
//!
//! Every offset read from a source is tracked until the record it carried is
//! fully handled. The committable offset of a source is the lowest offset
//! still in flight (or the next unread offset when nothing is in flight), so a
//! restart resumes at the first record whose effect might not be durable yet.

use engine_core::{SourceId, SourcePosition};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

#[derive(Debug, Default)]
struct SourceOffsets {
    in_flight: BTreeSet<i64>,
    /// One past the highest tracked offset.
    next: Option<i64>,
    committed: Option<i64>,
    halted: bool,
}

impl SourceOffsets {
    fn candidate(&self) -> Option<i64> {
        self.in_flight.first().copied().or(self.next)
    }
}

/// Tracks in-flight offsets and what may be committed for each source.
#[derive(Debug, Default)]
pub struct OffsetLedger {
    sources: Mutex<HashMap<SourceId, SourceOffsets>>,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source with the offset already committed for it, if any.
    pub fn register(&self, source: SourceId, committed: Option<i64>) {
        let mut sources = self.sources.lock();
        let entry = sources.entry(source).or_default();
        entry.committed = committed;
    }

    /// Marks an offset as read but not yet handled.
    pub fn track(&self, position: &SourcePosition) {
        let mut sources = self.sources.lock();
        let entry = sources.entry(position.source.clone()).or_default();
        entry.in_flight.insert(position.offset);
        let next = position.offset + 1;
        entry.next = Some(entry.next.map_or(next, |n| n.max(next)));
    }

    /// Marks an offset as fully handled.
    pub fn ack(&self, position: &SourcePosition) {
        let mut sources = self.sources.lock();
        if let Some(entry) = sources.get_mut(&position.source) {
            entry.in_flight.remove(&position.offset);
        }
    }

    /// Offsets that can be committed now: one per source whose candidate moved
    /// past its last commit. Halted sources are never returned.
    pub fn committable(&self) -> Vec<(SourceId, i64)> {
        let sources = self.sources.lock();
        let mut offsets: Vec<(SourceId, i64)> = sources
            .iter()
            .filter(|(_, s)| !s.halted)
            .filter_map(|(id, s)| {
                let candidate = s.candidate()?;
                match s.committed {
                    Some(committed) if candidate <= committed => None,
                    _ => Some((id.clone(), candidate)),
                }
            })
            .collect();
        offsets.sort();
        offsets
    }

    /// Records a successful commit.
    pub fn mark_committed(&self, offsets: &[(SourceId, i64)]) {
        let mut sources = self.sources.lock();
        for (id, offset) in offsets {
            if let Some(entry) = sources.get_mut(id) {
                entry.committed = Some(entry.committed.map_or(*offset, |c| c.max(*offset)));
            }
        }
    }

    /// Stops commits for the given sources for the rest of this run.
    pub fn halt<'a>(&self, ids: impl IntoIterator<Item = &'a SourceId>) {
        let mut sources = self.sources.lock();
        for id in ids {
            let entry = sources.entry(id.clone()).or_default();
            if !entry.halted {
                warn!(stream = %id.stream, partition = id.partition, "Offset commits halted");
            }
            entry.halted = true;
        }
    }

    pub fn committed(&self, source: &SourceId) -> Option<i64> {
        self.sources.lock().get(source).and_then(|s| s.committed)
    }

    pub fn in_flight(&self, source: &SourceId) -> usize {
        self.sources
            .lock()
            .get(source)
            .map_or(0, |s| s.in_flight.len())
    }

    pub fn is_halted(&self, source: &SourceId) -> bool {
        self.sources.lock().get(source).is_some_and(|s| s.halted)
    }
}
