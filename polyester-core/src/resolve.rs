//! Deterministic ordering and conflict resolution.
//!
//! `add`, `merge` and compaction all funnel through [`apply`], so LWW and FWW
//! mean the same thing on every path.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::model::{ConflictResolution, Entry};

/// An entry together with the writer whose log it came from.
#[derive(Debug, Clone)]
pub struct Write {
    pub writer: String,
    pub entry: Entry,
}

/// Orders writes by clock, then by writer public key.
pub fn compare_writes(a: &Write, b: &Write) -> Ordering {
    a.entry
        .clock
        .cmp(&b.entry.clock)
        .then_with(|| a.writer.cmp(&b.writer))
}

pub fn sort_writes(writes: &mut [Write]) {
    writes.sort_by(compare_writes);
}

/// Applies one write to a materialized map, assuming writes arrive in
/// ascending [`compare_writes`] order.
pub fn apply(index: &mut IndexMap<String, Entry>, entry: Entry, policy: ConflictResolution) {
    match policy {
        ConflictResolution::LastWriteWins => {
            index.insert(entry.id.clone(), entry);
        }
        ConflictResolution::FirstWriteWins => {
            index.entry(entry.id.clone()).or_insert(entry);
        }
    }
}

/// Materializes ordered entries into an id-keyed map.
pub fn resolve<I>(entries: I, policy: ConflictResolution) -> IndexMap<String, Entry>
where
    I: IntoIterator<Item = Entry>,
{
    let mut index = IndexMap::new();
    for entry in entries {
        apply(&mut index, entry, policy);
    }
    index
}

/// Keeps only the effective entry per id and returns them in clock order.
///
/// This is the compaction step for a single writer's log.
pub fn dedupe(mut entries: Vec<Entry>, policy: ConflictResolution) -> Vec<Entry> {
    entries.sort_by_key(|e| e.clock);
    let mut live: Vec<Entry> = resolve(entries, policy).into_values().collect();
    live.sort_by_key(|e| e.clock);
    live
}

/// Half-open clock window `[lower, upper)` of entries that may be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRange {
    pub lower: u64,
    pub upper: Option<u64>,
}

impl ClockRange {
    pub fn contains(&self, clock: u64) -> bool {
        clock >= self.lower && self.upper.is_none_or(|upper| clock < upper)
    }
}
