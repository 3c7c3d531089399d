//! Shared accumulators used to merge a row's cells, or a row's
//! closest-before candidacy, across several layers (MemTable current,
//! MemTable snapshot, and any number of StoreFiles) that are each
//! processed in newest-first order.

use std::collections::HashMap;

use crate::key::{Column, Key, Row, Timestamp, LATEST};
use crate::value::Value;

/// Resolves, for a single row, the first (= newest) visible value of each
/// column across layers fed in newest-to-oldest order. Mirrors
/// `MemTable::getFull`'s `deletes`/`out` bookkeeping so the same logic
/// backs the engine's `get_full` and the merge scanner.
#[derive(Default)]
pub struct RowAccumulator {
    deletes: HashMap<Column, Timestamp>,
    pub out: std::collections::BTreeMap<Column, Value>,
    pub max_timestamp: Timestamp,
}

impl RowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one layer's entries for the target row, in ascending key
    /// order (ascending column, descending timestamp) as produced by a
    /// natural forward scan. Only the first entry encountered per column
    /// with `timestamp <= origin_timestamp` is significant for that
    /// layer; everything after it for the same column is an older,
    /// already-superseded version within this same layer.
    pub fn observe_layer(
        &mut self,
        origin_timestamp: Timestamp,
        entries: impl IntoIterator<Item = (Key, Value)>,
    ) {
        let mut last_column: Option<Column> = None;
        for (key, value) in entries {
            if key.timestamp > origin_timestamp {
                continue;
            }
            if last_column.as_deref() == Some(key.column.as_slice()) {
                continue;
            }
            last_column = Some(key.column.clone());

            if key.timestamp != LATEST && key.timestamp > self.max_timestamp {
                self.max_timestamp = key.timestamp;
            }

            if self.out.contains_key(&key.column) {
                continue; // already resolved by a newer layer
            }

            if value.is_tombstone() {
                let slot = self.deletes.entry(key.column.clone()).or_insert(0);
                if key.timestamp > *slot {
                    *slot = key.timestamp;
                }
                continue;
            }

            if let Some(&deleted_at) = self.deletes.get(&key.column) {
                if deleted_at >= key.timestamp {
                    continue; // shadowed by a tombstone already seen in a newer layer
                }
            }

            self.out.insert(key.column.clone(), value);
        }
    }
}

/// Accumulates the candidate set for `get_row_key_at_or_before`, shared
/// across every layer that contributes to a single lookup.
#[derive(Default)]
pub struct RowBeforeCandidates {
    candidates: std::collections::BTreeMap<(Row, Column), Timestamp>,
    /// Highest tombstone timestamp seen per stripped key, kept
    /// independently of `candidates` so a tombstone encountered before its
    /// shadowed put (entries are visited newest-timestamp-first within a
    /// column) still shadows that put when it arrives.
    deletes: std::collections::HashMap<(Row, Column), Timestamp>,
}

impl RowBeforeCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one entry's add/remove effect on the candidate set: a
    /// non-tombstone is recorded (keeping the newest timestamp seen for
    /// that stripped key) unless a tombstone at an equal-or-greater
    /// timestamp has already been observed for it; a tombstone evicts a
    /// same-key candidate whose timestamp it shadows and records itself so
    /// a not-yet-seen older put is shadowed too.
    pub fn observe(&mut self, key: &Key, value: &Value) {
        let stripped = key.strip_timestamp();
        if value.is_tombstone() {
            if let Some(&ts) = self.candidates.get(&stripped) {
                if ts <= key.timestamp {
                    self.candidates.remove(&stripped);
                }
            }
            let slot = self.deletes.entry(stripped).or_insert(0);
            if key.timestamp > *slot {
                *slot = key.timestamp;
            }
        } else {
            if let Some(&deleted_at) = self.deletes.get(&stripped) {
                if deleted_at >= key.timestamp {
                    return;
                }
            }
            self.candidates
                .entry(stripped)
                .and_modify(|ts| {
                    if key.timestamp > *ts {
                        *ts = key.timestamp;
                    }
                })
                .or_insert(key.timestamp);
        }
    }

    /// The largest row with a surviving candidate, if any.
    pub fn best_row(&self) -> Option<Row> {
        self.candidates.keys().next_back().map(|(row, _)| row.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The smallest row currently present among candidates, used to seat
    /// the "start from the earliest candidate's row" step of the
    /// per-file algorithm.
    pub fn earliest_row(&self) -> Option<Row> {
        self.candidates.keys().next().map(|(row, _)| row.clone())
    }
}
