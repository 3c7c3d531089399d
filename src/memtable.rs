//! In-memory sorted buffer of recent writes, plus the parallel snapshot
//! map held during flushes.
//!
//! `current` is a [`crossbeam_skiplist::SkipMap`] rather than a
//! `BTreeMap`: the original design lets writers insert under a *shared*
//! lock because the underlying concurrent map handles its own
//! synchronization. A `SkipMap` gives the same property in Rust: `add`
//! only needs a read lock on the outer `RwLock` to reach a map that
//! inserts safely through `&self`. The outer lock's write mode is reserved
//! for the one operation that truly needs exclusivity: swapping `current`
//! out for a fresh, empty map at `snapshot()` time.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crossbeam_skiplist::SkipMap;
use log::warn;

use crate::error::{StoreError, StoreResult};
use crate::key::{Column, Key, Row};
use crate::rowmerge::{RowAccumulator, RowBeforeCandidates};
use crate::value::Value;

/// A frozen view of what `current` held at the moment `snapshot()` was
/// called. Identity (not content) equality is what `clear_snapshot`
/// checks, mirroring a language without GC handing the flusher an owned
/// object and expecting it back.
#[derive(Clone)]
pub struct Snapshot(Arc<SkipMap<Key, Value>>);

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// All entries in ascending key order, as owned `(Key, Value)` pairs
    /// ready for a StoreFile writer.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.0.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    fn identity_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct State {
    current: Arc<SkipMap<Key, Value>>,
    snapshot: Option<Snapshot>,
}

pub struct MemTable {
    state: RwLock<State>,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        MemTable {
            state: RwLock::new(State { current: Arc::new(SkipMap::new()), snapshot: None }),
        }
    }

    /// Inserts `(key, value)`. Last-writer-wins at equal keys; concurrent
    /// calls never block each other.
    pub fn add(&self, key: Key, value: Value) {
        let state = self.state.read().unwrap();
        state.current.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves `current` aside into a new [`Snapshot`] and installs a fresh
    /// empty map. A no-op (logged) if a snapshot is already pending: this
    /// guards against a retried flush asking for a second snapshot while
    /// the first has not yet been cleared.
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = &state.snapshot {
            if !existing.is_empty() {
                warn!("snapshot() called while a non-empty snapshot is already pending flush; ignoring");
                return existing.clone();
            }
        }
        let taken = std::mem::replace(&mut state.current, Arc::new(SkipMap::new()));
        let snap = Snapshot(taken);
        state.snapshot = Some(snap.clone());
        snap
    }

    pub fn get_snapshot(&self) -> Option<Snapshot> {
        self.state.read().unwrap().snapshot.clone()
    }

    /// Discards the pending snapshot. Fails with `UnexpectedSnapshot` if
    /// `snap` is not (by identity) the memtable's current snapshot.
    pub fn clear_snapshot(&self, snap: &Snapshot) -> StoreResult<()> {
        let mut state = self.state.write().unwrap();
        match &state.snapshot {
            Some(current) if current.identity_eq(snap) => {
                state.snapshot = None;
                Ok(())
            }
            _ => Err(StoreError::UnexpectedSnapshot),
        }
    }

    /// Up to `n_versions` values for `(key.row, key.column)` with
    /// `timestamp <= key.timestamp`, newest first. A tombstone shadows
    /// every older version of the same cell, so the scan stops the
    /// instant one is found.
    pub fn get(&self, key: &Key, n_versions: usize) -> Vec<Value> {
        let state = self.state.read().unwrap();
        let mut out = Vec::new();
        let stopped = Self::collect_versions(&state.current, key, n_versions, &mut out);
        if !stopped && out.len() < n_versions {
            if let Some(snap) = &state.snapshot {
                Self::collect_versions(&snap.0, key, n_versions, &mut out);
            }
        }
        out
    }

    /// Same matching/shadowing rules as [`MemTable::get`], but additionally
    /// reports whether the search stopped on a tombstone (or was already
    /// satisfied), so a caller that also consults on-disk StoreFiles knows
    /// whether it's safe to keep looking in older layers.
    pub fn get_with_stop(&self, key: &Key, n_versions: usize, out: &mut Vec<Value>) -> bool {
        let state = self.state.read().unwrap();
        if Self::collect_versions(&state.current, key, n_versions, out) {
            return true;
        }
        if out.len() >= n_versions {
            return true;
        }
        if let Some(snap) = &state.snapshot {
            if Self::collect_versions(&snap.0, key, n_versions, out) {
                return true;
            }
        }
        out.len() >= n_versions
    }

    fn collect_versions(map: &SkipMap<Key, Value>, key: &Key, n_versions: usize, out: &mut Vec<Value>) -> bool {
        let probe = Key::new(key.row.clone(), key.column.clone(), key.timestamp);
        for entry in map.range(probe..) {
            if out.len() >= n_versions {
                return false;
            }
            let k = entry.key();
            if !k.matches_row_col(&key.row, &key.column) {
                break;
            }
            if entry.value().is_tombstone() {
                return true; // shadows everything older for this cell
            }
            out.push(entry.value().clone());
        }
        false
    }

    /// Same matching rules as `get`, but returns the keys themselves. An
    /// empty `origin.column` means "any column on this row".
    pub fn get_keys(&self, origin: &Key, n_versions: usize) -> Vec<Key> {
        let state = self.state.read().unwrap();
        let mut out = Vec::new();
        if origin.column.is_empty() {
            Self::collect_keys_wildcard(&state.current, origin, n_versions, &mut out);
            if out.len() < n_versions {
                if let Some(snap) = &state.snapshot {
                    Self::collect_keys_wildcard(&snap.0, origin, n_versions, &mut out);
                }
            }
        } else {
            let stopped = Self::collect_keys(&state.current, origin, n_versions, &mut out);
            if !stopped && out.len() < n_versions {
                if let Some(snap) = &state.snapshot {
                    Self::collect_keys(&snap.0, origin, n_versions, &mut out);
                }
            }
        }
        out
    }

    fn collect_keys(map: &SkipMap<Key, Value>, origin: &Key, n_versions: usize, out: &mut Vec<Key>) -> bool {
        let probe = Key::new(origin.row.clone(), origin.column.clone(), origin.timestamp);
        for entry in map.range(probe..) {
            if out.len() >= n_versions {
                return false;
            }
            let k = entry.key();
            if !k.matches_row_col(&origin.row, &origin.column) {
                break;
            }
            if entry.value().is_tombstone() {
                return true;
            }
            out.push(k.clone());
        }
        false
    }

    fn collect_keys_wildcard(map: &SkipMap<Key, Value>, origin: &Key, n_versions: usize, out: &mut Vec<Key>) {
        let probe = Key::start_of_row(origin.row.clone());
        let mut stopped_columns: HashSet<Column> = HashSet::new();
        for entry in map.range(probe..) {
            let k = entry.key();
            if k.row != origin.row {
                break;
            }
            if stopped_columns.contains(&k.column) {
                continue;
            }
            if k.timestamp > origin.timestamp {
                continue;
            }
            if out.len() >= n_versions {
                break;
            }
            if entry.value().is_tombstone() {
                stopped_columns.insert(k.column.clone());
                continue;
            }
            out.push(k.clone());
        }
    }

    /// Feeds `acc` with this memtable's contribution to a full-row
    /// resolution at `origin`, consulting `current` then `snapshot`.
    pub fn get_full(&self, origin: &Key, acc: &mut RowAccumulator) {
        let state = self.state.read().unwrap();
        let probe = Key::start_of_row(origin.row.clone());
        let current_entries: Vec<(Key, Value)> = state
            .current
            .range(probe.clone()..)
            .take_while(|e| e.key().row == origin.row)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        acc.observe_layer(origin.timestamp, current_entries);

        if let Some(snap) = &state.snapshot {
            let snap_entries: Vec<(Key, Value)> = snap
                .0
                .range(probe..)
                .take_while(|e| e.key().row == origin.row)
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();
            acc.observe_layer(origin.timestamp, snap_entries);
        }
    }

    /// Feeds `candidates` with this memtable's contribution toward
    /// `get_row_key_at_or_before(row)`. Since the memtable is already
    /// in memory, this simply walks every entry at or before `row`
    /// rather than the two-phase seek `StoreFile` uses to bound disk
    /// I/O.
    pub fn get_row_key_at_or_before(&self, row: &[u8], candidates: &mut RowBeforeCandidates) {
        let state = self.state.read().unwrap();
        let upper = Key::end_of_row(row.to_vec());
        for entry in state.current.range(..=upper.clone()) {
            candidates.observe(entry.key(), entry.value());
        }
        if let Some(snap) = &state.snapshot {
            for entry in snap.0.range(..=upper) {
                candidates.observe(entry.key(), entry.value());
            }
        }
    }

    /// The smallest row strictly greater than `row` present in either
    /// map, if any.
    pub fn get_next_row(&self, row: &[u8]) -> Option<Row> {
        let state = self.state.read().unwrap();
        let mut best: Option<Row> = None;
        for map in [Some(&state.current), state.snapshot.as_ref().map(|s| &s.0)].into_iter().flatten() {
            let probe = Key::end_of_row(row.to_vec());
            if let Some(entry) = map.range(probe..).find(|e| e.key().row.as_slice() > row) {
                let candidate = entry.key().row.clone();
                best = Some(match best {
                    Some(b) if b <= candidate => b,
                    _ => candidate,
                });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::LATEST;

    fn key(row: &str, col: &str, ts: u64) -> Key {
        Key::new(row.as_bytes().to_vec(), col.as_bytes().to_vec(), ts)
    }

    #[test]
    fn add_and_get_round_trip() {
        let mt = MemTable::new();
        mt.add(key("r", "c", 1), Value::put(b"v1".to_vec()));
        let got = mt.get(&key("r", "c", LATEST), 1);
        assert_eq!(got, vec![Value::put(b"v1".to_vec())]);
    }

    #[test]
    fn tombstone_masks_older_value_within_memtable() {
        let mt = MemTable::new();
        mt.add(key("r", "c", 1), Value::put(b"v1".to_vec()));
        mt.add(key("r", "c", 2), Value::tombstone());
        let got = mt.get(&key("r", "c", LATEST), 5);
        assert!(got.is_empty());
    }

    #[test]
    fn multi_version_get_orders_newest_first() {
        let mt = MemTable::new();
        mt.add(key("r", "c", 1), Value::put(b"a".to_vec()));
        mt.add(key("r", "c", 2), Value::put(b"b".to_vec()));
        mt.add(key("r", "c", 3), Value::put(b"c".to_vec()));
        let got = mt.get(&key("r", "c", LATEST), 2);
        assert_eq!(got, vec![Value::put(b"c".to_vec()), Value::put(b"b".to_vec())]);
    }

    #[test]
    fn snapshot_is_a_noop_while_non_empty_snapshot_pending() {
        let mt = MemTable::new();
        mt.add(key("r", "c", 1), Value::put(b"a".to_vec()));
        let s1 = mt.snapshot();
        mt.add(key("r", "c", 2), Value::put(b"b".to_vec()));
        let s2 = mt.snapshot();
        assert!(s1.identity_eq(&s2));
        // the second add landed in a fresh `current`, not lost
        assert_eq!(mt.get(&key("r", "c", LATEST), 1), vec![Value::put(b"b".to_vec())]);
    }

    #[test]
    fn clear_snapshot_rejects_mismatched_identity() {
        let mt = MemTable::new();
        mt.add(key("r", "c", 1), Value::put(b"a".to_vec()));
        let s1 = mt.snapshot();
        mt.clear_snapshot(&s1).unwrap();

        mt.add(key("r", "c", 2), Value::put(b"b".to_vec()));
        let s2 = mt.snapshot();
        // s1 is stale; its identity no longer matches the current snapshot
        assert!(mt.clear_snapshot(&s1).is_err());
        mt.clear_snapshot(&s2).unwrap();
    }

    #[test]
    fn get_keys_empty_column_matches_any_column_on_the_row() {
        let mt = MemTable::new();
        mt.add(key("r", "a", 1), Value::put(b"x".to_vec()));
        mt.add(key("r", "b", 1), Value::put(b"y".to_vec()));
        let origin = Key::new(b"r".to_vec(), Vec::new(), LATEST);
        let keys = mt.get_keys(&origin, 10);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn get_next_row_finds_the_smallest_greater_row() {
        let mt = MemTable::new();
        mt.add(key("010", "c", 1), Value::put(b"v".to_vec()));
        mt.add(key("030", "c", 1), Value::put(b"v".to_vec()));
        assert_eq!(mt.get_next_row(b"010"), Some(b"030".to_vec()));
        assert_eq!(mt.get_next_row(b"030"), None);
    }

    #[test]
    fn get_full_prefers_newest_non_tombstone_per_column() {
        let mt = MemTable::new();
        mt.add(key("r", "a", 1), Value::put(b"old".to_vec()));
        mt.add(key("r", "a", 2), Value::put(b"new".to_vec()));
        mt.add(key("r", "b", 1), Value::put(b"b".to_vec()));
        let mut acc = RowAccumulator::new();
        mt.get_full(&Key::new(b"r".to_vec(), Vec::new(), LATEST), &mut acc);
        assert_eq!(acc.out.get(&b"a".to_vec()).unwrap().as_bytes(), b"new");
        assert_eq!(acc.out.get(&b"b".to_vec()).unwrap().as_bytes(), b"b");
    }
}
