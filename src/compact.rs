//! Multi-way newest-first merge of several StoreFiles into one,
//! discarding versions beyond the per-cell cap and any value shadowed by
//! a tombstone.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::key::{Column, Key, Timestamp};
use crate::store_file::{InMemoryReader, StoreFileReader};
use crate::value::Value;

struct HeapItem {
    key: Key,
    value: Value,
    reader_idx: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.reader_idx == other.reader_idx
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| self.reader_idx.cmp(&other.reader_idx))
    }
}

/// Merges `readers` (opened fresh for this compaction, in no particular
/// input order; ties are broken by the reader's position in the input
/// slice, lower index wins, so callers should list files newest-first)
/// and returns the surviving entries in ascending key order, ready to
/// hand to `StoreFile::create`.
pub fn merge(mut readers: Vec<InMemoryReader>, max_versions: usize) -> Vec<(Key, Value)> {
    let mut heap = BinaryHeap::new();
    for (idx, reader) in readers.iter_mut().enumerate() {
        if let Some((key, value)) = reader.next() {
            heap.push(Reverse(HeapItem { key, value, reader_idx: idx }));
        }
    }

    let mut out = Vec::new();
    let mut last_row: Option<Vec<u8>> = None;
    let mut last_cell: Option<(Vec<u8>, Column)> = None;
    let mut last_full_key: Option<Key> = None;
    let mut times_seen: usize = 0;
    let mut deletes: HashMap<Column, HashSet<Timestamp>> = HashMap::new();

    while let Some(Reverse(item)) = heap.pop() {
        if let Some((key, value)) = readers[item.reader_idx].next() {
            heap.push(Reverse(HeapItem { key, value, reader_idx: item.reader_idx }));
        }

        let HeapItem { key, value, .. } = item;

        if last_full_key.as_ref() == Some(&key) {
            continue; // exact duplicate of the entry just emitted/processed
        }
        last_full_key = Some(key.clone());

        if last_row.as_deref() != Some(key.row.as_slice()) {
            deletes.clear();
            last_row = Some(key.row.clone());
        }

        let cell = (key.row.clone(), key.column.clone());
        if last_cell.as_ref() != Some(&cell) {
            times_seen = 0;
            last_cell = Some(cell);
        }

        if value.is_tombstone() {
            deletes.entry(key.column.clone()).or_default().insert(key.timestamp);
            continue;
        }

        if let Some(set) = deletes.get(&key.column) {
            if set.iter().any(|&ts| ts >= key.timestamp) {
                continue; // shadowed by a tombstone seen earlier (newer) in this row
            }
        }

        if times_seen >= max_versions || key.row.is_empty() || key.column.is_empty() {
            continue;
        }
        times_seen += 1;
        out.push((key, value));
    }

    out
}

/// Whether the file count alone warrants a compaction, per the simple
/// threshold policy named in the concurrency model.
pub fn needs_compaction_by_count(file_count: usize, threshold: usize) -> bool {
    file_count >= threshold
}
