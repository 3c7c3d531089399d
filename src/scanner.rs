//! A merge scanner unifying the MemTable and all open StoreFile readers
//! into a single ascending-row iterator of `(row, {column -> value})`
//! tuples.
//!
//! Rather than driving two independent per-entry cursors, this scanner
//! advances row-at-a-time: at each step it finds the smallest row beyond
//! the last one emitted across every layer, then reuses [`RowAccumulator`]
//! (the same newest-wins/tombstone-shadowing logic `get_full` uses) to
//! resolve that row's visible cells. This costs an extra row-lookup per
//! step but keeps a single row-resolution algorithm in one place and
//! needs no per-entry cursor state to re-seat when the reader set changes:
//! `update_readers` only needs a fresh reader list, not a saved
//! position.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::key::{Column, Key, Row, Timestamp};
use crate::memtable::MemTable;
use crate::rowmerge::RowAccumulator;
use crate::store_file::InMemoryReader;
use crate::value::Value;

/// Registered with the engine so it can be re-seated whenever the reader
/// set changes (a flush or compaction just committed).
pub trait ReaderSetObserver: Send + Sync {
    fn update_readers(&self);
}

pub type ReadersProvider = Arc<dyn Fn() -> Vec<InMemoryReader> + Send + Sync>;
pub type RowFilter = Box<dyn Fn(&Row) -> bool + Send + Sync>;

pub struct Scanner {
    memtable: Arc<MemTable>,
    readers: Mutex<Vec<InMemoryReader>>,
    readers_provider: ReadersProvider,
    origin_timestamp: Timestamp,
    columns: Option<HashSet<Column>>,
    row_filter: Option<RowFilter>,
    last_row: Mutex<Option<Row>>,
}

impl Scanner {
    pub fn new(
        memtable: Arc<MemTable>,
        readers_provider: ReadersProvider,
        origin_timestamp: Timestamp,
        columns: Option<HashSet<Column>>,
        row_filter: Option<RowFilter>,
        first_row: Option<Row>,
    ) -> Self {
        let readers = (readers_provider)();
        Scanner {
            memtable,
            readers: Mutex::new(readers),
            readers_provider,
            origin_timestamp,
            columns,
            row_filter,
            last_row: Mutex::new(first_row.map(|r| predecessor(&r))),
        }
    }

    /// The next non-empty, filter-accepted row, or `None` once every
    /// layer is exhausted.
    pub fn next(&self) -> Option<(Row, BTreeMap<Column, Value>)> {
        loop {
            let after = self.last_row.lock().unwrap().clone();
            let candidate = self.find_next_row(after.as_deref())?;
            *self.last_row.lock().unwrap() = Some(candidate.clone());

            if let Some(filter) = &self.row_filter {
                if !filter(&candidate) {
                    continue;
                }
            }

            let mut acc = RowAccumulator::new();
            let origin = Key::new(candidate.clone(), Vec::new(), self.origin_timestamp);
            self.memtable.get_full(&origin, &mut acc);
            {
                let readers = self.readers.lock().unwrap();
                for reader in readers.iter() {
                    acc.observe_layer(self.origin_timestamp, reader.entries_for_row(&candidate));
                }
            }

            let mut out = acc.out;
            if let Some(cols) = &self.columns {
                out.retain(|c, _| cols.contains(c));
            }
            if out.is_empty() {
                continue;
            }
            return Some((candidate, out));
        }
    }

    fn find_next_row(&self, after: Option<&[u8]>) -> Option<Row> {
        let probe = after.unwrap_or(b"");
        let mut best = self.memtable.get_next_row(probe);
        let readers = self.readers.lock().unwrap();
        for reader in readers.iter() {
            if let Some(row) = reader.smallest_row_strictly_after(probe) {
                best = match best {
                    Some(b) if b <= row => Some(b),
                    _ => Some(row),
                };
            }
        }
        best
    }
}

impl ReaderSetObserver for Scanner {
    fn update_readers(&self) {
        let fresh = (self.readers_provider)();
        *self.readers.lock().unwrap() = fresh;
    }
}

/// A probe value that sorts strictly before `row` under plain byte-string
/// order, used to seat `last_row` one step before the caller's requested
/// starting row.
fn predecessor(row: &[u8]) -> Row {
    let mut p = row.to_vec();
    if let Some(last) = p.last_mut() {
        if *last > 0 {
            *last -= 1;
            return p;
        }
    }
    p.pop();
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn key(row: &str, col: &str, ts: u64) -> Key {
        Key::new(row.as_bytes().to_vec(), col.as_bytes().to_vec(), ts)
    }

    #[test]
    fn scans_rows_in_ascending_order_merging_memtable_only() {
        let mt = Arc::new(MemTable::new());
        mt.add(key("020", "c", 1), Value::put(b"b".to_vec()));
        mt.add(key("010", "c", 1), Value::put(b"a".to_vec()));

        let scanner = Scanner::new(mt, Arc::new(Vec::new), crate::key::LATEST, None, None, None);
        let (r1, cells1) = scanner.next().unwrap();
        assert_eq!(r1, b"010".to_vec());
        assert_eq!(cells1.get(&b"c".to_vec()).unwrap().as_bytes(), b"a");

        let (r2, cells2) = scanner.next().unwrap();
        assert_eq!(r2, b"020".to_vec());
        assert_eq!(cells2.get(&b"c".to_vec()).unwrap().as_bytes(), b"b");

        assert!(scanner.next().is_none());
    }

    #[test]
    fn row_filter_skips_rejected_rows() {
        let mt = Arc::new(MemTable::new());
        mt.add(key("010", "c", 1), Value::put(b"a".to_vec()));
        mt.add(key("020", "c", 1), Value::put(b"b".to_vec()));

        let filter: Box<dyn Fn(&Row) -> bool + Send + Sync> = Box::new(|r: &Row| r.as_slice() == b"020");
        let scanner = Scanner::new(mt, Arc::new(Vec::new), crate::key::LATEST, None, Some(filter), None);
        let (row, _) = scanner.next().unwrap();
        assert_eq!(row, b"020".to_vec());
        assert!(scanner.next().is_none());
    }

    #[test]
    fn column_projection_hides_unrequested_columns() {
        let mt = Arc::new(MemTable::new());
        mt.add(key("r", "a", 1), Value::put(b"a".to_vec()));
        mt.add(key("r", "b", 1), Value::put(b"b".to_vec()));

        let mut cols = HashSet::new();
        cols.insert(b"a".to_vec());
        let scanner = Scanner::new(mt, Arc::new(Vec::new), crate::key::LATEST, Some(cols), None, None);
        let (_, cells) = scanner.next().unwrap();
        assert_eq!(cells.len(), 1);
        assert!(cells.contains_key(&b"a".to_vec()));
    }
}
