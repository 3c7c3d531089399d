//! Replays a caller-supplied write-ahead-log stream into a MemTable on
//! startup, for edits whose sequence id exceeds what the file set already
//! reflects.

use std::collections::HashSet;

use log::warn;

use crate::key::{Column, Key, Row, Timestamp};
use crate::memtable::MemTable;
use crate::value::Value;

/// One parsed WAL record. Parsing the WAL's own framing is out of scope;
/// callers hand the engine already-decoded records.
pub struct ReplayRecord {
    pub region: String,
    pub row: Row,
    pub column: Column,
    pub timestamp: Timestamp,
    pub value: Value,
    pub seq: u64,
}

/// Either a successfully parsed record, or a signal that the stream
/// ended mid-record (a truncated WAL tail from an unclean shutdown).
pub enum StreamItem {
    Record(ReplayRecord),
    Truncated,
}

pub struct ReplayOutcome {
    pub applied: u64,
    pub max_seq_replayed: u64,
    pub truncated: bool,
}

/// Splits `column` at its family separator (`:`) and returns the prefix.
pub fn column_family_of(column: &[u8]) -> &[u8] {
    match column.iter().position(|&b| b == b':') {
        Some(idx) => &column[..idx],
        None => column,
    }
}

/// Identifies which records in a shared WAL stream belong to this store:
/// its region, its column family, and not already reflected on disk.
pub struct ReplayScope<'a> {
    pub max_seq_id: Option<u64>,
    pub this_region: &'a str,
    pub this_family: &'a [u8],
    pub meta_columns: &'a HashSet<Column>,
}

/// Applies `stream` to `memtable`, skipping records outside `scope`.
/// `progress` is invoked every `progress_interval` applied edits;
/// `on_apply` is invoked for each applied record's key before it is
/// written into `memtable`.
pub fn replay(
    memtable: &MemTable,
    stream: impl IntoIterator<Item = StreamItem>,
    scope: ReplayScope,
    progress_interval: u64,
    mut progress: impl FnMut(u64),
    mut on_apply: impl FnMut(&Key),
) -> ReplayOutcome {
    let mut applied = 0u64;
    let mut max_seq_replayed = scope.max_seq_id.unwrap_or(0);
    let mut truncated = false;

    for item in stream {
        let record = match item {
            StreamItem::Record(r) => r,
            StreamItem::Truncated => {
                warn!("replay stream truncated after {applied} records applied; stopping recovery early");
                truncated = true;
                break;
            }
        };

        if let Some(max) = scope.max_seq_id {
            if record.seq <= max {
                continue;
            }
        }
        if record.region != scope.this_region {
            continue;
        }
        if scope.meta_columns.contains(&record.column) {
            continue;
        }
        if column_family_of(&record.column) != scope.this_family {
            continue;
        }

        let key = Key::new(record.row, record.column, record.timestamp);
        on_apply(&key);
        memtable.add(key, record.value);
        applied += 1;
        if record.seq > max_seq_replayed {
            max_seq_replayed = record.seq;
        }
        if progress_interval > 0 && applied.is_multiple_of(progress_interval) {
            progress(applied);
        }
    }

    ReplayOutcome { applied, max_seq_replayed, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(region: &str, row: &str, col: &str, ts: u64, val: &str, seq: u64) -> ReplayRecord {
        ReplayRecord {
            region: region.to_string(),
            row: row.as_bytes().to_vec(),
            column: col.as_bytes().to_vec(),
            timestamp: ts,
            value: Value::put(val.as_bytes().to_vec()),
            seq,
        }
    }

    #[test]
    fn skips_records_already_reflected_on_disk() {
        let mt = MemTable::new();
        let stream = vec![StreamItem::Record(record("r1", "row", "f:c", 1, "v", 5))];
        let outcome =
            replay(
                &mt,
                stream,
                ReplayScope { max_seq_id: Some(10), this_region: "r1", this_family: b"f", meta_columns: &HashSet::new() },
                2000,
                |_| {},
                |_| {},
            );
        assert_eq!(outcome.applied, 0);
        assert_eq!(mt.len(), 0);
    }

    #[test]
    fn applies_records_for_this_region_and_family_only() {
        let mt = MemTable::new();
        let mut meta = HashSet::new();
        meta.insert(b"meta:region".to_vec());
        let stream = vec![
            StreamItem::Record(record("r1", "row", "f:c", 1, "v1", 11)),
            StreamItem::Record(record("other-region", "row", "f:c", 12, "skip-region", 12)),
            StreamItem::Record(record("r1", "row", "g:c", 13, "skip-family", 13)),
            StreamItem::Record(ReplayRecord {
                region: "r1".into(),
                row: b"row".to_vec(),
                column: b"meta:region".to_vec(),
                timestamp: 14,
                value: Value::put(b"skip-meta".to_vec()),
                seq: 14,
            }),
        ];
        let outcome = replay(
            &mt,
            stream,
            ReplayScope { max_seq_id: Some(10), this_region: "r1", this_family: b"f", meta_columns: &meta },
            2000,
            |_| {},
            |_| {},
        );
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.max_seq_replayed, 11);
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn truncated_stream_stops_but_keeps_what_was_applied() {
        let mt = MemTable::new();
        let stream = vec![
            StreamItem::Record(record("r1", "row", "f:c", 1, "v1", 11)),
            StreamItem::Truncated,
            StreamItem::Record(record("r1", "row2", "f:c", 1, "v2", 12)),
        ];
        let outcome = replay(
            &mt,
            stream,
            ReplayScope { max_seq_id: None, this_region: "r1", this_family: b"f", meta_columns: &HashSet::new() },
            2000,
            |_| {},
            |_| {},
        );
        assert_eq!(outcome.applied, 1);
        assert!(outcome.truncated);
        assert_eq!(mt.len(), 1);
    }
}
