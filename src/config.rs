//! Tunables for a single column-family store, in the spirit of the
//! teacher's `CompactionOptions`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Compaction fires once the file set holds at least this many
    /// StoreFiles (or any of them is a reference, or compaction is
    /// forced). Background compaction scheduling beyond this simple
    /// file-count threshold is out of scope.
    pub compaction_threshold: usize,

    /// Maximum number of non-tombstone versions a compaction output keeps
    /// per `(row, column)`.
    pub max_versions: usize,

    /// `add()` calls that would grow the memtable past this many entries
    /// trigger an automatic flush, mirroring the teacher's `ms.len() >
    /// 10_000` check.
    pub flush_row_threshold: usize,

    /// How often the owned background thread wakes to check
    /// `needs_compaction()`.
    pub background_compaction_interval: Duration,

    /// How many applied edits elapse between progress-reporter callbacks
    /// during WAL replay.
    pub replay_progress_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            compaction_threshold: 4,
            max_versions: 3,
            flush_row_threshold: 10_000,
            background_compaction_interval: Duration::from_secs(60),
            replay_progress_interval: 2_000,
        }
    }
}
