//! Error kinds for the column-family store, per the error handling design:
//! local recovery for file-level corruption, surface everything else.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A filesystem read/write/rename error. Fatal for the in-progress
    /// operation; flush/compaction abandon their partial output.
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Zero-length data or index, or an otherwise unparseable entry.
    /// Recoverable at load time by skipping or deleting the offending file.
    #[error("corrupt store file {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// `clear_snapshot` was called with a snapshot that is not the
    /// memtable's current one. Programmer error.
    #[error("clear_snapshot called with a snapshot that is not current")]
    UnexpectedSnapshot,

    /// A file name under `mapfiles/` or `info/` did not match the
    /// `^(\d+)(?:\.(.+))?$` grammar. Fatal at load time.
    #[error("store file name {0:?} does not match the sequence-id grammar")]
    BadName(PathBuf),

    /// EOF encountered mid-record while replaying the WAL stream.
    /// Recovery stops applying further records but the store still opens.
    #[error("replay stream truncated after {records_applied} records")]
    ReplayTruncated { records_applied: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;
