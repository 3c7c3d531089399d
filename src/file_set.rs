//! The ordered collection of StoreFiles for a column family, indexed by
//! sequence id, with matching open readers. Tracks `max_seq_id` across
//! everything currently installed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::StoreResult;
use crate::store_file::{InMemoryReader, StoreFile};

pub struct FileSet {
    mapfiles_dir: PathBuf,
    info_dir: PathBuf,
    files: BTreeMap<u64, StoreFile>,
}

impl FileSet {
    pub fn open(base_dir: &Path) -> StoreResult<Self> {
        let mapfiles_dir = base_dir.join("mapfiles");
        let info_dir = base_dir.join("info");
        fs::create_dir_all(&mapfiles_dir)?;
        fs::create_dir_all(&info_dir)?;

        let mut files = BTreeMap::new();
        for entry in fs::read_dir(&mapfiles_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            match StoreFile::load(&mapfiles_dir, &info_dir, &dir_name) {
                Ok(Some(file)) => {
                    files.insert(file.sequence_id(), file);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("store file {dir_name:?} failed to load and will be skipped: {e}");
                }
            }
        }

        Ok(FileSet { mapfiles_dir, info_dir, files })
    }

    pub fn mapfiles_dir(&self) -> &Path {
        &self.mapfiles_dir
    }

    pub fn info_dir(&self) -> &Path {
        &self.info_dir
    }

    pub fn max_seq_id(&self) -> Option<u64> {
        self.files.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn has_any_reference(&self) -> bool {
        self.files.values().any(|f| f.is_reference())
    }

    /// Sequence ids oldest-first.
    pub fn sequence_ids(&self) -> Vec<u64> {
        self.files.keys().copied().collect()
    }

    /// Sequence ids newest-first, the order the read path and compactor
    /// want to consult files in.
    pub fn sequence_ids_newest_first(&self) -> Vec<u64> {
        self.files.keys().rev().copied().collect()
    }

    pub fn open_readers_newest_first(&self) -> Vec<InMemoryReader> {
        self.files.values().rev().map(|f| f.open_reader()).collect()
    }

    pub fn files(&self) -> impl Iterator<Item = &StoreFile> {
        self.files.values()
    }

    pub fn insert(&mut self, file: StoreFile) {
        self.files.insert(file.sequence_id(), file);
    }

    /// Removes the named files from the set and deletes their on-disk
    /// payloads. Callers must have already notified reader-set observers
    /// before calling this, per the deferred-delete resource policy.
    pub fn remove_and_delete(&mut self, sequence_ids: &[u64]) -> StoreResult<()> {
        for seq in sequence_ids {
            if let Some(file) = self.files.remove(seq) {
                let _ = fs::remove_dir_all(self.mapfiles_dir.join(file.dir_name()));
                let _ = fs::remove_file(self.info_dir.join(file.dir_name()));
            }
        }
        Ok(())
    }
}
