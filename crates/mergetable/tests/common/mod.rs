// Common test utilities for table integration tests

use mergetable::{MergeOutcome, SyncMode, Table, TableOptions};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Test fixture that creates a temporary table directory
pub struct TableTestFixture {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub dir: PathBuf,
}

impl TableTestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("table");
        Self { temp_dir, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn open(&self, options: TableOptions) -> Table {
        Table::open_with_options(&self.dir, options).expect("Failed to open table")
    }

    /// Names of the segment files currently in the table directory
    #[allow(dead_code)]
    pub fn segment_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)
            .expect("Failed to list table directory")
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.len() > 17 && n.as_bytes()[16] == b'.')
            .collect();
        names.sort();
        names
    }
}

impl Default for TableTestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge that appends the newer value to the older one; appends are not
/// fsynced
#[allow(dead_code)]
pub fn concat_options() -> TableOptions {
    TableOptions::default()
        .with_sync_mode(SyncMode::None)
        .with_merge(Arc::new(|_k: &[u8], old: &[u8], new: &[u8]| {
            let mut joined = old.to_vec();
            joined.extend_from_slice(new);
            MergeOutcome::Replace(joined)
        }))
}

/// Deterministic write workload: (key, value) pairs over a small key space
#[allow(dead_code)]
pub fn workload(writes: usize, keys: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    (0..writes)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let key = format!("key{:04}", state as usize % keys).into_bytes();
            let value = format!("{},", i).into_bytes();
            (key, value)
        })
        .collect()
}

/// Expected contents after applying `writes` with the concatenating merge
#[allow(dead_code)]
pub fn concat_model(writes: &[(Vec<u8>, Vec<u8>)]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for (k, v) in writes {
        model.entry(k.clone()).or_default().extend_from_slice(v);
    }
    model
}
