// Common test utilities for journal integration tests

use mergetable_journal::{JOURNAL_FILE, NEXT_JOURNAL_FILE};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Test fixture that creates a temporary table directory
pub struct JournalTestFixture {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub dir: PathBuf,
}

impl JournalTestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("table");
        fs::create_dir_all(&dir).expect("Failed to create table directory");

        Self { temp_dir, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[allow(dead_code)]
    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    #[allow(dead_code)]
    pub fn next_journal_path(&self) -> PathBuf {
        self.dir.join(NEXT_JOURNAL_FILE)
    }

    #[allow(dead_code)]
    pub fn journal_len(&self) -> u64 {
        fs::metadata(self.journal_path())
            .expect("Failed to stat journal")
            .len()
    }
}

impl Default for JournalTestFixture {
    fn default() -> Self {
        Self::new()
    }
}
