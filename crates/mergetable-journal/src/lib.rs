//! # mergetable journal
//!
//! Snapshot-plus-append durability log for mergetable.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of mergetable.**
//!
//! Users should depend on the main `mergetable` crate instead, which
//! provides the stable public API. This crate's API may change without
//! notice between minor versions.

// A journal file holds (a) a snapshot of the segment list and of every
// running compaction's resumable state, and (b) a tail of (key, value)
// writes appended since that snapshot. Resetting writes a fresh file
// holding only a new snapshot and atomically renames it over the old one.

use mergetable_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub mod reader;
pub mod record;
pub mod snapshot;
pub mod writer;

pub use reader::JournalReader;
pub use record::{Decoded, JournalRecord};
pub use snapshot::{JournalSnapshot, SegmentEntry, TaskEntry};
pub use writer::JournalWriter;

/// Name of the live journal file inside a table directory
pub const JOURNAL_FILE: &str = "JOURNAL";

/// Name of the temporary file a reset writes before renaming it into place
pub const NEXT_JOURNAL_FILE: &str = "JOURNAL.next";

/// Journal configuration options
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Sync mode: sync, async, or none
    pub sync_mode: SyncMode,
    /// Initial preallocated file size; doubled whenever an append overflows
    pub initial_capacity: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Sync,
            initial_capacity: 64 * 1024, // 64 KiB
        }
    }
}

/// Sync mode for journal writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// fsync the payload, then the length prefix, on every append
    Sync,
    /// Leave appends to the OS; fsync on reset and on explicit `sync`
    Async,
    /// Never fsync (fastest, unsafe for power loss)
    None,
}

/// Journal manager: owns the live journal file of one table directory
pub struct Journal {
    dir: PathBuf,
    config: JournalConfig,
    writer: JournalWriter,
    rotations: u64,
}

impl Journal {
    /// Whether `dir` holds a journal
    pub fn exists(dir: &Path) -> bool {
        dir.join(JOURNAL_FILE).is_file()
    }

    /// Create the journal of a new table, headed by `snapshot`
    pub fn create(dir: &Path, config: JournalConfig, snapshot: &JournalSnapshot) -> Result<Self> {
        let writer = install(dir, &config, snapshot)?;
        info!(dir = %dir.display(), "Created journal");
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            writer,
            rotations: 0,
        })
    }

    /// Open the journal of an existing table.
    ///
    /// Returns the manager (positioned to append after the last complete
    /// record), the snapshot, and the tail records to replay.
    pub fn open(
        dir: &Path,
        config: JournalConfig,
    ) -> Result<(Self, JournalSnapshot, Vec<JournalRecord>)> {
        let path = dir.join(JOURNAL_FILE);
        if !path.is_file() {
            return Err(Error::NotFound(path));
        }

        // A leftover next-journal means a reset died before its rename; the
        // old journal is still authoritative.
        let next = dir.join(NEXT_JOURNAL_FILE);
        if next.exists() {
            warn!(path = %next.display(), "Removing stale journal from interrupted reset");
            fs::remove_file(&next)?;
        }

        let (snapshot, mut reader) = JournalReader::open(&path)?;
        let records = reader.read_all()?;
        let valid_end = reader.valid_end();
        drop(reader);

        let writer = JournalWriter::resume(&path, valid_end, &config)?;

        info!(
            dir = %dir.display(),
            segments = snapshot.segments.len(),
            tasks = snapshot.tasks.len(),
            tail_records = records.len(),
            "Opened journal"
        );

        Ok((
            Self {
                dir: dir.to_path_buf(),
                config,
                writer,
                rotations: 0,
            },
            snapshot,
            records,
        ))
    }

    /// Append one write to the tail
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writer.append(key, value)
    }

    /// Replace the journal with a fresh one headed by `snapshot`.
    ///
    /// When this returns `Ok`, the new file is durable and in place; files
    /// only the old snapshot referenced may be deleted.
    pub fn snapshot_and_reset(&mut self, snapshot: &JournalSnapshot) -> Result<()> {
        let dropped_records = self.writer.records_appended();
        self.writer = install(&self.dir, &self.config, snapshot)?;
        self.rotations += 1;

        info!(
            dir = %self.dir.display(),
            write_seq = snapshot.write_seq,
            segments = snapshot.segments.len(),
            tasks = snapshot.tasks.len(),
            dropped_records,
            "Journal reset"
        );
        Ok(())
    }

    /// Flush the tail to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync()
    }

    /// Sync and close the journal
    pub fn close(mut self) -> Result<()> {
        self.writer.sync()
    }

    /// Path of the live journal file
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Offset one past the last appended record
    pub fn tail_end(&self) -> u64 {
        self.writer.position()
    }

    /// Records appended since the last reset (or since open)
    pub fn records_since_reset(&self) -> u64 {
        self.writer.records_appended()
    }

    /// Resets performed through this manager
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// The configuration in use
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }
}

/// Write a journal headed by `snapshot` to the temp name, make it durable,
/// rename it over the live journal and reopen it for appending.
fn install(dir: &Path, config: &JournalConfig, snapshot: &JournalSnapshot) -> Result<JournalWriter> {
    let next = dir.join(NEXT_JOURNAL_FILE);
    let live = dir.join(JOURNAL_FILE);

    let writer = JournalWriter::create(&next, snapshot, config)?;
    let header_end = writer.position();
    drop(writer);

    fs::rename(&next, &live)?;
    sync_dir(dir)?;
    debug!(path = %live.display(), header_end, "Installed journal");

    JournalWriter::resume(&live, header_end, config)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
