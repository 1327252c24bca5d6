// Journal writer module - appends tail records to a preallocated file
//
// The file is kept zero-filled past the write position. Appending a record
// writes the payload first and the length prefix last; in `SyncMode::Sync`
// the payload is made durable before the length is written, so a crash can
// only ever leave a record that is either complete or invisible.
use crate::record::{check_record_size, payload_length, JournalRecord, LENGTH_SIZE};
use crate::snapshot::JournalSnapshot;
use crate::{JournalConfig, SyncMode};
use mergetable_core::Result;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct JournalWriter {
    file: File,
    path: PathBuf,
    /// Offset where the next record's length prefix goes
    position: u64,
    /// Current (zero-filled) file length
    capacity: u64,
    sync_mode: SyncMode,
    records: u64,
}

impl JournalWriter {
    /// Create a new journal file headed by `snapshot`, truncating any
    /// existing file at `path`
    pub fn create(path: &Path, snapshot: &JournalSnapshot, config: &JournalConfig) -> Result<Self> {
        let header = snapshot.encode()?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all(&header)?;
        let position = header.len() as u64;
        let capacity = grown_capacity(config.initial_capacity, position);
        file.set_len(capacity)?;

        if config.sync_mode != SyncMode::None {
            file.sync_all()?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            position,
            capacity,
            sync_mode: config.sync_mode,
            records: 0,
        })
    }

    /// Reopen an existing journal for appending at `valid_end`.
    ///
    /// Anything past `valid_end` (a torn append, stale bytes) is cut off and
    /// the file is zero-filled again up to its capacity.
    pub fn resume(path: &Path, valid_end: u64, config: &JournalConfig) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let capacity = grown_capacity(config.initial_capacity, valid_end);
        file.set_len(valid_end)?;
        file.set_len(capacity)?;

        if config.sync_mode != SyncMode::None {
            file.sync_all()?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            position: valid_end,
            capacity,
            sync_mode: config.sync_mode,
            records: 0,
        })
    }

    /// Append one record
    ///
    /// Records larger than the reader accepts are refused with
    /// `InvalidArgument` before anything is written.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_record_size(key.len(), value.len())?;
        let frame_len = JournalRecord::frame_len(key.len(), value.len()) as u64;
        self.reserve(frame_len)?;

        let payload = JournalRecord::encode_payload(key, value)?;
        let length = payload_length(&payload)?;
        self.file
            .seek(SeekFrom::Start(self.position + LENGTH_SIZE as u64))?;
        self.file.write_all(&payload)?;

        // The length prefix is the validity marker: it must not reach the
        // disk ahead of the payload it describes.
        if self.sync_mode == SyncMode::Sync {
            self.file.sync_data()?;
        }

        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(&length)?;

        if self.sync_mode == SyncMode::Sync {
            self.file.sync_data()?;
        }

        self.position += frame_len;
        self.records += 1;
        Ok(())
    }

    /// Make sure `additional` bytes fit after the write position, doubling
    /// the file as often as needed
    pub fn reserve(&mut self, additional: u64) -> Result<()> {
        let needed = self.position + additional;
        if needed <= self.capacity {
            return Ok(());
        }

        let new_capacity = grown_capacity(self.capacity, needed);
        debug!(
            path = %self.path.display(),
            old_capacity = self.capacity,
            new_capacity,
            "Growing journal file"
        );
        self.file.set_len(new_capacity)?;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Flush appended records to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset one past the last appended record
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Current preallocated file length
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Records appended through this writer
    pub fn records_appended(&self) -> u64 {
        self.records
    }
}

/// Smallest power-of-two multiple of `base` that holds `needed` bytes plus
/// room for a terminating zero length prefix
fn grown_capacity(base: u64, needed: u64) -> u64 {
    let mut capacity = base.max(LENGTH_SIZE as u64);
    while capacity < needed + LENGTH_SIZE as u64 {
        capacity *= 2;
    }
    capacity
}
