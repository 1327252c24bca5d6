//! # mergetable
//!
//! An embedded, ordered key/value store for write-heavy workloads. Values
//! written for the same key are combined by an application-supplied merge
//! function, and on-disk segments are compacted pairwise in small slices
//! inside the write path, so no call ever waits on a full compaction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mergetable::Table;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let table = Table::open("./my_table")?;
//!
//!     table.add(b"user:1:name", b"Alice")?;
//!     table.add(b"user:1:name", b"Alicia")?;
//!
//!     // Last write wins by default
//!     assert_eq!(table.query(b"user:1:name")?, Some(b"Alicia".to_vec()));
//!
//!     table.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Custom merges
//!
//! ```rust,no_run
//! use mergetable::{MergeOutcome, Table, TableOptions};
//! use std::sync::Arc;
//!
//! // Every value is a little-endian u64 counter increment
//! let options = TableOptions::default().with_merge(Arc::new(|_key: &[u8], old: &[u8], new: &[u8]| {
//!     let a = u64::from_le_bytes(old.try_into().unwrap_or([0; 8]));
//!     let b = u64::from_le_bytes(new.try_into().unwrap_or([0; 8]));
//!     MergeOutcome::Replace((a + b).to_le_bytes().to_vec())
//! }));
//!
//! let table = Table::open_with_options("./counters", options)?;
//! table.add(b"page:/", &1u64.to_le_bytes())?;
//! table.add(b"page:/", &1u64.to_le_bytes())?;
//! assert_eq!(table.query(b"page:/")?, Some(2u64.to_le_bytes().to_vec()));
//! # Ok::<(), mergetable::Error>(())
//! ```

use mergetable_storage::Engine;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod logging;

// Re-export core types
pub use mergetable_core::{
    last_write_wins, CompareFn, Error, MergeFn, MergeOutcome, Result, SegmentId, SimplifyFn,
    Simplified, StableFn,
};

// Journal configuration
pub use mergetable_journal::record::MAX_RECORD_DATA;
pub use mergetable_journal::SyncMode;

// Storage components
pub use mergetable_storage::{
    BlockBackend, BlockCompression, CompactionStats, OpenMode, QueryOrder, SegmentBackend,
    SegmentSummary, TableOptions, TableStats, TreeBackend,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handle to an open table.
///
/// Thread-safe and cheap to clone; all clones share one engine. Every call
/// takes the engine's lock for its duration, and no call runs longer than
/// one memtable flush plus one bounded compaction slice.
///
/// # Examples
///
/// ```rust,no_run
/// use mergetable::Table;
///
/// let table = Table::open("./my_data")?;
/// table.add(b"key", b"value")?;
///
/// // Data persists across restarts
/// table.close()?;
/// let table = Table::open("./my_data")?;
/// assert_eq!(table.query(b"key")?, Some(b"value".to_vec()));
/// # Ok::<(), mergetable::Error>(())
/// ```
#[derive(Clone)]
pub struct Table {
    inner: Arc<Mutex<Engine>>,
}

impl Table {
    /// Opens the table in `path` with default options, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, TableOptions::default())
    }

    /// Opens the table in `path` with custom options.
    ///
    /// Fails with `LockHeld` while another handle has the directory open,
    /// and with `Corrupt` if the journal or a segment cannot be trusted.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: TableOptions) -> Result<Self> {
        let engine = Engine::open(path, options)?;
        Ok(Table {
            inner: Arc::new(Mutex::new(engine)),
        })
    }

    fn engine(&self) -> Result<MutexGuard<'_, Engine>> {
        self.inner.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Records a write of `value` under `key`.
    ///
    /// When this returns `Ok` the write is in the journal (durable under
    /// `SyncMode::Sync`) and visible to `query`. A key and value together
    /// longer than [`MAX_RECORD_DATA`] are refused with `InvalidArgument`.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine()?.add(key, value)
    }

    /// Returns the value of `key` after merging every write to it, or
    /// `None` if the key is absent or was dropped.
    pub fn query(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.engine()?.query(key)
    }

    /// Moves unflushed writes into a segment and rewrites the journal.
    pub fn flush(&self) -> Result<()> {
        self.engine()?.flush()
    }

    /// Forces the journal to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.engine()?.sync()
    }

    /// Get table statistics
    pub fn stats(&self) -> Result<TableStats> {
        Ok(self.engine()?.stats())
    }

    /// Closes this handle.
    ///
    /// The last handle flushes and releases the table; other handles only
    /// flush, leaving the table open for the remaining clones.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().map_err(|_| Error::LockPoisoned)?.close(),
            Err(shared) => shared.lock().map_err(|_| Error::LockPoisoned)?.flush(),
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Ok(engine) => f.debug_struct("Table").field("dir", &engine.dir()).finish(),
            Err(_) => f.debug_struct("Table").finish_non_exhaustive(),
        }
    }
}
