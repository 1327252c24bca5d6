//! Table options

use crate::backend::{BlockBackend, SegmentBackend};
use crate::compaction::CompactionConfig;
use mergetable_core::{
    last_write_wins, CompareFn, Comparator, Error, MergeFn, Result, SimplifyFn, StableFn, ValueOps,
};
use mergetable_journal::{JournalConfig, SyncMode};
use std::fmt;
use std::sync::Arc;

/// Default memtable flush threshold in writes (64 Ki)
const DEFAULT_MEMTABLE_ENTRIES: u64 = 64 * 1024;
/// Default memtable flush threshold in bytes (4MB)
const DEFAULT_MEMTABLE_BYTES: u64 = 4 * 1024 * 1024;

/// How `open` treats an existing or missing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Open the table, creating it when absent
    #[default]
    CreateIfMissing,
    /// Fail with `AlreadyExists` if a table is present
    CreateNew,
    /// Fail with `NotFound` if no table is present
    Existing,
}

/// Order in which `query` reconciles the layers holding a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    /// Memtable first, then segments newest to oldest; may stop early on a
    /// stable value
    #[default]
    NewestFirst,
    /// Oldest segment first, memtable last; always visits every layer
    OldestFirst,
}

/// Table configuration
#[derive(Clone)]
pub struct TableOptions {
    /// Combines an older and a newer value for the same key
    pub merge: MergeFn,
    /// Key ordering; raw bytes when unset
    pub compare: Option<CompareFn>,
    /// Value rewrite applied at the oldest layer
    pub simplify: Option<SimplifyFn>,
    /// Reports a value no older layer can change
    pub is_stable: Option<StableFn>,
    /// Flush once the memtable has absorbed more writes than this
    pub max_memtable_entries: u64,
    /// Flush once the memtable holds more bytes than this
    pub max_memtable_bytes: u64,
    /// Merges allowed in progress at once
    pub max_running_compactions: usize,
    /// Pairs whose size ratio is at or above this are not merged
    pub compaction_ratio_ceiling: f64,
    /// Rewrite the journal snapshot every this many flushes
    pub journal_reset_period: u64,
    /// Merge steps run per write
    pub compaction_slice_steps: usize,
    /// Layer order for queries
    pub query_order: QueryOrder,
    /// Journal durability
    pub sync_mode: SyncMode,
    /// Segment file format for new segments
    pub backend: Arc<dyn SegmentBackend>,
    /// Create/open behaviour
    pub open_mode: OpenMode,
    /// Reject keys of any other length
    pub fixed_key_len: Option<usize>,
    /// Reject values of any other length
    pub fixed_value_len: Option<usize>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            merge: last_write_wins(),
            compare: None,
            simplify: None,
            is_stable: None,
            max_memtable_entries: DEFAULT_MEMTABLE_ENTRIES,
            max_memtable_bytes: DEFAULT_MEMTABLE_BYTES,
            max_running_compactions: 2,
            compaction_ratio_ceiling: 4.0,
            journal_reset_period: 8,
            compaction_slice_steps: 32,
            query_order: QueryOrder::NewestFirst,
            sync_mode: SyncMode::Sync,
            backend: Arc::new(BlockBackend::default()),
            open_mode: OpenMode::CreateIfMissing,
            fixed_key_len: None,
            fixed_value_len: None,
        }
    }
}

impl TableOptions {
    pub fn with_merge(mut self, merge: MergeFn) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_compare(mut self, compare: CompareFn) -> Self {
        self.compare = Some(compare);
        self
    }

    pub fn with_simplify(mut self, simplify: SimplifyFn) -> Self {
        self.simplify = Some(simplify);
        self
    }

    pub fn with_stable(mut self, is_stable: StableFn) -> Self {
        self.is_stable = Some(is_stable);
        self
    }

    pub fn with_max_memtable_entries(mut self, entries: u64) -> Self {
        self.max_memtable_entries = entries;
        self
    }

    pub fn with_max_memtable_bytes(mut self, bytes: u64) -> Self {
        self.max_memtable_bytes = bytes;
        self
    }

    pub fn with_max_running_compactions(mut self, max: usize) -> Self {
        self.max_running_compactions = max;
        self
    }

    pub fn with_compaction_ratio_ceiling(mut self, ceiling: f64) -> Self {
        self.compaction_ratio_ceiling = ceiling;
        self
    }

    pub fn with_journal_reset_period(mut self, flushes: u64) -> Self {
        self.journal_reset_period = flushes;
        self
    }

    pub fn with_compaction_slice_steps(mut self, steps: usize) -> Self {
        self.compaction_slice_steps = steps;
        self
    }

    pub fn with_query_order(mut self, order: QueryOrder) -> Self {
        self.query_order = order;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SegmentBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    pub fn with_fixed_key_len(mut self, len: usize) -> Self {
        self.fixed_key_len = Some(len);
        self
    }

    pub fn with_fixed_value_len(mut self, len: usize) -> Self {
        self.fixed_value_len = Some(len);
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_memtable_entries == 0 || self.max_memtable_bytes == 0 {
            return Err(Error::InvalidArgument(
                "memtable thresholds must be positive".to_string(),
            ));
        }
        if self.journal_reset_period == 0 {
            return Err(Error::InvalidArgument(
                "journal reset period must be positive".to_string(),
            ));
        }
        if self.compaction_slice_steps == 0 {
            return Err(Error::InvalidArgument(
                "compaction slice must run at least one step".to_string(),
            ));
        }
        if !(self.compaction_ratio_ceiling > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "compaction ratio ceiling must be positive, got {}",
                self.compaction_ratio_ceiling
            )));
        }
        Ok(())
    }

    /// Callback bundle for the memtable, compaction and queries
    pub fn value_ops(&self) -> ValueOps {
        let comparator = match &self.compare {
            Some(f) => Comparator::custom(Arc::clone(f)),
            None => Comparator::bytewise(),
        };
        ValueOps::new(Arc::clone(&self.merge))
            .with_comparator(comparator)
            .with_simplify(self.simplify.clone())
            .with_stable(self.is_stable.clone())
    }

    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            sync_mode: self.sync_mode,
            ..Default::default()
        }
    }

    pub fn compaction_config(&self) -> CompactionConfig {
        CompactionConfig {
            max_running: self.max_running_compactions,
            ratio_ceiling: self.compaction_ratio_ceiling,
        }
    }
}

impl fmt::Debug for TableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableOptions")
            .field("compare", &self.compare.is_some())
            .field("simplify", &self.simplify.is_some())
            .field("is_stable", &self.is_stable.is_some())
            .field("max_memtable_entries", &self.max_memtable_entries)
            .field("max_memtable_bytes", &self.max_memtable_bytes)
            .field("max_running_compactions", &self.max_running_compactions)
            .field("compaction_ratio_ceiling", &self.compaction_ratio_ceiling)
            .field("journal_reset_period", &self.journal_reset_period)
            .field("compaction_slice_steps", &self.compaction_slice_steps)
            .field("query_order", &self.query_order)
            .field("sync_mode", &self.sync_mode)
            .field("backend", &self.backend.name())
            .field("open_mode", &self.open_mode)
            .field("fixed_key_len", &self.fixed_key_len)
            .field("fixed_value_len", &self.fixed_value_len)
            .finish()
    }
}
