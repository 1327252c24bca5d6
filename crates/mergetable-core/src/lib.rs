//! # mergetable core
//!
//! Core types shared by every mergetable crate: the error type, on-disk
//! format constants, and the value-reconciliation vocabulary used by the
//! memtable, compaction and the read path.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format_version;
pub mod merge;

pub use error::{Error, Result};
pub use merge::{
    last_write_wins, CompareFn, Comparator, MergeFn, MergeOutcome, SimplifyFn, Simplified,
    StableFn, ValueOps,
};

/// Identifier of one segment file; monotonically assigned per table.
pub type SegmentId = u64;
