//! Value reconciliation
//!
//! Keys and values are uninterpreted bytes. The application decides what
//! happens when two values meet for the same key (a merge function), how
//! keys are ordered (a comparator), and optionally how a value may be
//! rewritten once nothing older can exist (a simplify function).
//!
//! The same merge function is used when a write lands on a key already in
//! the memtable, when compaction meets a key in both inputs, and when a
//! query folds the layers that hold a key.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Result of combining an older value `A` with a newer value `B`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Keep the older value `A`
    KeepOld,
    /// Keep the newer value `B`
    KeepNew,
    /// Replace both with a new value
    Replace(Vec<u8>),
    /// Delete the key entirely.
    ///
    /// The key reads as absent until a later write, and an older value
    /// still in another layer is folded in as if the dropped pair had
    /// never existed.
    Drop,
}

/// Result of simplifying a value at the oldest layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Simplified {
    /// Write the value unchanged
    Keep,
    /// Write a rewritten value
    Replace(Vec<u8>),
    /// Do not write the key at all
    Drop,
}

/// `merge(key, older, newer)`
///
/// Writes to a key are combined in whatever grouping the flushes and
/// compactions happen to produce: `(A, B)` may meet in the memtable while
/// `C` is folded in later, or `B` and `C` may meet first in a compaction.
/// Results are only independent of that timing when the function is
/// associative, treating `Drop` as the identity value. Last-write-wins,
/// counters that drop at zero and appends all qualify; a function that
/// drops on some pairs but not on their combination with a third value
/// does not.
pub type MergeFn = Arc<dyn Fn(&[u8], &[u8], &[u8]) -> MergeOutcome + Send + Sync>;

/// Total order over keys.
pub type CompareFn = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// `simplify(key, value)`, applied only where no older value can exist.
pub type SimplifyFn = Arc<dyn Fn(&[u8], &[u8]) -> Simplified + Send + Sync>;

/// `is_stable(key, value)`: true when no older value could change the result.
pub type StableFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Merge function that always keeps the newest write.
pub fn last_write_wins() -> MergeFn {
    Arc::new(|_key: &[u8], _old: &[u8], _new: &[u8]| MergeOutcome::KeepNew)
}

/// Key ordering, raw byte order unless a custom function is installed.
#[derive(Clone, Default)]
pub struct Comparator {
    custom: Option<CompareFn>,
}

impl Comparator {
    /// Raw lexicographic byte order
    pub fn bytewise() -> Self {
        Self { custom: None }
    }

    /// Caller-supplied order
    pub fn custom(compare: CompareFn) -> Self {
        Self {
            custom: Some(compare),
        }
    }

    /// Compare two keys
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match &self.custom {
            Some(f) => f(a, b),
            None => a.cmp(b),
        }
    }

    /// True when keys are ordered by raw bytes
    pub fn is_bytewise(&self) -> bool {
        self.custom.is_none()
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bytewise() {
            write!(f, "Comparator::Bytewise")
        } else {
            write!(f, "Comparator::Custom")
        }
    }
}

/// The bundle of application callbacks every layer of the engine consults.
#[derive(Clone)]
pub struct ValueOps {
    merge: MergeFn,
    comparator: Comparator,
    simplify: Option<SimplifyFn>,
    is_stable: Option<StableFn>,
}

impl ValueOps {
    /// Create with a merge function, bytewise keys, no simplify and no
    /// stability predicate.
    pub fn new(merge: MergeFn) -> Self {
        Self {
            merge,
            comparator: Comparator::bytewise(),
            simplify: None,
            is_stable: None,
        }
    }

    /// Install a key comparator
    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    /// Install a simplify function
    pub fn with_simplify(mut self, simplify: Option<SimplifyFn>) -> Self {
        self.simplify = simplify;
        self
    }

    /// Install a stability predicate
    pub fn with_stable(mut self, is_stable: Option<StableFn>) -> Self {
        self.is_stable = is_stable;
        self
    }

    /// The key comparator
    pub fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    /// Compare two keys
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }

    /// Combine an older and a newer value for `key`
    #[inline]
    pub fn merge(&self, key: &[u8], older: &[u8], newer: &[u8]) -> MergeOutcome {
        (self.merge)(key, older, newer)
    }

    /// Combine two values and return the survivor, `None` when dropped.
    pub fn resolve(&self, key: &[u8], older: &[u8], newer: &[u8]) -> Option<Vec<u8>> {
        match self.merge(key, older, newer) {
            MergeOutcome::KeepOld => Some(older.to_vec()),
            MergeOutcome::KeepNew => Some(newer.to_vec()),
            MergeOutcome::Replace(v) => Some(v),
            MergeOutcome::Drop => None,
        }
    }

    /// Whether a simplify function is installed
    pub fn has_simplify(&self) -> bool {
        self.simplify.is_some()
    }

    /// Simplify a value; `Keep` when no function is installed
    pub fn simplify(&self, key: &[u8], value: &[u8]) -> Simplified {
        match &self.simplify {
            Some(f) => f(key, value),
            None => Simplified::Keep,
        }
    }

    /// Whether `value` is final for `key`; false when no predicate is installed
    pub fn is_stable(&self, key: &[u8], value: &[u8]) -> bool {
        match &self.is_stable {
            Some(f) => f(key, value),
            None => false,
        }
    }
}

impl Default for ValueOps {
    fn default() -> Self {
        Self::new(last_write_wins())
    }
}

impl fmt::Debug for ValueOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueOps")
            .field("comparator", &self.comparator)
            .field("simplify", &self.simplify.is_some())
            .field("is_stable", &self.is_stable.is_some())
            .finish()
    }
}
