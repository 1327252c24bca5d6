//! Memtable - In-memory sorted write buffer
//!
//! The memtable holds the writes that have not been flushed to a segment
//! yet. It keeps at most one value per key: a write that lands on a key
//! already present is reconciled with the table's merge function on the
//! spot. Keys are ordered by the table's comparator, so draining it yields
//! exactly the order a segment must be built in.

use mergetable_core::{Comparator, MergeOutcome, ValueOps};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// What `insert` did with a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was absent and is now present
    Inserted,
    /// The key was present; the old value was kept
    KeptOld,
    /// The key was present; the new value replaced it
    KeptNew,
    /// The key was present; both values were replaced by a merged one
    Replaced,
    /// The key was present; the merge deleted it
    Dropped,
}

/// Key wrapper ordering raw bytes by the table's comparator
#[derive(Clone)]
struct MemKey {
    bytes: Vec<u8>,
    comparator: Comparator,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(&self.bytes, &other.bytes)
    }
}

/// Memtable - an in-memory sorted write buffer
pub struct Memtable {
    data: BTreeMap<MemKey, Vec<u8>>,
    comparator: Comparator,
    /// Approximate size in bytes (for flush threshold checking)
    size_bytes: u64,
    /// Writes absorbed since the last drain, merged ones included
    writes: u64,
}

impl Memtable {
    /// Creates a new empty memtable ordered by `comparator`
    pub fn new(comparator: Comparator) -> Self {
        Self {
            data: BTreeMap::new(),
            comparator,
            size_bytes: 0,
            writes: 0,
        }
    }

    fn lookup(&self, key: &[u8]) -> MemKey {
        MemKey {
            bytes: key.to_vec(),
            comparator: self.comparator.clone(),
        }
    }

    /// Absorb one write, merging it with any value already held for `key`
    pub fn insert(&mut self, key: &[u8], value: &[u8], ops: &ValueOps) -> InsertOutcome {
        self.writes += 1;
        let lookup = self.lookup(key);

        let Some(old) = self.data.get_mut(&lookup) else {
            self.size_bytes += (key.len() + value.len()) as u64;
            self.data.insert(lookup, value.to_vec());
            return InsertOutcome::Inserted;
        };

        let old_len = old.len() as u64;
        match ops.merge(key, old, value) {
            MergeOutcome::KeepOld => InsertOutcome::KeptOld,
            MergeOutcome::KeepNew => {
                *old = value.to_vec();
                self.size_bytes = self.size_bytes - old_len + value.len() as u64;
                InsertOutcome::KeptNew
            }
            MergeOutcome::Replace(merged) => {
                self.size_bytes = self.size_bytes - old_len + merged.len() as u64;
                *old = merged;
                InsertOutcome::Replaced
            }
            MergeOutcome::Drop => {
                self.data.remove(&lookup);
                self.size_bytes -= key.len() as u64 + old_len;
                InsertOutcome::Dropped
            }
        }
    }

    /// Retrieves the value held for `key`
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(&self.lookup(key)).map(|v| v.as_slice())
    }

    /// Number of distinct keys held
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no key is held
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate size of held keys and values in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Writes absorbed since the last drain
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Iterate held entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.data.iter().map(|(k, v)| (k.bytes.as_slice(), v.as_slice()))
    }

    /// Empty the memtable, yielding its entries in key order
    pub fn drain_sorted(&mut self) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> {
        self.size_bytes = 0;
        self.writes = 0;
        std::mem::take(&mut self.data)
            .into_iter()
            .map(|(k, v)| (k.bytes, v))
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("len", &self.data.len())
            .field("size_bytes", &self.size_bytes)
            .field("writes", &self.writes)
            .finish()
    }
}
