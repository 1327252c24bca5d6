//! # mergetable storage engine
//!
//! ## Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of mergetable.**
//!
//! Users should depend on the main `mergetable` crate instead, which
//! provides the stable public API. This crate's API may change without
//! notice between minor versions.
//!
//! ---
//!
//! This crate provides the storage engine, a log-structured merge design
//! in which compaction never blocks:
//!
//! - **Memtable**: in-memory write buffer, merging duplicate keys on insert
//! - **Segments**: immutable sorted runs on disk, each covering a range of
//!   write sequence numbers, in a pluggable file format
//! - **Compaction**: pairwise merges of adjacent segments, advanced a
//!   bounded slice at a time from inside `add`
//! - **Journal**: snapshot of the segment list and running merges plus a
//!   tail of writes since the snapshot
//!
//! ## Architecture
//!
//! ```text
//! add → Journal tail
//!     → Memtable ──flush──▶ [S0 | S1 | S2 | ... ]  (oldest → newest)
//!                              └─merge─┘
//! ```
//!
//! There is no background thread. All work happens synchronously inside
//! the engine's methods, so a single mutex around an [`Engine`] is all the
//! synchronization it needs.

use mergetable_core::{Error, Result, SegmentId, Simplified, ValueOps};
use mergetable_journal::record::check_record_size;
use mergetable_journal::{Journal, JournalSnapshot};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub mod backend;
pub mod compaction;
pub mod lock;
pub mod memtable;
pub mod options;
pub mod recovery;
pub mod segment;

pub use backend::{BlockBackend, BlockCompression, SegmentBackend, TreeBackend};
pub use compaction::{CompactionConfig, CompactionStats, Scheduler};
pub use lock::DirLock;
pub use memtable::{InsertOutcome, Memtable};
pub use options::{OpenMode, QueryOrder, TableOptions};
pub use segment::{Segment, SegmentList};

use backend::BuildHints;
use compaction::CompletedCompaction;

/// Storage engine of one table directory
///
/// Not thread-safe on its own; wrap it in a mutex to share it.
pub struct Engine {
    /// Table directory
    dir: PathBuf,
    options: TableOptions,
    ops: ValueOps,
    memtable: Memtable,
    segments: SegmentList,
    scheduler: Scheduler,
    /// `None` while the journal tail is being replayed
    journal: Option<Journal>,
    /// Superseded segments the current journal snapshot still names
    pending_deletion: Vec<Arc<Segment>>,
    /// Writes accepted so far
    write_seq: u64,
    next_segment_id: SegmentId,
    flushes_since_reset: u64,
    flushes: u64,
    /// Set when a mutation failed part way; memory no longer matches disk
    poisoned: bool,
    _lock: DirLock,
}

impl Engine {
    /// Open the table in `path`, creating or recovering it per `options.open_mode`
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Self> {
        options.validate()?;
        let dir = path.as_ref().to_path_buf();

        let exists = Journal::exists(&dir);
        match options.open_mode {
            OpenMode::CreateNew if exists => return Err(Error::AlreadyExists(dir)),
            OpenMode::Existing if !exists => return Err(Error::NotFound(dir)),
            _ => {}
        }

        std::fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;

        let ops = options.value_ops();
        let mut engine = Self {
            memtable: Memtable::new(ops.comparator().clone()),
            segments: SegmentList::new(),
            scheduler: Scheduler::new(options.compaction_config()),
            journal: None,
            pending_deletion: Vec::new(),
            write_seq: 0,
            next_segment_id: 0,
            flushes_since_reset: 0,
            flushes: 0,
            poisoned: false,
            _lock: lock,
            dir,
            options,
            ops,
        };

        if exists {
            engine.recover()?;
        } else {
            let snapshot = JournalSnapshot {
                backend: engine.options.backend.name().to_string(),
                ..Default::default()
            };
            recovery::remove_orphans(&engine.dir, &snapshot)?;
            engine.journal = Some(Journal::create(&engine.dir, engine.options.journal_config(), &snapshot)?);
            info!(dir = %engine.dir.display(), backend = engine.options.backend.name(), "Created table");
        }

        Ok(engine)
    }

    /// Rebuild state from the journal: snapshot first, then the tail
    fn recover(&mut self) -> Result<()> {
        let (journal, snapshot, records) = Journal::open(&self.dir, self.options.journal_config())?;

        recovery::check_backend(&snapshot, self.options.backend.as_ref())?;
        recovery::validate_snapshot(&snapshot)?;
        let orphans = recovery::remove_orphans(&self.dir, &snapshot)?;

        let backend = Arc::clone(&self.options.backend);
        self.segments = recovery::open_segments(&self.dir, backend.as_ref(), &snapshot)?;
        recovery::resume_compactions(&self.dir, backend.as_ref(), &snapshot, &self.segments, &mut self.scheduler)?;
        self.write_seq = snapshot.write_seq;
        self.next_segment_id = snapshot.next_segment_id;

        // The journal stays detached while replaying so the tail is not
        // appended to itself.
        for record in &records {
            self.apply(&record.key, &record.value)?;
        }
        self.journal = Some(journal);

        info!(
            dir = %self.dir.display(),
            write_seq = self.write_seq,
            segments = self.segments.len(),
            running = self.scheduler.running_len(),
            replayed = records.len(),
            orphans,
            "Recovered table"
        );
        Ok(())
    }

    /// Table directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    /// Whether an earlier failure left the engine unusable for writes
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn check_writable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::Corrupt(
                "an earlier write failed part way; reopen the table".to_string(),
            ));
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        match self.options.fixed_key_len {
            Some(len) if key.len() != len => Err(Error::InvalidArgument(format!(
                "key is {} bytes, table requires {}",
                key.len(),
                len
            ))),
            _ => Ok(()),
        }
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        match self.options.fixed_value_len {
            Some(len) if value.len() != len => Err(Error::InvalidArgument(format!(
                "value is {} bytes, table requires {}",
                value.len(),
                len
            ))),
            _ => Ok(()),
        }
    }

    /// Record one write
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.check_key(key)?;
        self.check_value(value)?;
        check_record_size(key.len(), value.len())?;

        let result = self.apply(key, value).and_then(|snapshot_due| {
            if snapshot_due {
                // The snapshot covers this write; it must not be in the tail
                self.rotate_journal()
            } else {
                self.append_journal(key, value)
            }
        });
        self.poison_on_error(result)
    }

    fn poison_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// The write path shared by `add` and journal replay.
    ///
    /// Returns true when enough flushes have accumulated that the journal
    /// should be rewritten now, with the memtable empty.
    fn apply(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.write_seq += 1;
        self.memtable.insert(key, value, &self.ops);

        let mut snapshot_due = false;
        if self.memtable_full() {
            self.flush_memtable()?;
            self.flushes_since_reset += 1;
            snapshot_due = self.journal.is_some() && self.flushes_since_reset >= self.options.journal_reset_period;
        }

        self.start_compactions()?;
        self.run_compaction_slice()?;
        Ok(snapshot_due)
    }

    fn memtable_full(&self) -> bool {
        self.memtable.writes() > self.options.max_memtable_entries
            || self.memtable.size_bytes() > self.options.max_memtable_bytes
    }

    fn append_journal(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(key, value),
            None => Ok(()),
        }
    }

    /// Drain the memtable into a new segment covering every write since the
    /// newest segment
    fn flush_memtable(&mut self) -> Result<()> {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let range = self.segments.end()..self.write_seq;

        let hints = BuildHints {
            expected_entries: self.memtable.len() as u64,
        };
        let mut builder = self.options.backend.create(&self.dir, id, hints)?;
        for (key, value) in self.memtable.drain_sorted() {
            builder.feed(&key, &value)?;
        }
        let segment = Segment::new(id, range, builder.finish()?, false);

        debug!(
            id,
            range = ?segment.input_range(),
            entries = segment.entry_count(),
            "Flushed memtable"
        );

        let previous = self.segments.newest().cloned();
        self.segments.append(Arc::clone(&segment));
        if let Some(previous) = previous {
            self.scheduler.offer_pair(&previous, &segment);
        }
        self.flushes += 1;
        Ok(())
    }

    fn start_compactions(&mut self) -> Result<()> {
        self.scheduler.maybe_start(
            &self.segments,
            self.options.backend.as_ref(),
            &self.dir,
            &mut self.next_segment_id,
        )?;
        Ok(())
    }

    /// Advance the head running merge and install its output if it finished
    fn run_compaction_slice(&mut self) -> Result<()> {
        let Some(done) = self
            .scheduler
            .run_slice(self.options.compaction_slice_steps, &self.ops)?
        else {
            return Ok(());
        };
        let CompletedCompaction { older, newer, output } = done;

        let index = self.segments.replace_pair(older.id(), newer.id(), Arc::clone(&output));
        info!(
            older = older.id(),
            newer = newer.id(),
            output = output.id(),
            range = ?output.input_range(),
            entries = output.entry_count(),
            "Compaction finished"
        );
        self.release(older);
        self.release(newer);

        let (before, after) = self.segments.neighbors(index);
        let (before, after) = (before.cloned(), after.cloned());
        if let Some(before) = before {
            self.scheduler.offer_pair(&before, &output);
        }
        if let Some(after) = after {
            self.scheduler.offer_pair(&output, &after);
        }
        Ok(())
    }

    /// Give up a superseded segment. Files the journal snapshot names stay
    /// until the next rotation.
    fn release(&mut self, segment: Arc<Segment>) {
        if segment.is_journaled() {
            self.pending_deletion.push(segment);
        } else {
            segment.mark_obsolete();
        }
    }

    /// Write a fresh journal snapshot and start an empty tail.
    ///
    /// Only valid while the memtable is empty.
    fn rotate_journal(&mut self) -> Result<()> {
        assert!(self.memtable.is_empty(), "journal rotation with unflushed writes");
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };

        for segment in self.segments.iter() {
            segment.mark_journaled();
        }
        let snapshot = JournalSnapshot {
            write_seq: self.write_seq,
            next_segment_id: self.next_segment_id,
            segments: self.segments.entries(),
            tasks: self.scheduler.checkpoint_tasks()?,
            backend: self.options.backend.name().to_string(),
        };
        journal.snapshot_and_reset(&snapshot)?;

        for segment in self.pending_deletion.drain(..) {
            segment.mark_obsolete();
        }
        self.flushes_since_reset = 0;
        Ok(())
    }

    /// Look up the reconciled value of `key` across every layer
    pub fn query(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;

        let value = match self.options.query_order {
            QueryOrder::NewestFirst => self.query_newest_first(key)?,
            QueryOrder::OldestFirst => self.query_oldest_first(key)?,
        };

        Ok(value.and_then(|v| match self.ops.simplify(key, &v) {
            Simplified::Keep => Some(v),
            Simplified::Replace(replacement) => Some(replacement),
            Simplified::Drop => None,
        }))
    }

    fn query_newest_first(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let comparator = self.ops.comparator();
        let mut acc = self.memtable.get(key).map(|v| v.to_vec());

        for segment in self.segments.iter().rev() {
            if let Some(v) = &acc {
                if self.ops.is_stable(key, v) {
                    return Ok(acc);
                }
            }
            let Some(older) = segment.file().query(key, comparator)? else {
                continue;
            };
            acc = match acc {
                None => Some(older),
                Some(newer) => self.ops.resolve(key, &older, &newer),
            };
        }
        Ok(acc)
    }

    fn query_oldest_first(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let comparator = self.ops.comparator();
        let mut acc: Option<Vec<u8>> = None;

        for segment in self.segments.iter() {
            if let Some(newer) = segment.file().query(key, comparator)? {
                acc = self.fold_newer(key, acc, &newer);
            }
        }
        if let Some(newer) = self.memtable.get(key) {
            acc = self.fold_newer(key, acc, newer);
        }
        Ok(acc)
    }

    fn fold_newer(&self, key: &[u8], acc: Option<Vec<u8>>, newer: &[u8]) -> Option<Vec<u8>> {
        match acc {
            None => Some(newer.to_vec()),
            Some(older) => self.ops.resolve(key, &older, newer),
        }
    }

    /// Force unflushed writes into a segment and rewrite the journal
    pub fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        let result = self.flush_inner();
        self.poison_on_error(result)
    }

    fn flush_inner(&mut self) -> Result<()> {
        // Flush even when merges emptied the memtable, so the segment ranges
        // reach write_seq.
        if self.write_seq > self.segments.end() {
            self.flush_memtable()?;
        }
        self.start_compactions()?;
        self.rotate_journal()
    }

    /// Make every accepted write durable
    pub fn sync(&mut self) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    /// Flush, sync and release the table
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        if let Some(journal) = self.journal.take() {
            journal.close()?;
        }
        info!(dir = %self.dir.display(), write_seq = self.write_seq, "Closed table");
        Ok(())
    }

    /// Get table statistics
    pub fn stats(&self) -> TableStats {
        TableStats {
            write_seq: self.write_seq,
            memtable_entries: self.memtable.len(),
            memtable_bytes: self.memtable.size_bytes(),
            memtable_writes: self.memtable.writes(),
            segments: self
                .segments
                .iter()
                .map(|s| SegmentSummary {
                    id: s.id(),
                    input_range: s.input_range(),
                    entries: s.entry_count(),
                    file_size: s.file().file_size(),
                })
                .collect(),
            running_compactions: self.scheduler.running_len(),
            unstarted_compactions: self.scheduler.unstarted_len(),
            pending_deletion: self.pending_deletion.len(),
            flushes: self.flushes,
            compaction: self.scheduler.stats().clone(),
            journal_rotations: self.journal.as_ref().map(|j| j.rotations()).unwrap_or(0),
        }
    }
}

/// One segment as reported by [`Engine::stats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub id: SegmentId,
    /// Write sequence numbers the segment derives from
    pub input_range: Range<u64>,
    pub entries: u64,
    pub file_size: u64,
}

/// Table statistics
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    /// Writes accepted so far
    pub write_seq: u64,
    /// Distinct keys in the memtable
    pub memtable_entries: usize,
    /// Approximate memtable size in bytes
    pub memtable_bytes: u64,
    /// Writes absorbed by the memtable since the last flush
    pub memtable_writes: u64,
    /// Segments, oldest first
    pub segments: Vec<SegmentSummary>,
    pub running_compactions: usize,
    pub unstarted_compactions: usize,
    /// Superseded segments awaiting the next journal rotation
    pub pending_deletion: usize,
    /// Memtable flushes since open
    pub flushes: u64,
    /// Compaction statistics
    pub compaction: CompactionStats,
    /// Journal rotations since open
    pub journal_rotations: u64,
}

impl TableStats {
    /// Whether the segment ranges tile `[0, end)` without gaps
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 0;
        for segment in &self.segments {
            if segment.input_range.start != expected {
                return false;
            }
            expected = segment.input_range.end;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergetable_core::{MergeOutcome, Simplified};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn small(entries: u64) -> TableOptions {
        TableOptions::default().with_max_memtable_entries(entries)
    }

    #[test]
    fn test_engine_basic() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), TableOptions::default()).unwrap();

        engine.add(b"key1", b"value1").unwrap();
        engine.add(b"key2", b"value2").unwrap();

        assert_eq!(engine.query(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(engine.query(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(engine.query(b"key3").unwrap(), None);
    }

    #[test]
    fn test_flush_on_third_write() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), small(2)).unwrap();

        engine.add(b"a", b"1").unwrap();
        engine.add(b"b", b"1").unwrap();
        assert!(engine.stats().segments.is_empty());

        engine.add(b"a", b"2").unwrap();
        let stats = engine.stats();
        assert_eq!(stats.segments.len(), 1);
        assert_eq!(stats.segments[0].input_range, 0..3);
        assert_eq!(stats.segments[0].entries, 2);
        assert_eq!(stats.memtable_entries, 0);

        assert_eq!(engine.query(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.query(b"b").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.query(b"c").unwrap(), None);
    }

    #[test]
    fn test_segments_stay_contiguous() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), small(3).with_journal_reset_period(2)).unwrap();

        for i in 0..500u32 {
            let key = format!("key{:03}", (i * 7) % 61);
            engine.add(key.as_bytes(), &i.to_le_bytes()).unwrap();

            let stats = engine.stats();
            assert!(stats.is_contiguous());
            let end = stats.segments.last().map(|s| s.input_range.end).unwrap_or(0);
            assert!(end <= stats.write_seq);
        }

        let stats = engine.stats();
        assert!(stats.compaction.completed > 0);
        assert!(stats.journal_rotations > 0);
    }

    #[test]
    fn test_compaction_keeps_query_results() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), small(4).with_compaction_slice_steps(2)).unwrap();
        let mut expected = BTreeMap::new();

        for i in 0..300u32 {
            let key = format!("k{:02}", i % 37);
            let value = format!("v{}", i);
            engine.add(key.as_bytes(), value.as_bytes()).unwrap();
            expected.insert(key, value);

            if i % 25 == 0 {
                for (k, v) in &expected {
                    assert_eq!(engine.query(k.as_bytes()).unwrap(), Some(v.as_bytes().to_vec()));
                }
            }
        }
        for (k, v) in &expected {
            assert_eq!(engine.query(k.as_bytes()).unwrap(), Some(v.as_bytes().to_vec()));
        }
    }

    #[test]
    fn test_drop_merge_removes_key() {
        let dir = tempdir().unwrap();
        let options = small(2).with_merge(Arc::new(|_k: &[u8], _a: &[u8], _b: &[u8]| MergeOutcome::Drop));
        let mut engine = Engine::open(dir.path(), options).unwrap();

        engine.add(b"a", b"1").unwrap();
        engine.add(b"a", b"2").unwrap();
        assert_eq!(engine.query(b"a").unwrap(), None);

        // Across layers: "x" lands in a segment, the second write in the memtable
        engine.add(b"x", b"1").unwrap();
        engine.add(b"y", b"1").unwrap();
        engine.add(b"x", b"2").unwrap();
        assert_eq!(engine.query(b"x").unwrap(), None);
        assert_eq!(engine.query(b"y").unwrap(), Some(b"1".to_vec()));
    }

    fn counter_options() -> TableOptions {
        small(3).with_merge(Arc::new(|_k: &[u8], a: &[u8], b: &[u8]| {
            let sum = u64::from_le_bytes(a.try_into().unwrap()) + u64::from_le_bytes(b.try_into().unwrap());
            MergeOutcome::Replace(sum.to_le_bytes().to_vec())
        }))
    }

    #[test]
    fn test_counter_merge_query_orders_agree() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let mut newest = Engine::open(dir_a.path(), counter_options()).unwrap();
        let mut oldest =
            Engine::open(dir_b.path(), counter_options().with_query_order(QueryOrder::OldestFirst)).unwrap();

        for i in 0..100u64 {
            let key = [b'k', (i % 5) as u8];
            newest.add(&key, &i.to_le_bytes()).unwrap();
            oldest.add(&key, &i.to_le_bytes()).unwrap();
        }

        for k in 0..5u64 {
            let key = [b'k', k as u8];
            let total: u64 = (0..100u64).filter(|i| i % 5 == k).sum();
            assert_eq!(newest.query(&key).unwrap(), Some(total.to_le_bytes().to_vec()));
            assert_eq!(oldest.query(&key).unwrap(), Some(total.to_le_bytes().to_vec()));
        }
    }

    #[test]
    fn test_stable_value_stops_lookup() {
        let dir = tempdir().unwrap();
        // "final" values win over anything older and are reported stable
        let options = small(1)
            .with_merge(Arc::new(|_k: &[u8], a: &[u8], b: &[u8]| {
                if a == b"final" {
                    MergeOutcome::KeepOld
                } else {
                    MergeOutcome::KeepNew
                }
            }))
            .with_stable(Arc::new(|_k: &[u8], v: &[u8]| v == b"final"));
        let mut engine = Engine::open(dir.path(), options).unwrap();

        engine.add(b"a", b"1").unwrap();
        engine.add(b"a", b"final").unwrap();
        engine.add(b"a", b"3").unwrap();
        engine.add(b"a", b"4").unwrap();
        assert_eq!(engine.query(b"a").unwrap(), Some(b"final".to_vec()));
    }

    #[test]
    fn test_simplify_applies_to_query_results() {
        let dir = tempdir().unwrap();
        let options = small(2).with_simplify(Arc::new(|_k: &[u8], v: &[u8]| {
            if v.is_empty() {
                Simplified::Drop
            } else {
                Simplified::Keep
            }
        }));
        let mut engine = Engine::open(dir.path(), options).unwrap();

        engine.add(b"a", b"1").unwrap();
        engine.add(b"a", b"").unwrap();
        engine.add(b"b", b"1").unwrap();
        assert_eq!(engine.query(b"a").unwrap(), None);
        assert_eq!(engine.query(b"b").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_recovery_after_crash() {
        let dir = tempdir().unwrap();
        let options = || small(5).with_journal_reset_period(3);

        {
            let mut engine = Engine::open(dir.path(), options()).unwrap();
            for i in 0..97u32 {
                let key = format!("key{:02}", i % 23);
                engine.add(key.as_bytes(), format!("v{}", i).as_bytes()).unwrap();
            }
            // Dropped without close
        }

        let engine = Engine::open(dir.path(), options()).unwrap();
        assert_eq!(engine.stats().write_seq, 97);
        assert!(engine.stats().is_contiguous());
        for k in 0..23u32 {
            let last = (0..97u32).filter(|i| i % 23 == k).max().unwrap();
            let key = format!("key{:02}", k);
            assert_eq!(engine.query(key.as_bytes()).unwrap(), Some(format!("v{}", last).into_bytes()));
        }
    }

    #[test]
    fn test_explicit_flush_and_close() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), TableOptions::default()).unwrap();
        engine.add(b"a", b"1").unwrap();
        engine.flush().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.segments.len(), 1);
        assert_eq!(stats.journal_rotations, 1);

        // Nothing new to flush: no empty segment
        engine.flush().unwrap();
        assert_eq!(engine.stats().segments.len(), 1);
        engine.close().unwrap();

        let engine = Engine::open(dir.path(), TableOptions::default()).unwrap();
        assert_eq!(engine.query(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_fixed_lengths() {
        let dir = tempdir().unwrap();
        let options = TableOptions::default().with_fixed_key_len(2).with_fixed_value_len(1);
        let mut engine = Engine::open(dir.path(), options).unwrap();

        engine.add(b"ab", b"1").unwrap();
        assert!(matches!(engine.add(b"abc", b"1"), Err(Error::InvalidArgument(_))));
        assert!(matches!(engine.add(b"ab", b"12"), Err(Error::InvalidArgument(_))));
        assert!(matches!(engine.query(b"a"), Err(Error::InvalidArgument(_))));

        // Rejected writes do not poison the engine
        assert!(!engine.is_poisoned());
        assert_eq!(engine.stats().write_seq, 1);
    }

    #[test]
    fn test_open_modes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table");

        let err = Engine::open(&path, TableOptions::default().with_open_mode(OpenMode::Existing)).err();
        assert!(matches!(err, Some(Error::NotFound(_))));

        let engine = Engine::open(&path, TableOptions::default().with_open_mode(OpenMode::CreateNew)).unwrap();
        drop(engine);

        let err = Engine::open(&path, TableOptions::default().with_open_mode(OpenMode::CreateNew)).err();
        assert!(matches!(err, Some(Error::AlreadyExists(_))));

        Engine::open(&path, TableOptions::default().with_open_mode(OpenMode::Existing)).unwrap();
    }

    #[test]
    fn test_tree_backend_table() {
        let dir = tempdir().unwrap();
        let options = small(4).with_backend(Arc::new(TreeBackend::with_fanout(4)));
        let mut engine = Engine::open(dir.path(), options).unwrap();

        for i in 0..200u32 {
            engine.add(format!("key{:03}", i).as_bytes(), b"x").unwrap();
        }
        for i in (0..200u32).step_by(13) {
            assert_eq!(engine.query(format!("key{:03}", i).as_bytes()).unwrap(), Some(b"x".to_vec()));
        }
        assert!(std::fs::read_dir(dir.path())
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().ends_with(".btr")));
    }
}
