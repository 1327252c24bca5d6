//! Compaction - incremental pairwise merging of adjacent segments
//!
//! Two adjacent segments are merged into one new segment whose range
//! covers both. Merges do not run to completion in one go: a started merge
//! advances by a bounded number of steps at a time, and its reader and
//! builder positions can be checkpointed into the journal and resumed
//! after a restart.
//!
//! The scheduler keeps two collections:
//!
//! - unstarted candidates, one per idle adjacent pair, ordered by the ratio
//!   of their entry counts (lower is more balanced and preferred);
//! - running tasks, ordered by combined input size, smallest first. Only
//!   the head of this list advances, so cheap merges finish first and can
//!   cascade into their neighbors.

use crate::backend::{BuildHints, BuildingFile, SegmentBackend, SegmentReader};
use crate::segment::{Segment, SegmentList};
use mergetable_core::{MergeOutcome, Result, SegmentId, Simplified, ValueOps};
use mergetable_journal::TaskEntry;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Compaction scheduling configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Merges allowed to be in progress at once
    pub max_running: usize,
    /// Candidates at or above this ratio are left waiting
    pub ratio_ceiling: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_running: 2,
            ratio_ceiling: 4.0,
        }
    }
}

/// Statistics for compaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Merges started (resumed ones included)
    pub started: u64,
    /// Merges completed
    pub completed: u64,
    /// Records written to merge outputs
    pub entries_written: u64,
    /// Records eliminated by merging duplicate keys or simplifying
    pub entries_removed: u64,
}

/// Ratio used to rank a candidate pair
pub fn pair_ratio(older_entries: u64, newer_entries: u64) -> f64 {
    // Empty segments merge away for free: rank them first
    if older_entries == 0 || newer_entries == 0 {
        return 0.0;
    }
    older_entries as f64 / newer_entries as f64
}

/// An unstarted merge of an adjacent pair
#[derive(Debug, Clone, Copy)]
struct Candidate {
    ratio: f64,
    older: SegmentId,
    newer: SegmentId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ratio
            .total_cmp(&other.ratio)
            .then(self.older.cmp(&other.older))
            .then(self.newer.cmp(&other.newer))
    }
}

/// Result of a merge that ran to completion
pub struct CompletedCompaction {
    pub older: Arc<Segment>,
    pub newer: Arc<Segment>,
    pub output: Arc<Segment>,
}

/// A started merge of two adjacent segments
pub struct CompactionTask {
    older: Arc<Segment>,
    newer: Arc<Segment>,
    output_id: SegmentId,
    left: Box<dyn SegmentReader>,
    right: Box<dyn SegmentReader>,
    builder: Box<dyn BuildingFile>,
    /// Left input is the oldest segment, so values may be simplified
    simplify: bool,
    /// Named by a durable journal snapshot
    journaled: bool,
    removed: u64,
}

impl CompactionTask {
    /// Start merging `older` and `newer` into a new segment `output_id`
    pub fn start(
        older: Arc<Segment>,
        newer: Arc<Segment>,
        output_id: SegmentId,
        backend: &dyn SegmentBackend,
        dir: &Path,
    ) -> Result<Self> {
        let left = older.file().create_reader()?;
        let right = newer.file().create_reader()?;
        let hints = BuildHints {
            expected_entries: older.entry_count() + newer.entry_count(),
        };
        let builder = backend.create(dir, output_id, hints)?;
        Ok(Self::assemble(older, newer, output_id, left, right, builder, false))
    }

    /// Resume a merge from the state recorded in a journal snapshot
    pub fn resume(
        older: Arc<Segment>,
        newer: Arc<Segment>,
        entry: &TaskEntry,
        backend: &dyn SegmentBackend,
        dir: &Path,
    ) -> Result<Self> {
        let left = older.file().reopen_reader(&entry.left_state)?;
        let right = newer.file().reopen_reader(&entry.right_state)?;
        let builder = backend.open_building(dir, entry.output, &entry.builder_state)?;
        Ok(Self::assemble(older, newer, entry.output, left, right, builder, true))
    }

    fn assemble(
        older: Arc<Segment>,
        newer: Arc<Segment>,
        output_id: SegmentId,
        left: Box<dyn SegmentReader>,
        right: Box<dyn SegmentReader>,
        builder: Box<dyn BuildingFile>,
        journaled: bool,
    ) -> Self {
        let simplify = older.is_oldest();
        Self {
            older,
            newer,
            output_id,
            left,
            right,
            builder,
            simplify,
            journaled,
            removed: 0,
        }
    }

    pub fn older(&self) -> &Arc<Segment> {
        &self.older
    }

    pub fn newer(&self) -> &Arc<Segment> {
        &self.newer
    }

    pub fn output_id(&self) -> SegmentId {
        self.output_id
    }

    /// Combined entry count of both inputs
    pub fn input_entries(&self) -> u64 {
        self.older.entry_count() + self.newer.entry_count()
    }

    /// Records written to the output so far
    pub fn output_entries(&self) -> u64 {
        self.builder.entry_count()
    }

    pub fn is_done(&self) -> bool {
        self.left.is_eof() && self.right.is_eof()
    }

    fn emit(&mut self, key: &[u8], value: &[u8], ops: &ValueOps) -> Result<()> {
        if !self.simplify {
            return self.builder.feed(key, value);
        }
        match ops.simplify(key, value) {
            Simplified::Keep => self.builder.feed(key, value),
            Simplified::Replace(v) => self.builder.feed(key, &v),
            Simplified::Drop => {
                self.removed += 1;
                Ok(())
            }
        }
    }

    /// Run one step of the merge: emit or reconcile the smallest head key
    fn step(&mut self, ops: &ValueOps) -> Result<()> {
        let order = match (self.left.entry(), self.right.entry()) {
            (None, None) => return Ok(()),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((lk, _)), Some((rk, _))) => ops.compare(lk, rk),
        };

        match order {
            Ordering::Less => {
                let (k, v) = owned(self.left.entry());
                self.emit(&k, &v, ops)?;
                self.left.advance()?;
            }
            Ordering::Greater => {
                let (k, v) = owned(self.right.entry());
                self.emit(&k, &v, ops)?;
                self.right.advance()?;
            }
            Ordering::Equal => {
                let (k, old) = owned(self.left.entry());
                let (_, new) = owned(self.right.entry());
                match ops.merge(&k, &old, &new) {
                    MergeOutcome::KeepOld => self.emit(&k, &old, ops)?,
                    MergeOutcome::KeepNew => self.emit(&k, &new, ops)?,
                    MergeOutcome::Replace(v) => self.emit(&k, &v, ops)?,
                    MergeOutcome::Drop => self.removed += 1,
                }
                self.removed += 1;
                self.left.advance()?;
                self.right.advance()?;
            }
        }
        Ok(())
    }

    /// Advance by at most `max_steps`; returns true once both inputs are
    /// exhausted
    pub fn run(&mut self, max_steps: usize, ops: &ValueOps) -> Result<bool> {
        for _ in 0..max_steps {
            if self.is_done() {
                break;
            }
            self.step(ops)?;
        }
        Ok(self.is_done())
    }

    /// Resumable state for a journal snapshot.
    ///
    /// Once recorded, the task's output must outlive the snapshot.
    pub fn checkpoint(&mut self) -> Result<TaskEntry> {
        let entry = TaskEntry {
            older: self.older.id(),
            newer: self.newer.id(),
            output: self.output_id,
            left_state: self.left.checkpoint()?,
            right_state: self.right.checkpoint()?,
            builder_state: self.builder.checkpoint()?,
        };
        self.journaled = true;
        Ok(entry)
    }

    /// Finish the output file of a completed merge
    fn finish(self) -> Result<CompletedCompaction> {
        assert!(self.is_done(), "finishing an incomplete compaction");
        let range = self.older.input_range().start..self.newer.input_range().end;
        let file = self.builder.finish()?;
        let output = Segment::new(self.output_id, range, file, self.journaled);
        Ok(CompletedCompaction {
            older: self.older,
            newer: self.newer,
            output,
        })
    }
}

// Readers lend their head entry; steps that feed the builder need it owned.
fn owned(entry: Option<(&[u8], &[u8])>) -> (Vec<u8>, Vec<u8>) {
    match entry {
        Some((k, v)) => (k.to_vec(), v.to_vec()),
        None => unreachable!("merge step on an exhausted reader"),
    }
}

/// Compaction scheduler
pub struct Scheduler {
    config: CompactionConfig,
    unstarted: BTreeSet<Candidate>,
    /// Pairs with an unstarted candidate
    pairs: HashSet<(SegmentId, SegmentId)>,
    running: Vec<CompactionTask>,
    /// Segments that are inputs of a running task
    busy: HashSet<SegmentId>,
    stats: CompactionStats,
}

impl Scheduler {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            unstarted: BTreeSet::new(),
            pairs: HashSet::new(),
            running: Vec::new(),
            busy: HashSet::new(),
            stats: CompactionStats::default(),
        }
    }

    pub fn unstarted_len(&self) -> usize {
        self.unstarted.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn running(&self) -> &[CompactionTask] {
        &self.running
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    pub fn is_busy(&self, id: SegmentId) -> bool {
        self.busy.contains(&id)
    }

    pub fn has_candidate(&self, older: SegmentId, newer: SegmentId) -> bool {
        self.pairs.contains(&(older, newer))
    }

    /// Register an adjacent pair as a merge candidate.
    ///
    /// Pairs touching a running merge, or already registered, are ignored.
    pub fn offer_pair(&mut self, older: &Segment, newer: &Segment) {
        if self.busy.contains(&older.id()) || self.busy.contains(&newer.id()) {
            return;
        }
        if !self.pairs.insert((older.id(), newer.id())) {
            return;
        }
        let candidate = Candidate {
            ratio: pair_ratio(older.entry_count(), newer.entry_count()),
            older: older.id(),
            newer: newer.id(),
        };
        debug!(older = candidate.older, newer = candidate.newer, ratio = candidate.ratio, "Offered compaction pair");
        self.unstarted.insert(candidate);
    }

    /// Offer every idle adjacent pair of `list`
    pub fn rebuild_candidates(&mut self, list: &SegmentList) {
        let segments: Vec<&Arc<Segment>> = list.iter().collect();
        for pair in segments.windows(2) {
            self.offer_pair(pair[0], pair[1]);
        }
    }

    fn cancel_touching(&mut self, id: SegmentId) {
        let doomed: Vec<Candidate> = self
            .unstarted
            .iter()
            .filter(|c| c.older == id || c.newer == id)
            .copied()
            .collect();
        for candidate in doomed {
            self.unstarted.remove(&candidate);
            self.pairs.remove(&(candidate.older, candidate.newer));
        }
    }

    fn insert_running(&mut self, task: CompactionTask) {
        let older = task.older.id();
        let newer = task.newer.id();
        assert!(
            self.busy.insert(older) && self.busy.insert(newer),
            "segment already in a running compaction ({}, {})",
            older,
            newer
        );
        self.cancel_touching(older);
        self.cancel_touching(newer);

        let size = task.input_entries();
        let at = self.running.partition_point(|t| t.input_entries() <= size);
        self.running.insert(at, task);
        self.stats.started += 1;
    }

    /// Promote the best candidates while the budget allows and their ratio
    /// is under the ceiling. Returns how many merges were started.
    pub fn maybe_start(
        &mut self,
        list: &SegmentList,
        backend: &dyn SegmentBackend,
        dir: &Path,
        next_segment_id: &mut SegmentId,
    ) -> Result<usize> {
        let mut started = 0;
        while self.running.len() < self.config.max_running {
            let Some(best) = self.unstarted.first().copied() else {
                break;
            };
            if best.ratio >= self.config.ratio_ceiling {
                break;
            }

            let (Some(older), Some(newer)) = (list.get(best.older), list.get(best.newer)) else {
                panic!("candidate ({}, {}) names a segment outside the list", best.older, best.newer);
            };

            let output_id = *next_segment_id;
            let task = CompactionTask::start(Arc::clone(older), Arc::clone(newer), output_id, backend, dir)?;
            *next_segment_id += 1;

            debug!(
                older = best.older,
                newer = best.newer,
                output = output_id,
                ratio = best.ratio,
                entries = task.input_entries(),
                "Started compaction"
            );
            self.insert_running(task);
            started += 1;
        }
        Ok(started)
    }

    /// Re-register a merge recovered from a journal snapshot
    pub fn resume(&mut self, task: CompactionTask) {
        self.insert_running(task);
    }

    /// Advance the head running merge by at most `max_steps`.
    ///
    /// Returns the finished merge when it completes; the caller must put
    /// the output into the segment list in place of the inputs.
    pub fn run_slice(&mut self, max_steps: usize, ops: &ValueOps) -> Result<Option<CompletedCompaction>> {
        let Some(head) = self.running.first_mut() else {
            return Ok(None);
        };
        if !head.run(max_steps, ops)? {
            return Ok(None);
        }

        let task = self.running.remove(0);
        self.busy.remove(&task.older.id());
        self.busy.remove(&task.newer.id());
        self.stats.entries_removed += task.removed;

        let done = task.finish()?;
        self.stats.completed += 1;
        self.stats.entries_written += done.output.entry_count();
        Ok(Some(done))
    }

    /// Checkpoint every running merge, in running order
    pub fn checkpoint_tasks(&mut self) -> Result<Vec<TaskEntry>> {
        self.running.iter_mut().map(|t| t.checkpoint()).collect()
    }
}
