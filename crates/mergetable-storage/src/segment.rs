//! Segments and the segment list
//!
//! A segment is one immutable sorted run on disk plus the half-open range
//! of write sequence numbers its data was derived from. The segment list
//! orders segments oldest to newest, and their ranges always tile
//! `[0, end)` with no gap or overlap.
//!
//! Segments are shared (`Arc`) between the list, running compactions and
//! the set of superseded segments the last journal snapshot still names.
//! The file is erased when the last handle drops, but only if the segment
//! was marked obsolete first.

use crate::backend::SegmentFile;
use mergetable_core::{Error, Result, SegmentId};
use mergetable_journal::SegmentEntry;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// One immutable segment
pub struct Segment {
    id: SegmentId,
    range: Range<u64>,
    file: Box<dyn SegmentFile>,
    /// Named by a durable journal snapshot
    journaled: AtomicBool,
    /// Erase the file once the last handle drops
    obsolete: AtomicBool,
}

impl Segment {
    pub fn new(id: SegmentId, range: Range<u64>, file: Box<dyn SegmentFile>, journaled: bool) -> Arc<Self> {
        assert!(range.start <= range.end, "inverted segment range {:?}", range);
        Arc::new(Self {
            id,
            range,
            file,
            journaled: AtomicBool::new(journaled),
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Write sequence numbers this segment's data derives from
    pub fn input_range(&self) -> Range<u64> {
        self.range.clone()
    }

    pub fn entry_count(&self) -> u64 {
        self.file.entry_count()
    }

    pub fn file(&self) -> &dyn SegmentFile {
        self.file.as_ref()
    }

    /// No older data can exist below this segment
    pub fn is_oldest(&self) -> bool {
        self.range.start == 0
    }

    pub fn is_journaled(&self) -> bool {
        self.journaled.load(Ordering::Acquire)
    }

    pub fn mark_journaled(&self) {
        self.journaled.store(true, Ordering::Release);
    }

    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Journal snapshot entry for this segment
    pub fn to_entry(&self) -> SegmentEntry {
        SegmentEntry {
            id: self.id,
            first_input_seq: self.range.start,
            input_count: self.range.end - self.range.start,
            entry_count: self.entry_count(),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let erase = self.obsolete.load(Ordering::Acquire);
        if let Err(e) = self.file.destroy(erase) {
            warn!(id = self.id, error = %e, "Failed to delete obsolete segment file");
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("entries", &self.entry_count())
            .finish()
    }
}

/// Ordered, contiguity-checked sequence of segments, oldest first
#[derive(Debug, Default)]
pub struct SegmentList {
    segments: Vec<Arc<Segment>>,
}

impl SegmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// End of the covered write-sequence range (0 when empty)
    pub fn end(&self) -> u64 {
        self.segments.last().map(|s| s.range.end).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Segment>> {
        self.segments.iter()
    }

    pub fn newest(&self) -> Option<&Arc<Segment>> {
        self.segments.last()
    }

    pub fn position(&self, id: SegmentId) -> Option<usize> {
        self.segments.iter().position(|s| s.id == id)
    }

    pub fn get(&self, id: SegmentId) -> Option<&Arc<Segment>> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// Neighbors of the segment at `index`: (older, newer)
    pub fn neighbors(&self, index: usize) -> (Option<&Arc<Segment>>, Option<&Arc<Segment>>) {
        let older = index.checked_sub(1).and_then(|i| self.segments.get(i));
        (older, self.segments.get(index + 1))
    }

    /// Add a segment at the newest end.
    ///
    /// # Panics
    ///
    /// If the segment's range does not start where the list ends.
    pub fn append(&mut self, segment: Arc<Segment>) {
        assert_eq!(
            segment.range.start,
            self.end(),
            "segment {} breaks contiguity: starts at {}, list ends at {}",
            segment.id,
            segment.range.start,
            self.end()
        );
        self.segments.push(segment);
    }

    /// Splice `output` in place of the adjacent pair `older`, `newer`,
    /// returning the index it now occupies.
    ///
    /// # Panics
    ///
    /// If the pair is not adjacent or `output` does not cover exactly
    /// their combined range.
    pub fn replace_pair(&mut self, older: SegmentId, newer: SegmentId, output: Arc<Segment>) -> usize {
        let index = self
            .position(older)
            .unwrap_or_else(|| panic!("segment {} is not in the list", older));
        assert!(
            self.segments.get(index + 1).map(|s| s.id) == Some(newer),
            "segments {} and {} are not adjacent",
            older,
            newer
        );

        let covered = self.segments[index].range.start..self.segments[index + 1].range.end;
        assert_eq!(output.range, covered, "compaction output range mismatch");

        self.segments.splice(index..index + 2, std::iter::once(output));
        index
    }

    /// Whether the ranges tile `[0, end)`
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 0;
        for segment in &self.segments {
            if segment.range.start != expected {
                return false;
            }
            expected = segment.range.end;
        }
        true
    }

    /// Snapshot entries, oldest first
    pub fn entries(&self) -> Vec<SegmentEntry> {
        self.segments.iter().map(|s| s.to_entry()).collect()
    }
}

/// Check that snapshot entries tile `[0, write_seq)` exactly
pub fn validate_contiguity(entries: &[SegmentEntry], write_seq: u64) -> Result<()> {
    let mut expected = 0u64;
    for entry in entries {
        if entry.first_input_seq != expected {
            return Err(Error::Corrupt(format!(
                "segment {:016x} starts at write {}, expected {}",
                entry.id, entry.first_input_seq, expected
            )));
        }
        expected = entry
            .first_input_seq
            .checked_add(entry.input_count)
            .ok_or_else(|| Error::Corrupt(format!("segment {:016x} range overflows", entry.id)))?;
    }

    if expected != write_seq {
        return Err(Error::Corrupt(format!(
            "segments cover writes [0, {}) but the journal is at write {}",
            expected, write_seq
        )));
    }
    Ok(())
}
