//! Recovery - rebuilding the segment list and running compactions from a
//! journal snapshot
//!
//! Order of operations on open:
//!
//! 1. check the configured backend is the one that wrote the segments;
//! 2. validate the snapshot (contiguity, task adjacency, id allocation);
//! 3. delete segment files the snapshot does not name;
//! 4. reopen every named segment and check its entry count;
//! 5. resume every running compaction from its checkpoint.
//!
//! Replaying the journal tail is left to the engine, which feeds it through
//! its ordinary write path.

use crate::backend::{parse_segment_file_name, SegmentBackend};
use crate::compaction::{CompactionTask, Scheduler};
use crate::segment::{validate_contiguity, Segment, SegmentList};
use mergetable_core::{Error, Result, SegmentId};
use mergetable_journal::JournalSnapshot;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Check that a snapshot describes a consistent table
pub fn validate_snapshot(snapshot: &JournalSnapshot) -> Result<()> {
    validate_contiguity(&snapshot.segments, snapshot.write_seq)?;

    let mut ids = HashSet::new();
    for entry in &snapshot.segments {
        if entry.id >= snapshot.next_segment_id {
            return Err(Error::Corrupt(format!(
                "segment id {:016x} not below next id {:016x}",
                entry.id, snapshot.next_segment_id
            )));
        }
        if !ids.insert(entry.id) {
            return Err(Error::Corrupt(format!("segment id {:016x} listed twice", entry.id)));
        }
    }

    let position = |id: SegmentId| snapshot.segments.iter().position(|s| s.id == id);
    let mut inputs = HashSet::new();
    let mut outputs = HashSet::new();
    for task in &snapshot.tasks {
        let adjacent = match (position(task.older), position(task.newer)) {
            (Some(o), Some(n)) => o + 1 == n,
            _ => false,
        };
        if !adjacent {
            return Err(Error::Corrupt(format!(
                "compaction of {:016x} and {:016x} does not name adjacent segments",
                task.older, task.newer
            )));
        }
        if !inputs.insert(task.older) || !inputs.insert(task.newer) {
            return Err(Error::Corrupt(format!(
                "segment in more than one compaction ({:016x}, {:016x})",
                task.older, task.newer
            )));
        }
        if task.output >= snapshot.next_segment_id || ids.contains(&task.output) || !outputs.insert(task.output) {
            return Err(Error::Corrupt(format!(
                "compaction output id {:016x} is not a fresh id",
                task.output
            )));
        }
    }
    Ok(())
}

/// Refuse to open segments written by a different backend
pub fn check_backend(snapshot: &JournalSnapshot, backend: &dyn SegmentBackend) -> Result<()> {
    if snapshot.backend != backend.name() {
        return Err(Error::InvalidArgument(format!(
            "table segments were written by the {:?} backend, options select {:?}",
            snapshot.backend,
            backend.name()
        )));
    }
    Ok(())
}

/// Delete segment files in `dir` that `snapshot` does not reference.
///
/// Returns the number of files removed.
pub fn remove_orphans(dir: &Path, snapshot: &JournalSnapshot) -> Result<usize> {
    let live: HashSet<SegmentId> = snapshot
        .segments
        .iter()
        .map(|s| s.id)
        .chain(snapshot.tasks.iter().map(|t| t.output))
        .collect();

    let mut removed = 0;
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((id, _)) = parse_segment_file_name(name) else {
            continue;
        };
        if live.contains(&id) || !dir_entry.file_type()?.is_file() {
            continue;
        }

        warn!(file = name, "Removing orphaned segment file");
        fs::remove_file(dir_entry.path())?;
        removed += 1;
    }
    Ok(removed)
}

/// Reopen every segment named by `snapshot`, oldest first
pub fn open_segments(dir: &Path, backend: &dyn SegmentBackend, snapshot: &JournalSnapshot) -> Result<SegmentList> {
    let mut list = SegmentList::new();
    for entry in &snapshot.segments {
        let file = backend.open(dir, entry.id)?;
        if file.entry_count() != entry.entry_count {
            return Err(Error::Corrupt(format!(
                "segment {:016x} holds {} entries, journal expects {}",
                entry.id,
                file.entry_count(),
                entry.entry_count
            )));
        }
        debug!(id = entry.id, range = ?entry.input_range(), entries = entry.entry_count, "Reopened segment");
        list.append(Segment::new(entry.id, entry.input_range(), file, true));
    }
    Ok(list)
}

/// Resume the compactions recorded in `snapshot`, then offer every idle
/// adjacent pair
pub fn resume_compactions(
    dir: &Path,
    backend: &dyn SegmentBackend,
    snapshot: &JournalSnapshot,
    list: &SegmentList,
    scheduler: &mut Scheduler,
) -> Result<()> {
    for entry in &snapshot.tasks {
        let (Some(older), Some(newer)) = (list.get(entry.older), list.get(entry.newer)) else {
            return Err(Error::Corrupt(format!(
                "compaction names missing segment ({:016x}, {:016x})",
                entry.older, entry.newer
            )));
        };
        let task = CompactionTask::resume(Arc::clone(older), Arc::clone(newer), entry, backend, dir)?;
        debug!(
            older = entry.older,
            newer = entry.newer,
            output = entry.output,
            progress = task.output_entries(),
            "Resumed compaction"
        );
        scheduler.resume(task);
    }
    scheduler.rebuild_candidates(list);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlockBackend, TreeBackend};
    use crate::compaction::CompactionConfig;
    use crate::segment::tests::make_segment;
    use mergetable_core::ValueOps;
    use mergetable_journal::{SegmentEntry, TaskEntry};
    use tempfile::tempdir;

    fn entry(id: SegmentId, start: u64, count: u64, entries: u64) -> SegmentEntry {
        SegmentEntry {
            id,
            first_input_seq: start,
            input_count: count,
            entry_count: entries,
        }
    }

    fn task(older: SegmentId, newer: SegmentId, output: SegmentId) -> TaskEntry {
        TaskEntry {
            older,
            newer,
            output,
            left_state: Vec::new(),
            right_state: Vec::new(),
            builder_state: Vec::new(),
        }
    }

    fn snapshot(segments: Vec<SegmentEntry>, tasks: Vec<TaskEntry>) -> JournalSnapshot {
        let write_seq = segments.last().map(|s| s.first_input_seq + s.input_count).unwrap_or(0);
        JournalSnapshot {
            write_seq,
            next_segment_id: 10,
            segments,
            tasks,
            backend: "block".to_string(),
        }
    }

    #[test]
    fn test_check_backend() {
        let snap = snapshot(vec![entry(1, 0, 2, 2)], Vec::new());
        check_backend(&snap, &BlockBackend::default()).unwrap();
        assert!(matches!(
            check_backend(&snap, &TreeBackend::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_snapshot() {
        let segments = vec![entry(1, 0, 2, 2), entry(2, 2, 2, 2), entry(3, 4, 1, 1)];
        validate_snapshot(&snapshot(segments.clone(), vec![task(2, 3, 4)])).unwrap();

        // Not adjacent
        assert!(validate_snapshot(&snapshot(segments.clone(), vec![task(1, 3, 4)]))
            .unwrap_err()
            .is_corruption());
        // Segment in two tasks
        assert!(
            validate_snapshot(&snapshot(segments.clone(), vec![task(1, 2, 4), task(2, 3, 5)]))
                .unwrap_err()
                .is_corruption()
        );
        // Output collides with a live segment
        assert!(validate_snapshot(&snapshot(segments.clone(), vec![task(1, 2, 3)]))
            .unwrap_err()
            .is_corruption());
        // Output id never allocated
        assert!(validate_snapshot(&snapshot(segments.clone(), vec![task(1, 2, 12)]))
            .unwrap_err()
            .is_corruption());

        let mut gap = snapshot(segments, Vec::new());
        gap.write_seq += 1;
        assert!(validate_snapshot(&gap).unwrap_err().is_corruption());
    }

    #[test]
    fn test_remove_orphans() {
        let dir = tempdir().unwrap();
        make_segment(dir.path(), 1, 0..1, &[(b"a", b"1")]);
        make_segment(dir.path(), 2, 1..2, &[(b"b", b"1")]);
        make_segment(dir.path(), 7, 2..3, &[(b"c", b"1")]);
        fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        let snap = JournalSnapshot {
            write_seq: 1,
            next_segment_id: 8,
            segments: vec![entry(1, 0, 1, 1)],
            tasks: vec![task(1, 1, 2)],
            ..Default::default()
        };
        assert_eq!(remove_orphans(dir.path(), &snap).unwrap(), 1);

        assert!(dir.path().join("0000000000000001.blk").exists());
        assert!(dir.path().join("0000000000000002.blk").exists());
        assert!(!dir.path().join("0000000000000007.blk").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_open_segments_checks_entry_count() {
        let dir = tempdir().unwrap();
        make_segment(dir.path(), 1, 0..2, &[(b"a", b"1"), (b"b", b"1")]);
        let backend = BlockBackend::default();

        let good = snapshot(vec![entry(1, 0, 2, 2)], Vec::new());
        let list = open_segments(dir.path(), &backend, &good).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.get(1).unwrap().is_journaled());

        let bad = snapshot(vec![entry(1, 0, 2, 5)], Vec::new());
        assert!(open_segments(dir.path(), &backend, &bad)
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn test_resume_compactions() {
        let dir = tempdir().unwrap();
        let backend = BlockBackend::default();
        let older = make_segment(dir.path(), 1, 0..1, &[(b"a", b"1")]);
        let newer = make_segment(dir.path(), 2, 1..2, &[(b"b", b"1")]);
        let third = make_segment(dir.path(), 3, 2..3, &[(b"c", b"1")]);

        let mut running =
            CompactionTask::start(Arc::clone(&older), Arc::clone(&newer), 4, &backend, dir.path()).unwrap();
        running.run(1, &ValueOps::default()).unwrap();
        let checkpoint = running.checkpoint().unwrap();
        drop(running);

        let snap = JournalSnapshot {
            write_seq: 3,
            next_segment_id: 5,
            segments: vec![older.to_entry(), newer.to_entry(), third.to_entry()],
            tasks: vec![checkpoint],
            backend: backend.name().to_string(),
        };
        drop((older, newer, third));
        validate_snapshot(&snap).unwrap();

        let list = open_segments(dir.path(), &backend, &snap).unwrap();
        let mut scheduler = Scheduler::new(CompactionConfig::default());
        resume_compactions(dir.path(), &backend, &snap, &list, &mut scheduler).unwrap();

        assert_eq!(scheduler.running_len(), 1);
        assert_eq!(scheduler.running()[0].output_entries(), 1);
        // (2, 3) touches a running input; nothing else is adjacent
        assert_eq!(scheduler.unstarted_len(), 0);

        let done = scheduler.run_slice(32, &ValueOps::default()).unwrap().unwrap();
        assert_eq!(done.output.entry_count(), 2);
        assert_eq!(done.output.input_range(), 0..2);
    }
}
