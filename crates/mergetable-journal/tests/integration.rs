// Integration tests for journal basic functionality

mod common;

use common::JournalTestFixture;
use mergetable_journal::{
    Journal, JournalConfig, JournalRecord, JournalSnapshot, SegmentEntry, SyncMode, TaskEntry,
};

fn config(sync_mode: SyncMode) -> JournalConfig {
    JournalConfig {
        sync_mode,
        ..Default::default()
    }
}

#[test]
fn test_journal_create_and_close() {
    let fixture = JournalTestFixture::new();

    let journal = Journal::create(
        fixture.dir(),
        JournalConfig::default(),
        &JournalSnapshot::default(),
    )
    .expect("Failed to create journal");
    journal.close().expect("Failed to close journal");

    assert!(fixture.journal_path().exists());
    assert!(!fixture.next_journal_path().exists());
    assert_eq!(fixture.journal_len(), 64 * 1024);
}

#[test]
fn test_journal_different_sync_modes() {
    for sync_mode in [SyncMode::Sync, SyncMode::Async, SyncMode::None] {
        let fixture = JournalTestFixture::new();

        let mut journal =
            Journal::create(fixture.dir(), config(sync_mode), &JournalSnapshot::default())
                .expect("Failed to create journal");
        for i in 0..10 {
            journal
                .append(format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes())
                .expect("Failed to append");
        }
        journal.sync().expect("Failed to sync");
        journal.close().expect("Failed to close");

        let (_, _, records) =
            Journal::open(fixture.dir(), config(sync_mode)).expect("Failed to reopen");
        assert_eq!(records.len(), 10, "sync mode {:?}", sync_mode);
    }
}

#[test]
fn test_journal_grows_past_initial_capacity() {
    let fixture = JournalTestFixture::new();
    let small = JournalConfig {
        sync_mode: SyncMode::None,
        initial_capacity: 256,
    };

    let mut journal =
        Journal::create(fixture.dir(), small.clone(), &JournalSnapshot::default()).unwrap();
    let value = vec![0x5A; 100];
    for i in 0..100u32 {
        journal.append(&i.to_be_bytes(), &value).unwrap();
    }
    journal.close().unwrap();
    assert!(fixture.journal_len() >= 100 * 112);

    let (_, _, records) = Journal::open(fixture.dir(), small).unwrap();
    assert_eq!(records.len(), 100);
    assert_eq!(records[42].key, 42u32.to_be_bytes().to_vec());
}

#[test]
fn test_snapshot_carries_tasks() {
    let fixture = JournalTestFixture::new();

    let snapshot = JournalSnapshot {
        write_seq: 100,
        next_segment_id: 9,
        segments: vec![
            SegmentEntry {
                id: 4,
                first_input_seq: 0,
                input_count: 60,
                entry_count: 40,
            },
            SegmentEntry {
                id: 7,
                first_input_seq: 60,
                input_count: 40,
                entry_count: 31,
            },
        ],
        tasks: vec![TaskEntry {
            older: 4,
            newer: 7,
            output: 8,
            left_state: vec![0; 16],
            right_state: vec![1; 16],
            builder_state: vec![2; 24],
        }],
        backend: "tree".to_string(),
    };

    let mut journal =
        Journal::create(fixture.dir(), config(SyncMode::Sync), &JournalSnapshot::default())
            .unwrap();
    journal.append(b"lost", b"after reset").unwrap();
    journal.snapshot_and_reset(&snapshot).unwrap();
    journal.append(b"kept", b"1").unwrap();
    journal.close().unwrap();

    let (_, recovered, records) = Journal::open(fixture.dir(), config(SyncMode::Sync)).unwrap();
    assert_eq!(recovered, snapshot);
    assert_eq!(
        records,
        vec![JournalRecord::new(b"kept".to_vec(), b"1".to_vec())]
    );
}

#[test]
fn test_repeated_resets() {
    let fixture = JournalTestFixture::new();
    let mut journal =
        Journal::create(fixture.dir(), config(SyncMode::Async), &JournalSnapshot::default())
            .unwrap();

    for round in 0..5u64 {
        journal.append(b"k", &round.to_le_bytes()).unwrap();
        journal
            .snapshot_and_reset(&JournalSnapshot {
                write_seq: round + 1,
                ..Default::default()
            })
            .unwrap();
    }
    assert_eq!(journal.rotations(), 5);
    journal.close().unwrap();

    let (_, recovered, records) = Journal::open(fixture.dir(), config(SyncMode::Async)).unwrap();
    assert_eq!(recovered.write_seq, 5);
    assert!(records.is_empty());
}
