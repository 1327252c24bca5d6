// Table behaviour tests: merges, flushes and compaction transparency

mod common;

use common::{concat_model, concat_options, workload, TableTestFixture};
use mergetable::{
    BlockBackend, Error, MergeOutcome, OpenMode, QueryOrder, Simplified, SyncMode, TableOptions,
    TreeBackend,
};
use std::collections::BTreeMap;
use std::sync::Arc;

#[test]
fn test_flush_scenario() {
    let fixture = TableTestFixture::new();
    let table = fixture.open(TableOptions::default().with_max_memtable_entries(2));

    table.add(b"a", b"1").unwrap();
    table.add(b"b", b"1").unwrap();
    table.add(b"a", b"2").unwrap();

    let stats = table.stats().unwrap();
    assert_eq!(stats.segments.len(), 1, "Third write must flush the memtable");
    assert_eq!(stats.segments[0].input_range, 0..3);
    assert_eq!(stats.running_compactions, 0);

    assert_eq!(table.query(b"a").unwrap(), Some(b"2".to_vec()));
    assert_eq!(table.query(b"b").unwrap(), Some(b"1".to_vec()));
    assert_eq!(table.query(b"c").unwrap(), None);
}

#[test]
fn test_compaction_scenario() {
    let fixture = TableTestFixture::new();
    let table = fixture.open(TableOptions::default().with_max_memtable_entries(1_000));

    // Older segment {a:1}, newer segment {a:2, b:1}
    table.add(b"a", b"1").unwrap();
    table.flush().unwrap();
    table.add(b"a", b"2").unwrap();
    table.add(b"b", b"1").unwrap();
    table.flush().unwrap();

    let before = (table.query(b"a").unwrap(), table.query(b"b").unwrap());
    assert_eq!(before, (Some(b"2".to_vec()), Some(b"1".to_vec())));

    // flush() started the merge; each write runs a slice of it
    table.add(b"z", b"0").unwrap();
    let stats = table.stats().unwrap();
    assert_eq!(stats.compaction.completed, 1);
    assert_eq!(stats.segments.len(), 1);
    assert_eq!(stats.segments[0].input_range, 0..3);
    assert_eq!(stats.segments[0].entries, 2);

    let after = (table.query(b"a").unwrap(), table.query(b"b").unwrap());
    assert_eq!(before, after);
}

#[test]
fn test_last_write_wins_and_drop() {
    let fixture = TableTestFixture::new();
    let table = fixture.open(TableOptions::default().with_max_memtable_entries(3));
    for i in 0..20u32 {
        table.add(b"key", format!("v{}", i).as_bytes()).unwrap();
    }
    assert_eq!(table.query(b"key").unwrap(), Some(b"v19".to_vec()));
    table.close().unwrap();

    let fixture = TableTestFixture::new();
    let dropping = TableOptions::default()
        .with_max_memtable_entries(3)
        .with_merge(Arc::new(|_k: &[u8], _a: &[u8], _b: &[u8]| MergeOutcome::Drop));
    let table = fixture.open(dropping);
    table.add(b"key", b"A").unwrap();
    table.add(b"other", b"x").unwrap();
    table.add(b"pad", b"x").unwrap();
    table.add(b"pad2", b"x").unwrap();
    table.add(b"key", b"B").unwrap();
    assert_eq!(table.query(b"key").unwrap(), None);
    assert_eq!(table.query(b"other").unwrap(), Some(b"x".to_vec()));
}

#[test]
fn test_compaction_transparency() {
    let writes = workload(2_000, 97);
    let model = concat_model(&writes);

    for max_entries in [1u64, 3, 16, 250, 100_000] {
        let fixture = TableTestFixture::new();
        let table = fixture.open(
            concat_options()
                .with_max_memtable_entries(max_entries)
                .with_journal_reset_period(4),
        );
        for (k, v) in &writes {
            table.add(k, v).unwrap();
        }

        let stats = table.stats().unwrap();
        assert!(stats.is_contiguous());
        for (k, v) in &model {
            assert_eq!(
                table.query(k).unwrap().as_ref(),
                Some(v),
                "max_memtable_entries={} key={}",
                max_entries,
                String::from_utf8_lossy(k)
            );
        }
        assert_eq!(table.query(b"absent").unwrap(), None);
    }
}

/// Signed counters that disappear when they sum to zero
fn zero_dropping_counter() -> TableOptions {
    TableOptions::default()
        .with_sync_mode(SyncMode::None)
        .with_merge(Arc::new(|_k: &[u8], old: &[u8], new: &[u8]| {
            let a = i64::from_le_bytes(old.try_into().unwrap());
            let b = i64::from_le_bytes(new.try_into().unwrap());
            match a + b {
                0 => MergeOutcome::Drop,
                sum => MergeOutcome::Replace(sum.to_le_bytes().to_vec()),
            }
        }))
}

#[test]
fn test_associative_drop_is_transparent() {
    // Nonzero increments in -2..=2 over a handful of keys, so sums hit zero often
    let mut increments: Vec<(Vec<u8>, i64)> = workload(1_500, 12)
        .into_iter()
        .enumerate()
        .map(|(i, (k, _))| (k, [-2i64, -1, 1, 2][i * 7 % 4]))
        .collect();

    let mut model: BTreeMap<Vec<u8>, i64> = BTreeMap::new();
    for (k, delta) in &increments {
        *model.entry(k.clone()).or_default() += delta;
    }
    // Cancel a few keys outright so the final state has dropped keys too
    let cancels: Vec<(Vec<u8>, i64)> = model
        .iter()
        .take(3)
        .filter(|(_, sum)| **sum != 0)
        .map(|(k, sum)| (k.clone(), -sum))
        .collect();
    for (k, delta) in cancels {
        model.insert(k.clone(), 0);
        increments.push((k, delta));
    }

    for order in [QueryOrder::NewestFirst, QueryOrder::OldestFirst] {
        for max_entries in [1u64, 2, 5, 64, 100_000] {
            let fixture = TableTestFixture::new();
            let table = fixture.open(
                zero_dropping_counter()
                    .with_max_memtable_entries(max_entries)
                    .with_compaction_slice_steps(2)
                    .with_query_order(order),
            );
            for (k, delta) in &increments {
                table.add(k, &delta.to_le_bytes()).unwrap();
            }

            for (k, sum) in &model {
                let expected = (*sum != 0).then(|| sum.to_le_bytes().to_vec());
                assert_eq!(
                    table.query(k).unwrap(),
                    expected,
                    "order={:?} max_memtable_entries={} key={}",
                    order,
                    max_entries,
                    String::from_utf8_lossy(k)
                );
            }
        }
    }
}

#[test]
fn test_oldest_first_query_order() {
    let writes = workload(600, 31);
    let model = concat_model(&writes);

    let fixture = TableTestFixture::new();
    let table = fixture.open(
        concat_options()
            .with_max_memtable_entries(7)
            .with_query_order(QueryOrder::OldestFirst),
    );
    for (k, v) in &writes {
        table.add(k, v).unwrap();
    }
    for (k, v) in &model {
        assert_eq!(table.query(k).unwrap().as_ref(), Some(v));
    }
}

#[test]
fn test_contiguity_across_flushes_and_compactions() {
    let fixture = TableTestFixture::new();
    let table = fixture.open(
        TableOptions::default()
            .with_max_memtable_entries(2)
            .with_compaction_slice_steps(1)
            .with_max_running_compactions(3),
    );

    let mut saw_running = false;
    for i in 0..400u32 {
        table.add(format!("k{}", i % 50).as_bytes(), b"v").unwrap();
        let stats = table.stats().unwrap();
        assert!(stats.is_contiguous(), "Gap or overlap after write {}", i);
        assert!(stats.running_compactions <= 3);
        saw_running |= stats.running_compactions > 0;
    }
    assert!(saw_running);
}

#[test]
fn test_simplify_collapses_tombstones() {
    let fixture = TableTestFixture::new();
    let options = TableOptions::default()
        .with_max_memtable_entries(2)
        .with_simplify(Arc::new(|_k: &[u8], v: &[u8]| {
            if v == b"" {
                Simplified::Drop
            } else {
                Simplified::Keep
            }
        }));
    let table = fixture.open(options);

    for i in 0..60u32 {
        let key = format!("k{}", i % 6);
        let value: &[u8] = if i % 4 == 3 { b"" } else { b"live" };
        table.add(key.as_bytes(), value).unwrap();
    }
    table.flush().unwrap();
    for _ in 0..50 {
        table.add(b"filler", b"x").unwrap();
    }

    for i in 0..6u32 {
        let last = (0..60u32).filter(|j| j % 6 == i).max().unwrap();
        let expected = if last % 4 == 3 { None } else { Some(b"live".to_vec()) };
        assert_eq!(table.query(format!("k{}", i).as_bytes()).unwrap(), expected);
    }
}

#[test]
fn test_custom_comparator_with_both_backends() {
    let backends: [Arc<dyn mergetable::SegmentBackend>; 2] = [
        Arc::new(BlockBackend::with_block_size(64)),
        Arc::new(TreeBackend::with_fanout(3)),
    ];

    for backend in backends {
        let fixture = TableTestFixture::new();
        let options = TableOptions::default()
            .with_max_memtable_entries(5)
            .with_compare(Arc::new(|a: &[u8], b: &[u8]| b.cmp(a)))
            .with_backend(backend);
        let table = fixture.open(options);

        for i in 0..150u32 {
            table
                .add(format!("key{:03}", i % 40).as_bytes(), &i.to_le_bytes())
                .unwrap();
        }
        for k in 0..40u32 {
            let last = (0..150u32).filter(|i| i % 40 == k).max().unwrap();
            assert_eq!(
                table.query(format!("key{:03}", k).as_bytes()).unwrap(),
                Some(last.to_le_bytes().to_vec())
            );
        }
    }
}

#[test]
fn test_fixed_length_validation() {
    let fixture = TableTestFixture::new();
    let table = fixture.open(
        TableOptions::default()
            .with_fixed_key_len(4)
            .with_fixed_value_len(8),
    );

    table.add(b"abcd", &7u64.to_le_bytes()).unwrap();
    assert!(matches!(
        table.add(b"abc", &7u64.to_le_bytes()),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        table.add(b"abcd", b"short"),
        Err(Error::InvalidArgument(_))
    ));
    // The table keeps working after a rejected write
    table.add(b"wxyz", &8u64.to_le_bytes()).unwrap();
    assert_eq!(table.stats().unwrap().write_seq, 2);
}

#[test]
fn test_open_modes() {
    let fixture = TableTestFixture::new();

    let missing = mergetable::Table::open_with_options(
        fixture.dir(),
        TableOptions::default().with_open_mode(OpenMode::Existing),
    );
    assert!(matches!(missing, Err(Error::NotFound(_))));

    let table = fixture.open(TableOptions::default().with_open_mode(OpenMode::CreateNew));
    table.add(b"k", b"v").unwrap();
    table.close().unwrap();

    let again = mergetable::Table::open_with_options(
        fixture.dir(),
        TableOptions::default().with_open_mode(OpenMode::CreateNew),
    );
    assert!(matches!(again, Err(Error::AlreadyExists(_))));

    let table = fixture.open(TableOptions::default().with_open_mode(OpenMode::Existing));
    assert_eq!(table.query(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_concurrent_handles() {
    let fixture = TableTestFixture::new();
    let table = fixture.open(TableOptions::default().with_max_memtable_entries(16));

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    table.add(&[t, (i % 10) as u8], &i.to_le_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.stats().unwrap().write_seq, 400);
    for t in 0..4u8 {
        for k in 0..10u8 {
            let last = (0..100u32).filter(|i| i % 10 == k as u32).max().unwrap();
            assert_eq!(table.query(&[t, k]).unwrap(), Some(last.to_le_bytes().to_vec()));
        }
    }
}
