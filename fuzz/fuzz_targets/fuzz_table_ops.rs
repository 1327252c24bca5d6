#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mergetable::{SyncMode, Table, TableOptions};
use std::collections::HashMap;

#[derive(Arbitrary, Debug)]
enum TableOp {
    Add { key: u8, value: Vec<u8> },
    Query { key: u8 },
    Flush,
    Reopen,
}

fn options() -> TableOptions {
    TableOptions::default()
        .with_sync_mode(SyncMode::None)
        .with_max_memtable_entries(3)
        .with_journal_reset_period(2)
        .with_compaction_slice_steps(2)
}

fuzz_target!(|ops: Vec<TableOp>| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let Ok(mut table) = Table::open_with_options(dir.path(), options()) else {
        return;
    };
    let mut model: HashMap<u8, Vec<u8>> = HashMap::new();

    // Limit operations to prevent timeout
    for op in ops.iter().take(200) {
        match op {
            TableOp::Add { key, value } => {
                if value.len() > 256 {
                    continue;
                }
                table.add(&[*key], value).expect("add failed");
                model.insert(*key, value.clone());
            }
            TableOp::Query { key } => {
                let found = table.query(&[*key]).expect("query failed");
                assert_eq!(found.as_ref(), model.get(key));
            }
            TableOp::Flush => table.flush().expect("flush failed"),
            TableOp::Reopen => {
                // Crash: drop without close
                drop(table);
                table = Table::open_with_options(dir.path(), options()).expect("recovery failed");
            }
        }
    }

    let stats = table.stats().expect("stats failed");
    assert!(stats.is_contiguous());
});
