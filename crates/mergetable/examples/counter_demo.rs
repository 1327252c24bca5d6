//! Page-view counters: every write is an increment, the merge function sums
//! them, and compaction folds increments together on disk.
//!
//! Run with: cargo run -p mergetable --example counter_demo

use mergetable::{MergeOutcome, Simplified, Table, TableOptions};
use std::sync::Arc;

fn decode(value: &[u8]) -> i64 {
    i64::from_le_bytes(value.try_into().unwrap_or([0; 8]))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    let options = TableOptions::default()
        .with_fixed_value_len(8)
        .with_max_memtable_entries(64)
        .with_merge(Arc::new(|_key: &[u8], old: &[u8], new: &[u8]| {
            MergeOutcome::Replace((decode(old) + decode(new)).to_le_bytes().to_vec())
        }))
        // Counters that net out to zero disappear once they reach the oldest segment
        .with_simplify(Arc::new(|_key: &[u8], value: &[u8]| {
            if decode(value) == 0 {
                Simplified::Drop
            } else {
                Simplified::Keep
            }
        }));

    let table = Table::open_with_options(dir.path(), options)?;

    let pages = ["/", "/about", "/blog", "/contact"];
    for i in 0..10_000usize {
        let page = pages[i % pages.len()];
        table.add(page.as_bytes(), &1i64.to_le_bytes())?;
    }
    // Retract every view of /contact
    for _ in 0..2_500 {
        table.add(b"/contact", &(-1i64).to_le_bytes())?;
    }

    for page in pages {
        match table.query(page.as_bytes())? {
            Some(v) => println!("{:10} {}", page, decode(&v)),
            None => println!("{:10} (no views)", page),
        }
    }

    let stats = table.stats()?;
    println!(
        "\n{} flushes, {} compactions, {} segment(s) on disk",
        stats.flushes,
        stats.compaction.completed,
        stats.segments.len()
    );

    table.close()?;
    Ok(())
}
