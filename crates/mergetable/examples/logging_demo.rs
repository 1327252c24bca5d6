//! Shows the engine's tracing output: flushes and compaction starts at
//! debug, completed compactions and journal rotations at info.
//!
//! Run with: cargo run -p mergetable --example logging_demo

use mergetable::logging::LogConfig;
use mergetable::{Table, TableOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = LogConfig::debug().init()?;
    let dir = tempfile::tempdir()?;

    println!("=== mergetable Logging Demo ===\n");

    let options = TableOptions::default()
        .with_max_memtable_entries(8)
        .with_journal_reset_period(2);
    let table = Table::open_with_options(dir.path(), options)?;

    for i in 0..64u32 {
        table.add(format!("key{:02}", i % 24).as_bytes(), &i.to_le_bytes())?;
    }
    table.close()?;

    // Reopening logs the recovery summary
    let table = Table::open(dir.path())?;
    println!("\nkey05 = {:?}", table.query(b"key05")?);
    Ok(())
}
