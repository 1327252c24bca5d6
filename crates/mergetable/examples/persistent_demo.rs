//! Demonstrates that writes survive a restart, with or without a clean close.
//!
//! Run with: cargo run -p mergetable --example persistent_demo

use mergetable::Table;
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let table_path = "./demo_table";

    println!("=== mergetable Persistent Table Demo ===\n");

    if Path::new(table_path).exists() {
        std::fs::remove_dir_all(table_path)?;
        println!("Cleaned up previous demo data\n");
    }

    println!("PART 1: Writing data, then closing cleanly...");
    {
        let table = Table::open(table_path)?;
        table.add(b"user:1:name", b"Alice")?;
        table.add(b"user:1:email", b"alice@example.com")?;
        table.add(b"user:2:name", b"Bob")?;
        table.close()?;
    }

    println!("PART 2: Writing more data, then dropping the handle without close...");
    {
        let table = Table::open(table_path)?;
        table.add(b"user:2:email", b"bob@example.com")?;
        table.add(b"user:1:name", b"Alicia")?;
        // The journal tail holds these writes
    }

    println!("PART 3: Reopening and reading back...");
    let table = Table::open(table_path)?;
    for key in [&b"user:1:name"[..], b"user:1:email", b"user:2:name", b"user:2:email"] {
        let value = table.query(key)?.unwrap_or_default();
        println!(
            "   {} = {}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(&value)
        );
    }

    let stats = table.stats()?;
    println!(
        "\n{} writes, {} segment(s), {} entries in the memtable",
        stats.write_seq,
        stats.segments.len(),
        stats.memtable_entries
    );

    table.close()?;
    std::fs::remove_dir_all(table_path)?;
    Ok(())
}
