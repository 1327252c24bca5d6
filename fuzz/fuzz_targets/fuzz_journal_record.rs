#![no_main]

use libfuzzer_sys::fuzz_target;
use mergetable_journal::{JournalRecord, JournalSnapshot};

fuzz_target!(|data: &[u8]| {
    // Limit input size to prevent timeout
    if data.len() > 1_000_000 {
        return;
    }

    // Decoding untrusted bytes must fail cleanly, never panic
    let _ = JournalRecord::decode(data);
    let _ = JournalSnapshot::decode(data);
});
