#![no_main]

use libfuzzer_sys::fuzz_target;
use mergetable_core::Comparator;
use mergetable_storage::backend::{segment_path, BlockBackend, SegmentBackend, TreeBackend};

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }

    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let backends: [&dyn SegmentBackend; 2] = [&BlockBackend::default(), &TreeBackend::default()];

    for backend in backends {
        let path = segment_path(dir.path(), 1, backend.file_extension());
        if std::fs::write(&path, data).is_err() {
            return;
        }

        // Opening, scanning and point lookups on a damaged file must
        // return errors, never panic
        let Ok(file) = backend.open(dir.path(), 1) else {
            continue;
        };
        let _ = file.query(b"key", &Comparator::bytewise());

        if let Ok(mut reader) = file.create_reader() {
            for _ in 0..10_000 {
                match reader.advance() {
                    Ok(true) => {}
                    _ => break,
                }
            }
        }
    }
});
