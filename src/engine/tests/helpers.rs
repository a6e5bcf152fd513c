use std::sync::Arc;

use crate::engine::{MergeOutcome, Table, TableOptions};

/// Installs a subscriber once so failing tests show engine traces when
/// run with `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Options with a small memtable so flushes and merges happen quickly.
pub fn small_buffer_options() -> TableOptions {
    TableOptions {
        max_in_memory_entries: 64,
        ..TableOptions::default()
    }
}

/// Options whose merge sums 4-byte big-endian integers.
pub fn summing_options(max_in_memory_entries: usize) -> TableOptions {
    TableOptions {
        merge: Some(Arc::new(|_key, a: &[u8], b: &[u8], out: &mut Vec<u8>| {
            let a = u32::from_be_bytes(a.try_into().expect("4-byte value"));
            let b = u32::from_be_bytes(b.try_into().expect("4-byte value"));
            out.extend_from_slice(&a.wrapping_add(b).to_be_bytes());
            MergeOutcome::Merged
        })),
        max_in_memory_entries,
        ..TableOptions::default()
    }
}

/// Drives every pending merge to completion.
pub fn settle_merges(table: &mut Table) {
    while table.stats().n_running_merges > 0 {
        table.step(1024).unwrap();
    }
}
