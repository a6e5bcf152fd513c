use std::fs;

use tempfile::TempDir;

use crate::runfile::flat::FlatFile;
use crate::runfile::{FeedOutcome, FileHints, RunFile};

fn kv(i: u32) -> (Vec<u8>, Vec<u8>) {
    (
        format!("key-{i:08}").into_bytes(),
        format!("value-{i}-{}", "x".repeat((i % 97) as usize)).into_bytes(),
    )
}

/// Feeds `n` ordered entries and completes the file.
fn build_file(dir: &std::path::Path, id: u64, n: u32) -> FlatFile {
    let mut file = FlatFile::create(dir, id, &FileHints::default()).unwrap();
    for i in 0..n {
        let (k, v) = kv(i);
        file.feed(&k, &v).unwrap();
    }
    assert!(file.done_feeding().unwrap());
    file
}

#[test]
fn sequential_read_returns_fed_entries() {
    let tmp = TempDir::new().unwrap();
    let file = build_file(tmp.path(), 1, 5000);
    assert_eq!(file.entry_count(), 5000);

    let mut reader = file.create_reader().unwrap();
    for i in 0..5000 {
        let (k, v) = kv(i);
        let (rk, rv) = reader.entry().expect("entry before eof");
        assert_eq!(rk, &k[..], "key {i}");
        assert_eq!(rv, &v[..], "value {i}");
        reader.advance().unwrap();
    }
    assert!(reader.entry().is_none());
}

#[test]
fn reopen_sees_same_entries() {
    let tmp = TempDir::new().unwrap();
    {
        build_file(tmp.path(), 7, 1200);
    }
    let file = FlatFile::open(tmp.path(), 7).unwrap();
    assert_eq!(file.entry_count(), 1200);
    let mut reader = file.create_reader().unwrap();
    let mut seen = 0;
    while reader.entry().is_some() {
        let (k, v) = kv(seen);
        let (rk, rv) = reader.entry().unwrap();
        assert_eq!(rk, &k[..]);
        assert_eq!(rv, &v[..]);
        seen += 1;
        reader.advance().unwrap();
    }
    assert_eq!(seen, 1200);
}

#[test]
fn empty_file_round_trips() {
    let tmp = TempDir::new().unwrap();
    let file = build_file(tmp.path(), 9, 0);
    assert_eq!(file.entry_count(), 0);
    let reader = file.create_reader().unwrap();
    assert!(reader.entry().is_none());

    let reopened = FlatFile::open(tmp.path(), 9).unwrap();
    assert_eq!(reopened.entry_count(), 0);
}

/// A build interrupted at a block boundary and resumed from saved state
/// must produce files byte-identical to an uninterrupted build.
#[test]
fn resumed_build_is_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let n = 20_000u32;

    build_file(tmp.path(), 1, n);

    let mut file = FlatFile::create(tmp.path(), 2, &FileHints::default()).unwrap();
    let mut i = 0;
    let mut resumed = false;
    while i < n {
        let (k, v) = kv(i);
        let outcome = file.feed(&k, &v).unwrap();
        i += 1;
        // Restart once, at the first block boundary past the midpoint.
        if !resumed && i > n / 2 && outcome == FeedOutcome::BlockFlushed {
            let state = file.build_state().unwrap();
            drop(file);
            file = FlatFile::open_building(tmp.path(), 2, &state).unwrap();
            assert_eq!(file.entry_count(), u64::from(i));
            resumed = true;
        }
    }
    assert!(resumed, "test must hit a block boundary after the midpoint");
    assert!(file.done_feeding().unwrap());

    for ext in ["index", "firstkeys", "data"] {
        let a = fs::read(tmp.path().join(format!("{:016x}.{ext}", 1))).unwrap();
        let b = fs::read(tmp.path().join(format!("{:016x}.{ext}", 2))).unwrap();
        assert_eq!(a, b, "{ext} files differ");
    }
}

#[test]
fn destroy_erase_unlinks_backing_files() {
    let tmp = TempDir::new().unwrap();
    let file = build_file(tmp.path(), 3, 100);
    Box::new(file).destroy(true).unwrap();
    for ext in ["index", "firstkeys", "data"] {
        assert!(!tmp.path().join(format!("{:016x}.{ext}", 3)).exists());
    }
}
