use tempfile::TempDir;

use crate::runfile::flat::FlatFile;
use crate::runfile::{FileHints, RunFile};

fn key(i: u32) -> Vec<u8> {
    format!("k{i:07}").into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("v{i}").into_bytes()
}

fn query(file: &mut FlatFile, target: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let found = file
        .query(&mut |candidate| target.cmp(candidate), &mut out)
        .unwrap();
    found.then_some(out)
}

#[test]
fn point_queries_hit_every_entry() {
    let tmp = TempDir::new().unwrap();
    let mut file = FlatFile::create(tmp.path(), 1, &FileHints::default()).unwrap();
    // Every third key, so misses exist between hits.
    for i in (0..9000).step_by(3) {
        file.feed(&key(i), &value(i)).unwrap();
    }
    assert!(file.done_feeding().unwrap());

    for i in (0..9000).step_by(3) {
        assert_eq!(query(&mut file, &key(i)), Some(value(i)), "key {i}");
    }
    for i in (1..9000).step_by(3) {
        assert_eq!(query(&mut file, &key(i)), None, "absent key {i}");
    }
    assert_eq!(query(&mut file, b"a-before-everything"), None);
    assert_eq!(query(&mut file, b"z-after-everything"), None);
}

#[test]
fn queries_work_while_building() {
    let tmp = TempDir::new().unwrap();
    let mut file = FlatFile::create(tmp.path(), 2, &FileHints::default()).unwrap();
    // Large incompressible-ish values force several closed blocks.
    let mut flushed = 0u32;
    for i in 0..4000 {
        let v: Vec<u8> = (0..64u32).map(|j| ((i * 31 + j * 7) % 251) as u8).collect();
        if file.feed(&key(i), &v).unwrap() == crate::runfile::FeedOutcome::BlockFlushed {
            flushed += 1;
        }
    }
    assert!(flushed > 0, "expected at least one closed block");

    // Keys inside closed blocks are visible before done_feeding.
    let hit = query(&mut file, &key(0)).expect("first key must be in a closed block");
    assert_eq!(hit.len(), 64);
    assert_eq!(hit[0], 0);
    assert_eq!(query(&mut file, b"zzz"), None);

    assert!(file.done_feeding().unwrap());
    assert!(query(&mut file, &key(3999)).is_some());
}

#[test]
fn empty_file_misses() {
    let tmp = TempDir::new().unwrap();
    let mut file = FlatFile::create(tmp.path(), 3, &FileHints::default()).unwrap();
    assert!(file.done_feeding().unwrap());
    assert_eq!(query(&mut file, b"anything"), None);
}
