use tempfile::TempDir;

use crate::engine::tests::helpers::{settle_merges, small_buffer_options, summing_options};
use crate::engine::{OpenMode, Table, TableOptions};

#[test]
fn replacement_semantics_last_write_wins() {
    let tmp = TempDir::new().unwrap();
    let mut table = Table::open(
        tmp.path(),
        TableOptions::replacement_semantics(),
        OpenMode::MustCreate,
    )
    .unwrap();

    table.insert(b"alpha", b"1").unwrap();
    table.insert(b"beta", b"2").unwrap();
    table.insert(b"alpha", b"3").unwrap();

    assert_eq!(table.lookup(b"alpha").unwrap(), Some(b"3".to_vec()));
    assert_eq!(table.lookup(b"beta").unwrap(), Some(b"2".to_vec()));
    assert_eq!(table.lookup(b"gamma").unwrap(), None);
    table.close().unwrap();
}

#[test]
fn without_any_merge_the_newest_duplicate_wins() {
    let tmp = TempDir::new().unwrap();
    let mut table = Table::open(
        tmp.path(),
        TableOptions::default(),
        OpenMode::CreateOrOpen,
    )
    .unwrap();

    table.insert(b"alpha", b"1").unwrap();
    table.insert(b"beta", b"2").unwrap();
    table.insert(b"alpha", b"3").unwrap();

    assert_eq!(table.lookup(b"alpha").unwrap(), Some(b"3".to_vec()));
    table.close().unwrap();
}

#[test]
fn lookups_cross_the_flush_boundary() {
    let tmp = TempDir::new().unwrap();
    let mut table =
        Table::open(tmp.path(), small_buffer_options(), OpenMode::MustCreate).unwrap();

    for i in 0..1000u32 {
        table
            .insert(format!("key-{i:05}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    assert!(table.stats().n_runs >= 1, "flushes must have happened");

    for i in (0..1000u32).step_by(17) {
        assert_eq!(
            table.lookup(format!("key-{i:05}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes()),
            "key {i}"
        );
    }
    assert_eq!(table.lookup(b"key-99999").unwrap(), None);
    table.close().unwrap();
}

#[test]
fn summing_merge_accumulates_across_runs() {
    let tmp = TempDir::new().unwrap();
    let mut table = Table::open(tmp.path(), summing_options(32), OpenMode::MustCreate).unwrap();

    // 50 keys × 40 increments, spread so every key crosses many flushes.
    let mut expected = [0u32; 50];
    for round in 0..40u32 {
        for k in 0..50usize {
            let delta = round * 7 + k as u32 + 1;
            expected[k] = expected[k].wrapping_add(delta);
            table
                .insert(format!("counter-{k:03}").as_bytes(), &delta.to_be_bytes())
                .unwrap();
        }
    }
    settle_merges(&mut table);

    for k in 0..50usize {
        let got = table
            .lookup(format!("counter-{k:03}").as_bytes())
            .unwrap()
            .expect("counter exists");
        assert_eq!(u32::from_be_bytes(got.try_into().unwrap()), expected[k]);
    }
    table.close().unwrap();
}

#[test]
fn stats_track_shape() {
    let tmp = TempDir::new().unwrap();
    let mut table =
        Table::open(tmp.path(), small_buffer_options(), OpenMode::MustCreate).unwrap();
    assert_eq!(table.stats().total_inserts, 0);
    assert_eq!(table.stats().n_runs, 0);

    for i in 0..100u32 {
        table.insert(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    let stats = table.stats();
    assert_eq!(stats.total_inserts, 100);
    assert!(stats.n_runs >= 1);
    assert!(stats.memtable_entries < 100);
    table.close().unwrap();
}

#[test]
fn dir_accessor_reports_the_directory() {
    let tmp = TempDir::new().unwrap();
    let table = Table::open(
        tmp.path(),
        TableOptions::default(),
        OpenMode::CreateOrOpen,
    )
    .unwrap();
    assert_eq!(table.dir(), tmp.path());
    table.close().unwrap();
}

#[test]
fn second_open_of_a_locked_table_fails() {
    let tmp = TempDir::new().unwrap();
    let table = Table::open(
        tmp.path(),
        TableOptions::default(),
        OpenMode::CreateOrOpen,
    )
    .unwrap();
    assert!(Table::open(tmp.path(), TableOptions::default(), OpenMode::CreateOrOpen).is_err());
    table.close().unwrap();
    // Closing released the lock.
    Table::open(tmp.path(), TableOptions::default(), OpenMode::CreateOrOpen)
        .unwrap()
        .close()
        .unwrap();
}
