use std::sync::Arc;

use tempfile::TempDir;

use crate::engine::{OpenMode, SimplifyOutcome, Table, TableError, TableOptions};
use crate::runfile::RunFormat;

#[test]
fn open_mode_gates_creation_and_existence() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope");
    assert!(matches!(
        Table::open(&missing, TableOptions::default(), OpenMode::MustExist),
        Err(TableError::Config(_))
    ));

    let table = Table::open(
        tmp.path(),
        TableOptions::default(),
        OpenMode::MustCreate,
    )
    .unwrap();
    table.close().unwrap();

    assert!(matches!(
        Table::open(tmp.path(), TableOptions::default(), OpenMode::MustCreate),
        Err(TableError::Config(_))
    ));
    Table::open(tmp.path(), TableOptions::default(), OpenMode::MustExist)
        .unwrap()
        .close()
        .unwrap();
}

#[test]
fn simplify_without_merge_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let options = TableOptions {
        simplify: Some(Arc::new(|_k, _v, _out: &mut Vec<u8>| SimplifyOutcome::Keep)),
        ..TableOptions::default()
    };
    assert!(matches!(
        Table::open(tmp.path(), options, OpenMode::MustCreate),
        Err(TableError::Config(_))
    ));
}

#[test]
fn zero_fixed_lengths_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let options = TableOptions {
        key_fixed_length: Some(0),
        ..TableOptions::default()
    };
    assert!(matches!(
        Table::open(tmp.path(), options, OpenMode::MustCreate),
        Err(TableError::Config(_))
    ));
}

#[test]
fn fixed_lengths_are_enforced_per_insert() {
    let tmp = TempDir::new().unwrap();
    let options = TableOptions {
        key_fixed_length: Some(8),
        value_fixed_length: Some(4),
        ..TableOptions::default()
    };
    let mut table = Table::open(tmp.path(), options, OpenMode::MustCreate).unwrap();

    table.insert(b"exactly8", b"4byt").unwrap();
    assert!(matches!(
        table.insert(b"short", b"4byt"),
        Err(TableError::Config(_))
    ));
    assert!(matches!(
        table.insert(b"exactly8", b"toolong"),
        Err(TableError::Config(_))
    ));
    assert!(matches!(
        table.lookup(b"short"),
        Err(TableError::Config(_))
    ));
    assert_eq!(table.lookup(b"exactly8").unwrap(), Some(b"4byt".to_vec()));

    // A failed insert rolled back: the count reflects only the success.
    assert_eq!(table.stats().total_inserts, 1);
    table.close().unwrap();
}

#[test]
fn custom_comparator_controls_ordering_everywhere() {
    let tmp = TempDir::new().unwrap();
    // Order keys by their reversed bytes.
    let options = TableOptions {
        compare: Some(Arc::new(|a: &[u8], b: &[u8]| {
            a.iter().rev().cmp(b.iter().rev())
        })),
        max_in_memory_entries: 8,
        ..TableOptions::default()
    };
    let mut table = Table::open(tmp.path(), options, OpenMode::MustCreate).unwrap();
    for i in 0..100u32 {
        table
            .insert(format!("{i:04}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    for i in (0..100u32).step_by(7) {
        assert_eq!(
            table.lookup(format!("{i:04}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    table.close().unwrap();
}

#[test]
fn btree_format_runs_the_full_engine() {
    let tmp = TempDir::new().unwrap();
    let options = || TableOptions {
        run_format: RunFormat::Btree,
        max_in_memory_entries: 48,
        ..TableOptions::default()
    };
    let mut table = Table::open(tmp.path(), options(), OpenMode::MustCreate).unwrap();
    for i in 0..1500u32 {
        table
            .insert(format!("key-{i:05}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    while table.stats().n_running_merges > 0 {
        table.step(1024).unwrap();
    }
    for i in (0..1500u32).step_by(11) {
        assert_eq!(
            table.lookup(format!("key-{i:05}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes()),
            "key {i}"
        );
    }
    table.close().unwrap();

    // Survives reopen in the same format.
    let mut table = Table::open(tmp.path(), options(), OpenMode::MustExist).unwrap();
    assert_eq!(
        table.lookup(b"key-00042").unwrap(),
        Some(b"v42".to_vec())
    );
    table.close().unwrap();
}
