use tempfile::TempDir;

use crate::engine::tests::helpers::{init_tracing, settle_merges, summing_options};
use crate::engine::{JournalMode, OpenMode, Table, TableOptions};

/// Simulates a crash: the table is dropped without `close`, so no final
/// flush or checkpoint happens and recovery must work from the journal
/// alone.
fn crash(table: Table) {
    drop(table);
}

#[test]
fn default_journal_recovers_every_acknowledged_insert() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let options = || TableOptions {
        max_in_memory_entries: 64,
        ..TableOptions::default()
    };
    {
        let mut table = Table::open(tmp.path(), options(), OpenMode::MustCreate).unwrap();
        for i in 0..1000u32 {
            table
                .insert(format!("key-{i:05}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        crash(table);
    }

    let mut table = Table::open(tmp.path(), options(), OpenMode::MustExist).unwrap();
    for i in 0..1000u32 {
        assert_eq!(
            table.lookup(format!("key-{i:05}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes()),
            "key {i} lost in recovery"
        );
    }
    assert_eq!(table.stats().total_inserts, 1000);
    table.close().unwrap();
}

#[test]
fn recovery_preserves_merge_fold_results() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let n_rounds = 700u32;
    let key_space = 31u32;
    {
        let mut table =
            Table::open(tmp.path(), summing_options(32), OpenMode::MustCreate).unwrap();
        for i in 0..n_rounds {
            let key = format!("c{:02}", i % key_space);
            table.insert(key.as_bytes(), &(i + 1).to_be_bytes()).unwrap();
        }
        crash(table);
    }

    let mut table = Table::open(tmp.path(), summing_options(32), OpenMode::MustExist).unwrap();
    settle_merges(&mut table);
    for k in 0..key_space {
        let mut want = 0u32;
        for i in 0..n_rounds {
            if i % key_space == k {
                want = want.wrapping_add(i + 1);
            }
        }
        let got = table
            .lookup(format!("c{k:02}").as_bytes())
            .unwrap()
            .expect("counter exists");
        assert_eq!(u32::from_be_bytes(got.try_into().unwrap()), want, "c{k:02}");
    }
    table.close().unwrap();
}

#[test]
fn repeated_crashes_converge() {
    let tmp = TempDir::new().unwrap();
    let options = || TableOptions {
        max_in_memory_entries: 16,
        ..TableOptions::default()
    };
    let mut written = 0u32;
    for round in 0..5 {
        let mode = if round == 0 {
            OpenMode::MustCreate
        } else {
            OpenMode::MustExist
        };
        let mut table = Table::open(tmp.path(), options(), mode).unwrap();
        for _ in 0..123 {
            table
                .insert(
                    format!("key-{written:06}").as_bytes(),
                    format!("v{written}").as_bytes(),
                )
                .unwrap();
            written += 1;
        }
        crash(table);
    }

    let mut table = Table::open(tmp.path(), options(), OpenMode::MustExist).unwrap();
    assert_eq!(table.stats().total_inserts, u64::from(written));
    for i in (0..written).step_by(41) {
        assert_eq!(
            table.lookup(format!("key-{i:06}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
    table.close().unwrap();
}

#[test]
fn close_then_reopen_in_journal_none_mode() {
    let tmp = TempDir::new().unwrap();
    let options = || TableOptions {
        journal_mode: JournalMode::None,
        max_in_memory_entries: 32,
        ..TableOptions::default()
    };
    {
        let mut table = Table::open(tmp.path(), options(), OpenMode::MustCreate).unwrap();
        for i in 0..200u32 {
            table
                .insert(format!("k{i:04}").as_bytes(), b"v")
                .unwrap();
        }
        // A clean close flushes and checkpoints even without a tail.
        table.close().unwrap();
    }
    let mut table = Table::open(tmp.path(), options(), OpenMode::MustExist).unwrap();
    for i in (0..200u32).step_by(13) {
        assert_eq!(
            table.lookup(format!("k{i:04}").as_bytes()).unwrap(),
            Some(b"v".to_vec())
        );
    }
    table.close().unwrap();
}

#[test]
fn occasional_journal_mode_loses_at_most_one_batch() {
    let tmp = TempDir::new().unwrap();
    let options = || TableOptions {
        journal_mode: JournalMode::Occasionally,
        max_in_memory_entries: 64,
        ..TableOptions::default()
    };
    let n = 500u32;
    {
        let mut table = Table::open(tmp.path(), options(), OpenMode::MustCreate).unwrap();
        for i in 0..n {
            table
                .insert(format!("k{i:04}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        crash(table);
    }

    let mut table = Table::open(tmp.path(), options(), OpenMode::MustExist).unwrap();
    let recovered = table.stats().total_inserts;
    // Batches are 32 inserts; only the unpublished staging may vanish.
    assert!(
        recovered >= u64::from(n) - 32 && recovered <= u64::from(n),
        "recovered {recovered} of {n}"
    );
    // Whatever was recovered is a strict prefix of the insert sequence.
    for i in 0..recovered as u32 {
        assert_eq!(
            table.lookup(format!("k{i:04}").as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes()),
            "prefix hole at {i}"
        );
    }
    table.close().unwrap();
}

#[test]
fn unreferenced_engine_files_are_swept_on_open() {
    let tmp = TempDir::new().unwrap();
    {
        let mut table = Table::open(
            tmp.path(),
            TableOptions::default(),
            OpenMode::MustCreate,
        )
        .unwrap();
        table.insert(b"k", b"v").unwrap();
        table.close().unwrap();
    }
    // Plant garbage that looks like engine files, plus a user file.
    std::fs::write(tmp.path().join("00000000deadbeef.index"), b"junk").unwrap();
    std::fs::write(tmp.path().join("00000000deadbeef.data"), b"junk").unwrap();
    std::fs::write(tmp.path().join("Userfile"), b"keep me").unwrap();

    let mut table =
        Table::open(tmp.path(), TableOptions::default(), OpenMode::MustExist).unwrap();
    assert!(!tmp.path().join("00000000deadbeef.index").exists());
    assert!(!tmp.path().join("00000000deadbeef.data").exists());
    assert!(tmp.path().join("Userfile").exists());
    assert_eq!(table.lookup(b"k").unwrap(), Some(b"v".to_vec()));
    table.close().unwrap();
}
