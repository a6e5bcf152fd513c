use tempfile::TempDir;

use crate::runfile::flat::FlatFile;
use crate::runfile::{FileHints, RunFile, RunFileError};

fn build(dir: &std::path::Path, id: u64, n: u32) -> FlatFile {
    let mut file = FlatFile::create(dir, id, &FileHints::default()).unwrap();
    for i in 0..n {
        let k = format!("key-{i:08}").into_bytes();
        let v: Vec<u8> = (0..48u32).map(|j| ((i + j) % 256) as u8).collect();
        file.feed(&k, &v).unwrap();
    }
    assert!(file.done_feeding().unwrap());
    file
}

/// Saving a reader's state at every position and resuming from it must
/// land on the same entry and replay the same suffix.
#[test]
fn reader_state_round_trips_mid_stream() {
    let tmp = TempDir::new().unwrap();
    let n = 6000;
    let file = build(tmp.path(), 1, n);

    let mut reader = file.create_reader().unwrap();
    // Probe a handful of positions spread across block boundaries.
    let mut position = 0u32;
    loop {
        if position % 997 == 0 {
            let state = reader.save_state();
            let mut resumed = file.recreate_reader(&state).unwrap();
            match (reader.entry(), resumed.entry()) {
                (Some((k1, v1)), Some((k2, v2))) => {
                    assert_eq!(k1, k2, "at position {position}");
                    assert_eq!(v1, v2, "at position {position}");
                }
                (None, None) => {}
                other => panic!("divergent reader state at {position}: {other:?}"),
            }
            // The resumed reader continues identically for a while.
            for _ in 0..10 {
                resumed.advance().unwrap();
            }
        }
        if reader.entry().is_none() {
            break;
        }
        reader.advance().unwrap();
        position += 1;
    }
    assert_eq!(position, n);
}

#[test]
fn eof_state_restores_to_eof() {
    let tmp = TempDir::new().unwrap();
    let file = build(tmp.path(), 2, 10);
    let mut reader = file.create_reader().unwrap();
    while reader.entry().is_some() {
        reader.advance().unwrap();
    }
    let state = reader.save_state();
    assert_eq!(state, vec![1]);
    let resumed = file.recreate_reader(&state).unwrap();
    assert!(resumed.entry().is_none());
}

#[test]
fn garbage_state_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let file = build(tmp.path(), 3, 10);
    assert!(matches!(
        file.recreate_reader(&[]),
        Err(RunFileError::BadState(_))
    ));
    assert!(matches!(
        file.recreate_reader(&[2, 0, 0]),
        Err(RunFileError::BadState(_))
    ));
    // In-progress state with a bogus record index.
    let mut state = vec![0u8];
    state.extend_from_slice(&8u64.to_le_bytes());
    state.extend_from_slice(&0u64.to_le_bytes());
    state.extend_from_slice(&0u64.to_le_bytes());
    state.extend_from_slice(&u32::MAX.to_le_bytes());
    assert!(matches!(
        file.recreate_reader(&state),
        Err(RunFileError::BadState(_))
    ));
}
