//! Table directory ownership: exclusive lock, file naming, garbage sweep.
//!
//! All engine files live flat in one directory and are named
//! `<16-hex-digit id>.<ext>`, where the id is a monotonically assigned
//! 64-bit counter. Files whose basename starts with a capital letter are
//! user files and are never touched. The `journal`, `journal.tmp`, and
//! `lock` basenames are reserved for the engine.
//!
//! A `TableDir` holds an exclusive advisory lock on the `lock` file for its
//! entire lifetime; a second opener fails instead of corrupting the table.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Reserved basename of the current journal.
pub const JOURNAL_NAME: &str = "journal";

/// Reserved basename of the in-progress checkpoint journal.
pub const JOURNAL_TMP_NAME: &str = "journal.tmp";

/// Reserved basename of the lock file.
pub const LOCK_NAME: &str = "lock";

/// Errors from directory management.
#[derive(Debug, Error)]
pub enum DirError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process (or handle) already holds the directory lock.
    #[error("table directory {0} is locked by another instance")]
    Locked(PathBuf),
}

/// An owned, exclusively locked table directory.
///
/// Dropping the `TableDir` drops the lock-file handle, which releases the
/// advisory lock.
pub struct TableDir {
    path: PathBuf,
    _lock_file: File,
}

impl TableDir {
    /// Locks `path` exclusively. The directory must already exist.
    pub fn lock(path: &Path) -> Result<Self, DirError> {
        let lock_path = path.join(LOCK_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(DirError::Locked(path.to_path_buf()));
        }
        debug!(dir = %path.display(), "table directory locked");
        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Builds the path of an engine file: `<16-hex-digit id>.<ext>`.
    pub fn file_path(&self, id: u64, ext: &str) -> PathBuf {
        self.path.join(format!("{id:016x}.{ext}"))
    }

    /// Path of the current journal.
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_NAME)
    }

    /// Path of the temporary checkpoint journal.
    pub fn journal_tmp_path(&self) -> PathBuf {
        self.path.join(JOURNAL_TMP_NAME)
    }

    /// Deletes every `<hex>.<ext>` engine file whose id is not in
    /// `known_ids`.
    ///
    /// Called after recovery: any run or scratch file that neither the
    /// recovered run set nor an in-flight merge output references is
    /// garbage from before the crash. Dot entries, capital-letter user
    /// files, and the reserved basenames are skipped; anything else that
    /// does not parse as `<hex>.<ext>` is left alone with a warning.
    pub fn sweep(&self, known_ids: &HashSet<u64>) -> Result<(), DirError> {
        let mut doomed: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                warn!(dir = %self.path.display(), "non-UTF-8 file name in table dir, skipping");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if name.starts_with(|c: char| c.is_ascii_uppercase()) {
                continue; // user file
            }
            if name == JOURNAL_NAME || name == JOURNAL_TMP_NAME || name == LOCK_NAME {
                continue;
            }
            match parse_engine_file_name(name) {
                Some((id, _ext)) => {
                    if !known_ids.contains(&id) {
                        doomed.push(entry.path());
                    }
                }
                None => {
                    warn!(file = name, "unrecognized file in table dir, skipping");
                }
            }
        }
        for path in doomed {
            debug!(file = %path.display(), "sweeping unreferenced engine file");
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Splits `<hex>.<ext>` into `(id, ext)`; `None` if the name does not fit
/// the engine convention.
pub fn parse_engine_file_name(name: &str) -> Option<(u64, &str)> {
    let dot = name.find('.')?;
    let (hex, ext) = (&name[..dot], &name[dot + 1..]);
    if hex.is_empty() || ext.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let id = u64::from_str_radix(hex, 16).ok()?;
    Some((id, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_engine_names() {
        assert_eq!(
            parse_engine_file_name("000000000000002a.index"),
            Some((42, "index"))
        );
        assert_eq!(parse_engine_file_name("ff.data"), Some((255, "data")));
        assert_eq!(parse_engine_file_name("journal"), None);
        assert_eq!(parse_engine_file_name("zz.data"), None);
        assert_eq!(parse_engine_file_name(".hidden"), None);
    }

    #[test]
    fn second_lock_fails() {
        let tmp = TempDir::new().unwrap();
        let first = TableDir::lock(tmp.path()).unwrap();
        assert!(matches!(
            TableDir::lock(tmp.path()),
            Err(DirError::Locked(_))
        ));
        drop(first);
        TableDir::lock(tmp.path()).unwrap();
    }

    #[test]
    fn sweep_spares_user_and_reserved_files() {
        let tmp = TempDir::new().unwrap();
        let dir = TableDir::lock(tmp.path()).unwrap();

        fs::write(dir.file_path(1, "index"), b"").unwrap();
        fs::write(dir.file_path(2, "data"), b"").unwrap();
        fs::write(tmp.path().join("Keepme"), b"user data").unwrap();
        fs::write(tmp.path().join("journal"), b"").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"").unwrap();

        let known: HashSet<u64> = [1].into_iter().collect();
        dir.sweep(&known).unwrap();

        assert!(dir.file_path(1, "index").exists());
        assert!(!dir.file_path(2, "data").exists());
        assert!(tmp.path().join("Keepme").exists());
        assert!(tmp.path().join("journal").exists());
        assert!(tmp.path().join("notes.txt").exists());
    }
}
