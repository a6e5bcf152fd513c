//! Crash-recovery journal: state checkpoints plus an append-only tail.
//!
//! The journal is one memory-mapped file with two zones:
//!
//! - a **checkpoint header** — a snapshot of the run set and every
//!   started merge task (reader positions and output build state) at the
//!   moment the checkpoint was written, and
//! - a **tail** of `(key, value)` records for inserts accepted since that
//!   checkpoint.
//!
//! # Layout (all integers little-endian)
//!
//! ```text
//! magic:4  n_files:4  n_tasks:4  reserved:4  n_input_entries:8
//! per file:  id:8  first_input_entry:8  n_input_entries:8  n_entries:8
//! per task:  in0_id:8 r0_len:4 r0…  in1_id:8 r1_len:4 r1…  out_id:8 bs_len:4 bs…
//! tail (4-byte aligned): key_len+1:4  value_len:4  key…  value…   …   0:4
//! ```
//!
//! A tail record becomes visible only when its `key_len+1` word is
//! written; the payload and the zeroed terminator of the *next* record go
//! in first, a release fence orders them, and the length word is
//! published last. A torn tail therefore always ends at a zero word.
//!
//! Checkpoints are atomic: the new header is written to `journal.tmp`
//! and renamed over `journal`. When the tail would overflow the map, the
//! file is grown by doubling and remapped.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{Cursor, EncodingError};

/// First four bytes of every journal.
pub const JOURNAL_MAGIC: u32 = 0x1143_eeab;

const HEADER_FIXED_LEN: usize = 4 + 4 + 4 + 4 + 8;

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal bytes do not parse; recovery must be aborted.
    #[error("corrupt journal: {0}")]
    Corrupt(String),
}

impl From<EncodingError> for JournalError {
    fn from(e: EncodingError) -> Self {
        JournalError::Corrupt(e.to_string())
    }
}

/// One run recorded in a checkpoint header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Run file id.
    pub id: u64,
    /// First input-sequence index the run covers.
    pub first_input_entry: u64,
    /// Number of input-sequence indices the run covers.
    pub n_input_entries: u64,
    /// Entries physically stored in the run.
    pub n_entries: u64,
}

/// One started merge task recorded in a checkpoint header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// Ids of the two adjacent input runs, older first.
    pub input_ids: [u64; 2],
    /// Saved reader positions for both inputs.
    pub reader_states: [Vec<u8>; 2],
    /// Id of the output run being built.
    pub output_id: u64,
    /// Saved builder state of the output.
    pub build_state: Vec<u8>,
}

/// Everything a checkpoint header captures.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Runs, oldest first; must be contiguous in input sequence.
    pub files: Vec<FileRecord>,
    /// Started merge tasks, in run-set order.
    pub tasks: Vec<TaskRecord>,
    /// Total inserts ever accepted.
    pub n_input_entries: u64,
}

/// A parsed journal: the snapshot plus the replayable tail.
pub struct Recovered {
    /// The checkpointed state.
    pub snapshot: Snapshot,
    /// Tail inserts, oldest first.
    pub tail: Vec<(Vec<u8>, Vec<u8>)>,
}

/// The live journal handle.
pub struct Journal {
    file: File,
    map: MmapMut,
    size: usize,
    /// Append offset of the tail terminator (4-byte aligned).
    len: usize,
    path: PathBuf,
    tmp_path: PathBuf,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// Safety note: all maps in this module are private to this process; the
// directory lock guarantees no second writer exists.
fn map_file(file: &File) -> Result<MmapMut, JournalError> {
    Ok(unsafe { MmapMut::map_mut(file)? })
}

/// Appends bytes at `*at`, growing the file and remapping when the write
/// (plus terminator headroom) would not fit.
fn put_bytes(
    file: &File,
    map: &mut MmapMut,
    size: &mut usize,
    at: &mut usize,
    bytes: &[u8],
) -> Result<(), JournalError> {
    if *at + bytes.len() + 4 > *size {
        let mut new_size = *size;
        while new_size < *at + bytes.len() + 4 {
            new_size *= 2;
        }
        file.set_len(new_size as u64)?;
        *map = map_file(file)?;
        *size = new_size;
    }
    map[*at..*at + bytes.len()].copy_from_slice(bytes);
    *at += bytes.len();
    Ok(())
}

impl Journal {
    /// Writes a fresh checkpoint to `tmp_path` and renames it over
    /// `path`, returning the live handle positioned for tail appends.
    ///
    /// `min_size` bounds the initial file size; the file grows by
    /// doubling whenever the header or tail needs more room.
    pub fn checkpoint(
        path: &Path,
        tmp_path: &Path,
        snapshot: &Snapshot,
        min_size: usize,
    ) -> Result<Self, JournalError> {
        let mut size = 1024usize;
        while size < min_size {
            size *= 2;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        file.set_len(size as u64)?;
        let mut map = map_file(&file)?;

        let mut at = 0usize;
        put_bytes(&file, &mut map, &mut size, &mut at, &JOURNAL_MAGIC.to_le_bytes())?;
        put_bytes(
            &file,
            &mut map,
            &mut size,
            &mut at,
            &(snapshot.files.len() as u32).to_le_bytes(),
        )?;
        put_bytes(
            &file,
            &mut map,
            &mut size,
            &mut at,
            &(snapshot.tasks.len() as u32).to_le_bytes(),
        )?;
        put_bytes(&file, &mut map, &mut size, &mut at, &0u32.to_le_bytes())?;
        put_bytes(
            &file,
            &mut map,
            &mut size,
            &mut at,
            &snapshot.n_input_entries.to_le_bytes(),
        )?;

        for f in &snapshot.files {
            let mut rec = Vec::with_capacity(32);
            rec.extend_from_slice(&f.id.to_le_bytes());
            rec.extend_from_slice(&f.first_input_entry.to_le_bytes());
            rec.extend_from_slice(&f.n_input_entries.to_le_bytes());
            rec.extend_from_slice(&f.n_entries.to_le_bytes());
            put_bytes(&file, &mut map, &mut size, &mut at, &rec)?;
        }
        for t in &snapshot.tasks {
            let mut rec = Vec::new();
            for input in 0..2 {
                rec.extend_from_slice(&t.input_ids[input].to_le_bytes());
                rec.extend_from_slice(&(t.reader_states[input].len() as u32).to_le_bytes());
                rec.extend_from_slice(&t.reader_states[input]);
            }
            rec.extend_from_slice(&t.output_id.to_le_bytes());
            rec.extend_from_slice(&(t.build_state.len() as u32).to_le_bytes());
            rec.extend_from_slice(&t.build_state);
            put_bytes(&file, &mut map, &mut size, &mut at, &rec)?;
        }

        std::fs::rename(tmp_path, path)?;
        info!(
            files = snapshot.files.len(),
            tasks = snapshot.tasks.len(),
            inputs = snapshot.n_input_entries,
            header_len = at,
            "journal checkpoint written"
        );

        // The file was zero-filled by set_len, so the aligned terminator
        // is already in place.
        let len = align4(at);
        Ok(Self {
            file,
            map,
            size,
            len,
            path: path.to_path_buf(),
            tmp_path: tmp_path.to_path_buf(),
        })
    }

    /// Opens and parses an existing journal.
    pub fn open(path: &Path, tmp_path: &Path) -> Result<(Self, Recovered), JournalError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size < HEADER_FIXED_LEN {
            return Err(JournalError::Corrupt(format!(
                "journal is {size} bytes, smaller than its fixed header"
            )));
        }
        let map = map_file(&file)?;

        let mut cur = Cursor::new(&map);
        let magic = cur.read_u32_le()?;
        if magic != JOURNAL_MAGIC {
            return Err(JournalError::Corrupt(format!(
                "bad journal magic {magic:#010x}, want {JOURNAL_MAGIC:#010x}"
            )));
        }
        let n_files = cur.read_u32_le()?;
        let n_tasks = cur.read_u32_le()?;
        let reserved = cur.read_u32_le()?;
        if reserved != 0 {
            return Err(JournalError::Corrupt(
                "reserved journal word is nonzero".into(),
            ));
        }
        let n_input_entries = cur.read_u64_le()?;

        let mut files = Vec::with_capacity(n_files as usize);
        for i in 0..n_files {
            let record = FileRecord {
                id: cur.read_u64_le()?,
                first_input_entry: cur.read_u64_le()?,
                n_input_entries: cur.read_u64_le()?,
                n_entries: cur.read_u64_le()?,
            };
            if i == 0 {
                if record.first_input_entry != 0 {
                    return Err(JournalError::Corrupt(format!(
                        "first run {:#x} starts at {}, not zero",
                        record.id, record.first_input_entry
                    )));
                }
            } else {
                let prev: &FileRecord = &files[i as usize - 1];
                let prev_end = prev.first_input_entry + prev.n_input_entries;
                if prev_end != record.first_input_entry {
                    return Err(JournalError::Corrupt(format!(
                        "runs {:#x} and {:#x} are not contiguous ({} vs {})",
                        prev.id, record.id, prev_end, record.first_input_entry
                    )));
                }
            }
            files.push(record);
        }

        // Checkpoints are only written with an empty memtable, so the
        // recorded runs must cover the input sequence exactly.
        let covered = files
            .last()
            .map(|f| f.first_input_entry + f.n_input_entries)
            .unwrap_or(0);
        if covered != n_input_entries {
            return Err(JournalError::Corrupt(format!(
                "runs cover {covered} inputs but the header records {n_input_entries}"
            )));
        }

        let mut tasks = Vec::with_capacity(n_tasks as usize);
        for _ in 0..n_tasks {
            let mut input_ids = [0u64; 2];
            let mut reader_states: [Vec<u8>; 2] = [Vec::new(), Vec::new()];
            for input in 0..2 {
                input_ids[input] = cur.read_u64_le()?;
                let len = cur.read_u32_le()? as usize;
                reader_states[input] = cur.read_bytes(len)?.to_vec();
            }
            let output_id = cur.read_u64_le()?;
            let len = cur.read_u32_le()? as usize;
            let build_state = cur.read_bytes(len)?.to_vec();
            tasks.push(TaskRecord {
                input_ids,
                reader_states,
                output_id,
                build_state,
            });
        }

        debug!(
            n_files,
            n_tasks,
            n_input_entries,
            header_len = cur.position(),
            "journal header parsed"
        );

        // Tail replay: records are 4-byte aligned and end at a zero word.
        let mut tail = Vec::new();
        loop {
            cur.align4();
            let key_len_plus1 = cur.read_u32_le()?;
            if key_len_plus1 == 0 {
                break;
            }
            let key_len = (key_len_plus1 - 1) as usize;
            let value_len = cur.read_u32_le()? as usize;
            let key = cur.read_bytes(key_len)?.to_vec();
            let value = cur.read_bytes(value_len)?.to_vec();
            tail.push((key, value));
        }
        // The terminator word itself is where appends continue.
        let len = cur.position() - 4;
        debug_assert_eq!(len % 4, 0);

        if !tail.is_empty() {
            info!(records = tail.len(), "journal tail to replay");
        }

        let journal = Self {
            file,
            map,
            size,
            len,
            path: path.to_path_buf(),
            tmp_path: tmp_path.to_path_buf(),
        };
        Ok((
            journal,
            Recovered {
                snapshot: Snapshot {
                    files,
                    tasks,
                    n_input_entries,
                },
                tail,
            },
        ))
    }

    /// Replaces this journal with a fresh checkpoint.
    pub fn rewrite(&mut self, snapshot: &Snapshot) -> Result<(), JournalError> {
        let replacement = Self::checkpoint(&self.path, &self.tmp_path, snapshot, self.size)?;
        *self = replacement;
        Ok(())
    }

    /// Appends one insert to the tail.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<(), JournalError> {
        self.append_batch(std::iter::once((key, value)))
    }

    /// Appends a batch of inserts, publishing them under a single
    /// sentinel flip: either the whole batch is visible after a crash or
    /// none of it is.
    pub fn append_batch<'a, I>(&mut self, records: I) -> Result<(), JournalError>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let start = self.len;
        let mut at = start;
        let mut first_len_word: Option<(usize, u32)> = None;

        for (key, value) in records {
            let record_end = align4(at + 8 + key.len() + value.len());
            if record_end + 4 > self.size {
                self.grow(record_end + 4)?;
            }
            // Zero the terminator past this record before publishing it.
            self.map[record_end..record_end + 4].copy_from_slice(&0u32.to_le_bytes());
            self.map[at + 8..at + 8 + key.len()].copy_from_slice(key);
            self.map[at + 8 + key.len()..at + 8 + key.len() + value.len()].copy_from_slice(value);
            self.map[at + 4..at + 8].copy_from_slice(&(value.len() as u32).to_le_bytes());
            let len_word = (key.len() as u32) + 1;
            if at == start {
                first_len_word = Some((at, len_word));
            } else {
                self.map[at..at + 4].copy_from_slice(&len_word.to_le_bytes());
            }
            at = record_end;
        }

        let Some((first_at, len_word)) = first_len_word else {
            return Ok(()); // empty batch
        };

        // Publish: payload first, fence, then the leading length word the
        // recovery scan keys on.
        fence(Ordering::Release);
        self.map[first_at..first_at + 4].copy_from_slice(&len_word.to_le_bytes());
        self.len = at;
        Ok(())
    }

    fn grow(&mut self, min_size: usize) -> Result<(), JournalError> {
        let mut new_size = self.size;
        while new_size < min_size {
            new_size *= 2;
        }
        debug!(from = self.size, to = new_size, "journal growing");
        self.file.set_len(new_size as u64)?;
        self.map = map_file(&self.file)?;
        self.size = new_size;
        Ok(())
    }

    /// Current tail append offset; test and diagnostics hook.
    pub fn tail_len(&self) -> usize {
        self.len
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(e) = self.map.flush() {
            warn!(path = %self.path.display(), error = %e, "journal flush on drop failed");
        }
    }
}
