//! Uniform contract over on-disk run formats.
//!
//! A *run* is an immutable sorted file of `(key, value)` entries, produced
//! either by flushing the memtable or by merging two adjacent runs. The
//! engine manipulates runs only through the [`RunFile`] and [`RunReader`]
//! traits, so the two concrete formats — [`flat`] (write-optimized,
//! compressed blocks) and [`btree`] (read-optimized, multi-level tree) —
//! are interchangeable. One directory always uses a single format, chosen
//! at open time; files and readers are boxed trait objects.
//!
//! # Lifecycle
//!
//! ```text
//! create ──feed*──> done_feeding ──build_step*──> readable
//!    │                    │
//!    └── build_state ─────┘      (resumable via open_building)
//! ```
//!
//! `feed` reports [`FeedOutcome::BlockFlushed`] whenever the format just
//! made everything fed so far durable in a self-contained unit; build
//! state may only be captured at such boundaries. Formats whose
//! `done_feeding` returns `false` finish construction through repeated
//! `build_step` calls.

pub mod btree;
pub mod flat;
pub mod mmap;

use std::cmp::Ordering;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::encoding::EncodingError;
use mmap::MmapError;

/// Errors from run-file operations.
#[derive(Debug, Error)]
pub enum RunFileError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Mmap-layer failure.
    #[error("mmap error: {0}")]
    Mmap(#[from] MmapError),

    /// The file's bytes do not decode as the format demands.
    #[error("corrupt run file: {0}")]
    Corrupt(String),

    /// Decoding failure inside a block or state blob.
    #[error("corrupt run file: {0}")]
    Encoding(#[from] EncodingError),

    /// A saved build or reader state does not match the file.
    #[error("invalid saved state: {0}")]
    BadState(String),
}

/// Result of feeding one entry to a run writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The entry was buffered; keep feeding.
    WantMore,
    /// The entry completed a block; everything fed so far is serialized
    /// and [`RunFile::build_state`] may be captured.
    BlockFlushed,
}

/// Sizing hints passed to `create`. Formats may ignore any of them.
#[derive(Debug, Clone, Copy)]
pub struct FileHints {
    /// Expected number of entries, if known.
    pub expected_entries: Option<u64>,
    /// Keys have this exact length (stored implicitly when supported).
    pub key_fixed_length: Option<usize>,
    /// Values have this exact length (stored implicitly when supported).
    pub value_fixed_length: Option<usize>,
}

impl Default for FileHints {
    fn default() -> Self {
        Self {
            expected_entries: None,
            key_fixed_length: None,
            value_fixed_length: None,
        }
    }
}

/// A run file in any lifecycle state.
///
/// Keys must be fed in strictly ascending order under the table's
/// comparator; formats do not re-validate the order.
pub trait RunFile {
    /// The 64-bit id this file was created with.
    fn id(&self) -> u64;

    /// Number of entries fed so far (building) or stored (readable).
    fn entry_count(&self) -> u64;

    /// Appends one entry to the file being built.
    fn feed(&mut self, key: &[u8], value: &[u8]) -> Result<FeedOutcome, RunFileError>;

    /// Ends the feed phase. Returns `true` when the file is immediately
    /// readable, `false` when [`RunFile::build_step`] calls remain.
    fn done_feeding(&mut self) -> Result<bool, RunFileError>;

    /// Advances a multi-phase build; returns `true` when readable.
    fn build_step(&mut self) -> Result<bool, RunFileError>;

    /// Serializes the build progress so the file can be resumed with
    /// `open_building` after a restart. Valid whenever the last `feed`
    /// returned [`FeedOutcome::BlockFlushed`] (or nothing was fed yet).
    fn build_state(&self) -> Result<Vec<u8>, RunFileError>;

    /// Point lookup. `cmp` orders the caller's target against a candidate
    /// key (`Less` = target sorts before the candidate). On a hit the
    /// value is copied into `value_out` and `true` is returned.
    ///
    /// Works on readable files and on files still being built (merge
    /// outputs are queried mid-build).
    fn query(
        &mut self,
        cmp: &mut dyn FnMut(&[u8]) -> Ordering,
        value_out: &mut Vec<u8>,
    ) -> Result<bool, RunFileError>;

    /// Opens a sequential reader positioned at the first entry.
    fn create_reader(&self) -> Result<Box<dyn RunReader>, RunFileError>;

    /// Re-opens a sequential reader from a state produced by
    /// [`RunReader::save_state`].
    fn recreate_reader(&self, state: &[u8]) -> Result<Box<dyn RunReader>, RunFileError>;

    /// Releases the file, optionally unlinking its backing files.
    fn destroy(self: Box<Self>, erase: bool) -> Result<(), RunFileError>;
}

/// A sequential cursor over a run's entries, used to drive merges.
pub trait RunReader {
    /// The current entry, or `None` at end of file.
    fn entry(&self) -> Option<(&[u8], &[u8])>;

    /// Moves to the next entry (or to end of file).
    fn advance(&mut self) -> Result<(), RunFileError>;

    /// Serializes the position. Restorable with
    /// [`RunFile::recreate_reader`]; must be callable in any state.
    fn save_state(&self) -> Vec<u8>;
}

/// The on-disk format used for every run in a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunFormat {
    /// Compressed flat blocks; optimized for write-dominated loads.
    #[default]
    Flat,
    /// Prefix-compressed B-tree; optimized for read-dominated loads.
    Btree,
}

impl RunFormat {
    /// Begins writing a new run file.
    pub fn create(
        self,
        dir: &Path,
        id: u64,
        hints: &FileHints,
    ) -> Result<Box<dyn RunFile>, RunFileError> {
        match self {
            Self::Flat => Ok(Box::new(flat::FlatFile::create(dir, id, hints)?)),
            Self::Btree => Ok(Box::new(btree::BtreeFile::create(dir, id, hints)?)),
        }
    }

    /// Resumes a half-written run file from serialized build state.
    pub fn open_building(
        self,
        dir: &Path,
        id: u64,
        state: &[u8],
    ) -> Result<Box<dyn RunFile>, RunFileError> {
        match self {
            Self::Flat => Ok(Box::new(flat::FlatFile::open_building(dir, id, state)?)),
            Self::Btree => Ok(Box::new(btree::BtreeFile::open_building(dir, id, state)?)),
        }
    }

    /// Opens a completed run file read-only.
    pub fn open(self, dir: &Path, id: u64) -> Result<Box<dyn RunFile>, RunFileError> {
        match self {
            Self::Flat => Ok(Box::new(flat::FlatFile::open(dir, id)?)),
            Self::Btree => Ok(Box::new(btree::BtreeFile::open(dir, id)?)),
        }
    }

    /// File extensions this format owns, scratch files included.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Flat => flat::EXTENSIONS,
            Self::Btree => btree::EXTENSIONS,
        }
    }
}
