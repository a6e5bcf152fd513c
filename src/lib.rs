//! # siltdb
//!
//! An embeddable, sorted key-value store built on merged immutable runs
//! (a log-structured merge tree) with pluggable on-disk formats, a
//! memory-mapped write-ahead journal, and a cooperative background merge
//! scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Table                             │
//! │  ┌───────────┐   flush   ┌──────┐ ┌──────┐ ┌──────┐       │
//! │  │ Memtable  │──────────▶│ run  │ │ run  │ │ run  │  …    │
//! │  │ (sorted)  │           └──┬───┘ └──┬───┘ └──────┘       │
//! │  └───────────┘              └───▲────┘                    │
//! │                           merge │ scheduler (step-driven) │
//! │  ┌──────────────────────────────┴────────────────────┐    │
//! │  │   Journal (mmap): checkpoint header + insert tail │    │
//! │  └───────────────────────────────────────────────────┘    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | The [`Table`] itself — open, insert, lookup, step, close |
//! | `memtable` | Ordered in-memory buffer with merge-on-insert |
//! | [`runfile`] | Immutable sorted run files (flat blocks or B-tree) |
//! | [`merge`] | Run list, merge planning, cooperative merge stepping |
//! | [`journal`] | Checkpoint + tail journal for crash recovery |
//! | [`dir`] | Directory lock, file naming, garbage sweep |
//! | [`encoding`] | Varints and little-endian wire primitives |
//!
//! ## Semantics
//!
//! Keys and values are opaque byte strings. Ordering, value folding,
//! terminal reduction, and lookup short-circuiting are pluggable through
//! [`TableOptions`]; deletion is expressed by a merge function returning
//! [`MergeOutcome::Drop`] rather than a status bit.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use siltdb::{OpenMode, Table, TableOptions};
//!
//! let options = TableOptions::replacement_semantics();
//! let mut table = Table::open("/tmp/my_table", options, OpenMode::CreateOrOpen)?;
//!
//! table.insert(b"hello", b"world")?;
//! assert_eq!(table.lookup(b"hello")?, Some(b"world".to_vec()));
//!
//! // Drive background merges from the host loop if inserts are rare.
//! table.step(32)?;
//!
//! table.close()?;
//! # Ok::<(), siltdb::TableError>(())
//! ```

pub mod dir;
pub mod encoding;
pub mod engine;
mod hooks;
pub mod journal;
mod memtable;
pub mod merge;
pub mod runfile;

pub use engine::{
    JournalMode, OpenMode, Table, TableError, TableOptions, TableStats,
};
pub use hooks::{CompareFn, MergeFn, MergeOutcome, SimplifyFn, SimplifyOutcome, StableFn};
pub use runfile::RunFormat;
