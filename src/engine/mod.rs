//! The table engine: open/insert/lookup lifecycle over all subsystems.
//!
//! A [`Table`] is a sorted key-value store in one locked directory.
//! Writes land in an in-memory buffer; when the buffer fills it is dumped
//! into an immutable on-disk *run*, and a background scheduler merges
//! adjacent runs cooperatively (interleaved with inserts, or driven by
//! the host through [`Table::step`]) so lookups only ever consult a
//! bounded number of files. A memory-mapped journal makes acknowledged
//! writes crash-recoverable.
//!
//! ## Write path
//!
//! `insert` routes the entry into the memtable; a full memtable flushes
//! a new run, periodically checkpoints the journal, and lets the
//! scheduler start merges. After a bounded number of merge steps the
//! entry is appended to the journal tail (mode-dependent) — skipped when
//! a checkpoint taken during the same insert already captured it.
//!
//! ## Read path
//!
//! `lookup` folds every location that may hold the key — memtable plus
//! all runs, newest first by default — through the user merge function,
//! consulting in-progress merge outputs once their durable frontier has
//! passed the key, and stops early when the stability predicate says the
//! answer can no longer change.
//!
//! ## Single-writer model
//!
//! All state is owned by one `Table`; methods take `&mut self`. The
//! directory holds an exclusive lock for the table's lifetime, so a
//! second process cannot corrupt it.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dir::{DirError, TableDir};
use crate::hooks::Hooks;
pub use crate::hooks::{
    CompareFn, MergeFn, MergeOutcome, SimplifyFn, SimplifyOutcome, StableFn,
};
use crate::journal::{Journal, JournalError, Snapshot};
use crate::memtable::Memtable;
use crate::merge::{
    MergeError, RunSet, StepStatus, DEFAULT_MAX_MERGE_RATIO_Q16, DEFAULT_MAX_RUNNING_TASKS,
};
use crate::runfile::{FileHints, RunFileError, RunFormat};

/// Default memtable insert-count cap.
pub const DEFAULT_MAX_IN_MEMORY_ENTRIES: usize = 2048;

/// Default memtable byte budget.
pub const DEFAULT_MAX_IN_MEMORY_BYTES: usize = 1024 * 1024;

/// A checkpoint replaces the journal every this many flushes.
const CHECKPOINT_FLUSH_PERIOD: u32 = 3;

/// Merge records processed per insert.
const MERGE_STEPS_PER_INSERT: usize = 32;

/// `Occasionally` journaling publishes batches of this many inserts.
const OCCASIONAL_BATCH_LEN: usize = 32;

/// Errors surfaced by table operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Invalid options, flags, or input shape; nothing was changed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Directory lock or sweep failure.
    #[error(transparent)]
    Dir(#[from] DirError),

    /// Journal failure; corruption here aborts recovery.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Run file failure.
    #[error(transparent)]
    RunFile(#[from] RunFileError),

    /// Merge machinery failure.
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// When inserts are made durable in the journal tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Never journal inserts; only checkpoints are written. Fastest,
    /// loses unflushed writes on crash.
    None,
    /// Journal inserts in batches: a crash loses at most one partial
    /// batch.
    Occasionally,
    /// Journal every insert before acknowledging it.
    #[default]
    Default,
}

/// Whether `open` may create a fresh table, open an existing one, or
/// both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Fail if the table already exists.
    MustCreate,
    /// Fail unless the table already exists.
    MustExist,
    /// Open whichever is there.
    #[default]
    CreateOrOpen,
}

/// Configuration for [`Table::open`].
#[derive(Clone, Default)]
pub struct TableOptions {
    /// Key comparator; lexicographic byte order when absent.
    pub compare: Option<CompareFn>,
    /// Value merge for keys inserted more than once. Without it, every
    /// insert is kept and a lookup returns the first hit in walk order —
    /// the newest value in the default newest-first mode.
    pub merge: Option<MergeFn>,
    /// Terminal reduction applied when merges reach a key's earliest
    /// history.
    pub simplify: Option<SimplifyFn>,
    /// Lets lookups stop walking early.
    pub is_stable: Option<StableFn>,
    /// Journal durability mode.
    pub journal_mode: JournalMode,
    /// On-disk format for all runs in this table.
    pub run_format: RunFormat,
    /// Memtable insert-count cap; 0 means the default.
    pub max_in_memory_entries: usize,
    /// Memtable byte budget; 0 means the default.
    pub max_in_memory_bytes: usize,
    /// Walk newest-to-oldest on lookups (the default) instead of
    /// oldest-to-newest.
    pub chronological_lookups: bool,
    /// Every key must have exactly this length.
    pub key_fixed_length: Option<usize>,
    /// Every value must have exactly this length.
    pub value_fixed_length: Option<usize>,
}

impl TableOptions {
    /// Options where the newest value simply replaces older ones: a
    /// keep-newest merge plus an always-stable predicate, so lookups
    /// stop at the first (newest) hit.
    pub fn replacement_semantics() -> Self {
        Self {
            merge: Some(Arc::new(|_key, _a, _b, _out: &mut Vec<u8>| {
                MergeOutcome::KeepB
            })),
            is_stable: Some(Arc::new(|_key, _value| true)),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for TableOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableOptions")
            .field("compare", &self.compare.is_some())
            .field("merge", &self.merge.is_some())
            .field("simplify", &self.simplify.is_some())
            .field("is_stable", &self.is_stable.is_some())
            .field("journal_mode", &self.journal_mode)
            .field("run_format", &self.run_format)
            .field("max_in_memory_entries", &self.max_in_memory_entries)
            .field("max_in_memory_bytes", &self.max_in_memory_bytes)
            .field("chronological_lookups", &self.chronological_lookups)
            .field("key_fixed_length", &self.key_fixed_length)
            .field("value_fixed_length", &self.value_fixed_length)
            .finish()
    }
}

/// A point-in-time view of engine shape, for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Runs currently in the list.
    pub n_runs: usize,
    /// Started merge tasks.
    pub n_running_merges: usize,
    /// Live entries buffered in the memtable.
    pub memtable_entries: usize,
    /// Inserts accepted over the table's lifetime.
    pub total_inserts: u64,
}

/// An open table. See the [module docs](self) for the data flow.
pub struct Table {
    dir: TableDir,
    hooks: Hooks,
    format: RunFormat,
    journal_mode: JournalMode,
    chronological: bool,
    key_fixed_length: Option<usize>,
    value_fixed_length: Option<usize>,
    memtable: Memtable,
    runs: RunSet,
    journal: Journal,
    /// Total inserts ever accepted (the input sequence counter).
    n_input_entries: u64,
    last_file_id: u64,
    /// Flushes since the last checkpoint.
    flush_index: u32,
    /// Staged tail records awaiting batch publication (`Occasionally`).
    staged: Vec<(Vec<u8>, Vec<u8>)>,
    /// True while the journal tail is being replayed on open.
    replaying: bool,
    /// Reusable query buffers.
    result_bufs: [Vec<u8>; 2],
    query_buf: Vec<u8>,
}

impl Table {
    /// Opens (or creates) a table rooted at `path`.
    ///
    /// A table exists when its directory contains a journal; `mode` says
    /// which cases are acceptable. On an existing table the journal is
    /// recovered — runs reopened, in-flight merges resumed, the tail
    /// replayed — and unreferenced engine files are swept.
    pub fn open(
        path: impl AsRef<Path>,
        options: TableOptions,
        mode: OpenMode,
    ) -> Result<Self, TableError> {
        let path = path.as_ref();
        let max_entries = match options.max_in_memory_entries {
            0 => DEFAULT_MAX_IN_MEMORY_ENTRIES,
            n => n,
        };
        let max_bytes = match options.max_in_memory_bytes {
            0 => DEFAULT_MAX_IN_MEMORY_BYTES,
            n => n,
        };
        if options.key_fixed_length == Some(0) || options.value_fixed_length == Some(0) {
            return Err(TableError::Config(
                "fixed key/value lengths must be nonzero".into(),
            ));
        }
        if options.simplify.is_some() && options.merge.is_none() {
            return Err(TableError::Config(
                "a simplify function requires a merge function".into(),
            ));
        }

        // A table exists when its journal does; decide before touching
        // the filesystem so a refused open leaves nothing behind.
        let exists = path.join(crate::dir::JOURNAL_NAME).exists();
        match (exists, mode) {
            (true, OpenMode::MustCreate) => {
                return Err(TableError::Config(format!(
                    "table at {} already exists",
                    path.display()
                )));
            }
            (false, OpenMode::MustExist) => {
                return Err(TableError::Config(format!(
                    "no table at {}",
                    path.display()
                )));
            }
            _ => {}
        }

        fs::create_dir_all(path)?;
        let dir = TableDir::lock(path)?;

        let hooks = Hooks {
            compare: options.compare.clone(),
            merge: options.merge.clone(),
            simplify: options.simplify.clone(),
            is_stable: options.is_stable.clone(),
        };
        let journal_min_size = max_bytes + 8 * max_entries + 4096;

        let mut table = if exists {
            let (journal, recovered) =
                Journal::open(&dir.journal_path(), &dir.journal_tmp_path())?;
            let runs = RunSet::recover(
                &recovered.snapshot,
                dir.path(),
                options.run_format,
                DEFAULT_MAX_RUNNING_TASKS,
                DEFAULT_MAX_MERGE_RATIO_Q16,
            )?;
            let last_file_id = recovered
                .snapshot
                .files
                .iter()
                .map(|f| f.id)
                .chain(recovered.snapshot.tasks.iter().map(|t| t.output_id))
                .max()
                .unwrap_or(0);

            dir.sweep(&runs.known_file_ids())?;

            let mut table = Self {
                dir,
                hooks,
                format: options.run_format,
                journal_mode: options.journal_mode,
                chronological: options.chronological_lookups,
                key_fixed_length: options.key_fixed_length,
                value_fixed_length: options.value_fixed_length,
                memtable: Memtable::new(max_entries, max_bytes),
                runs,
                journal,
                n_input_entries: recovered.snapshot.n_input_entries,
                last_file_id,
                flush_index: 0,
                staged: Vec::new(),
                replaying: false,
                result_bufs: [Vec::new(), Vec::new()],
                query_buf: Vec::new(),
            };

            info!(
                dir = %path.display(),
                runs = table.runs.n_runs(),
                merges = table.runs.n_running_tasks(),
                tail = recovered.tail.len(),
                "table recovered"
            );

            // Re-apply tail inserts with journaling suspended; they are
            // already durable in the tail we just read.
            table.replaying = true;
            for (key, value) in &recovered.tail {
                if let Err(e) = table.insert(key, value) {
                    table.replaying = false;
                    return Err(e);
                }
            }
            table.replaying = false;
            table
        } else {
            let journal = Journal::checkpoint(
                &dir.journal_path(),
                &dir.journal_tmp_path(),
                &Snapshot::default(),
                journal_min_size,
            )?;
            info!(dir = %path.display(), "table created");
            Self {
                dir,
                hooks,
                format: options.run_format,
                journal_mode: options.journal_mode,
                chronological: options.chronological_lookups,
                key_fixed_length: options.key_fixed_length,
                value_fixed_length: options.value_fixed_length,
                memtable: Memtable::new(max_entries, max_bytes),
                runs: RunSet::new(DEFAULT_MAX_RUNNING_TASKS, DEFAULT_MAX_MERGE_RATIO_Q16),
                journal,
                n_input_entries: 0,
                last_file_id: 0,
                flush_index: 0,
                staged: Vec::new(),
                replaying: false,
                result_bufs: [Vec::new(), Vec::new()],
                query_buf: Vec::new(),
            }
        };

        // Merges recovered mid-flight may resume immediately.
        table
            .runs
            .maybe_start_tasks(table.dir.path(), table.format, &mut table.last_file_id)?;
        Ok(table)
    }

    /// The directory this table lives in.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Current shape of the table.
    pub fn stats(&self) -> TableStats {
        TableStats {
            n_runs: self.runs.n_runs(),
            n_running_merges: self.runs.n_running_tasks(),
            memtable_entries: self.memtable.live_entries(),
            total_inserts: self.n_input_entries,
        }
    }

    fn check_entry_shape(&self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        if let Some(len) = self.key_fixed_length {
            if key.len() != len {
                return Err(TableError::Config(format!(
                    "key length {} violates fixed length {len}",
                    key.len()
                )));
            }
        }
        if let Some(len) = self.value_fixed_length {
            if value.len() != len {
                return Err(TableError::Config(format!(
                    "value length {} violates fixed length {len}",
                    value.len()
                )));
            }
        }
        Ok(())
    }

    /// Adds one `(key, value)` pair.
    ///
    /// With a merge function configured, an existing key folds according
    /// to the merge outcome; without one both entries are kept. The
    /// entry is journaled (per [`JournalMode`]) after it is applied —
    /// unless a checkpoint taken during this insert already captured it
    /// inside a run, which makes the tail record redundant.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        self.check_entry_shape(key, value)?;

        self.n_input_entries += 1;
        let full = self.memtable.insert(key, value, &self.hooks);

        let checkpointed = if full { self.flush_memtable()? } else { false };

        if self.runs.n_running_tasks() > 0 {
            self.step(MERGE_STEPS_PER_INSERT)?;
        }

        if !self.replaying && !checkpointed {
            match self.journal_mode {
                JournalMode::Default => self.journal.append(key, value)?,
                JournalMode::Occasionally => {
                    self.staged.push((key.to_vec(), value.to_vec()));
                    if self.staged.len() >= OCCASIONAL_BATCH_LEN {
                        self.publish_staged()?;
                    }
                }
                JournalMode::None => {}
            }
        }
        Ok(())
    }

    fn publish_staged(&mut self) -> Result<(), TableError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        self.journal
            .append_batch(staged.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))?;
        Ok(())
    }

    /// Dumps the memtable into a fresh run, then checkpoints on the
    /// configured cadence and lets the scheduler pick up new work.
    ///
    /// Returns whether a checkpoint was written; the caller skips the
    /// journal tail record in that case, since the checkpoint already
    /// covers the insert that triggered the flush.
    fn flush_memtable(&mut self) -> Result<bool, TableError> {
        self.flush_memtable_with(true)
    }

    fn flush_memtable_with(&mut self, plan_merges: bool) -> Result<bool, TableError> {
        let n_inputs = self.memtable.insert_count();
        if n_inputs == 0 {
            return Ok(false);
        }
        // Any staged tail records must be durable before the run that
        // contains them can be checkpointed.
        self.publish_staged()?;

        let id = self.last_file_id + 1;
        let hints = FileHints {
            expected_entries: Some(self.memtable.live_entries() as u64),
            key_fixed_length: self.key_fixed_length,
            value_fixed_length: self.value_fixed_length,
        };
        let mut file = self.format.create(self.dir.path(), id, &hints)?;
        let feed_result = (|| -> Result<(), TableError> {
            for (key, value) in self.memtable.iter_sorted() {
                file.feed(key, value)?;
            }
            let mut ready = file.done_feeding()?;
            while !ready {
                ready = file.build_step()?;
            }
            Ok(())
        })();
        if let Err(e) = feed_result {
            // The memtable is untouched; the next insert retries the
            // flush.
            if let Err(destroy_err) = file.destroy(true) {
                warn!(error = %destroy_err, "erasing failed flush output also failed");
            }
            return Err(e);
        }
        self.last_file_id = id;

        let first_input_entry = self.n_input_entries - n_inputs;
        debug!(
            id,
            first_input_entry,
            inputs = n_inputs,
            entries = file.entry_count(),
            "memtable flushed to run"
        );
        self.runs.append_run(file, first_input_entry, n_inputs);
        self.memtable.reset();

        let mut checkpointed = false;
        self.flush_index += 1;
        // No checkpoints while the tail is being replayed: the on-disk
        // journal must stay intact until replay finishes, so a crash
        // mid-replay recovers from the same journal again.
        if self.flush_index >= CHECKPOINT_FLUSH_PERIOD && !self.replaying {
            self.checkpoint()?;
            self.flush_index = 0;
            checkpointed = true;
        }

        if plan_merges {
            self.runs
                .maybe_start_tasks(self.dir.path(), self.format, &mut self.last_file_id)?;
        }
        Ok(checkpointed)
    }

    /// Writes a fresh checkpoint and releases runs only the previous
    /// checkpoint still referenced.
    fn checkpoint(&mut self) -> Result<(), TableError> {
        let snapshot = self.runs.snapshot(self.n_input_entries)?;
        self.journal.rewrite(&snapshot)?;
        self.runs.commit_checkpoint();
        Ok(())
    }

    /// Runs up to `count` merge-step records; the host event loop may
    /// call this between inserts to keep merges progressing.
    pub fn step(&mut self, count: usize) -> Result<(), TableError> {
        if self.runs.step(count, &self.hooks)? == StepStatus::Completed {
            self.runs
                .maybe_start_tasks(self.dir.path(), self.format, &mut self.last_file_id)?;
        }
        Ok(())
    }

    /// Exact-match lookup.
    ///
    /// Folds every value recorded for `key` through the merge function —
    /// newest-first by default, oldest-first in chronological mode — and
    /// returns the folded result, or `None` if the key was never written
    /// (or folded away).
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TableError> {
        if let Some(len) = self.key_fixed_length {
            if key.len() != len {
                return Err(TableError::Config(format!(
                    "key length {} violates fixed length {len}",
                    key.len()
                )));
            }
        }
        let hooks = self.hooks.clone();
        let reverse = !self.chronological;
        let no_merge = hooks.merge.is_none();

        let mut has_result = false;
        let mut result_idx = 0usize;

        // Folds `found` into the accumulator; returns true when the walk
        // can stop.
        macro_rules! fold {
            ($found:expr) => {{
                let found: &[u8] = $found;
                if !has_result {
                    has_result = true;
                    self.result_bufs[result_idx].clear();
                    self.result_bufs[result_idx].extend_from_slice(found);
                    if no_merge {
                        // First hit in walk order is the answer.
                        true
                    } else {
                        hooks.is_stable.as_ref().is_some_and(|stable| {
                            stable(key, &self.result_bufs[result_idx])
                        })
                    }
                } else {
                    let merge = hooks.merge.as_ref().expect("merge fn when folding");
                    let other = 1 - result_idx;
                    self.result_bufs[other].clear();
                    let (bufs_lo, bufs_hi) = self.result_bufs.split_at_mut(1);
                    let (acc, out): (&mut Vec<u8>, &mut Vec<u8>) = if result_idx == 0 {
                        (&mut bufs_lo[0], &mut bufs_hi[0])
                    } else {
                        (&mut bufs_hi[0], &mut bufs_lo[0])
                    };
                    // Walking newest-first the found value is older than
                    // the accumulator; oldest-first it is newer.
                    let outcome = if reverse {
                        merge(key, found, acc, out)
                    } else {
                        merge(key, acc, found, out)
                    };
                    match outcome {
                        MergeOutcome::KeepA => {
                            if reverse {
                                acc.clear();
                                acc.extend_from_slice(found);
                            }
                        }
                        MergeOutcome::KeepB => {
                            if !reverse {
                                acc.clear();
                                acc.extend_from_slice(found);
                            }
                        }
                        MergeOutcome::Merged => result_idx = other,
                        MergeOutcome::Drop => has_result = false,
                    }
                    has_result
                        && hooks.is_stable.as_ref().is_some_and(|stable| {
                            stable(key, &self.result_bufs[result_idx])
                        })
                }
            }};
        }

        // Newest-first mode consults the memtable before any run.
        if reverse {
            if let Some((_, value)) = self.memtable.lookup(key, &hooks) {
                let value = value.to_vec();
                if fold!(&value) {
                    return Ok(Some(self.result_bufs[result_idx].clone()));
                }
            }
        }

        let ids = self.runs.run_ids();
        let walk: Vec<u32> = if reverse {
            ids.iter().rev().copied().collect()
        } else {
            ids
        };

        let mut skip_next = false;
        for &run_id in &walk {
            if skip_next {
                skip_next = false;
                continue;
            }

            // An in-progress merge output stands in for both of its
            // inputs once its durable frontier covers the key.
            let task = if reverse {
                self.runs.started_task_before(run_id)
            } else {
                self.runs.started_task_after(run_id)
            };
            let usable_task = task.filter(|&t| {
                self.runs
                    .task_last_queryable(t)
                    .is_some_and(|frontier| hooks.cmp(frontier, key) != Ordering::Less)
            });

            let mut query_buf = std::mem::take(&mut self.query_buf);
            let found = match usable_task {
                Some(t) => {
                    skip_next = true;
                    let output = self.runs.task_output_mut(t);
                    output.query(&mut |candidate| hooks.cmp(key, candidate), &mut query_buf)?
                }
                None => {
                    let file = self.runs.run_file_mut(run_id);
                    file.query(&mut |candidate| hooks.cmp(key, candidate), &mut query_buf)?
                }
            };
            self.query_buf = query_buf;

            if found {
                let value = std::mem::take(&mut self.query_buf);
                let stop = fold!(&value);
                self.query_buf = value;
                if stop {
                    return Ok(Some(self.result_bufs[result_idx].clone()));
                }
            }
        }

        // Oldest-first mode ends at the memtable.
        if !reverse {
            if let Some((_, value)) = self.memtable.lookup(key, &hooks) {
                let value = value.to_vec();
                if fold!(&value) {
                    return Ok(Some(self.result_bufs[result_idx].clone()));
                }
            }
        }

        Ok(has_result.then(|| self.result_bufs[result_idx].clone()))
    }

    /// Shuts the table down cleanly: buffered writes are flushed to a
    /// run, merge progress is checkpointed, and the directory lock is
    /// released.
    ///
    /// Dropping a `Table` without `close` releases the lock but skips
    /// the final flush and checkpoint; the journal tail still covers the
    /// buffered writes in the default journal mode.
    pub fn close(mut self) -> Result<(), TableError> {
        self.publish_staged()?;
        // Flush without planning fresh merges; the table is going away.
        self.flush_memtable_with(false)?;
        self.checkpoint()?;
        let stats = self.stats();
        info!(
            runs = stats.n_runs,
            merges = stats.n_running_merges,
            inserts = stats.total_inserts,
            "table closed"
        );
        let Self { runs, .. } = self;
        runs.close();
        Ok(())
    }
}
