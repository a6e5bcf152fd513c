//! Run set and background merge scheduler.
//!
//! The engine's on-disk state is a totally ordered list of runs; each run
//! covers a contiguous half-open range of the input sequence and the list
//! covers `[0, total_inserts − memtable)` without gaps or overlaps. A
//! *merge task* fuses two adjacent runs into one. Tasks are either
//! *unstarted* (a plan, scored by size imbalance) or *started* (two open
//! readers feeding an output builder).
//!
//! Runs and tasks live in index arenas with `Option<u32>` links — no
//! reference cycles, no per-node allocation:
//!
//! ```text
//!   run ──next_task──▶ task ◀──prev_task── run
//!    ▲                  │ inputs[0,1]
//!    └──── prev/next run list ────▶
//! ```
//!
//! ## Policy
//!
//! An unstarted task exists for an adjacent pair whenever neither run is
//! already claimed by another task; the candidate order is the ratio
//! `entries(older)/entries(younger)·2^16` — lower is better. After any
//! event that changes the run graph the scheduler starts tasks, best
//! ratio first, while fewer than `max_running_tasks` run and the best
//! ratio is at most `max_merge_ratio`. Starting a task retires its
//! neighbors' plans; merges never share an input.
//!
//! ## Stepping
//!
//! Merges run cooperatively: `step(count)` processes up to `count` input
//! records on the started task with the fewest total input entries. Equal
//! keys fold through the merge function; when the older input reaches
//! back to input sequence zero the simplify function may reduce or drop
//! whatever is emitted. Each time the output closes a block, the task's
//! *last queryable key* advances, letting lookups consult the unfinished
//! output in place of both inputs.
//!
//! A run's backing files are erased only when no journal checkpoint on
//! disk references them: the live list holds one reference and the last
//! checkpoint holds another.

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hooks::{Hooks, MergeOutcome, SimplifyOutcome};
use crate::journal::{FileRecord, Snapshot, TaskRecord};
use crate::runfile::{FeedOutcome, FileHints, RunFile, RunFileError, RunFormat, RunReader};

/// Default cap on concurrently started merge tasks.
pub const DEFAULT_MAX_RUNNING_TASKS: usize = 4;

/// Default start threshold for the imbalance ratio, in Q16.
pub const DEFAULT_MAX_MERGE_RATIO_Q16: u32 = 3 << 16;

/// Errors from the run set and merge machinery.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A run file operation failed.
    #[error("run file error: {0}")]
    RunFile(#[from] RunFileError),

    /// Recovered state references runs that do not line up.
    #[error("corrupt run graph: {0}")]
    Corrupt(String),
}

/// Result of one `step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// No started task exists.
    Idle,
    /// Records were processed; the head task is still running.
    Progress,
    /// The head task finished and its output replaced its inputs.
    Completed,
}

// ------------------------------------------------------------------------------------------------
// Arena slots
// ------------------------------------------------------------------------------------------------

/// One run in the ordered list.
pub(crate) struct RunSlot {
    pub file: Box<dyn RunFile>,
    pub first_input_entry: u64,
    pub n_input_entries: u64,
    /// Live-list reference plus possibly a checkpoint reference.
    refs: u32,
    prev_run: Option<u32>,
    next_run: Option<u32>,
    /// Task whose newer input is this run.
    prev_task: Option<u32>,
    /// Task whose older input is this run.
    next_task: Option<u32>,
}

struct StartedTask {
    output: Box<dyn RunFile>,
    readers: [Box<dyn RunReader>; 2],
    last_queryable_key: Option<Vec<u8>>,
    /// Builder and reader states captured together at the output's last
    /// block boundary. Checkpoints persist these, never live positions:
    /// entries fed since the boundary exist only in the compressor, so a
    /// resume must restart the readers from the same boundary.
    saved_build_state: Vec<u8>,
    saved_reader_states: [Vec<u8>; 2],
}

enum TaskState {
    Unstarted { ratio_q16: u32 },
    Started(StartedTask),
}

struct TaskSlot {
    /// Input run ids, older first.
    inputs: [u32; 2],
    state: TaskState,
}

fn imbalance_ratio_q16(older_entries: u64, younger_entries: u64) -> u32 {
    if older_entries == 0 && younger_entries == 0 {
        1 << 16
    } else if younger_entries == 0 {
        u32::MAX
    } else {
        let ratio = (older_entries as f64 / younger_entries as f64) * 65536.0;
        if ratio >= u32::MAX as f64 {
            u32::MAX
        } else {
            ratio as u32
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RunSet
// ------------------------------------------------------------------------------------------------

/// The run list, the task graph, and the scheduling state.
pub(crate) struct RunSet {
    runs: Vec<Option<RunSlot>>,
    free_runs: Vec<u32>,
    tasks: Vec<Option<TaskSlot>>,
    free_tasks: Vec<u32>,
    first_run: Option<u32>,
    last_run: Option<u32>,
    n_runs: usize,
    /// Unstarted tasks ordered by `(ratio, task id)`.
    unstarted: BTreeSet<(u32, u32)>,
    /// Started tasks sorted ascending by total input entries; the head is
    /// the task `step` works on.
    run_list: Vec<u32>,
    /// Run ids referenced by the checkpoint currently on disk.
    checkpointed: Vec<u32>,
    max_running_tasks: usize,
    max_merge_ratio_q16: u32,
}

impl RunSet {
    pub fn new(max_running_tasks: usize, max_merge_ratio_q16: u32) -> Self {
        Self {
            runs: Vec::new(),
            free_runs: Vec::new(),
            tasks: Vec::new(),
            free_tasks: Vec::new(),
            first_run: None,
            last_run: None,
            n_runs: 0,
            unstarted: BTreeSet::new(),
            run_list: Vec::new(),
            checkpointed: Vec::new(),
            max_running_tasks,
            max_merge_ratio_q16,
        }
    }

    fn run(&self, id: u32) -> &RunSlot {
        self.runs[id as usize].as_ref().expect("live run slot")
    }

    fn run_mut(&mut self, id: u32) -> &mut RunSlot {
        self.runs[id as usize].as_mut().expect("live run slot")
    }

    fn task(&self, id: u32) -> &TaskSlot {
        self.tasks[id as usize].as_ref().expect("live task slot")
    }

    fn task_mut(&mut self, id: u32) -> &mut TaskSlot {
        self.tasks[id as usize].as_mut().expect("live task slot")
    }

    /// Number of runs in the list.
    pub fn n_runs(&self) -> usize {
        self.n_runs
    }

    /// Number of started tasks.
    pub fn n_running_tasks(&self) -> usize {
        self.run_list.len()
    }

    /// Run slot ids, oldest first.
    pub fn run_ids(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(self.n_runs);
        let mut at = self.first_run;
        while let Some(id) = at {
            ids.push(id);
            at = self.run(id).next_run;
        }
        ids
    }

    /// Read access to a run slot.
    pub fn run_slot(&self, id: u32) -> &RunSlot {
        self.run(id)
    }

    /// Mutable access to a run's file (queries need `&mut`).
    pub fn run_file_mut(&mut self, id: u32) -> &mut dyn RunFile {
        self.run_mut(id).file.as_mut()
    }

    /// The started task consuming (`id`, successor), if any.
    pub fn started_task_after(&self, id: u32) -> Option<u32> {
        self.run(id)
            .next_task
            .filter(|&t| matches!(self.task(t).state, TaskState::Started(_)))
    }

    /// The started task consuming (predecessor, `id`), if any.
    pub fn started_task_before(&self, id: u32) -> Option<u32> {
        self.run(id)
            .prev_task
            .filter(|&t| matches!(self.task(t).state, TaskState::Started(_)))
    }

    /// A started task's last queryable key, if it has flushed one.
    pub fn task_last_queryable(&self, task_id: u32) -> Option<&[u8]> {
        match &self.task(task_id).state {
            TaskState::Started(s) => s.last_queryable_key.as_deref(),
            TaskState::Unstarted { .. } => None,
        }
    }

    /// Mutable access to a started task's output file.
    pub fn task_output_mut(&mut self, task_id: u32) -> &mut dyn RunFile {
        match &mut self.task_mut(task_id).state {
            TaskState::Started(s) => s.output.as_mut(),
            TaskState::Unstarted { .. } => unreachable!("output of an unstarted task"),
        }
    }

    /// Every file id the on-disk state may legitimately reference: runs
    /// in the list plus started merge outputs.
    pub fn known_file_ids(&self) -> HashSet<u64> {
        let mut ids = HashSet::new();
        for run_id in self.run_ids() {
            ids.insert(self.run(run_id).file.id());
            if let Some(task_id) = self.started_task_after(run_id) {
                if let TaskState::Started(s) = &self.task(task_id).state {
                    ids.insert(s.output.id());
                }
            }
        }
        ids
    }

    fn alloc_run(&mut self, slot: RunSlot) -> u32 {
        if let Some(id) = self.free_runs.pop() {
            self.runs[id as usize] = Some(slot);
            id
        } else {
            self.runs.push(Some(slot));
            (self.runs.len() - 1) as u32
        }
    }

    fn alloc_task(&mut self, slot: TaskSlot) -> u32 {
        if let Some(id) = self.free_tasks.pop() {
            self.tasks[id as usize] = Some(slot);
            id
        } else {
            self.tasks.push(Some(slot));
            (self.tasks.len() - 1) as u32
        }
    }

    fn free_task(&mut self, id: u32) {
        self.tasks[id as usize] = None;
        self.free_tasks.push(id);
    }

    /// Drops one reference; at zero the slot is freed and the backing
    /// files are destroyed (unlinked when `erase`).
    fn unref_run(&mut self, id: u32, erase: bool) {
        let slot = self.runs[id as usize].as_mut().expect("live run slot");
        debug_assert!(slot.refs > 0);
        slot.refs -= 1;
        if slot.refs == 0 {
            let slot = self.runs[id as usize].take().expect("live run slot");
            if let Err(e) = slot.file.destroy(erase) {
                warn!(error = %e, erase, "destroying run file failed");
            }
            self.free_runs.push(id);
        }
    }

    /// Every run currently covers input sequence `[first, first+n)` and
    /// the list is contiguous from zero.
    #[cfg(debug_assertions)]
    fn check_contiguous(&self) {
        let mut expected = 0u64;
        for id in self.run_ids() {
            let run = self.run(id);
            assert_eq!(
                run.first_input_entry, expected,
                "run list is not contiguous"
            );
            expected += run.n_input_entries;
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_contiguous(&self) {}

    // --------------------------------------------------------------------------------------------
    // Graph mutation
    // --------------------------------------------------------------------------------------------

    /// Appends a freshly flushed run at the young end of the list and
    /// plans a merge with its elder neighbor when that pair is free.
    pub fn append_run(&mut self, file: Box<dyn RunFile>, first_input_entry: u64, n: u64) -> u32 {
        let id = self.alloc_run(RunSlot {
            file,
            first_input_entry,
            n_input_entries: n,
            refs: 1,
            prev_run: self.last_run,
            next_run: None,
            prev_task: None,
            next_task: None,
        });
        match self.last_run {
            Some(prev) => self.run_mut(prev).next_run = Some(id),
            None => self.first_run = Some(id),
        }
        self.last_run = Some(id);
        self.n_runs += 1;

        if let Some(prev) = self.run(id).prev_run {
            if self.task_is_unstarted_or_absent(self.run(prev).prev_task) {
                debug_assert!(self.run(prev).next_task.is_none());
                self.create_unstarted_task(prev, id);
            }
        }
        self.check_contiguous();
        id
    }

    fn task_is_unstarted_or_absent(&self, task: Option<u32>) -> bool {
        match task {
            None => true,
            Some(t) => matches!(self.task(t).state, TaskState::Unstarted { .. }),
        }
    }

    fn create_unstarted_task(&mut self, older: u32, younger: u32) {
        debug_assert!(self.run(older).next_task.is_none());
        debug_assert!(self.run(younger).prev_task.is_none());
        let ratio = imbalance_ratio_q16(
            self.run(older).file.entry_count(),
            self.run(younger).file.entry_count(),
        );
        let id = self.alloc_task(TaskSlot {
            inputs: [older, younger],
            state: TaskState::Unstarted { ratio_q16: ratio },
        });
        self.run_mut(older).next_task = Some(id);
        self.run_mut(younger).prev_task = Some(id);
        self.unstarted.insert((ratio, id));
    }

    fn kill_unstarted_task(&mut self, task_id: u32) {
        let (inputs, ratio) = match self.task(task_id) {
            TaskSlot {
                inputs,
                state: TaskState::Unstarted { ratio_q16 },
            } => (*inputs, *ratio_q16),
            _ => unreachable!("killing a started task"),
        };
        self.unstarted.remove(&(ratio, task_id));
        self.run_mut(inputs[0]).next_task = None;
        self.run_mut(inputs[1]).prev_task = None;
        self.free_task(task_id);
    }

    // --------------------------------------------------------------------------------------------
    // Starting tasks
    // --------------------------------------------------------------------------------------------

    /// Starts planned tasks, best imbalance ratio first, while the
    /// running count and ratio limits allow.
    pub fn maybe_start_tasks(
        &mut self,
        dir: &Path,
        format: RunFormat,
        next_file_id: &mut u64,
    ) -> Result<(), MergeError> {
        while self.run_list.len() < self.max_running_tasks {
            let Some(&(ratio, task_id)) = self.unstarted.iter().next() else {
                break;
            };
            if ratio > self.max_merge_ratio_q16 {
                break;
            }
            self.start_task(task_id, dir, format, next_file_id)?;
        }
        Ok(())
    }

    fn start_task(
        &mut self,
        task_id: u32,
        dir: &Path,
        format: RunFormat,
        next_file_id: &mut u64,
    ) -> Result<(), MergeError> {
        let (inputs, ratio) = match self.task(task_id) {
            TaskSlot {
                inputs,
                state: TaskState::Unstarted { ratio_q16 },
            } => (*inputs, *ratio_q16),
            _ => unreachable!("starting a started task"),
        };
        let [older, younger] = inputs;

        // A started merge may not share inputs, so the neighbors' plans
        // on either side die first.
        if let Some(t) = self.run(older).prev_task {
            debug_assert!(matches!(self.task(t).state, TaskState::Unstarted { .. }));
            self.kill_unstarted_task(t);
        }
        if let Some(t) = self.run(younger).next_task {
            debug_assert!(matches!(self.task(t).state, TaskState::Unstarted { .. }));
            self.kill_unstarted_task(t);
        }
        self.unstarted.remove(&(ratio, task_id));

        let reader0 = self.run(older).file.create_reader()?;
        let reader1 = self.run(younger).file.create_reader()?;

        *next_file_id += 1;
        let output_id = *next_file_id;
        let output = format.create(dir, output_id, &FileHints::default())?;

        info!(
            older = self.run(older).file.id(),
            younger = self.run(younger).file.id(),
            output = output_id,
            ratio_q16 = ratio,
            "merge task started"
        );

        let saved_build_state = output.build_state()?;
        let saved_reader_states = [reader0.save_state(), reader1.save_state()];
        self.task_mut(task_id).state = TaskState::Started(StartedTask {
            output,
            readers: [reader0, reader1],
            last_queryable_key: None,
            saved_build_state,
            saved_reader_states,
        });

        let total = self.task_total_inputs(task_id);
        let pos = self
            .run_list
            .partition_point(|&t| self.task_total_inputs(t) <= total);
        self.run_list.insert(pos, task_id);
        Ok(())
    }

    fn task_total_inputs(&self, task_id: u32) -> u64 {
        let inputs = self.task(task_id).inputs;
        self.run(inputs[0]).file.entry_count() + self.run(inputs[1]).file.entry_count()
    }

    // --------------------------------------------------------------------------------------------
    // Stepping
    // --------------------------------------------------------------------------------------------

    /// Processes up to `count` input records on the head started task.
    ///
    /// An I/O failure aborts only the head task: its output is erased,
    /// both inputs stay in the list, and the next `step` proceeds with
    /// the next task.
    pub fn step(&mut self, count: usize, hooks: &Hooks) -> Result<StepStatus, MergeError> {
        let Some(&task_id) = self.run_list.first() else {
            return Ok(StepStatus::Idle);
        };
        match self.step_task(task_id, count, hooks) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(error = %e, "merge step failed, aborting task");
                // A failure inside finalization has already dismantled
                // the task; otherwise tear it down here.
                if self.tasks[task_id as usize].is_some() {
                    self.abort_task(task_id);
                }
                Ok(StepStatus::Progress)
            }
        }
    }

    fn step_task(
        &mut self,
        task_id: u32,
        count: usize,
        hooks: &Hooks,
    ) -> Result<StepStatus, MergeError> {
        let inputs = self.task(task_id).inputs;
        let use_simplify =
            self.run(inputs[0]).first_input_entry == 0 && hooks.simplify.is_some();

        // Which side the next output entry comes from.
        enum Pick {
            Older,
            Newer,
            Merged(MergeOutcome),
            Finished,
        }

        let mut merge_buf: Vec<u8> = Vec::new();
        let mut simplify_buf: Vec<u8> = Vec::new();

        for _ in 0..count {
            let task = match &mut self.task_mut(task_id).state {
                TaskState::Started(s) => s,
                TaskState::Unstarted { .. } => unreachable!("stepping an unstarted task"),
            };

            let pick = match (task.readers[0].entry(), task.readers[1].entry()) {
                (None, None) => Pick::Finished,
                (Some(_), None) => Pick::Older,
                (None, Some(_)) => Pick::Newer,
                (Some((k0, v0)), Some((k1, v1))) => match hooks.cmp(k0, k1) {
                    std::cmp::Ordering::Less => Pick::Older,
                    std::cmp::Ordering::Greater => Pick::Newer,
                    std::cmp::Ordering::Equal => match &hooks.merge {
                        Some(merge) => {
                            merge_buf.clear();
                            Pick::Merged(merge(k0, v0, v1, &mut merge_buf))
                        }
                        // Without a merge function duplicates survive;
                        // emitting the older side first keeps their order.
                        None => Pick::Older,
                    },
                },
            };

            if let Pick::Finished = pick {
                self.complete_task(task_id)?;
                return Ok(StepStatus::Completed);
            }
            if let Pick::Merged(MergeOutcome::Drop) = pick {
                task.readers[0].advance()?;
                task.readers[1].advance()?;
                continue;
            }

            // Resolve the emitted entry. Feeding happens before the
            // readers move: the value borrows a reader while the output
            // is a sibling field, so no copies are needed.
            let (key, mut value): (&[u8], &[u8]) = match &pick {
                Pick::Older => task.readers[0].entry().expect("older entry"),
                Pick::Newer => task.readers[1].entry().expect("newer entry"),
                Pick::Merged(MergeOutcome::KeepA) => {
                    task.readers[0].entry().expect("older entry")
                }
                Pick::Merged(MergeOutcome::KeepB) => {
                    task.readers[1].entry().expect("newer entry")
                }
                Pick::Merged(MergeOutcome::Merged) => {
                    let (k, _) = task.readers[0].entry().expect("older entry");
                    (k, merge_buf.as_slice())
                }
                Pick::Merged(MergeOutcome::Drop) | Pick::Finished => unreachable!(),
            };

            let mut deleted = false;
            if use_simplify {
                let simplify = hooks.simplify.as_ref().expect("simplify hook");
                simplify_buf.clear();
                match simplify(key, value, &mut simplify_buf) {
                    SimplifyOutcome::Keep => {}
                    SimplifyOutcome::Simplified => value = &simplify_buf,
                    SimplifyOutcome::Delete => deleted = true,
                }
            }

            let mut flushed_key: Option<Vec<u8>> = None;
            if !deleted && task.output.feed(key, value)? == FeedOutcome::BlockFlushed {
                flushed_key = Some(key.to_vec());
            }

            match pick {
                Pick::Older => task.readers[0].advance()?,
                Pick::Newer => task.readers[1].advance()?,
                Pick::Merged(_) => {
                    task.readers[0].advance()?;
                    task.readers[1].advance()?;
                }
                Pick::Finished => unreachable!(),
            }

            // A closed block moves the queryable frontier and gives a
            // consistent resume point: builder state and reader
            // positions now agree on exactly what is durable.
            if let Some(key) = flushed_key {
                task.last_queryable_key = Some(key);
                task.saved_build_state = task.output.build_state()?;
                task.saved_reader_states =
                    [task.readers[0].save_state(), task.readers[1].save_state()];
            }
        }
        Ok(StepStatus::Progress)
    }

    fn complete_task(&mut self, task_id: u32) -> Result<(), MergeError> {
        debug_assert_eq!(self.run_list.first(), Some(&task_id));
        self.run_list.retain(|&t| t != task_id);

        let slot = self.tasks[task_id as usize]
            .take()
            .expect("live task slot");
        self.free_tasks.push(task_id);
        let TaskSlot { inputs, state } = slot;
        let TaskState::Started(mut started) = state else {
            unreachable!("completing an unstarted task");
        };
        let [older, younger] = inputs;

        // Unlink the task first so that a finalization failure leaves the
        // inputs in the list with no dangling task (abort semantics).
        self.run_mut(older).next_task = None;
        self.run_mut(younger).prev_task = None;

        // Finish the output; multi-phase formats bake to completion here.
        let finished = (|| -> Result<(), MergeError> {
            let mut ready = started.output.done_feeding()?;
            while !ready {
                ready = started.output.build_step()?;
            }
            Ok(())
        })();
        if let Err(e) = finished {
            if let Err(destroy_err) = started.output.destroy(true) {
                warn!(error = %destroy_err, "erasing failed merge output also failed");
            }
            return Err(e);
        }
        drop(started.readers);

        info!(
            older = self.run(older).file.id(),
            younger = self.run(younger).file.id(),
            output = started.output.id(),
            entries = started.output.entry_count(),
            "merge task completed"
        );

        let first_input_entry = self.run(older).first_input_entry;
        let n_input_entries =
            self.run(older).n_input_entries + self.run(younger).n_input_entries;
        let prev_run = self.run(older).prev_run;
        let next_run = self.run(younger).next_run;

        // Splice the new run where the two inputs sat.
        let new_id = self.alloc_run(RunSlot {
            file: started.output,
            first_input_entry,
            n_input_entries,
            refs: 1,
            prev_run,
            next_run,
            prev_task: None,
            next_task: None,
        });
        match prev_run {
            Some(p) => self.run_mut(p).next_run = Some(new_id),
            None => self.first_run = Some(new_id),
        }
        match next_run {
            Some(n) => self.run_mut(n).prev_run = Some(new_id),
            None => self.last_run = Some(new_id),
        }
        self.n_runs -= 1;

        self.run_mut(older).prev_run = None;
        self.run_mut(older).next_run = None;
        self.run_mut(younger).prev_run = None;
        self.run_mut(younger).next_run = None;
        self.unref_run(older, true);
        self.unref_run(younger, true);

        self.check_contiguous();

        // The new run may immediately team up with its neighbors.
        if let Some(prev) = prev_run {
            if self.run(prev).next_task.is_none()
                && self.task_is_unstarted_or_absent(self.run(prev).prev_task)
            {
                self.create_unstarted_task(prev, new_id);
            }
        }
        if let Some(next) = next_run {
            if self.run(next).prev_task.is_none()
                && self.task_is_unstarted_or_absent(self.run(next).next_task)
            {
                self.create_unstarted_task(new_id, next);
            }
        }
        Ok(())
    }

    /// Tears down a failing started task. Its output is erased; the
    /// inputs stay in the list untouched.
    fn abort_task(&mut self, task_id: u32) {
        self.run_list.retain(|&t| t != task_id);
        let slot = self.tasks[task_id as usize]
            .take()
            .expect("live task slot");
        self.free_tasks.push(task_id);
        let TaskSlot { inputs, state } = slot;
        let TaskState::Started(started) = state else {
            unreachable!("aborting an unstarted task");
        };
        if let Err(e) = started.output.destroy(true) {
            warn!(error = %e, "erasing aborted merge output failed");
        }
        self.run_mut(inputs[0]).next_task = None;
        self.run_mut(inputs[1]).prev_task = None;
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoint integration
    // --------------------------------------------------------------------------------------------

    /// Captures the run set and all started tasks for a checkpoint
    /// header.
    pub fn snapshot(&self, n_input_entries: u64) -> Result<Snapshot, MergeError> {
        let mut files = Vec::with_capacity(self.n_runs);
        let mut tasks = Vec::new();
        for id in self.run_ids() {
            let run = self.run(id);
            files.push(FileRecord {
                id: run.file.id(),
                first_input_entry: run.first_input_entry,
                n_input_entries: run.n_input_entries,
                n_entries: run.file.entry_count(),
            });
            if let Some(task_id) = self.started_task_after(id) {
                let TaskState::Started(s) = &self.task(task_id).state else {
                    unreachable!()
                };
                let inputs = self.task(task_id).inputs;
                tasks.push(TaskRecord {
                    input_ids: [
                        self.run(inputs[0]).file.id(),
                        self.run(inputs[1]).file.id(),
                    ],
                    reader_states: s.saved_reader_states.clone(),
                    output_id: s.output.id(),
                    build_state: s.saved_build_state.clone(),
                });
            }
        }
        Ok(Snapshot {
            files,
            tasks,
            n_input_entries,
        })
    }

    /// Swaps checkpoint references after a new checkpoint landed on
    /// disk: runs only the old checkpoint still referenced lose their
    /// files.
    pub fn commit_checkpoint(&mut self) {
        for id in self.run_ids() {
            self.run_mut(id).refs += 1;
        }
        let new_refs = self.run_ids();
        let old_refs = std::mem::replace(&mut self.checkpointed, new_refs);
        for id in old_refs {
            self.unref_run(id, true);
        }
    }

    /// Releases everything without touching on-disk files (table close).
    pub fn close(mut self) {
        let live = self.run_ids();
        for id in live {
            self.unref_run(id, false);
        }
        for id in std::mem::take(&mut self.checkpointed) {
            self.unref_run(id, false);
        }
        // Started tasks: readers and half-built outputs are dropped; the
        // output files stay on disk and resume from the checkpoint state
        // on reopen.
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Rebuilds the run set from a recovered checkpoint snapshot.
    pub fn recover(
        snapshot: &Snapshot,
        dir: &Path,
        format: RunFormat,
        max_running_tasks: usize,
        max_merge_ratio_q16: u32,
    ) -> Result<Self, MergeError> {
        let mut set = Self::new(max_running_tasks, max_merge_ratio_q16);

        let mut ids = Vec::with_capacity(snapshot.files.len());
        for record in &snapshot.files {
            let file = format.open(dir, record.id)?;
            if file.entry_count() != record.n_entries {
                return Err(MergeError::Corrupt(format!(
                    "run {:#x} stores {} entries but the journal recorded {}",
                    record.id,
                    file.entry_count(),
                    record.n_entries
                )));
            }
            // Bypass plan creation during reconstruction; plans are made
            // once the started tasks have claimed their inputs.
            let id = set.alloc_run(RunSlot {
                file,
                first_input_entry: record.first_input_entry,
                n_input_entries: record.n_input_entries,
                refs: 1,
                prev_run: ids.last().copied(),
                next_run: None,
                prev_task: None,
                next_task: None,
            });
            if let Some(&prev) = ids.last() {
                set.run_mut(prev).next_run = Some(id);
            } else {
                set.first_run = Some(id);
            }
            set.last_run = Some(id);
            set.n_runs += 1;
            ids.push(id);
        }
        set.check_contiguous();

        for record in &snapshot.tasks {
            let pos = ids
                .iter()
                .position(|&id| set.run(id).file.id() == record.input_ids[0])
                .ok_or_else(|| {
                    MergeError::Corrupt(format!(
                        "merge task input {:#x} is not in the run list",
                        record.input_ids[0]
                    ))
                })?;
            if pos + 1 >= ids.len() || set.run(ids[pos + 1]).file.id() != record.input_ids[1] {
                return Err(MergeError::Corrupt(format!(
                    "merge task inputs {:#x},{:#x} are not adjacent",
                    record.input_ids[0], record.input_ids[1]
                )));
            }
            let older = ids[pos];
            let younger = ids[pos + 1];
            if set.run(older).next_task.is_some() || set.run(younger).prev_task.is_some() {
                return Err(MergeError::Corrupt(
                    "merge tasks share an input run".into(),
                ));
            }

            let reader0 = set
                .run(older)
                .file
                .recreate_reader(&record.reader_states[0])?;
            let reader1 = set
                .run(younger)
                .file
                .recreate_reader(&record.reader_states[1])?;
            let output = format.open_building(dir, record.output_id, &record.build_state)?;

            debug!(
                older = record.input_ids[0],
                younger = record.input_ids[1],
                output = record.output_id,
                "merge task resumed"
            );

            let task_id = set.alloc_task(TaskSlot {
                inputs: [older, younger],
                state: TaskState::Started(StartedTask {
                    output,
                    readers: [reader0, reader1],
                    // Unknown until the next block closes; queries fall
                    // back to the inputs.
                    last_queryable_key: None,
                    saved_build_state: record.build_state.clone(),
                    saved_reader_states: record.reader_states.clone(),
                }),
            });
            set.run_mut(older).next_task = Some(task_id);
            set.run_mut(younger).prev_task = Some(task_id);
            set.run_list.push(task_id);
        }
        let mut run_list = std::mem::take(&mut set.run_list);
        run_list.sort_by_key(|&t| set.task_total_inputs(t));
        set.run_list = run_list;

        // Plan merges for every adjacent pair both of whose runs are
        // still unclaimed.
        for window in ids.windows(2) {
            let (older, younger) = (window[0], window[1]);
            if set.run(older).next_task.is_none()
                && set.task_is_unstarted_or_absent(set.run(older).prev_task)
                && set.run(younger).prev_task.is_none()
                && set.task_is_unstarted_or_absent(set.run(younger).next_task)
            {
                set.create_unstarted_task(older, younger);
            }
        }

        // The checkpoint we just recovered from holds references.
        set.commit_checkpoint();
        Ok(set)
    }

    /// Best unstarted ratio, for tests and diagnostics.
    pub fn best_unstarted_ratio(&self) -> Option<u32> {
        self.unstarted.iter().next().map(|&(r, _)| r)
    }
}
