//! Ties C1 (`MergeResource`), C2/C4 (`UnseqPointReader`/`ChunkMerger`), C3's
//! chosen `Selection`, C7 (`MergeJournal`) and one of C5/C6 together into a
//! single runnable merge: `PLAN -> READ -> WRITE -> COMMIT -> DONE`, with
//! `ABORT` reachable from any non-terminal state (§4 "State machines").
//!
//! The bounded sub-worker pool (§4.9's "shared sub-pool") lives here too:
//! it is a property of how many `ChunkMerger` invocations may run
//! concurrently across *all* tasks, not of any one task.

use super::chunk_merger::{ChunkMerger, OutputSelector};
use super::chunk_provider::ChunkProvider;
use super::committer::FileCommitter;
use super::context::{CancelToken, CompactionContext};
use super::journal::JournalWriter;
use super::resource::{CommitMode, MergeResource, MergeRunState};
use super::selector::Selection;
use super::squeeze::SqueezeMerger;
use crate::error::{Error, Result};
use crate::io::traits::SegmentWriter;
use crate::model::{DataType, Segment, Timestamp};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A bounded pool of "chunk sub-worker" permits, shared across every merge
/// task the scheduler (C9) is currently running. A task that cannot
/// acquire a permit runs its sub-work inline on the calling thread instead
/// of blocking, so a saturated sub-pool can never deadlock a task waiting
/// on its own sub-workers (§4.9, §5).
pub struct SubWorkerPool {
    permits: AtomicUsize,
}

impl SubWorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: AtomicUsize::new(capacity.max(1)),
        }
    }

    pub fn try_acquire(&self) -> Option<SubWorkerPermit<'_>> {
        loop {
            let current = self.permits.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .permits
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(SubWorkerPermit { pool: self });
            }
        }
    }
}

pub struct SubWorkerPermit<'a> {
    pool: &'a SubWorkerPool,
}

impl Drop for SubWorkerPermit<'_> {
    fn drop(&mut self) {
        self.pool.permits.fetch_add(1, Ordering::AcqRel);
    }
}

/// What `FileSelector` (C3) and the configured commit strategy decided for
/// one run.
pub struct MergeTaskPlan {
    pub selection: Selection,
    pub mode: CommitMode,
    pub concurrent_merge_series_num: usize,
}

/// Result of a completed merge task.
pub struct MergeOutcome {
    /// Sequence segments as they stand after commit: for inplace mode, one
    /// per input (same identity or bumped `mergeN`); for squeeze mode, the
    /// single new output segment.
    pub committed_sequence: Vec<Segment>,
    pub squeeze_output: Option<Segment>,
    pub points_written: u64,
    pub chunks_written: u64,
}

/// A single merge task: owns nothing past its own `run` call, per §3
/// "MergeContext... owned by a merge task; discarded at end".
pub struct MergeTask<'a> {
    env: &'a CompactionContext,
    /// The storage-group system directory the journal and (for squeeze)
    /// the new output segment are written into.
    journal_dir: &'a Path,
}

impl<'a> MergeTask<'a> {
    pub fn new(env: &'a CompactionContext, journal_dir: &'a Path) -> Self {
        Self { env, journal_dir }
    }

    fn journal_path(&self, mode: CommitMode) -> PathBuf {
        match mode {
            CommitMode::Inplace => self.journal_dir.join("merge.log"),
            CommitMode::Squeeze => self.journal_dir.join("merge.squeeze.log"),
        }
    }

    /// Runs one merge task to completion. Every sequence and unsequence
    /// input is reserved (§3 "A segment is merging... from the moment the
    /// selector picks it until the committer finishes or aborts") before
    /// any chunk work starts, and released on any non-commit exit path.
    pub fn run(
        &self,
        plan: &MergeTaskPlan,
        cancel: &CancelToken,
        sub_pool: &SubWorkerPool,
    ) -> Result<MergeOutcome> {
        if plan.selection.is_empty() {
            return Err(Error::BudgetExhausted(
                "selection produced no working set".to_string(),
            ));
        }

        let journal = JournalWriter::create(&self.journal_path(plan.mode))?;
        let resource = MergeResource::new(
            self.env.clone(),
            plan.selection.sequence.clone(),
            plan.selection.unsequence.clone(),
            plan.mode,
            Timestamp::MIN,
        );

        let reserved = self.reserve_all(plan);
        let result = reserved.and_then(|()| self.run_inner(&resource, &journal, plan, cancel, sub_pool));

        resource.release();
        match &result {
            Ok(_) => {
                for segment in plan.selection.sequence.iter().chain(plan.selection.unsequence.iter()) {
                    if segment.reservation_state() == crate::model::ReservationState::Merging {
                        segment.release_reservation();
                    }
                }
                std::fs::remove_file(self.journal_path(plan.mode)).ok();
            }
            Err(_) => {
                if cancel.is_cancelled() {
                    journal.cancel().ok();
                }
                for segment in plan.selection.sequence.iter().chain(plan.selection.unsequence.iter()) {
                    segment.release_reservation();
                }
            }
        }
        result
    }

    fn reserve_all(&self, plan: &MergeTaskPlan) -> Result<()> {
        let mut reserved = Vec::new();
        for segment in plan.selection.sequence.iter().chain(plan.selection.unsequence.iter()) {
            if segment.try_reserve() {
                reserved.push(segment.clone());
            } else {
                for r in &reserved {
                    r.release_reservation();
                }
                return Err(Error::Inconsistent(format!(
                    "segment {} already reserved by another task",
                    segment.id()
                )));
            }
        }
        Ok(())
    }

    fn run_inner(
        &self,
        resource: &MergeResource,
        journal: &JournalWriter,
        plan: &MergeTaskPlan,
        cancel: &CancelToken,
        sub_pool: &SubWorkerPool,
    ) -> Result<MergeOutcome> {
        journal.files(
            plan.selection.sequence.iter().map(|s| s.id()).collect(),
            plan.selection.unsequence.iter().map(|s| s.id()).collect(),
        )?;
        journal.merge_start()?;

        let series = resource.distinct_series()?;
        let run_state = Mutex::new(MergeRunState::default());
        let provider = ChunkProvider::new();

        let squeeze_target = match plan.mode {
            CommitMode::Squeeze => {
                let squeeze = SqueezeMerger::new(journal, self.env.catalogue.as_ref());
                let output_id = squeeze.build_output_id(&plan.selection.sequence);
                let temp_path = squeeze.temp_path(self.journal_dir, output_id);
                let writer = (self.env.create_writer)(&temp_path)?;
                Some((output_id, temp_path, Arc::new(Mutex::new(writer))))
            }
            CommitMode::Inplace => None,
        };
        let squeeze_writer = squeeze_target
            .as_ref()
            .map(|(output_id, _, w)| (w.clone(), output_id.version));

        for batch in series.chunks(plan.concurrent_merge_series_num.max(1)) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.run_batch(
                resource,
                &provider,
                journal,
                &run_state,
                batch,
                plan,
                sub_pool,
                squeeze_writer.clone(),
            )?;
        }

        let run_state = run_state
            .into_inner()
            .map_err(|_| Error::Inconsistent("run state lock poisoned".to_string()))?;

        match plan.mode {
            CommitMode::Inplace => {
                let committer = FileCommitter::new(resource, journal, self.env);
                let committed = committer.commit(
                    &run_state,
                    &plan.selection.sequence,
                    &plan.selection.unsequence,
                )?;
                for segment in plan.selection.unsequence.iter() {
                    segment.retire();
                    segment.delete_files()?;
                }
                journal.merge_end()?;
                Ok(MergeOutcome {
                    committed_sequence: committed,
                    squeeze_output: None,
                    points_written: run_state.points_written,
                    chunks_written: run_state.chunks_written,
                })
            }
            CommitMode::Squeeze => {
                let (output_id, temp_path, writer) =
                    squeeze_target.expect("squeeze writer built above for squeeze mode");
                let squeeze = SqueezeMerger::new(journal, self.env.catalogue.as_ref());
                let final_path = squeeze.final_path(self.journal_dir, output_id);
                let mut inputs = plan.selection.sequence.clone();
                inputs.extend(plan.selection.unsequence.iter().cloned());
                let output = squeeze.commit(writer, &temp_path, &final_path, &inputs, output_id)?;
                Ok(MergeOutcome {
                    committed_sequence: vec![output.clone()],
                    squeeze_output: Some(output),
                    points_written: run_state.points_written,
                    chunks_written: run_state.chunks_written,
                })
            }
        }
    }

    /// Dispatches one series batch across up to `mergeChunkSubThreadNum`
    /// sub-workers (round-robin partitioning, §4.4 step 2), journaling the
    /// batch's `TSStart`/`TSEnd` markers around it.
    #[allow(clippy::too_many_arguments)]
    fn run_batch(
        &self,
        resource: &MergeResource,
        provider: &ChunkProvider,
        journal: &JournalWriter,
        run_state: &Mutex<MergeRunState>,
        batch: &[(String, String, DataType)],
        plan: &MergeTaskPlan,
        sub_pool: &SubWorkerPool,
        squeeze_writer: Option<(Arc<Mutex<Box<dyn SegmentWriter>>>, u64)>,
    ) -> Result<()> {
        let batch_label = batch
            .iter()
            .map(|(d, m, _)| format!("{d}.{m}"))
            .collect::<Vec<_>>()
            .join(",");
        journal.ts_start(&batch_label)?;

        let config = &self.env.config;
        let merger = ChunkMerger::new(resource, provider, config);
        let sub_worker_count = config
            .merge_chunk_sub_thread_num
            .max(1)
            .min(batch.len().max(1));
        let groups = round_robin(batch, sub_worker_count);

        let output_for: &OutputSelector<'_> =
            &|segment: &Segment| -> Result<(Arc<Mutex<Box<dyn SegmentWriter>>>, u64)> {
                match &squeeze_writer {
                    Some((w, version)) => Ok((w.clone(), *version)),
                    None => resource.temp_writer(segment).map(|w| (w, segment.id().version)),
                }
            };

        let error: Mutex<Option<Error>> = Mutex::new(None);
        std::thread::scope(|scope| {
            let mut inline_groups = Vec::new();
            let mut handles = Vec::new();
            for group in groups {
                if group.is_empty() {
                    continue;
                }
                match sub_pool.try_acquire() {
                    Some(permit) => {
                        let merger = &merger;
                        let selection = &plan.selection;
                        let error = &error;
                        handles.push(scope.spawn(move || {
                            let _permit = permit;
                            run_group(merger, run_state, &group, selection, output_for, error);
                        }));
                    }
                    None => inline_groups.push(group),
                }
            }
            for group in inline_groups {
                run_group(&merger, run_state, &group, &plan.selection, output_for, &error);
            }
            for handle in handles {
                handle.join().ok();
            }
        });

        journal.ts_end()?;

        let failure = error
            .into_inner()
            .map_err(|_| Error::Inconsistent("batch error lock poisoned".to_string()))?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn run_group(
    merger: &ChunkMerger<'_>,
    run_state: &Mutex<MergeRunState>,
    group: &[(String, String, DataType)],
    selection: &Selection,
    output_for: &OutputSelector<'_>,
    error: &Mutex<Option<Error>>,
) {
    for (device, measurement, data_type) in group {
        let series = format!("{device}.{measurement}");
        let outcome = merger.merge_series(
            run_state,
            &series,
            device,
            measurement,
            *data_type,
            &selection.sequence,
            &selection.unsequence,
            output_for,
        );
        if let Err(e) = outcome {
            let mut guard = error.lock().expect("error lock poisoned");
            if guard.is_none() {
                *guard = Some(e);
            }
            return;
        }
    }
}

fn round_robin<T: Clone>(items: &[T], groups: usize) -> Vec<Vec<T>> {
    let mut out = vec![Vec::new(); groups.max(1)];
    for (i, item) in items.iter().enumerate() {
        out[i % out.len()].push(item.clone());
    }
    out
}
