//! C8: LeveledCompactor — groups closed segments into per-partition levels
//! by filename-embedded merge generation; when a level fills, submits a
//! merge task that promotes its output to the next level (§4.8).

use super::context::CompactionContext;
use super::journal::JournalWriter;
use super::resource::{CommitMode, MergeResource};
use super::selector::Selection;
use super::squeeze::SqueezeMerger;
use super::task::{MergeTask, MergeTaskPlan, SubWorkerPool};
use super::unseq_reader::UnseqPointReader;
use crate::config::MergeConfig;
use crate::error::{Error, Result};
use crate::model::{Segment, SegmentId, SegmentKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Per-partition level arrays. Sequence levels are kept sorted in filename
/// order (`(partition, filenameOrder)`, §4.8); unsequence levels are
/// insertion-ordered.
#[derive(Default)]
struct PartitionLevels {
    sequence: Vec<Vec<Segment>>,
    unsequence: Vec<Vec<Segment>>,
}

impl PartitionLevels {
    fn new(seq_levels: usize, unseq_levels: usize) -> Self {
        Self {
            sequence: vec![Vec::new(); seq_levels.max(1)],
            unsequence: vec![Vec::new(); unseq_levels.max(1)],
        }
    }

    fn insert_sequence(&mut self, segment: Segment) {
        let top = self.sequence.len() - 1;
        let level = (segment.id().level.unwrap_or(0) as usize).min(top);
        self.sequence[level].push(segment);
        self.sequence[level].sort_by_key(|s| s.id());
    }

    fn insert_unsequence(&mut self, segment: Segment) {
        let top = self.unsequence.len() - 1;
        let level = (segment.id().level.unwrap_or(0) as usize).min(top);
        self.unsequence[level].push(segment);
    }
}

/// What a `LeveledCompactor::poll()` pass decided to do for one partition.
/// Handed to a `MergeScheduler` (C9) worker, which runs `plan` and reports
/// the outcome back via `LeveledCompactor::run_and_apply`.
pub struct PendingMerge {
    pub(crate) partition: String,
    pub(crate) plan: MergeTaskPlan,
    pub(crate) output_level: usize,
    pub(crate) output_kind: SegmentKind,
}

/// C8. Owns every partition's level index; never touches segment bytes
/// itself, only hands selections to `MergeTask` and folds results back in.
pub struct LeveledCompactor {
    env: CompactionContext,
    partitions: Mutex<HashMap<String, PartitionLevels>>,
}

impl LeveledCompactor {
    pub fn new(env: CompactionContext) -> Self {
        Self {
            env,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_partition(&self, partition: &str) {
        let mut partitions = self.partitions.lock().expect("level index lock poisoned");
        partitions
            .entry(partition.to_string())
            .or_insert_with(|| PartitionLevels::new(self.env.config.seq_level_num, self.env.config.unseq_level_num));
    }

    /// A newly sealed file enters level 0 of its population (§4.8).
    pub fn notify_sealed(&self, partition: &str, segment: Segment) {
        self.register_partition(partition);
        let mut partitions = self.partitions.lock().expect("level index lock poisoned");
        let levels = partitions.get_mut(partition).expect("just registered");
        match segment.kind() {
            SegmentKind::Sequence => levels.insert_sequence(segment),
            SegmentKind::Unsequence => levels.insert_unsequence(segment),
        }
    }

    /// One poll cycle: inspects every partition's level arrays and returns
    /// at most one `PendingMerge` per partition, so a slow scheduler never
    /// accumulates more than one queued task per partition from a single
    /// poll (§4.8).
    pub fn poll(&self) -> Vec<PendingMerge> {
        let config = &self.env.config;
        let mut partitions = self.partitions.lock().expect("level index lock poisoned");
        let mut out = Vec::new();
        for (name, levels) in partitions.iter_mut() {
            if let Some(pending) = plan_for_partition(name, levels, config) {
                out.push(pending);
            }
        }
        out
    }

    /// Runs `pending` to completion: on success, promotes its outputs into
    /// `output_level` (stamping the level into the filename, the source of
    /// truth per §6); on failure, the consumed inputs go back to their
    /// original level untouched (§7 "I/O errors... keep inputs, next round
    /// retries").
    pub fn run_and_apply(
        &self,
        pending: PendingMerge,
        cancel: &super::context::CancelToken,
        sub_pool: &SubWorkerPool,
        journal_dir: &Path,
    ) -> Result<()> {
        let task = MergeTask::new(&self.env, journal_dir);
        let result = task.run(&pending.plan, cancel, sub_pool);

        let mut partitions = self.partitions.lock().expect("level index lock poisoned");
        let levels = partitions
            .entry(pending.partition.clone())
            .or_insert_with(|| PartitionLevels::new(self.env.config.seq_level_num, self.env.config.unseq_level_num));

        match result {
            Ok(outcome) => {
                for segment in outcome.committed_sequence {
                    let promoted = stamp_level(&segment, pending.output_level as u32)?;
                    match pending.output_kind {
                        SegmentKind::Sequence => levels.insert_sequence(promoted),
                        SegmentKind::Unsequence => levels.insert_unsequence(promoted),
                    }
                }
                tracing::info!(
                    partition = %pending.partition,
                    level = pending.output_level,
                    "promoted merge output"
                );
                Ok(())
            }
            Err(e) => {
                for segment in &pending.plan.selection.sequence {
                    segment.release_reservation();
                    levels.insert_sequence(segment.clone());
                }
                for segment in &pending.plan.selection.unsequence {
                    segment.release_reservation();
                    levels.insert_unsequence(segment.clone());
                }
                Err(e)
            }
        }
    }

    /// The independent unsequence-level promotion path (§4.8 "unsequence
    /// is leveled independently and only joined at the top"): a plain
    /// multi-way point merge via `UnseqPointReader`, with no sequence
    /// counterpart, committed through `SqueezeMerger::commit_as` tagged
    /// `SegmentKind::Unsequence`. Run synchronously by the caller (not
    /// through `MergeTask`, which requires a non-empty sequence side).
    pub fn promote_unsequence_level(&self, partition: &str, inputs: Vec<Segment>, journal_dir: &Path) -> Result<Segment> {
        let journal = JournalWriter::create(&journal_dir.join("merge.squeeze.log"))?;
        journal.files(Vec::new(), inputs.iter().map(|s| s.id()).collect())?;
        journal.merge_start()?;

        let resource = MergeResource::new(
            self.env.clone(),
            Vec::new(),
            inputs.clone(),
            CommitMode::Squeeze,
            crate::model::Timestamp::MIN,
        );

        let squeeze = SqueezeMerger::new(&journal, self.env.catalogue.as_ref());
        let output_id = squeeze.build_output_id(&inputs);
        let temp_path = squeeze.temp_path(journal_dir, output_id);
        let writer = (self.env.create_writer)(&temp_path)?;
        let writer = std::sync::Arc::new(Mutex::new(writer));

        for (device, measurement, data_type) in resource.distinct_series()? {
            let series = format!("{device}.{measurement}");
            let mut reader = UnseqPointReader::build(&resource, &series, &inputs)?;
            let mut points = Vec::new();
            while let Some(p) = reader.next_point() {
                if p.is_live() {
                    points.push(p);
                }
            }
            if points.is_empty() {
                continue;
            }
            let mut guard = writer
                .lock()
                .map_err(|_| Error::Inconsistent("unsequence squeeze writer lock poisoned".to_string()))?;
            guard.write_chunk(&device, &measurement, data_type, &points, output_id.version)?;
        }

        resource.release();
        let final_path = squeeze.final_path(journal_dir, output_id);
        let output = squeeze.commit_as(writer, &temp_path, &final_path, &inputs, output_id, SegmentKind::Unsequence)?;

        let mut partitions = self.partitions.lock().expect("level index lock poisoned");
        let levels = partitions
            .entry(partition.to_string())
            .or_insert_with(|| PartitionLevels::new(self.env.config.seq_level_num, self.env.config.unseq_level_num));
        let next_level = 1u32;
        let promoted = stamp_level(&output, next_level)?;
        levels.insert_unsequence(promoted.clone());
        std::fs::remove_file(journal_dir.join("merge.squeeze.log")).ok();
        Ok(promoted)
    }
}

/// Decides the (at most one) merge to submit for `partition` this poll:
/// first the unsequence-into-sequence collapse (when configured as a
/// single flat unsequence level), then sequence-level promotion, then
/// independent unsequence-level promotion.
fn plan_for_partition(partition: &str, levels: &mut PartitionLevels, config: &MergeConfig) -> Option<PendingMerge> {
    if config.enable_unseq_compaction && config.unseq_level_num == 1 && !levels.unsequence[0].is_empty() {
        let top_sequence_level = levels.sequence.len() - 1;
        if !levels.sequence[top_sequence_level].is_empty() {
            let sequence_files = std::mem::take(&mut levels.sequence[top_sequence_level]);
            let unsequence_files = std::mem::take(&mut levels.unsequence[0]);
            let mode = if config.seq_merge_file_strategy.is_squeeze() {
                CommitMode::Squeeze
            } else {
                CommitMode::Inplace
            };
            return Some(PendingMerge {
                partition: partition.to_string(),
                plan: MergeTaskPlan {
                    selection: Selection {
                        sequence: sequence_files,
                        unsequence: unsequence_files,
                    },
                    mode,
                    concurrent_merge_series_num: config.merge_chunk_sub_thread_num,
                },
                output_level: top_sequence_level,
                output_kind: SegmentKind::Sequence,
            });
        }
    }

    for level in 0..levels.sequence.len().saturating_sub(1) {
        let cap = config.seq_file_num_in_each_level;
        if levels.sequence[level].len() > cap {
            let drained: Vec<Segment> = levels.sequence[level].drain(0..cap).collect();
            return Some(PendingMerge {
                partition: partition.to_string(),
                plan: MergeTaskPlan {
                    selection: Selection {
                        sequence: drained,
                        unsequence: Vec::new(),
                    },
                    mode: CommitMode::Squeeze,
                    concurrent_merge_series_num: config.merge_chunk_sub_thread_num,
                },
                output_level: level + 1,
                output_kind: SegmentKind::Sequence,
            });
        }
    }

    None
}

/// Renames `segment`'s file (and its sidecars) to embed `level` in its
/// name, the filename-embedded level being the source of truth (§6), and
/// returns the re-pathed `Segment`.
fn stamp_level(segment: &Segment, level: u32) -> Result<Segment> {
    let leveled_id = segment.id().with_level(level);
    let dir = segment
        .path()
        .parent()
        .ok_or_else(|| Error::Inconsistent("segment path has no parent".to_string()))?;
    let ext = segment
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("seg");
    let new_path = leveled_id.path_in(dir, ext);

    if new_path != segment.path() {
        std::fs::rename(segment.path(), &new_path)?;
        for sidecar_ext in ["resource", "mods"] {
            let old_sidecar = segment.path().with_extension(sidecar_ext);
            if old_sidecar.exists() {
                std::fs::rename(&old_sidecar, new_path.with_extension(sidecar_ext))?;
            }
        }
    }

    Ok(Segment::new(leveled_id, segment.kind(), new_path, segment.resource()))
}
