//! C5: FileCommitter — the in-place commit strategy.

use super::context::CompactionContext;
use super::journal::{JournalWriter, MergeMode};
use super::resource::{MergeResource, MergeRunState};
use crate::error::{Error, Result};
use crate::io::traits::SegmentReader;
use crate::model::{DataType, Segment, TimeValuePair};

pub struct FileCommitter<'a> {
    resource: &'a MergeResource,
    journal: &'a JournalWriter,
    env: &'a CompactionContext,
}

impl<'a> FileCommitter<'a> {
    pub fn new(resource: &'a MergeResource, journal: &'a JournalWriter, env: &'a CompactionContext) -> Self {
        Self { resource, journal, env }
    }

    /// Commits every sequence segment in the working set, choosing
    /// "move-unmerged-to-new" or "move-merged-to-old" per segment based on
    /// which side produced more chunks (§4.5). `unsequence` is the set of
    /// unsequence inputs folded into this merge, whose ancestors every
    /// committed sequence segment inherits.
    pub fn commit(
        &self,
        run_state: &MergeRunState,
        sequence: &[Segment],
        unsequence: &[Segment],
    ) -> Result<Vec<Segment>> {
        let mut committed = Vec::with_capacity(sequence.len());
        for segment in sequence {
            committed.push(self.commit_one(run_state, segment, unsequence)?);
        }
        Ok(committed)
    }

    fn commit_one(&self, run_state: &MergeRunState, segment: &Segment, unsequence: &[Segment]) -> Result<Segment> {
        let move_unmerged_to_new = run_state.prefers_move_unmerged_to_new(segment.id());
        let mode = if move_unmerged_to_new {
            MergeMode::MoveUnmergedToNew
        } else {
            MergeMode::MoveMergedToOld
        };

        let truncate_position = std::fs::metadata(segment.path())?.len();
        self.journal
            .file_merge_start(segment.id(), truncate_position, mode)?;

        let next_id = segment.id().next_merge();
        let new_path = next_id.path_in(
            segment
                .path()
                .parent()
                .ok_or_else(|| Error::Inconsistent("segment path has no parent".to_string()))?,
            segment
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("seg"),
        );

        if move_unmerged_to_new {
            self.move_unmerged_to_new(run_state, segment, &new_path)?;
        } else {
            self.move_merged_to_old(run_state, segment, truncate_position)?;
        }

        self.journal.file_merge_end(segment.id())?;

        // `move_unmerged_to_new` promoted a fresh file at `new_path`; the
        // old identity's file is now superseded and its reservation never
        // returns to `Idle`. `move_merged_to_old` kept the same identity
        // in place, so the segment stays live under its current reservation
        // (released by the caller once every segment in the batch commits).
        if move_unmerged_to_new {
            segment.retire();
        }

        let mut descriptor = segment.resource();
        descriptor.merge_ancestors(segment.id().generation, &segment.resource());
        for unseq in unsequence {
            descriptor.union(&unseq.resource());
            descriptor.merge_ancestors(unseq.id().generation, &unseq.resource());
        }
        let final_path = if move_unmerged_to_new {
            new_path
        } else {
            segment.path().to_path_buf()
        };
        let committed = Segment::new(
            if move_unmerged_to_new {
                next_id
            } else {
                segment.id()
            },
            segment.kind(),
            final_path,
            descriptor,
        );
        Ok(committed)
    }

    /// The temp writer for `segment` already holds merged chunks; append
    /// the unmerged chunks (identified by their recorded start times) then
    /// seal it and rename it over the original file.
    fn move_unmerged_to_new(
        &self,
        run_state: &MergeRunState,
        segment: &Segment,
        new_path: &std::path::Path,
    ) -> Result<()> {
        let unmerged_starts = run_state
            .unmerged_chunk_start_times
            .get(&segment.id())
            .cloned()
            .unwrap_or_default();

        if !unmerged_starts.is_empty() {
            let mut reader_chunks: Vec<(String, DataType, Vec<TimeValuePair>, u64)> = Vec::new();
            {
                let reader = self.resource.reader(segment)?;
                let mut guard = reader.lock().map_err(|_| {
                    Error::Inconsistent(format!("reader lock poisoned for {}", segment.id()))
                })?;
                let directory = guard.chunk_directory()?;
                for (series, starts) in &unmerged_starts {
                    for chunk in directory.iter().filter(|c| &c.series_path() == series) {
                        if starts.contains(&chunk.start_time()) {
                            let points = guard.read_chunk(chunk)?;
                            reader_chunks.push((series.clone(), chunk.data_type, points, chunk.version));
                        }
                    }
                }
            }

            let writer = self.resource.temp_writer(segment)?;
            let mut guard = writer
                .lock()
                .map_err(|_| Error::Inconsistent("temp writer lock poisoned".to_string()))?;
            for (series, data_type, points, version) in reader_chunks {
                let (device, measurement) = split_series(&series)?;
                guard.write_chunk(&device, &measurement, data_type, &points, version)?;
            }
        }

        let temp_path = self
            .resource
            .temp_writer_path(segment)
            .ok_or_else(|| Error::Inconsistent("temp writer path missing at commit".to_string()))?;
        {
            let writer = self
                .resource
                .take_writer(segment)
                .ok_or_else(|| Error::Inconsistent("temp writer missing at commit".to_string()))?;
            let owned = try_unwrap_writer(writer)?;
            owned.finish()?;
        }
        std::fs::rename(&temp_path, new_path)?;

        // The old identity is fully superseded by `new_path`; drop its file
        // and sidecars so a later directory scan doesn't see both.
        if segment.path() != new_path {
            segment.delete_files()?;
        }
        Ok(())
    }

    /// Truncate `segment` back to the append position recorded before the
    /// merge began (a no-op unless something appended past it since), then
    /// append the merged chunks from its temp writer after the chunks that
    /// were left unmerged, and reseal it in place. The unmerged chunks keep
    /// their original byte offsets untouched — only the trailing directory
    /// and header are rewritten, so a crash between here and the matching
    /// `FileMergeEnd` leaves the original file, directory included, intact
    /// up to `truncate_position`.
    fn move_merged_to_old(
        &self,
        run_state: &MergeRunState,
        segment: &Segment,
        truncate_position: u64,
    ) -> Result<()> {
        let unmerged_starts = run_state
            .unmerged_chunk_start_times
            .get(&segment.id())
            .cloned()
            .unwrap_or_default();

        let kept_chunks: Vec<crate::model::ChunkMetadata> = if unmerged_starts.is_empty() {
            Vec::new()
        } else {
            let reader = self.resource.reader(segment)?;
            let mut guard = reader
                .lock()
                .map_err(|_| Error::Inconsistent(format!("reader lock poisoned for {}", segment.id())))?;
            let directory = guard.chunk_directory()?;
            directory
                .into_iter()
                .filter(|c| {
                    unmerged_starts
                        .get(&c.series_path())
                        .map(|starts| starts.contains(&c.start_time()))
                        .unwrap_or(false)
                })
                .collect()
        };

        let temp_path = self
            .resource
            .temp_writer_path(segment)
            .ok_or_else(|| Error::Inconsistent("temp writer path missing at commit".to_string()))?;
        {
            let writer = self
                .resource
                .take_writer(segment)
                .ok_or_else(|| Error::Inconsistent("temp writer missing at commit".to_string()))?;
            let owned = try_unwrap_writer(writer)?;
            owned.finish()?;
        }

        let merged_chunks = {
            let mut reader = (self.env.open_reader)(&temp_path)?;
            let directory = reader.chunk_directory()?;
            let mut chunks = Vec::with_capacity(directory.len());
            for meta in &directory {
                chunks.push((meta.clone(), reader.read_chunk(meta)?));
            }
            chunks
        };

        let file = std::fs::OpenOptions::new().write(true).open(segment.path())?;
        file.set_len(truncate_position)?;
        drop(file);

        let mut writer = (self.env.resume_writer)(segment.path(), truncate_position, kept_chunks)?;
        for (meta, points) in merged_chunks {
            writer.write_chunk(&meta.device, &meta.measurement, meta.data_type, &points, meta.version)?;
        }
        writer.finish()?;
        std::fs::remove_file(&temp_path)?;
        Ok(())
    }
}

fn split_series(series: &str) -> Result<(String, String)> {
    series
        .split_once('.')
        .map(|(d, m)| (d.to_string(), m.to_string()))
        .ok_or_else(|| Error::Inconsistent(format!("malformed series path {series}")))
}

fn try_unwrap_writer(
    writer: std::sync::Arc<std::sync::Mutex<Box<dyn crate::io::traits::SegmentWriter>>>,
) -> Result<Box<dyn crate::io::traits::SegmentWriter>> {
    match std::sync::Arc::try_unwrap(writer) {
        Ok(mutex) => mutex
            .into_inner()
            .map_err(|_| Error::Inconsistent("temp writer lock poisoned".to_string())),
        Err(_) => Err(Error::Inconsistent(
            "temp writer still shared at commit time".to_string(),
        )),
    }
}
