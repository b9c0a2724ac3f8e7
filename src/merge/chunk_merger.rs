//! C4: ChunkMerger — the inner merge kernel.
//!
//! Walks one series' sequence chunks in segment order, overlays the
//! series' unsequence point stream where ranges overlap, and emits merged
//! chunks through whichever output writer the caller selects (the caller
//! distinguishes in-place per-segment outputs from a single squeeze
//! output; the kernel itself does not).

use super::chunk_provider::ChunkProvider;
use super::resource::{MergeResource, MergeRunState};
use super::unseq_reader::UnseqPointReader;
use crate::config::MergeConfig;
use crate::error::{Error, Result};
use crate::io::traits::SegmentWriter;
use crate::model::{ChunkMetadata, DataType, Segment, TimeValuePair};
use std::sync::{Arc, Mutex};

/// One output sink a merged or copied chunk can land in: either the temp
/// writer of the sequence segment currently being walked (in-place mode)
/// or a single writer shared across the whole working set (squeeze mode).
/// The paired `u64` is the identity version the destination segment
/// writes its chunks under (§6): the walked segment's own version in
/// in-place mode, the squeeze output's version in squeeze mode.
pub type OutputSelector<'a> = dyn Fn(&Segment) -> Result<(Arc<Mutex<Box<dyn SegmentWriter>>>, u64)> + 'a;

struct ChunkBuffer {
    points: Vec<TimeValuePair>,
}

impl ChunkBuffer {
    fn new() -> Self {
        Self { points: Vec::new() }
    }

    fn push_all(&mut self, points: impl IntoIterator<Item = TimeValuePair>) {
        self.points.extend(points);
    }

    fn exceeds(&self, threshold: Option<u32>) -> bool {
        match threshold {
            Some(t) => self.points.len() as u32 > t,
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn take(&mut self) -> Vec<TimeValuePair> {
        std::mem::take(&mut self.points)
    }
}

pub struct ChunkMerger<'a> {
    resource: &'a MergeResource,
    provider: &'a ChunkProvider,
    config: &'a MergeConfig,
}

impl<'a> ChunkMerger<'a> {
    pub fn new(resource: &'a MergeResource, provider: &'a ChunkProvider, config: &'a MergeConfig) -> Self {
        Self {
            resource,
            provider,
            config,
        }
    }

    /// Merges one series across every sequence segment in `sequence`
    /// (already in non-overlapping sequence order), overlaying the single
    /// unsequence point stream built from `unsequence`.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_series(
        &self,
        run_state: &Mutex<MergeRunState>,
        series: &str,
        device: &str,
        measurement: &str,
        data_type: DataType,
        sequence: &[Segment],
        unsequence: &[Segment],
        output_for: &OutputSelector<'_>,
    ) -> Result<()> {
        let mut unseq_reader = UnseqPointReader::build(self.resource, series, unsequence)?;
        let mut pending_unseq: Option<TimeValuePair> = unseq_reader.next();
        let mut buffer = ChunkBuffer::new();

        for (segment_index, segment) in sequence.iter().enumerate() {
            let is_last_segment = segment_index + 1 == sequence.len();
            let mut chunks = self.resource.chunk_metadata(series, segment)?;
            let tombstones = self.resource.modifications(segment, series)?;
            for chunk in &mut chunks {
                for t in &tombstones {
                    if t.applies_to(series) {
                        chunk.apply_tombstone(t.end_time);
                    }
                }
            }

            for chunk in &chunks {
                if chunk.fully_deleted() {
                    continue;
                }
                let outcome = self.process_chunk(
                    run_state,
                    segment,
                    chunk,
                    device,
                    measurement,
                    data_type,
                    &mut buffer,
                    &mut pending_unseq,
                    &mut unseq_reader,
                    output_for,
                );
                // §7 / §4 failure semantics: a corrupt chunk is logged and
                // skipped, not propagated — the rest of the series still
                // merges. Any other error aborts the task.
                if let Err(e) = outcome {
                    if e.is_corrupt_input() {
                        tracing::warn!(series, segment = %segment.id(), chunk_offset = chunk.offset, error = %e, "skipping corrupt chunk");
                        continue;
                    }
                    return Err(e);
                }
            }

            if is_last_segment {
                while let Some(p) = pending_unseq.take() {
                    buffer.push_all(std::iter::once(p));
                    pending_unseq = unseq_reader.next();
                }
                if !buffer.is_empty() {
                    self.flush(run_state, segment, device, measurement, data_type, &mut buffer, output_for)?;
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_chunk(
        &self,
        run_state: &Mutex<MergeRunState>,
        segment: &Segment,
        chunk: &ChunkMetadata,
        device: &str,
        measurement: &str,
        data_type: DataType,
        buffer: &mut ChunkBuffer,
        pending_unseq: &mut Option<TimeValuePair>,
        unseq_reader: &mut UnseqPointReader,
        output_for: &OutputSelector<'_>,
    ) -> Result<()> {
        // `pending_unseq` always holds the running minimum of whatever
        // unseq points remain (the reader is a min-heap), so checking just
        // the head against this chunk's end is sufficient: if the head is
        // already past `end_time`, nothing smaller remains to overlap it.
        let overlaps_unseq = pending_unseq
            .as_ref()
            .map(|p| p.timestamp <= chunk.end_time())
            .unwrap_or(false);
        let tombstoned = chunk.is_tombstoned();
        let chunk_big_enough = self.config.chunk_big_enough(chunk.point_count);
        let no_unclosed_buffer = buffer.is_empty();
        let full_merge = self.config.force_full_merge;

        if overlaps_unseq {
            let points = self.provider.require(self.resource, segment, chunk)?;
            let mut merged = Vec::with_capacity(points.len());
            for p in points.iter() {
                if !p.is_live() || chunk.deleted_by(p.timestamp) {
                    continue;
                }
                let mut seq_point_superseded = false;
                while let Some(u) = pending_unseq.clone() {
                    if u.timestamp < p.timestamp {
                        merged.push(u);
                        *pending_unseq = unseq_reader.next();
                    } else if u.timestamp == p.timestamp {
                        // Tie: unseq wins, the seq point at this timestamp
                        // is dropped (§4.4 Merge case).
                        merged.push(u);
                        *pending_unseq = unseq_reader.next();
                        seq_point_superseded = true;
                        break;
                    } else {
                        break;
                    }
                }
                if seq_point_superseded {
                    continue;
                }
                merged.push(p.clone());
            }
            buffer.push_all(merged);
        } else if !no_unclosed_buffer || tombstoned || !chunk_big_enough {
            let points = self.provider.require(self.resource, segment, chunk)?;
            buffer.push_all(
                points
                    .iter()
                    .filter(|p| !chunk.deleted_by(p.timestamp))
                    .cloned(),
            );
        } else if full_merge {
            // Copy: verbatim recopy via decode (no raw-byte copy path
            // exists in this codec; decoding then re-encoding is
            // behaviourally equivalent and keeps one write path).
            let points = self.provider.require(self.resource, segment, chunk)?;
            let (writer, version) = output_for(segment)?;
            let mut guard = writer
                .lock()
                .map_err(|_| Error::Inconsistent("output writer lock poisoned".to_string()))?;
            guard.write_chunk(device, measurement, data_type, &points, version)?;
            let mut state = run_state
                .lock()
                .map_err(|_| Error::Inconsistent("run state lock poisoned".to_string()))?;
            state.record_merged_chunk(segment.id(), chunk.point_count as u64);
        } else {
            let mut state = run_state
                .lock()
                .map_err(|_| Error::Inconsistent("run state lock poisoned".to_string()))?;
            state.record_unmerged_chunk_start(segment.id(), chunk.series_path().as_str(), chunk.start_time());
        }

        if buffer.exceeds(self.config.chunk_merge_point_threshold) {
            self.flush(run_state, segment, device, measurement, data_type, buffer, output_for)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn flush(
        &self,
        run_state: &Mutex<MergeRunState>,
        segment: &Segment,
        device: &str,
        measurement: &str,
        data_type: DataType,
        buffer: &mut ChunkBuffer,
        output_for: &OutputSelector<'_>,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut points = buffer.take();
        points.sort_by_key(|p| p.timestamp);
        points.dedup_by_key(|p| p.timestamp);
        let count = points.len() as u64;

        let (writer, version) = output_for(segment)?;
        let mut guard = writer
            .lock()
            .map_err(|_| Error::Inconsistent("output writer lock poisoned".to_string()))?;
        guard.write_chunk(device, measurement, data_type, &points, version)?;
        drop(guard);

        let mut state = run_state
            .lock()
            .map_err(|_| Error::Inconsistent("run state lock poisoned".to_string()))?;
        state.record_merged_chunk(segment.id(), count);
        Ok(())
    }
}
