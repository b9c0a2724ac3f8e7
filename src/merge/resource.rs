//! C1: MergeResource — the working set of segments for one merge task, its
//! cached readers/writers, and the per-run mutable aggregate the kernel
//! accumulates into.

use super::context::CompactionContext;
use crate::error::{Error, Result};
use crate::io::traits::{SegmentReader, SegmentWriter};
use crate::model::{ChunkMetadata, Segment, SegmentId, Timestamp, Tombstone, TombstoneCache};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Which commit strategy the task will use; decides the temp-writer's file
/// suffix (§4.1 `tempWriter`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Inplace,
    Squeeze,
}

impl CommitMode {
    fn temp_suffix(&self) -> &'static str {
        match self {
            CommitMode::Inplace => "merge.inplace",
            CommitMode::Squeeze => "merge.squeeze",
        }
    }
}

/// Per-run mutable aggregate the chunk merge kernel accumulates into (§3
/// "MergeContext"). Owned by the task; discarded at end.
#[derive(Debug, Default)]
pub struct MergeRunState {
    /// `Segment -> Series -> [chunk start times]` emitted by the "Skip"
    /// case; consumed by `FileCommitter` to know what to back-patch.
    pub unmerged_chunk_start_times: HashMap<SegmentId, HashMap<String, Vec<Timestamp>>>,
    pub merged_chunk_count: HashMap<SegmentId, u64>,
    pub unmerged_chunk_count: HashMap<SegmentId, u64>,
    pub points_written: u64,
    pub chunks_written: u64,
}

impl MergeRunState {
    pub fn record_unmerged_chunk_start(&mut self, segment: SegmentId, series: &str, start: Timestamp) {
        self.unmerged_chunk_start_times
            .entry(segment)
            .or_default()
            .entry(series.to_string())
            .or_default()
            .push(start);
        *self.unmerged_chunk_count.entry(segment).or_insert(0) += 1;
    }

    pub fn record_merged_chunk(&mut self, segment: SegmentId, points: u64) {
        *self.merged_chunk_count.entry(segment).or_insert(0) += 1;
        self.points_written += points;
        self.chunks_written += 1;
    }

    /// §4.5's commit-branch decision: "move unmerged to new" when merged
    /// output dominates, else "move merged to old".
    pub fn prefers_move_unmerged_to_new(&self, segment: SegmentId) -> bool {
        let merged = self.merged_chunk_count.get(&segment).copied().unwrap_or(0);
        let unmerged = self.unmerged_chunk_count.get(&segment).copied().unwrap_or(0);
        merged >= unmerged
    }
}

type SharedReader = Arc<Mutex<Box<dyn SegmentReader>>>;
type SharedWriter = Arc<Mutex<Box<dyn SegmentWriter>>>;

/// C1. Owns the working set of segments for one merge, caching readers,
/// temp-file writers and per-(segment, series) tombstone lists.
pub struct MergeResource {
    env: CompactionContext,
    sequence: Vec<Segment>,
    unsequence: Vec<Segment>,
    mode: CommitMode,
    readers: DashMap<SegmentId, SharedReader, ahash::RandomState>,
    writers: DashMap<SegmentId, SharedWriter, ahash::RandomState>,
    writer_paths: DashMap<SegmentId, PathBuf, ahash::RandomState>,
    tombstones: DashMap<SegmentId, Mutex<TombstoneCache>, ahash::RandomState>,
}

impl MergeResource {
    /// Apply the §4.1 filtering rule while building the working set: a
    /// segment is kept only if sealed, not deleted, and its latest device
    /// end time exceeds `time_lower_bound`.
    pub fn new(
        env: CompactionContext,
        candidates_sequence: Vec<Segment>,
        candidates_unsequence: Vec<Segment>,
        mode: CommitMode,
        time_lower_bound: Timestamp,
    ) -> Self {
        let filter = |segs: Vec<Segment>| -> Vec<Segment> {
            segs.into_iter()
                .filter(|s| s.eligible_for_merge(time_lower_bound))
                .collect()
        };
        Self {
            env,
            sequence: filter(candidates_sequence),
            unsequence: filter(candidates_unsequence),
            mode,
            readers: DashMap::with_hasher(ahash::RandomState::default()),
            writers: DashMap::with_hasher(ahash::RandomState::default()),
            writer_paths: DashMap::with_hasher(ahash::RandomState::default()),
            tombstones: DashMap::with_hasher(ahash::RandomState::default()),
        }
    }

    pub fn sequence(&self) -> &[Segment] {
        &self.sequence
    }

    pub fn unsequence(&self) -> &[Segment] {
        &self.unsequence
    }

    /// Opens on first call; the same reader (behind a lock, shared-read
    /// for the duration of the task) is returned afterwards.
    pub fn reader(&self, segment: &Segment) -> Result<SharedReader> {
        if let Some(existing) = self.readers.get(&segment.id()) {
            return Ok(existing.clone());
        }
        let reader = (self.env.open_reader)(segment.path())?;
        let shared = Arc::new(Mutex::new(reader));
        self.readers.insert(segment.id(), shared.clone());
        Ok(shared)
    }

    /// Lazily creates the temp-file writer for `segment`; creation is
    /// idempotent per segment.
    pub fn temp_writer(&self, segment: &Segment) -> Result<SharedWriter> {
        if let Some(existing) = self.writers.get(&segment.id()) {
            return Ok(existing.clone());
        }
        let path = segment.path().with_extension(self.mode.temp_suffix());
        let writer = (self.env.create_writer)(&path)?;
        let shared = Arc::new(Mutex::new(writer));
        self.writers.insert(segment.id(), shared.clone());
        self.writer_paths.insert(segment.id(), path);
        Ok(shared)
    }

    pub fn temp_writer_path(&self, segment: &Segment) -> Option<PathBuf> {
        self.writer_paths.get(&segment.id()).map(|p| p.clone())
    }

    /// Removes the cached writer for `segment` and returns it, so the
    /// caller holds the sole remaining `Arc` and can safely unwrap it to
    /// finalize the file at commit time.
    pub fn take_writer(&self, segment: &Segment) -> Option<SharedWriter> {
        self.writers.remove(&segment.id()).map(|(_, v)| v)
    }

    /// Not cached: chunk directories are large, and each series is walked
    /// at most once per segment, so caching would not amortize.
    pub fn chunk_metadata(&self, series: &str, segment: &Segment) -> Result<Vec<ChunkMetadata>> {
        let reader = self.reader(segment)?;
        let mut guard = reader.lock().map_err(|_| {
            Error::Inconsistent(format!("reader lock poisoned for {}", segment.id()))
        })?;
        let directory = guard.chunk_directory()?;
        Ok(directory
            .into_iter()
            .filter(|c| c.series_path() == series)
            .collect())
    }

    /// Returns the tombstones applicable to `series` in `segment`,
    /// **destructively** removing them from the cache. A second call for
    /// the same pair returns empty, per §4.1.
    pub fn modifications(&self, segment: &Segment, series: &str) -> Result<Vec<Tombstone>> {
        if !self.tombstones.contains_key(&segment.id()) {
            let loaded = self.env.catalogue.tombstones_for(segment.path())?;
            self.tombstones
                .insert(segment.id(), Mutex::new(TombstoneCache::load(loaded)));
        }
        let entry = self.tombstones.get(&segment.id()).unwrap();
        let mut cache = entry
            .lock()
            .map_err(|_| Error::Inconsistent("tombstone cache lock poisoned".to_string()))?;
        Ok(cache.take(series))
    }

    /// Distinct `(device, measurement, data_type)` triples touched by any
    /// segment in the working set, in device-then-measurement order
    /// (§5 "chunk-groups are device-sorted; within a device, measurements
    /// are written in catalogue order"). Used by the merge task to build
    /// series batches before any per-series work starts.
    pub fn distinct_series(&self) -> Result<Vec<(String, String, crate::model::DataType)>> {
        let mut seen = std::collections::BTreeMap::new();
        for segment in self.sequence.iter().chain(self.unsequence.iter()) {
            let reader = self.reader(segment)?;
            let mut guard = reader.lock().map_err(|_| {
                Error::Inconsistent(format!("reader lock poisoned for {}", segment.id()))
            })?;
            for chunk in guard.chunk_directory()? {
                seen.entry((chunk.device.clone(), chunk.measurement.clone()))
                    .or_insert(chunk.data_type);
            }
        }
        Ok(seen
            .into_iter()
            .map(|((device, measurement), data_type)| (device, measurement, data_type))
            .collect())
    }

    /// Closes all cached readers and writers. Idempotent; individual
    /// close errors are logged and suppressed so cleanup always completes.
    pub fn release(&self) {
        self.readers.clear();
        for entry in self.writers.iter() {
            tracing::debug!(segment = %entry.key(), "releasing temp writer without finishing it");
        }
        self.writers.clear();
    }
}
