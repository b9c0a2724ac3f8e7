//! Chunk metadata: the unit the chunk merge kernel walks over (§3).

use super::timestamp::{TimeRange, Timestamp};
use super::value::DataType;
use serde::{Deserialize, Serialize};

/// Metadata for one chunk: one measurement of one device over a contiguous
/// timestamp range, as stored in a segment's chunk directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub device: String,
    pub measurement: String,
    pub range: TimeRange,
    pub point_count: u32,
    pub offset: u64,
    pub data_type: DataType,
    pub version: u64,
    /// Set by tombstone application (§4.4 step 1): the latest tombstone
    /// `endTime` that applies to this chunk, if any.
    pub deleted_at: Option<Timestamp>,
}

impl ChunkMetadata {
    pub fn start_time(&self) -> Timestamp {
        self.range.start
    }

    pub fn end_time(&self) -> Timestamp {
        self.range.end
    }

    pub fn series_path(&self) -> String {
        format!("{}.{}", self.device, self.measurement)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Apply a tombstone end time, keeping the maximum per §4.4 step 1
    /// ("setting `deletedAt = max(endTime of applicable tombstones)`").
    pub fn apply_tombstone(&mut self, end_time: Timestamp) {
        self.deleted_at = Some(match self.deleted_at {
            Some(existing) => existing.max(end_time),
            None => end_time,
        });
    }

    /// Whether the chunk's entire range falls at or before its own
    /// deletion marker (the whole chunk was deleted).
    pub fn fully_deleted(&self) -> bool {
        matches!(self.deleted_at, Some(at) if at >= self.range.end)
    }

    /// Whether a point at `timestamp` within this chunk is covered by its
    /// deletion marker (§4.4 step 1: `deletedAt = max(endTime)` of every
    /// applicable tombstone; a point at or before it was deleted).
    pub fn deleted_by(&self, timestamp: Timestamp) -> bool {
        matches!(self.deleted_at, Some(at) if timestamp <= at)
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.range.overlaps(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(start: i64, end: i64) -> ChunkMetadata {
        ChunkMetadata {
            device: "d1".into(),
            measurement: "m1".into(),
            range: TimeRange::new(Timestamp::from_secs(start), Timestamp::from_secs(end)),
            point_count: 10,
            offset: 0,
            data_type: DataType::Int64,
            version: 1,
            deleted_at: None,
        }
    }

    #[test]
    fn tombstone_application_keeps_max() {
        let mut m = meta(0, 100);
        m.apply_tombstone(Timestamp::from_secs(40));
        m.apply_tombstone(Timestamp::from_secs(20));
        assert_eq!(m.deleted_at, Some(Timestamp::from_secs(40)));
    }

    #[test]
    fn fully_deleted_when_marker_covers_range() {
        let mut m = meta(0, 100);
        assert!(!m.fully_deleted());
        m.apply_tombstone(Timestamp::from_secs(100));
        assert!(m.fully_deleted());
    }

    #[test]
    fn deleted_by_drops_only_points_at_or_before_marker() {
        let mut m = meta(0, 100);
        m.apply_tombstone(Timestamp::from_secs(49));
        assert!(m.deleted_by(Timestamp::from_secs(0)));
        assert!(m.deleted_by(Timestamp::from_secs(49)));
        assert!(!m.deleted_by(Timestamp::from_secs(50)));
    }
}
