//! Abstract segment I/O contracts. The merge kernel (`crate::merge`) is
//! written only against these traits; `codec` supplies the one concrete
//! implementation this crate ships, but it is a default, not the contract.

use crate::error::Result;
use crate::model::{ChunkMetadata, ResourceDescriptor, Tombstone};
use std::path::Path;

/// Read access to a sealed segment file: its chunk directory, and the raw
/// point data for any one chunk in that directory.
#[cfg_attr(test, mockall::automock)]
pub trait SegmentReader: Send {
    /// All chunks stored in this segment, in on-disk order.
    fn chunk_directory(&mut self) -> Result<Vec<ChunkMetadata>>;

    /// Decoded `(timestamp, value)` pairs for one chunk, identified by its
    /// byte offset in `chunk_directory`.
    fn read_chunk(&mut self, chunk: &ChunkMetadata) -> Result<Vec<crate::model::TimeValuePair>>;
}

/// Write access building up a new segment file: chunks are appended in
/// increasing start-time order per series and the file is sealed once.
pub trait SegmentWriter: Send {
    /// Append one fully-materialized chunk (already filtered by any
    /// tombstones). `version` is the writing segment's identity version
    /// (§6 filename grammar), carried into `ChunkMetadata` so a later
    /// `UnseqPointReader` can apply the higher-version-wins tie-break.
    /// Returns the `ChunkMetadata` with its on-disk offset filled in.
    fn write_chunk(
        &mut self,
        device: &str,
        measurement: &str,
        data_type: crate::model::DataType,
        points: &[crate::model::TimeValuePair],
        version: u64,
    ) -> Result<ChunkMetadata>;

    /// Finalize the file: write the chunk directory and header, fsync.
    fn finish(self: Box<Self>) -> Result<()>;

    /// Reopens an already-sealed file, truncated to `start_offset`, so
    /// chunks can keep being appended after the bytes already on disk
    /// below that offset. Used by the "move merged to old" in-place
    /// commit path (§4.5) to re-seal a segment without disturbing the
    /// chunk bytes it keeps. An associated function rather than a method
    /// so the trait stays object-safe: call it through whichever concrete
    /// codec the `CompactionContext` was built with, not on a `dyn`
    /// reference.
    fn resume(path: &Path, start_offset: u64, existing_entries: Vec<ChunkMetadata>) -> Result<Box<dyn SegmentWriter>>
    where
        Self: Sized;
}

/// Enumerates segment files in a directory and loads/stores their sidecar
/// metadata (`.resource`, `.mods`).
pub trait Catalogue: Send + Sync {
    fn resource_for(&self, segment_path: &Path) -> Result<ResourceDescriptor>;
    fn write_resource(&self, segment_path: &Path, descriptor: &ResourceDescriptor) -> Result<()>;
    fn tombstones_for(&self, segment_path: &Path) -> Result<Vec<Tombstone>>;
    fn append_tombstone(&self, segment_path: &Path, tombstone: &Tombstone) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, ScalarValue, TimeRange, TimeValuePair, Timestamp};

    fn a_chunk() -> ChunkMetadata {
        ChunkMetadata {
            device: "dev1".to_string(),
            measurement: "temp".to_string(),
            range: TimeRange::new(Timestamp::from_secs(0), Timestamp::from_secs(1)),
            point_count: 1,
            offset: 64,
            data_type: DataType::Int64,
            version: 0,
            deleted_at: None,
        }
    }

    /// The merge kernel only ever talks to `SegmentReader` through the
    /// trait, so a mock standing in for the concrete codec must satisfy
    /// the same contract a real reader does: directory first, then reads
    /// keyed off an entry from that directory.
    #[test]
    fn mock_segment_reader_satisfies_the_dedup_contract() {
        let mut mock = MockSegmentReader::new();
        let meta = a_chunk();

        let dir_meta = meta.clone();
        mock.expect_chunk_directory()
            .times(1)
            .returning(move || Ok(vec![dir_meta.clone()]));

        let read_meta = meta.clone();
        mock.expect_read_chunk()
            .withf(move |c| c.offset == read_meta.offset)
            .times(1)
            .returning(|_| Ok(vec![TimeValuePair::new(Timestamp::from_secs(0), ScalarValue::Int64(1))]));

        let directory = mock.chunk_directory().unwrap();
        assert_eq!(directory.len(), 1);
        let points = mock.read_chunk(&directory[0]).unwrap();
        assert_eq!(points.len(), 1);
    }
}
