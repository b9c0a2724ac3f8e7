//! Concrete segment codec: 64-byte header, compressed chunk bodies, a
//! trailing chunk directory, and JSON sidecars for resource/tombstone
//! metadata. Grounded directly on the segment file format this crate's
//! ambient storage layer already used, carried forward for chunks instead
//! of flat events.
//!
//! This is *a* codec the merge engine can run against, not the only one it
//! could: `ChunkMerger` and friends are written only against
//! `super::traits::{SegmentReader, SegmentWriter}`.

use super::traits::{Catalogue, SegmentReader, SegmentWriter};
use crate::error::{Error, Result};
use crate::model::{ChunkMetadata, DataType, ResourceDescriptor, TimeRange, TimeValuePair, Tombstone};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SEGMENT_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 64;
pub const MAGIC: &[u8; 5] = b"TSMG0";
pub const ZSTD_COMPRESSION_LEVEL: i32 = 3;

struct FileHeader {
    chunk_count: u32,
    directory_offset: u64,
    directory_len: u32,
    checksum: u32,
}

impl FileHeader {
    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(MAGIC);
        buf.put_u8(SEGMENT_VERSION);
        buf.put_u16(0);
        buf.put_u32(self.chunk_count);
        buf.put_u64(self.directory_offset);
        buf.put_u32(self.directory_len);
        buf.put_u32(self.checksum);
        // 5 + 1 + 2 + 4 + 8 + 4 + 4 = 28, pad to 64.
        buf.put_bytes(0, HEADER_SIZE - buf.len());
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf.freeze()
    }

    fn deserialize(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::CorruptInput("segment header truncated".to_string()));
        }
        if &buf[0..5] != MAGIC {
            return Err(Error::CorruptInput(format!(
                "bad segment magic: {:?}",
                &buf[0..5]
            )));
        }
        buf.advance(5);
        let version = buf.get_u8();
        if version != SEGMENT_VERSION {
            return Err(Error::CorruptInput(format!(
                "unsupported segment version {version}"
            )));
        }
        buf.advance(2);
        let chunk_count = buf.get_u32();
        let directory_offset = buf.get_u64();
        let directory_len = buf.get_u32();
        let checksum = buf.get_u32();
        Ok(Self {
            chunk_count,
            directory_offset,
            directory_len,
            checksum,
        })
    }
}

/// One on-disk chunk directory entry. Distinct from `ChunkMetadata` only in
/// that it additionally carries `device`/`measurement` redundantly for
/// standalone (de)serialization; `bincode` handles the rest.
type Directory = Vec<ChunkMetadata>;

pub struct ChunkSegmentWriter {
    file: File,
    entries: Directory,
    current_offset: u64,
    checksum_hasher: Crc32Hasher,
}

impl ChunkSegmentWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&[0u8; HEADER_SIZE])?;
        Ok(Self {
            file,
            entries: Vec::new(),
            current_offset: HEADER_SIZE as u64,
            checksum_hasher: Crc32Hasher::new(),
        })
    }
}

impl SegmentWriter for ChunkSegmentWriter {
    fn write_chunk(
        &mut self,
        device: &str,
        measurement: &str,
        data_type: DataType,
        points: &[TimeValuePair],
        version: u64,
    ) -> Result<ChunkMetadata> {
        if points.is_empty() {
            return Err(Error::Inconsistent(format!(
                "attempted to write an empty chunk for {device}.{measurement}"
            )));
        }

        let mut raw = BytesMut::new();
        raw.put_u32(points.len() as u32);
        for p in points {
            raw.put_i64(p.timestamp.as_nanos());
            match &p.value {
                Some(v) => v.encode(&mut raw),
                None => {
                    return Err(Error::Inconsistent(
                        "cannot persist a tombstoned point".to_string(),
                    ))
                }
            }
        }

        let compressed = zstd::encode_all(&raw[..], ZSTD_COMPRESSION_LEVEL)
            .map_err(|e| Error::Storage(format!("zstd compression failed: {e}")))?;
        self.checksum_hasher.update(&compressed);

        let offset = self.current_offset;
        self.file.write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.file.write_all(&compressed)?;
        self.current_offset += 4 + compressed.len() as u64;

        let start = points.first().unwrap().timestamp;
        let end = points.last().unwrap().timestamp;
        let meta = ChunkMetadata {
            device: device.to_string(),
            measurement: measurement.to_string(),
            range: TimeRange::new(start, end),
            point_count: points.len() as u32,
            offset,
            data_type,
            version,
            deleted_at: None,
        };
        self.entries.push(meta.clone());
        Ok(meta)
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let directory_bytes =
            bincode::serialize(&self.entries).map_err(|e| Error::Serialization(e.to_string()))?;
        let directory_offset = self.current_offset;
        self.file.write_all(&directory_bytes)?;

        let header = FileHeader {
            chunk_count: self.entries.len() as u32,
            directory_offset,
            directory_len: directory_bytes.len() as u32,
            checksum: self.checksum_hasher.clone().finalize(),
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.serialize())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Resume an already-sealed segment file that has just been truncated
    /// back to `start_offset` (the end of its last chunk body, i.e. right
    /// where its now-discarded chunk directory used to begin). Chunks
    /// written through this writer land after `existing_entries` in the
    /// directory `finish` rebuilds, so the bytes before `start_offset`
    /// (the original header and chunk bodies) are never touched — only
    /// the trailing directory and header get rewritten (§4.5 "move merged
    /// to old").
    fn resume(path: &Path, start_offset: u64, existing_entries: Vec<ChunkMetadata>) -> Result<Box<dyn SegmentWriter>> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(start_offset))?;
        Ok(Box::new(Self {
            file,
            entries: existing_entries,
            current_offset: start_offset,
            checksum_hasher: Crc32Hasher::new(),
        }))
    }
}

pub struct ChunkSegmentReader {
    file: File,
    header: FileHeader,
}

impl ChunkSegmentReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header_buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = FileHeader::deserialize(&header_buf)?;
        Ok(Self { file, header })
    }

    /// Byte offset where this file's chunk directory begins, i.e. the end
    /// of its last chunk body.
    pub fn directory_offset(&self) -> u64 {
        self.header.directory_offset
    }
}

impl SegmentReader for ChunkSegmentReader {
    fn chunk_directory(&mut self) -> Result<Vec<ChunkMetadata>> {
        self.file.seek(SeekFrom::Start(self.header.directory_offset))?;
        let mut buf = vec![0u8; self.header.directory_len as usize];
        self.file.read_exact(&mut buf)?;
        let entries: Directory =
            bincode::deserialize(&buf).map_err(|e| Error::CorruptInput(e.to_string()))?;
        if entries.len() != self.header.chunk_count as usize {
            return Err(Error::CorruptInput(format!(
                "chunk directory length {} does not match header count {}",
                entries.len(),
                self.header.chunk_count
            )));
        }
        Ok(entries)
    }

    fn read_chunk(&mut self, chunk: &ChunkMetadata) -> Result<Vec<TimeValuePair>> {
        self.file.seek(SeekFrom::Start(chunk.offset))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let compressed_len = u32::from_le_bytes(len_buf) as usize;
        let mut compressed = vec![0u8; compressed_len];
        self.file.read_exact(&mut compressed)?;

        let decompressed = zstd::decode_all(&compressed[..])
            .map_err(|e| Error::CorruptInput(format!("zstd decompression failed: {e}")))?;
        let mut buf = &decompressed[..];
        if buf.remaining() < 4 {
            return Err(Error::CorruptInput("truncated chunk body".to_string()));
        }
        let count = buf.get_u32() as usize;
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 8 {
                return Err(Error::CorruptInput("truncated chunk point".to_string()));
            }
            let ts = crate::model::Timestamp::from_nanos(buf.get_i64());
            let value = crate::model::ScalarValue::decode(chunk.data_type, &mut buf)?;
            points.push(TimeValuePair::new(ts, value));
        }
        Ok(points)
    }
}

/// Filesystem-backed `Catalogue`: `.resource` and `.mods` sidecars stored as
/// newline-delimited JSON next to the segment file.
pub struct FileCatalogue;

impl FileCatalogue {
    pub fn new() -> Self {
        Self
    }

    fn resource_path(segment_path: &Path) -> PathBuf {
        segment_path.with_extension("resource")
    }

    fn mods_path(segment_path: &Path) -> PathBuf {
        segment_path.with_extension("mods")
    }
}

impl Default for FileCatalogue {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalogue for FileCatalogue {
    fn resource_for(&self, segment_path: &Path) -> Result<ResourceDescriptor> {
        let path = Self::resource_path(segment_path);
        if !path.exists() {
            return Ok(ResourceDescriptor::new());
        }
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_resource(&self, segment_path: &Path, descriptor: &ResourceDescriptor) -> Result<()> {
        let path = Self::resource_path(segment_path);
        let bytes = serde_json::to_vec(descriptor)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn tombstones_for(&self, segment_path: &Path) -> Result<Vec<Tombstone>> {
        let path = Self::mods_path(segment_path);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).map_err(Error::from))
            .collect()
    }

    fn append_tombstone(&self, segment_path: &Path, tombstone: &Tombstone) -> Result<()> {
        let path = Self::mods_path(segment_path);
        let mut line = serde_json::to_string(tombstone)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScalarValue, Timestamp};
    use tempfile::TempDir;

    fn points(start: i64, n: i64) -> Vec<TimeValuePair> {
        (0..n)
            .map(|i| TimeValuePair::new(Timestamp::from_secs(start + i), ScalarValue::Int64(i)))
            .collect()
    }

    #[test]
    fn writes_and_reads_chunks_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-0.seg");

        let mut writer = ChunkSegmentWriter::create(&path).unwrap();
        let meta_a = writer
            .write_chunk("dev1", "temp", DataType::Int64, &points(0, 10), 0)
            .unwrap();
        let meta_b = writer
            .write_chunk("dev1", "humidity", DataType::Int64, &points(100, 5), 0)
            .unwrap();
        Box::new(writer).finish().unwrap();

        let mut reader = ChunkSegmentReader::open(&path).unwrap();
        let directory = reader.chunk_directory().unwrap();
        assert_eq!(directory.len(), 2);

        let read_a = reader.read_chunk(&meta_a).unwrap();
        assert_eq!(read_a.len(), 10);
        assert_eq!(read_a[0].value, Some(ScalarValue::Int64(0)));

        let read_b = reader.read_chunk(&meta_b).unwrap();
        assert_eq!(read_b.len(), 5);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.seg");
        std::fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();
        assert!(ChunkSegmentReader::open(&path).is_err());
    }

    #[test]
    fn catalogue_round_trips_resource_and_tombstones() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-0.seg");
        std::fs::write(&path, []).unwrap();
        let catalogue = FileCatalogue::new();

        let mut descriptor = ResourceDescriptor::new();
        descriptor.record("dev1", Timestamp::from_secs(5));
        catalogue.write_resource(&path, &descriptor).unwrap();
        let loaded = catalogue.resource_for(&path).unwrap();
        assert_eq!(loaded.device_range("dev1"), descriptor.device_range("dev1"));

        let tombstone = Tombstone {
            series_path: "dev1.temp".to_string(),
            end_time: Timestamp::from_secs(10),
            version: 1,
        };
        catalogue.append_tombstone(&path, &tombstone).unwrap();
        let loaded = catalogue.tombstones_for(&path).unwrap();
        assert_eq!(loaded, vec![tombstone]);
    }
}
