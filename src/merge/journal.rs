//! C7: MergeJournal — the append-only, CRC-checked write-ahead log that
//! makes a merge task's commit phase crash-safe.

use crate::error::{Error, Result};
use crate::model::SegmentId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

pub const MAGIC: u32 = 0x4D524731; // "MRG1"

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    MoveMergedToOld,
    MoveUnmergedToNew,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    Files {
        sequence: Vec<SegmentId>,
        unsequence: Vec<SegmentId>,
    },
    MergeStart,
    TsStart {
        series: String,
    },
    TsEnd,
    FilePosition {
        file: SegmentId,
        offset: u64,
    },
    FileMergeStart {
        file: SegmentId,
        truncate_position: u64,
        mode: MergeMode,
    },
    FileMergeEnd {
        file: SegmentId,
    },
    NewFile {
        path: String,
    },
    MergeEnd,
    Cancel,
}

#[repr(u8)]
enum Tag {
    Files = 0,
    MergeStart = 1,
    TsStart = 2,
    TsEnd = 3,
    FilePosition = 4,
    FileMergeStart = 5,
    FileMergeEnd = 6,
    NewFile = 7,
    MergeEnd = 8,
    Cancel = 9,
}

fn tag_of(entry: &JournalEntry) -> u8 {
    (match entry {
        JournalEntry::Files { .. } => Tag::Files,
        JournalEntry::MergeStart => Tag::MergeStart,
        JournalEntry::TsStart { .. } => Tag::TsStart,
        JournalEntry::TsEnd => Tag::TsEnd,
        JournalEntry::FilePosition { .. } => Tag::FilePosition,
        JournalEntry::FileMergeStart { .. } => Tag::FileMergeStart,
        JournalEntry::FileMergeEnd { .. } => Tag::FileMergeEnd,
        JournalEntry::NewFile { .. } => Tag::NewFile,
        JournalEntry::MergeEnd => Tag::MergeEnd,
        JournalEntry::Cancel => Tag::Cancel,
    }) as u8
}

fn encode_entry(entry: &JournalEntry) -> Result<Bytes> {
    let payload = bincode::serialize(entry).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(1 + 4 + payload.len() + 4);
    buf.put_u8(tag_of(entry));
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    let mut hasher = Crc32Hasher::new();
    hasher.update(&payload);
    buf.put_u32(hasher.finalize());
    Ok(buf.freeze())
}

/// Append-only writer over `merge.log` (inplace) or `merge.squeeze.log`
/// (squeeze), per §6.
pub struct JournalWriter {
    file: Mutex<File>,
}

impl JournalWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&MAGIC.to_le_bytes())?;
        file.sync_all()?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn append(&self, entry: JournalEntry) -> Result<()> {
        let bytes = encode_entry(&entry)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Inconsistent("journal lock poisoned".to_string()))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn files(&self, sequence: Vec<SegmentId>, unsequence: Vec<SegmentId>) -> Result<()> {
        self.append(JournalEntry::Files { sequence, unsequence })
    }

    pub fn merge_start(&self) -> Result<()> {
        self.append(JournalEntry::MergeStart)
    }

    pub fn ts_start(&self, series: &str) -> Result<()> {
        self.append(JournalEntry::TsStart {
            series: series.to_string(),
        })
    }

    pub fn ts_end(&self) -> Result<()> {
        self.append(JournalEntry::TsEnd)
    }

    pub fn file_position(&self, file: SegmentId, offset: u64) -> Result<()> {
        self.append(JournalEntry::FilePosition { file, offset })
    }

    pub fn file_merge_start(&self, file: SegmentId, truncate_position: u64, mode: MergeMode) -> Result<()> {
        self.append(JournalEntry::FileMergeStart {
            file,
            truncate_position,
            mode,
        })
    }

    pub fn file_merge_end(&self, file: SegmentId) -> Result<()> {
        self.append(JournalEntry::FileMergeEnd { file })
    }

    pub fn new_file(&self, path: &str) -> Result<()> {
        self.append(JournalEntry::NewFile {
            path: path.to_string(),
        })
    }

    pub fn merge_end(&self) -> Result<()> {
        self.append(JournalEntry::MergeEnd)
    }

    pub fn cancel(&self) -> Result<()> {
        self.append(JournalEntry::Cancel)
    }
}

/// Scans every well-formed entry in `path`, stopping at the first
/// corruption or EOF (§4.7 step 2). A truncated trailing entry is not an
/// error: it is the expected shape of a crash mid-append.
pub fn scan(path: &Path) -> Result<Vec<JournalEntry>> {
    let mut file = File::open(path)?;
    let mut magic_buf = [0u8; 4];
    file.read_exact(&mut magic_buf)?;
    if u32::from_le_bytes(magic_buf) != MAGIC {
        return Err(Error::CorruptJournal("bad journal magic".to_string()));
    }

    let mut entries = Vec::new();
    loop {
        let mut tag_buf = [0u8; 1];
        if file.read_exact(&mut tag_buf).is_err() {
            break;
        }
        let mut len_buf = [0u8; 4];
        if file.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if file.read_exact(&mut crc_buf).is_err() {
            break;
        }
        let expected_crc = u32::from_le_bytes(crc_buf);
        let mut hasher = Crc32Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            break;
        }
        let entry: JournalEntry = match bincode::deserialize(&payload) {
            Ok(e) => e,
            Err(_) => break,
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// What the recovery scan decided to do, for the caller (typically
/// `LeveledCompactor` at startup) to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    NoJournal,
    CompletedCleanly,
    ResumedRename { file: SegmentId },
    RolledBackTruncate { file: SegmentId },
    DiscardedUnpromoted { file: SegmentId },
    AbortedEarly,
}

/// Recovery procedure on startup (§4.7 steps 1-7). `segment_dir` is the
/// partition directory the journaled segment ids resolve into; recovery
/// needs it because a `SegmentId` alone does not carry a path. Deletes the
/// journal once its implications have been applied; running this twice
/// against the same on-disk state is a no-op the second time (the journal
/// is already gone, so step 1 short-circuits).
pub fn recover(journal_path: &Path, segment_dir: &Path) -> Result<RecoveryAction> {
    if !journal_path.exists() {
        return Ok(RecoveryAction::NoJournal);
    }

    let entries = match scan(journal_path) {
        Ok(e) => e,
        Err(_) => {
            // A corrupt journal header itself is unrecoverable; treat
            // conservatively as "nothing to resume" and remove it so a
            // future cycle is not blocked forever.
            std::fs::remove_file(journal_path).ok();
            return Ok(RecoveryAction::AbortedEarly);
        }
    };

    let has_merge_end = entries.iter().any(|e| matches!(e, JournalEntry::MergeEnd));

    // Track the most recently opened file commit and whether its own
    // `FileMergeEnd` already landed, so a crash after one file's commit
    // finished (but before the task-level `MergeEnd`) is not mistaken for
    // an in-flight commit on that same file (§4.7 step 4: "if f is
    // already sealed at the post-merge length, finish rename").
    let mut last_start: Option<(SegmentId, u64, MergeMode)> = None;
    let mut last_start_completed = false;
    for entry in &entries {
        match entry {
            JournalEntry::FileMergeStart { file, truncate_position, mode } => {
                last_start = Some((*file, *truncate_position, *mode));
                last_start_completed = false;
            }
            JournalEntry::FileMergeEnd { file } => {
                if last_start.map(|(f, _, _)| f) == Some(*file) {
                    last_start_completed = true;
                }
            }
            _ => {}
        }
    }

    let action = if has_merge_end {
        RecoveryAction::CompletedCleanly
    } else if let Some((file, truncate_position, mode)) = last_start {
        let segment_path = file.path_in(segment_dir, "seg");
        let temp_path = segment_path.with_extension("merge.inplace");
        if last_start_completed {
            // This file's own commit already finished durably; only the
            // task-level `MergeEnd` is missing. Nothing to roll back for
            // it — just clear any stray temp file left behind.
            std::fs::remove_file(&temp_path).ok();
            RecoveryAction::ResumedRename { file }
        } else {
            match mode {
                MergeMode::MoveMergedToOld => {
                    if let Ok(meta) = std::fs::metadata(&segment_path) {
                        if meta.len() != truncate_position {
                            if let Ok(f) = OpenOptions::new().write(true).open(&segment_path) {
                                f.set_len(truncate_position).ok();
                            }
                        }
                    }
                    std::fs::remove_file(&temp_path).ok();
                    RecoveryAction::RolledBackTruncate { file }
                }
                MergeMode::MoveUnmergedToNew => {
                    std::fs::remove_file(&temp_path).ok();
                    RecoveryAction::DiscardedUnpromoted { file }
                }
            }
        }
    } else {
        for entry in &entries {
            if let JournalEntry::Files { sequence, .. } = entry {
                for file in sequence {
                    let temp_path = file.path_in(segment_dir, "seg").with_extension("merge.inplace");
                    std::fs::remove_file(&temp_path).ok();
                }
            }
        }
        RecoveryAction::AbortedEarly
    };

    std::fs::remove_file(journal_path)?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scan_reads_back_every_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("merge.log");
        let writer = JournalWriter::create(&path).unwrap();
        writer
            .files(vec![SegmentId::new(1, 0, 0)], vec![])
            .unwrap();
        writer.merge_start().unwrap();
        writer.ts_start("dev1.temp").unwrap();
        writer.ts_end().unwrap();
        writer.merge_end().unwrap();

        let entries = scan(&path).unwrap();
        assert_eq!(entries.len(), 5);
        assert!(matches!(entries[4], JournalEntry::MergeEnd));
    }

    #[test]
    fn recovery_with_no_journal_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("merge.log");
        assert_eq!(recover(&path, dir.path()).unwrap(), RecoveryAction::NoJournal);
    }

    #[test]
    fn recovery_deletes_journal_after_merge_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("merge.log");
        let writer = JournalWriter::create(&path).unwrap();
        writer.merge_start().unwrap();
        writer.merge_end().unwrap();

        let action = recover(&path, dir.path()).unwrap();
        assert_eq!(action, RecoveryAction::CompletedCleanly);
        assert!(!path.exists());
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("merge.log");
        let writer = JournalWriter::create(&path).unwrap();
        writer.merge_start().unwrap();
        writer.merge_end().unwrap();
        drop(writer);

        recover(&path, dir.path()).unwrap();
        let second = recover(&path, dir.path()).unwrap();
        assert_eq!(second, RecoveryAction::NoJournal);
    }

    #[test]
    fn recovery_does_not_truncate_a_file_whose_own_merge_end_already_landed() {
        let dir = TempDir::new().unwrap();
        let segment_path = dir.path().join("0-0-0.seg");
        std::fs::write(&segment_path, b"already-committed-bytes-on-disk").unwrap();
        let post_merge_len = std::fs::metadata(&segment_path).unwrap().len();

        let journal_path = dir.path().join("merge.log");
        let id = SegmentId::new(0, 0, 0);
        let writer = JournalWriter::create(&journal_path).unwrap();
        writer.files(vec![id], vec![]).unwrap();
        writer.merge_start().unwrap();
        writer.ts_start("dev1.temp").unwrap();
        writer.ts_end().unwrap();
        writer
            .file_merge_start(id, 5, MergeMode::MoveMergedToOld)
            .unwrap();
        writer.file_merge_end(id).unwrap();
        // Crash here: this file's commit is durable, but the task-level
        // `MergeEnd` never lands.
        drop(writer);

        let action = recover(&journal_path, dir.path()).unwrap();
        assert_eq!(action, RecoveryAction::ResumedRename { file: id });
        assert!(!journal_path.exists());
        assert_eq!(std::fs::metadata(&segment_path).unwrap().len(), post_merge_len);
    }

    #[test]
    fn truncated_trailing_entry_is_treated_as_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("merge.log");
        let writer = JournalWriter::create(&path).unwrap();
        writer.merge_start().unwrap();
        drop(writer);

        // Simulate a crash mid-append: truncate the last few bytes.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();
        drop(file);

        let entries = scan(&path).unwrap();
        assert!(entries.is_empty());
    }
}
