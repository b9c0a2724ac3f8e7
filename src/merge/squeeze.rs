//! C6: SqueezeMerger — writes one brand-new output segment covering the
//! union of all inputs, then atomically retires the inputs.

use super::journal::JournalWriter;
use crate::error::{Error, Result};
use crate::io::traits::{Catalogue, SegmentWriter};
use crate::model::{ResourceDescriptor, Segment, SegmentId, SegmentKind, Timestamp};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct SqueezeMerger<'a> {
    journal: &'a JournalWriter,
    catalogue: &'a dyn Catalogue,
}

impl<'a> SqueezeMerger<'a> {
    pub fn new(journal: &'a JournalWriter, catalogue: &'a dyn Catalogue) -> Self {
        Self { journal, catalogue }
    }

    /// Output filename: `{now}-{minInputVersion}-{maxInputMergeN+1}.ext`,
    /// with a `.merge.squeeze` suffix while the file is still being built.
    pub fn build_output_id(&self, inputs: &[Segment]) -> SegmentId {
        let min_version = inputs.iter().map(|s| s.id().version).min().unwrap_or(0);
        let max_merge = inputs.iter().map(|s| s.id().merge_count).max().unwrap_or(0);
        SegmentId::new(Timestamp::now().as_nanos() as u64, min_version, max_merge + 1)
    }

    pub fn temp_path(&self, dir: &Path, output_id: SegmentId) -> PathBuf {
        let mut path = output_id.path_in(dir, "seg");
        path.set_extension("seg.merge.squeeze");
        path
    }

    pub fn final_path(&self, dir: &Path, output_id: SegmentId) -> PathBuf {
        output_id.path_in(dir, "seg")
    }

    /// Retires the committed writer into its final location: records
    /// `NewFile(path)` durably before the rename, then renames and writes
    /// the union resource descriptor sidecar, then marks every input
    /// deleted.
    pub fn commit(
        &self,
        writer: Arc<Mutex<Box<dyn SegmentWriter>>>,
        temp_path: &Path,
        final_path: &Path,
        inputs: &[Segment],
        output_id: SegmentId,
    ) -> Result<Segment> {
        self.commit_as(writer, temp_path, final_path, inputs, output_id, SegmentKind::Sequence)
    }

    /// As `commit`, but lets the caller pick the output population. The
    /// independent unsequence-level promotion path (C8, §4.8 "unsequence
    /// is leveled independently") squeezes several unsequence files into
    /// one new unsequence file rather than a sequence one.
    pub fn commit_as(
        &self,
        writer: Arc<Mutex<Box<dyn SegmentWriter>>>,
        temp_path: &Path,
        final_path: &Path,
        inputs: &[Segment],
        output_id: SegmentId,
        kind: SegmentKind,
    ) -> Result<Segment> {
        let owned = Arc::try_unwrap(writer)
            .map_err(|_| Error::Inconsistent("squeeze writer still shared at commit".to_string()))?
            .into_inner()
            .map_err(|_| Error::Inconsistent("squeeze writer lock poisoned".to_string()))?;
        owned.finish()?;

        self.journal
            .new_file(&final_path.to_string_lossy())?;

        std::fs::rename(temp_path, final_path)?;

        let mut descriptor = ResourceDescriptor::new();
        for input in inputs {
            descriptor.union(&input.resource());
            descriptor.merge_ancestors(input.id().generation, &input.resource());
        }
        self.catalogue.write_resource(final_path, &descriptor)?;

        for input in inputs {
            input.retire();
            input.delete_files()?;
        }

        self.journal.merge_end()?;

        Ok(Segment::new(
            output_id,
            kind,
            final_path.to_path_buf(),
            descriptor,
        ))
    }
}
