//! The process-wide environment threaded through every merge task.
//!
//! Replaces the cache-of-caches / storage-engine-singleton shape with a
//! single value passed down the call chain (§9 "Cyclic registries",
//! "Global mutable state"): no cache owns a back-reference to this struct,
//! they are handed a clone of what they need at construction time.

use crate::config::MergeConfig;
use crate::error::Result;
use crate::io::traits::{Catalogue, SegmentReader, SegmentWriter};
use crate::model::ChunkMetadata;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type ReaderFactory = dyn Fn(&Path) -> Result<Box<dyn SegmentReader>> + Send + Sync;
pub type WriterFactory = dyn Fn(&Path) -> Result<Box<dyn SegmentWriter>> + Send + Sync;
/// Reopens an already-sealed file truncated to a given offset, seeded with
/// the chunk entries that remain below it. Routes the in-place commit
/// path's resume step through the same codec the rest of the environment
/// was built with, instead of it reaching for a concrete type directly.
pub type ResumeWriterFactory =
    dyn Fn(&Path, u64, Vec<ChunkMetadata>) -> Result<Box<dyn SegmentWriter>> + Send + Sync;

/// Cooperative cancellation flag shared between a scheduler and the tasks
/// it runs (§4.9, §5 "Cancellation").
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Environment constructed once at process start and cloned into every
/// merge task. Cheap to clone: every field is an `Arc` or plain config data.
#[derive(Clone)]
pub struct CompactionContext {
    pub catalogue: Arc<dyn Catalogue>,
    pub open_reader: Arc<ReaderFactory>,
    pub create_writer: Arc<WriterFactory>,
    pub resume_writer: Arc<ResumeWriterFactory>,
    pub config: MergeConfig,
}

impl CompactionContext {
    pub fn new(
        catalogue: Arc<dyn Catalogue>,
        open_reader: Arc<ReaderFactory>,
        create_writer: Arc<WriterFactory>,
        resume_writer: Arc<ResumeWriterFactory>,
        config: MergeConfig,
    ) -> Self {
        Self {
            catalogue,
            open_reader,
            create_writer,
            resume_writer,
            config,
        }
    }
}
