//! Operator entry point: discover sealed segments on disk, build the
//! environment a merge task needs, and run one compaction pass.

pub mod commands;

pub use commands::{Cli, Commands};

use crate::config::MergeConfig;
use crate::error::{Error, Result};
use crate::io::codec::{ChunkSegmentReader, ChunkSegmentWriter, FileCatalogue};
use crate::io::traits::SegmentWriter;
use crate::merge::{CancelToken, CompactionContext, LeveledCompactor, SubWorkerPool};
use crate::model::{ChunkMetadata, Segment, SegmentId, SegmentKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Builds the `CompactionContext` every command shares: the filesystem
/// catalogue and this crate's one concrete segment codec (§3.1).
pub fn default_context(config: MergeConfig) -> CompactionContext {
    CompactionContext::new(
        Arc::new(FileCatalogue::new()),
        Arc::new(|path: &Path| {
            Ok(Box::new(ChunkSegmentReader::open(path)?) as Box<dyn crate::io::traits::SegmentReader>)
        }),
        Arc::new(|path: &Path| {
            Ok(Box::new(ChunkSegmentWriter::create(path)?) as Box<dyn crate::io::traits::SegmentWriter>)
        }),
        Arc::new(|path: &Path, start_offset: u64, existing_entries: Vec<ChunkMetadata>| {
            <ChunkSegmentWriter as SegmentWriter>::resume(path, start_offset, existing_entries)
        }),
        config,
    )
}

/// Walks `dir/sequence` and `dir/unsequence` for sealed `*.seg` files
/// (skipping in-progress `.merge.*` temp files) and loads each one's
/// resource sidecar into a `Segment`.
pub fn discover_segments(dir: &Path, catalogue: &FileCatalogue) -> Result<(Vec<Segment>, Vec<Segment>)> {
    let sequence = discover_population(&dir.join("sequence"), SegmentKind::Sequence, catalogue)?;
    let unsequence = discover_population(&dir.join("unsequence"), SegmentKind::Unsequence, catalogue)?;
    Ok((sequence, unsequence))
}

fn discover_population(dir: &Path, kind: SegmentKind, catalogue: &FileCatalogue) -> Result<Vec<Segment>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("seg") {
            continue;
        }
        let id = SegmentId::parse(&path)?;
        let resource = catalogue.resource_for(&path)?;
        segments.push(Segment::new(id, kind, path, resource));
    }
    Ok(segments)
}

/// Runs `Commands::Compact`: discovers segments, registers them with a
/// fresh `LeveledCompactor`, runs a single poll, and either reports what
/// it would do (`dry_run`) or runs every pending merge to completion.
pub fn run_compact(dir: &PathBuf, dry_run: bool, config: MergeConfig) -> Result<String> {
    let env = default_context(config.clone());
    let catalogue = FileCatalogue::new();
    let (sequence, unsequence) = discover_segments(dir, &catalogue)?;

    let partition = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("default")
        .to_string();

    let compactor = LeveledCompactor::new(env);
    compactor.register_partition(&partition);
    for segment in sequence.iter().chain(unsequence.iter()) {
        compactor.notify_sealed(&partition, segment.clone());
    }

    let pending = compactor.poll();
    if pending.is_empty() {
        return Ok(format!(
            "partition {partition}: {} sequence, {} unsequence file(s); nothing to compact this pass",
            sequence.len(),
            unsequence.len()
        ));
    }

    if dry_run {
        let mut lines = Vec::new();
        for p in &pending {
            lines.push(format!(
                "partition {partition}: would promote {} sequence + {} unsequence file(s) to level {}",
                p.plan.selection.sequence.len(),
                p.plan.selection.unsequence.len(),
                p.output_level
            ));
        }
        return Ok(lines.join("\n"));
    }

    let cancel = CancelToken::new();
    let sub_pool = SubWorkerPool::new(config.merge_chunk_sub_thread_num.max(1));
    let mut summary = Vec::new();
    for p in pending {
        let level = p.output_level;
        match compactor.run_and_apply(p, &cancel, &sub_pool, dir) {
            Ok(()) => summary.push(format!("partition {partition}: promoted to level {level}")),
            Err(e) => summary.push(format!("partition {partition}: merge failed: {e}")),
        }
    }
    Ok(summary.join("\n"))
}

/// Runs `Commands::Recover`: replays the crash-recovery journal, if any.
pub fn run_recover(dir: &Path) -> Result<String> {
    let journal_path = dir.join("merge.log");
    let squeeze_path = dir.join("merge.squeeze.log");
    let mut actions = Vec::new();
    for path in [journal_path, squeeze_path] {
        if path.exists() {
            let action = crate::merge::journal::recover(&path, dir)?;
            actions.push(format!("{}: {:?}", path.display(), action));
        }
    }
    if actions.is_empty() {
        Ok("no journal present; nothing to recover".to_string())
    } else {
        Ok(actions.join("\n"))
    }
}

impl Commands {
    /// Dispatches this command to its handler.
    pub fn run(&self, config: MergeConfig) -> Result<String> {
        match self {
            Commands::Compact { dir, dry_run } => run_compact(dir, *dry_run, config),
            Commands::Recover { dir } => run_recover(dir).map_err(|e| match e {
                Error::Io(_) => e,
                other => other,
            }),
        }
    }
}
