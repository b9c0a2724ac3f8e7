//! CLI commands: operator entry points, glue only (§2.1 "a small clap CLI
//! ... not a server"). All the actual compaction logic lives in `merge`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tsmerge")]
#[command(about = "Memory-bounded, crash-safe compaction engine for tiered time-series segment storage")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one compaction pass over a storage-group directory and print a
    /// summary. Expects `sequence/` and `unsequence/` subdirectories of
    /// already-sealed segment files.
    Compact {
        /// Storage-group directory to compact.
        #[arg(long)]
        dir: PathBuf,
        /// Plan the merge and print what would run, without committing it.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Replay the crash-recovery journal for a storage-group directory
    /// without running a new merge. A no-op if no journal is present.
    Recover {
        /// Storage-group directory whose `merge.log`/`merge.squeeze.log` to replay.
        #[arg(long)]
        dir: PathBuf,
    },
}
