//! tsmerge: operator entry point.
//!
//! Glue only — discovers sealed segments under a storage-group directory,
//! runs one compaction pass or replays the crash-recovery journal, and
//! prints a summary. See `cli` for the command surface and `merge` for
//! the engine itself.

use clap::Parser;
use tsmerge::cli::Cli;
use tsmerge::config::MergeConfig;
use tsmerge::error::Result;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = MergeConfig::default();
    let summary = cli.command.run(config)?;
    println!("{summary}");
    Ok(())
}
