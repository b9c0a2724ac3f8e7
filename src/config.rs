//! Recognized configuration options (§6). Loading these from a file or
//! environment is out of scope for this crate; `MergeConfig` is the plain
//! data structure a host process populates and hands in.

use serde::{Deserialize, Serialize};

/// Strategy for committing a sequence-population merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeqMergeFileStrategy {
    InplaceMaxFiles,
    InplaceMaxSeries,
    SqueezeMaxFiles,
    SqueezeMaxSeries,
    SimpleMaxFiles,
}

impl SeqMergeFileStrategy {
    /// Whether this strategy commits via `FileCommitter` (in-place) or
    /// `SqueezeMerger` (single new output).
    pub fn is_squeeze(&self) -> bool {
        matches!(self, Self::SqueezeMaxFiles | Self::SqueezeMaxSeries)
    }

    /// Whether `FileSelector` should optimize for number of files admitted
    /// ("max files") or per-series working-set size ("max series").
    pub fn optimizes_series(&self) -> bool {
        matches!(self, Self::InplaceMaxSeries | Self::SqueezeMaxSeries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub merge_thread_num: usize,
    pub merge_chunk_sub_thread_num: usize,
    pub merge_memory_budget: u64,
    pub merge_file_selection_time_budget: std::time::Duration,
    /// `None` represents the spec's `-1` sentinel: size-based skipping is
    /// disabled and every chunk is treated as "big enough".
    pub chunk_merge_point_threshold: Option<u32>,
    pub seq_merge_file_strategy: SeqMergeFileStrategy,
    pub force_full_merge: bool,
    pub continue_merge_after_reboot: bool,
    pub merge_interval_sec: u64,
    pub seq_level_num: usize,
    pub unseq_level_num: usize,
    pub seq_file_num_in_each_level: usize,
    pub unseq_file_num_in_each_level: usize,
    pub enable_unseq_compaction: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_thread_num: 4,
            merge_chunk_sub_thread_num: 4,
            merge_memory_budget: 2 * 1024 * 1024 * 1024,
            merge_file_selection_time_budget: std::time::Duration::from_secs(30),
            chunk_merge_point_threshold: Some(100_000),
            seq_merge_file_strategy: SeqMergeFileStrategy::InplaceMaxFiles,
            force_full_merge: false,
            continue_merge_after_reboot: true,
            merge_interval_sec: 60,
            seq_level_num: 3,
            unseq_level_num: 1,
            seq_file_num_in_each_level: 4,
            unseq_file_num_in_each_level: 4,
            enable_unseq_compaction: true,
        }
    }
}

impl MergeConfig {
    /// Whether a chunk of `point_count` points is "big enough" to copy
    /// verbatim rather than decode, per the `chunkMergePointThreshold`
    /// option (§4.4 cases Skip/Copy vs. Decode-only).
    pub fn chunk_big_enough(&self, point_count: u32) -> bool {
        match self.chunk_merge_point_threshold {
            Some(threshold) => point_count >= threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_threshold_treats_every_chunk_as_big_enough() {
        let mut cfg = MergeConfig::default();
        cfg.chunk_merge_point_threshold = None;
        assert!(cfg.chunk_big_enough(1));
    }

    #[test]
    fn threshold_gates_on_point_count() {
        let mut cfg = MergeConfig::default();
        cfg.chunk_merge_point_threshold = Some(100);
        assert!(!cfg.chunk_big_enough(50));
        assert!(cfg.chunk_big_enough(100));
    }
}
