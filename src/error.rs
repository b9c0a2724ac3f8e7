//! Error types for the compaction/merge engine.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the merge engine.
///
/// Variants map onto the error-kind taxonomy of the design: transient I/O,
/// corrupt input, corrupt journal, budget exhaustion, cancellation and
/// inconsistent (fatal) state. See `Error::is_fatal` for the
/// operator-intervention boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Transient I/O error during read, write or commit. The caller retries
    /// on the next compaction cycle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk or sidecar failed its checksum or is otherwise malformed.
    /// Handled by skipping the chunk and logging a warning; never fatal.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    /// The merge journal itself is truncated or has a bad CRC past the
    /// point recovery expects. Handled only at startup.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    /// Selection could not fit even a single segment within the configured
    /// memory or time budget. Callers treat an empty selection as "nothing
    /// to do" rather than surfacing this as a task failure.
    #[error("selection budget exhausted: {0}")]
    BudgetExhausted(String),

    /// The task observed a cancellation signal and unwound cleanly.
    #[error("merge task cancelled")]
    Cancelled,

    /// Recovery observed a commit marker referencing a file that is no
    /// longer on disk. Requires operator intervention; never auto-retried.
    #[error("inconsistent on-disk state: {0}")]
    Inconsistent(String),

    /// Segment, sidecar or journal serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Bad or missing configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic storage error not covered by a more specific variant.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether this error requires operator intervention rather than a
    /// routine retry on the next compaction cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Inconsistent(_))
    }

    /// Whether this error should be logged and suppressed rather than
    /// propagated (corrupt input chunks are skipped, not fatal).
    pub fn is_corrupt_input(&self) -> bool {
        matches!(self, Error::CorruptInput(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
