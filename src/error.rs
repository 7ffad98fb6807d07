//! The error taxonomy from the fleet's error handling design: each kind
//! carries the context a caller needs to decide whether to retry, promote
//! to a fatal worker failure, or just log and move on.

use thiserror::Error;

/// The generic result type for this crate.
pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    /// A copy operation (send or fetch) exited non-zero. Retried in place
    /// up to three times by the owning stage before being promoted.
    #[error("copy failed ({exit_code:?}) transferring {source} -> {destination}")]
    TransientCopyFailure {
        source: String,
        destination: String,
        exit_code: Option<i32>,
    },

    /// The remote transcoder exited non-zero. Never retried: a bad segment
    /// will keep failing the same way.
    #[error("transcode of {item} failed on {host} (exit code {exit_code:?})")]
    FatalTranscodeFailure {
        host: String,
        item: String,
        exit_code: Option<i32>,
    },

    /// Any unrecoverable stage failure. Breaks the owning Worker.
    #[error("worker for {host} broke: {reason}")]
    FatalWorkerFailure { host: String, reason: String },

    /// The batched remote delete failed. Logged, never propagated further.
    #[error("cleanup failed on {host}: {reason}")]
    CleanupFailure { host: String, reason: String },

    /// Detected at Worker start-up: missing local binary, unreachable host,
    /// or an otherwise unusable configuration.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A re-queued Segment (§4.3 fatal stage failure policy) was never
    /// picked back up before every Worker finished or broke, so the
    /// concatenated output would be missing part of the input.
    #[error("{} of the discovered segments were never produced: {missing:?}", missing.len())]
    IncompleteOutput { missing: Vec<String> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether this error kind is subject to in-place retry before being
    /// promoted to a [`FleetError::FatalWorkerFailure`].
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::TransientCopyFailure { .. })
    }
}
