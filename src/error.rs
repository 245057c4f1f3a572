/*!
 * Error Types
 *
 * Failure taxonomy for the quasi-fork worker subsystem. Startup failures
 * keep a worker from ever running its operation; operation failures are
 * the worker's terminal status. Nothing here is retried inside a worker —
 * retry is a parent-side policy.
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration parsing or validation error
///
/// Carries the file and line where parsing stopped so the parent can log
/// the same diagnostic it would have produced during its own startup.
#[derive(Error, Debug)]
#[error("config error in {file} line {line}: {reason}")]
pub struct ConfigError {
    /// File being parsed when the error occurred
    pub file: PathBuf,
    /// 1-based line number of the offending directive
    pub line: usize,
    /// Human-readable description of the problem
    pub reason: String,
}

/// Fatal conditions during worker startup
///
/// A worker that hits any of these never reaches its operation: it must
/// not run with a torn state image or a half-initialized registry.
#[derive(Error, Debug)]
pub enum StartupError {
    /// Hand-off blob does not match the expected state image size
    #[error("state image size mismatch: expected {expected} bytes, got {actual}")]
    BlobSizeMismatch {
        expected: usize,
        actual: usize,
    },

    /// Hand-off blob is not a state image at all
    #[error("state image has bad magic")]
    BadMagic,

    /// Blob framed correctly but a field inside it is unusable
    #[error("state image is malformed: {0}")]
    MalformedImage(&'static str),

    /// Configuration re-read failed while rebuilding extensions
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An extension the loader considers mandatory failed to load
    #[error("extension load failed: {0}")]
    Extension(String),
}

/// Terminal status of a worker operation
///
/// Exactly one of these (or a clean exit) is surfaced to the launcher as
/// the worker's exit status.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Full snapshot save did not complete
    #[error("snapshot save failed: {0}")]
    SaveFailed(#[source] io::Error),

    /// Append-log rewrite did not complete
    #[error("log rewrite failed: {0}")]
    RewriteFailed(#[source] io::Error),

    /// Replica transfer failed, or its outcome could not be reported
    #[error("replica transfer failed: {0}")]
    TransferFailed(String),

    /// Operation attempted out of phase (before state install, or twice)
    #[error("worker not ready: {0}")]
    NotReady(&'static str),
}

impl WorkerError {
    /// Exit code reported to the launcher; 0 is reserved for success
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::SaveFailed(_) => 1,
            WorkerError::RewriteFailed(_) => 2,
            WorkerError::TransferFailed(_) => 3,
            WorkerError::NotReady(_) => 4,
        }
    }
}

/// Replica report encode/transmit failures
///
/// Folded into `WorkerError::TransferFailed` by the dispatcher: an
/// unreported transfer outcome is indistinguishable from a failed one.
#[derive(Error, Debug)]
pub enum ReportError {
    /// A report must carry at least one replica entry
    #[error("empty replica report")]
    Empty,

    /// Replica id list and status list disagree in length
    #[error("replica id/status length mismatch: {ids} ids, {statuses} statuses")]
    LengthMismatch { ids: usize, statuses: usize },

    /// Encoded message was not accepted in a single write
    #[error("short report write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Byte stream is not a well-formed report
    #[error("malformed replica report: {0}")]
    Malformed(String),

    /// Underlying channel I/O error
    #[error("report channel: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for worker operations
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let errs = [
            WorkerError::SaveFailed(io::Error::other("x")),
            WorkerError::RewriteFailed(io::Error::other("x")),
            WorkerError::TransferFailed("x".into()),
            WorkerError::NotReady("x"),
        ];
        let mut codes: Vec<i32> = errs.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn config_error_mentions_location() {
        let e = ConfigError {
            file: PathBuf::from("redis.conf"),
            line: 7,
            reason: "unbalanced quotes".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("redis.conf"));
        assert!(msg.contains("line 7"));
    }
}
