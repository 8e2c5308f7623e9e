//! Error types for throttle-dl
//!
//! The taxonomy distinguishes recoverable conditions (transport hiccups
//! during a probe, transient disk failures) from conditions that terminate a
//! record (exhausted retries, integrity failures) and conditions that
//! terminate a role (listener bind failures).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for throttle-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for throttle-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Bad parameters, unsupported scheme, unwritable sink — surfaced to the caller
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or mismatched IPC bearer token
    #[error("authentication failed")]
    Auth,

    /// Network or protocol failure during probe or fetch
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Disk write or finalization failure
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    /// Post-download scanner hook reported a threat
    #[error("integrity check failed for {path}: {reason}")]
    Integrity {
        /// The artifact that failed the check
        path: PathBuf,
        /// Scanner-reported reason
        reason: String,
    },

    /// An operation exceeded its deadline
    #[error("timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    /// A listener could not bind, or another unrecoverable resource failure.
    /// Fatal for the role; the supervisor respawns it after its backoff.
    #[error("resource error: {0}")]
    Resource(String),

    /// Download or record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Transport-layer errors (probe, open, range fetch)
#[derive(Debug, Error)]
pub enum TransportError {
    /// No adapter registered for the URI scheme
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The adapter does not support byte-range requests
    #[error("range requests not supported by {scheme} transport")]
    RangeNotSupported {
        /// Scheme of the adapter that was asked for a range
        scheme: String,
    },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP response carried a non-success status
    #[error("HTTP status {status} from {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// FTP protocol or connection failure
    #[error("FTP error: {0}")]
    Ftp(String),

    /// A range worker produced no bytes after its fallback attempt
    #[error("range {index} ({lo}..={hi}) yielded no data")]
    EmptyRange {
        /// Range index in the partition
        index: usize,
        /// First byte offset
        lo: u64,
        /// Last byte offset
        hi: u64,
    },

    /// Malformed URI
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// Stream ended before the expected byte count
    #[error("truncated stream: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the probe promised
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },
}

/// Disk-writer errors
#[derive(Debug, Error)]
pub enum DiskError {
    /// The sink lacks write capability or a chunk bound is out of range
    #[error("invalid sink: {0}")]
    InvalidSink(String),

    /// The writer was disposed before the call
    #[error("disk writer is closed")]
    Closed,

    /// Underlying write failed after all retries
    #[error("write failed for {path} after {attempts} attempts: {source}")]
    WriteFailed {
        /// Destination path
        path: PathBuf,
        /// Number of attempts made
        attempts: u32,
        /// Last I/O error observed
        source: std::io::Error,
    },

    /// Atomic rename into place failed
    #[error("failed to finalize {path}: {source}")]
    FinalizeFailed {
        /// Destination path
        path: PathBuf,
        /// Rename error
        source: std::io::Error,
    },
}

impl Error {
    /// Short machine-readable code used in structured IPC error replies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::Auth => "auth_error",
            Error::Transport(_) => "transport_error",
            Error::Disk(_) => "disk_error",
            Error::Integrity { .. } => "integrity_error",
            Error::Timeout(..) => "timeout",
            Error::Resource(_) => "resource_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "error",
        }
    }
}
