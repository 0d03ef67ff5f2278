//! # HYPERDESK Transfer
//!
//! File transfer engine: chunked local copy with resume, integrity
//! checksums, bandwidth pacing, and retry; plus the framed TCP channel used
//! for bulk bytes between paired devices.
//!
//! Everything here is blocking I/O, run on worker threads by the daemon.
//! The pacing and retry math is factored into [`limiter`] as pure functions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod engine;
pub mod limiter;

use thiserror::Error;

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Disk or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the bulk stream before delivering all bytes
    #[error("stream truncated: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes the header promised
        expected: u64,
        /// Bytes actually delivered
        received: u64,
    },

    /// The framed header carried a bad filename
    #[error("invalid filename in stream header")]
    InvalidFilename,

    /// The sender was used before `open()`
    #[error("sender is not open")]
    NotOpen,
}

/// Result of a completed copy or send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Total bytes at the destination (including any resumed prefix)
    pub bytes_copied: u64,
    /// Lowercase hex SHA-256
    pub checksum: String,
}

/// Progress callback: `(bytes_copied, total_size)`.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;
