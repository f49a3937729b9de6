//! Custom error types for the event writer.
//!
//! This module defines the primary error type, `EvioError`, used across the
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the failures a writer can run into:
//!
//! - **`Config`**: incompatible or out-of-range options, e.g. requesting a
//!   file split while appending, or an empty base file name. These are
//!   caught up front by [`crate::config::WriterOptions::validate`].
//! - **`Io`**: wraps `std::io::Error` for all file open/read/write/seek
//!   failures.
//! - **`Format`**: the bytes on disk do not look like a version-6 event
//!   file: bad magic word, unsupported version, inconsistent length fields,
//!   or a short read while scanning record headers in append mode.
//! - **`Capacity`**: a caller-supplied output buffer cannot hold the next
//!   record or the closing trailer.
//! - **`State`**: an operation was issued in the wrong lifecycle state, such
//!   as writing after `close()` or re-arming a buffer that is still open.
//! - **`Compression`**: a codec failed to compress or decompress a payload.
//! - **`Async`**: an error that originally occurred on a compressor or
//!   writer thread, captured on the record supply and re-raised on the next
//!   producer call.
//!
//! Note that a full disk is deliberately *not* an error: it is reported as a
//! `false` return from `EventWriter::write_event_to_file`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type EvioResult<T> = std::result::Result<T, EvioError>;

/// Errors produced while building records and writing event files.
#[derive(Error, Debug)]
pub enum EvioError {
    /// Incompatible or invalid writer options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data on disk is not a valid version-6 event file.
    #[error("Format error: {0}")]
    Format(String),

    /// A caller-supplied buffer is too small for a record or trailer.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Operation issued in the wrong lifecycle state.
    #[error("State error: {0}")]
    State(String),

    /// A compression codec failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Failure first observed on a worker thread and re-raised here.
    #[error("Worker error: {0}")]
    Async(String),
}

impl EvioError {
    /// True if this error was surfaced from a compressor or writer thread.
    pub fn is_async(&self) -> bool {
        matches!(self, EvioError::Async(_))
    }
}
