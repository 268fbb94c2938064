//! Unified crate-level error types.
//!
//! This module provides a single [`LoaderError`] type used across the crate and a
//! convenient [`LoaderResult`] alias.
//!
//! The same error value may have to reach several places at once (every pending read and the
//! observer see the terminal failure), so the type is `Clone` and keeps I/O errors behind an
//! `Arc` instead of owning them.

use std::io;
use std::sync::Arc;

/// Result type used by this crate.
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Unified error type for the `caching-loader` crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoaderError {
    /// The requested bytes have not been downloaded yet.
    ///
    /// Internal to request registration; never reported to the observer.
    #[error("range {offset}+{length} unavailable ({available} bytes buffered)")]
    RangeUnavailable {
        offset: u64,
        length: u64,
        available: u64,
    },

    /// Resource metadata was set twice with different values.
    #[error("metadata conflict: {0}")]
    MetadataConflict(String),

    /// A download session was started while another one is still active.
    #[error("download session already active from offset {from_offset}")]
    AlreadyActive { from_offset: u64 },

    /// HTTP request failed with a non-success status.
    #[error("HTTP error: {status} for {url}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// The server rejected the requested byte range.
    #[error("range not satisfiable for {0}")]
    RangeNotSatisfiable(String),

    /// Connecting or waiting for the next chunk timed out.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// Connection-level failure (refused, reset, body read error, early EOF).
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The request was cancelled before it could be fulfilled.
    #[error("operation cancelled")]
    Cancelled,

    /// The coordinator task is gone.
    #[error("loader closed")]
    Closed,

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),
}

impl LoaderError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        LoaderError::Message(msg.into())
    }

    /// Whether an automatic restart of the download may fix this error.
    ///
    /// Network hiccups are transient; protocol-level answers from the server and
    /// programming errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LoaderError::Timeout(_) | LoaderError::Connection(_) => true,
            LoaderError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for LoaderError {
    fn from(err: io::Error) -> Self {
        LoaderError::Io(Arc::new(err))
    }
}
