//! Error types for the loader.
//!
//! Errors fall into three families:
//! - argument errors, raised by the call that received the bad input;
//! - state errors, raised when calls arrive in an order the loader cannot honor;
//! - in-job errors, captured inside a background job and surfaced when the
//!   scheduler joins that job.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::JobState;

/// Boxed error returned by user parser callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for loader operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An element or file index was outside the valid range.
    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// The rejected index.
        index: usize,
        /// Number of valid entries.
        len: usize,
    },

    /// A file path did not name an existing regular file.
    #[error("file not found: {path}")]
    FileNotFound {
        /// The rejected path.
        path: PathBuf,
    },

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parsed data was requested while the file was not in standby.
    #[error("file {index} is not in standby (state {state:?})")]
    NotStandby {
        /// The file index.
        index: usize,
        /// The state the file was in.
        state: JobState,
    },

    /// A view outlived the buffer address it was issued for.
    #[error("stale view: issued at generation {captured}, store is at {current}")]
    StaleView {
        /// Generation captured when the view was issued.
        captured: u64,
        /// Current generation of the store.
        current: u64,
    },

    /// A view was resolved against a store that did not issue it.
    #[error("view was issued by a different store")]
    ForeignView,

    /// More unloads than loads were requested for a file.
    #[error("ref count underflow for file {index}")]
    RefCountUnderflow {
        /// The file index.
        index: usize,
    },

    /// An operation required every file to be in standby.
    #[error("operation requires all files in standby")]
    NotAllStandby,

    /// An operation conflicts with a job that is still running for the file.
    #[error("file {index} has a job in flight")]
    JobInFlight {
        /// The file index.
        index: usize,
    },

    /// Reading a file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file being read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The byte stream was not valid in the configured encoding.
    #[error("invalid encoded data at byte offset {offset}")]
    Decode {
        /// Absolute byte offset of the first invalid byte.
        offset: usize,
    },

    /// A user parser callback failed.
    #[error("parser callback failed for file {index}: {source}")]
    Callback {
        /// The file index.
        index: usize,
        /// The error returned by the callback.
        #[source]
        source: BoxError,
    },

    /// A background job panicked.
    #[error("job for file {index} panicked")]
    JobPanicked {
        /// The file index.
        index: usize,
    },

    /// A background load was dropped before it could run.
    #[error("job for file {index} was cancelled")]
    JobCancelled {
        /// The file index.
        index: usize,
    },

    /// A background unload batch was dropped before it could run.
    #[error("unload batch for files {indices:?} was cancelled")]
    UnloadCancelled {
        /// Files whose parsers were lost with the batch.
        indices: Vec<usize>,
    },

    /// The async runtime could not be created.
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl Error {
    /// Returns `true` for errors raised inside a background job.
    #[must_use]
    pub const fn is_job_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Decode { .. }
                | Self::Callback { .. }
                | Self::JobPanicked { .. }
                | Self::JobCancelled { .. }
        )
    }
}
