//! Per-file job state.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

/// Progress of the load pipeline for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum JobState {
    /// Registered, never loaded.
    #[default]
    Idle = 0,
    /// Reading the file bytes.
    ReadAsync = 1,
    /// Decoding blocks and feeding the parser.
    ParseText = 2,
    /// Finished in the background, waiting to be joined.
    WaitForCallingComplete = 3,
    /// Joined; parsed data is available.
    Completed = 4,
    /// Parsed data has been released.
    UnLoaded = 5,
}

impl JobState {
    /// Returns `true` if parsed data may be read in this state.
    #[inline]
    #[must_use]
    pub const fn is_standby(self) -> bool {
        matches!(self, Self::Completed | Self::UnLoaded)
    }

    /// Returns `true` while a background job owns the file.
    #[inline]
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::ReadAsync | Self::ParseText | Self::WaitForCallingComplete
        )
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ReadAsync,
            2 => Self::ParseText,
            3 => Self::WaitForCallingComplete,
            4 => Self::Completed,
            5 => Self::UnLoaded,
            _ => Self::Idle,
        }
    }
}

/// Elapsed time of each pipeline phase in the latest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobTimings {
    /// Time spent reading the file.
    pub read: Duration,
    /// Time spent decoding, splitting and calling the parser.
    pub parse: Duration,
    /// Time spent in the post-process hook.
    pub post_process: Duration,
}

/// Snapshot of one file's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadState {
    /// Current pipeline state.
    pub job_state: JobState,
    /// Planned number of decode blocks.
    pub length: usize,
    /// Blocks processed so far.
    pub read: usize,
    /// Outstanding load requests.
    pub ref_count: usize,
    /// Phase timings of the latest run.
    pub timings: JobTimings,
}

impl ReadState {
    /// Returns the processed fraction of planned blocks, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.length == 0 {
            0.0
        } else {
            (self.read as f64 / self.length as f64).min(1.0)
        }
    }
}

/// Progress counters shared between the scheduler and the job of one file.
///
/// Only the job writes while it is in flight; only the scheduler writes
/// otherwise.
#[derive(Debug, Default)]
pub(crate) struct JobProgress {
    state: AtomicU8,
    length: AtomicUsize,
    read: AtomicUsize,
}

impl JobProgress {
    pub(crate) fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn length(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    pub(crate) fn read(&self) -> usize {
        self.read.load(Ordering::Acquire)
    }

    /// Starts a new run with an unknown block count.
    pub(crate) fn begin(&self) {
        self.length.store(0, Ordering::Release);
        self.read.store(0, Ordering::Release);
        self.set_state(JobState::ReadAsync);
    }

    pub(crate) fn set_length(&self, blocks: usize) {
        self.length.store(blocks, Ordering::Release);
    }

    pub(crate) fn advance(&self) {
        self.read.fetch_add(1, Ordering::AcqRel);
    }
}
