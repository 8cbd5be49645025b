//! Deferred, batched release of parsed data.
//!
//! Unloads are collected into a batch and released on the blocking pool,
//! never on the scheduling thread. Parsers travel into the batch by value
//! and come back when the batch is joined.

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::parser::LineParser;

/// One file waiting to be released.
pub(crate) struct UnloadEntry<P> {
    pub(crate) index: usize,
    pub(crate) parser: P,
}

/// Collects unload targets and releases them in the background.
pub(crate) struct UnloadWorker<P> {
    pending: Vec<UnloadEntry<P>>,
    running: Option<JoinHandle<Vec<(usize, P)>>>,
    running_indices: Vec<usize>,
}

impl<P: LineParser> UnloadWorker<P> {
    pub(crate) const fn new() -> Self {
        Self {
            pending: Vec::new(),
            running: None,
            running_indices: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: UnloadEntry<P>) {
        self.pending.push(entry);
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Returns `true` if a batch is running and has finished.
    pub(crate) fn is_finished(&self) -> bool {
        self.running.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Starts releasing the pending entries, unless a batch is already out.
    pub(crate) fn launch(&mut self, runtime: &Handle) {
        if self.running.is_some() || self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        self.running_indices = batch.iter().map(|entry| entry.index).collect();
        tracing::debug!(count = batch.len(), "unload batch launched");
        self.running = Some(runtime.spawn_blocking(move || {
            batch
                .into_iter()
                .map(|mut entry| {
                    entry.parser.unload();
                    (entry.index, entry.parser)
                })
                .collect()
        }));
    }

    /// Waits for the running batch and returns the released parsers.
    ///
    /// The caller marks the files unloaded once their parsers are back. A
    /// panic inside an unload hook is resumed on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnloadCancelled`] with the batch's file indices if
    /// the runtime dropped the batch. Those parsers are gone.
    pub(crate) fn complete(&mut self, runtime: &Handle) -> Result<Vec<(usize, P)>> {
        let Some(handle) = self.running.take() else {
            return Ok(Vec::new());
        };
        let indices = std::mem::take(&mut self.running_indices);
        match runtime.block_on(handle) {
            Ok(released) => {
                tracing::debug!(count = released.len(), "unload batch joined");
                Ok(released)
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {
                tracing::warn!(?indices, "unload batch cancelled");
                Err(Error::UnloadCancelled { indices })
            }
        }
    }
}
