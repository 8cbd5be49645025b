//! Per-file load pipeline and the pool of reusable workers that run it.
//!
//! A [`ParseWorker`] owns the buffers a load needs (decoder state, staging
//! buffer, line batch). Workers are checked out of the [`WorkerPool`] for one
//! job, moved into the background task together with the file's parser, and
//! returned through the job's join handle.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;

use crate::decoder::{Decoder, Utf8Decoder};
use crate::error::{Error, Result};
use crate::lines::{LineBatch, SplitMode, split_lines};
use crate::parser::LineParser;
use crate::staging::HeadRemovableSequence;
use crate::state::{JobProgress, JobState, JobTimings};

/// Creates a fresh decoder for each new worker.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;

/// Returns the factory for [`Utf8Decoder`].
#[must_use]
pub fn utf8_decoder_factory() -> DecoderFactory {
    Arc::new(|| Box::new(Utf8Decoder::new()))
}

/// Reusable buffers for loading one file at a time.
pub struct ParseWorker {
    id: usize,
    decoder: Box<dyn Decoder>,
    staging: HeadRemovableSequence<u8>,
    batch: LineBatch,
}

impl std::fmt::Debug for ParseWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseWorker")
            .field("id", &self.id)
            .field("staging_len", &self.staging.len())
            .field("batch_len", &self.batch.len())
            .finish_non_exhaustive()
    }
}

impl ParseWorker {
    /// Creates a worker with the given id and decoder.
    #[must_use]
    pub fn new(id: usize, decoder: Box<dyn Decoder>) -> Self {
        Self {
            id,
            decoder,
            staging: HeadRemovableSequence::new(),
            batch: LineBatch::new(),
        }
    }

    /// Returns the worker id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    fn reset(&mut self) {
        self.decoder.reset();
        self.staging.clear();
        self.batch.clear(0);
    }

    /// Decodes `bytes` block by block and feeds the lines to `parser`.
    ///
    /// Stops early when the parser returns `false`.
    fn parse<P: LineParser>(
        &mut self,
        index: usize,
        bytes: &[u8],
        parser: &mut P,
        progress: &JobProgress,
        block_size: usize,
        mode: SplitMode,
    ) -> Result<()> {
        self.reset();
        let blocks = block_count(bytes.len(), block_size);
        let mut line_number = 0;

        for block in 0..blocks {
            let start = block * block_size;
            let end = (start + block_size).min(bytes.len());
            let last = block + 1 == blocks;

            self.decoder
                .decode(&bytes[start..end], last, &mut self.staging)?;
            split_lines(mode, &mut self.staging, &mut self.batch, last)?;
            progress.advance();

            if self.batch.is_empty() {
                continue;
            }
            let keep_going = parser
                .parse_lines(&self.batch)
                .map_err(|source| Error::Callback { index, source })?;
            line_number += self.batch.len();
            self.batch.clear(line_number);
            tracing::trace!(index, block, line_number, "block parsed");

            if !keep_going {
                tracing::debug!(index, block, blocks, "parser stopped early");
                break;
            }
        }
        Ok(())
    }
}

/// Number of decode blocks for a file of `len` bytes; at least one.
#[must_use]
pub const fn block_count(len: usize, block_size: usize) -> usize {
    if len == 0 { 1 } else { len.div_ceil(block_size) }
}

/// Everything a background load needs, moved into the job as a unit.
pub(crate) struct ParseJob<P> {
    pub(crate) index: usize,
    pub(crate) path: PathBuf,
    pub(crate) parser: P,
    pub(crate) worker: ParseWorker,
    pub(crate) progress: Arc<JobProgress>,
    pub(crate) block_size: usize,
    pub(crate) split_mode: SplitMode,
}

/// What a finished job hands back to the scheduler.
pub(crate) struct JobOutput<P> {
    pub(crate) parser: P,
    pub(crate) worker: ParseWorker,
    pub(crate) timings: JobTimings,
    pub(crate) result: Result<()>,
}

impl<P: LineParser> ParseJob<P> {
    /// Runs the whole pipeline on a blocking-pool thread.
    ///
    /// The file read is awaited through `runtime`. The job always returns its
    /// parser and worker, even when the parser panics.
    pub(crate) fn run(self, runtime: &Handle) -> JobOutput<P> {
        let Self {
            index,
            path,
            mut parser,
            mut worker,
            progress,
            block_size,
            split_mode,
        } = self;
        let mut timings = JobTimings::default();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            parser.clear();

            let started = Instant::now();
            let bytes = runtime
                .block_on(tokio::fs::read(&path))
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
            timings.read = started.elapsed();
            progress.set_length(block_count(bytes.len(), block_size));
            progress.set_state(JobState::ParseText);
            tracing::debug!(index, bytes = bytes.len(), "file read");

            let started = Instant::now();
            worker.parse(index, &bytes, &mut parser, &progress, block_size, split_mode)?;
            timings.parse = started.elapsed();

            let started = Instant::now();
            parser
                .post_read_proc()
                .map_err(|source| Error::Callback { index, source })?;
            timings.post_process = started.elapsed();
            Ok(())
        }));

        let result = outcome.unwrap_or_else(|_| {
            worker.reset();
            Err(Error::JobPanicked { index })
        });
        if let Err(e) = &result {
            tracing::warn!(index, error = %e, "load job failed");
        }
        progress.set_state(JobState::WaitForCallingComplete);

        JobOutput {
            parser,
            worker,
            timings,
            result,
        }
    }
}

/// Pool of idle workers with recycled ids.
///
/// Ids come from a free list, so a released id is reused before a new one
/// is minted.
pub(crate) struct WorkerPool {
    idle: Vec<ParseWorker>,
    busy: usize,
    free_ids: Vec<usize>,
    next_id: usize,
    decoder_factory: DecoderFactory,
}

impl WorkerPool {
    pub(crate) fn new(decoder_factory: DecoderFactory) -> Self {
        Self {
            idle: Vec::new(),
            busy: 0,
            free_ids: Vec::new(),
            next_id: 0,
            decoder_factory,
        }
    }

    /// Number of workers in existence, idle or checked out.
    pub(crate) fn size(&self) -> usize {
        self.idle.len() + self.busy
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Creates workers until the pool holds `target` of them.
    pub(crate) fn grow_to(&mut self, target: usize) {
        while self.size() < target {
            let id = self.free_ids.pop().unwrap_or_else(|| {
                self.next_id += 1;
                self.next_id - 1
            });
            self.idle.push(ParseWorker::new(id, (self.decoder_factory)()));
            tracing::debug!(id, size = self.size(), "worker created");
        }
    }

    pub(crate) fn acquire(&mut self) -> Option<ParseWorker> {
        let worker = self.idle.pop()?;
        self.busy += 1;
        Some(worker)
    }

    /// Returns a worker, dropping it if the pool holds more than `limit`.
    pub(crate) fn release(&mut self, worker: ParseWorker, limit: usize) {
        self.busy -= 1;
        if self.size() >= limit {
            tracing::debug!(id = worker.id, limit, "worker retired");
            self.free_ids.push(worker.id);
        } else {
            self.idle.push(worker);
        }
    }

    /// Accounts for a checked-out worker that will never come back.
    pub(crate) fn forget(&mut self, id: usize) {
        self.busy -= 1;
        self.free_ids.push(id);
    }

    /// Drops idle workers beyond `limit`.
    pub(crate) fn trim(&mut self, limit: usize) {
        while self.size() > limit {
            let Some(worker) = self.idle.pop() else {
                break;
            };
            self.free_ids.push(worker.id);
        }
    }
}
