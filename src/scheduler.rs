//! Ref-counted load/unload scheduler.
//!
//! This module provides [`LoadScheduler`] and [`LoadSchedulerBuilder`]. The
//! scheduler keeps each file's desired state (its ref count) apart from the
//! progress of its background job, and bounds the number of jobs in flight.
//!
//! All scheduling state lives in the scheduler and is only touched from the
//! thread that calls [`update`](LoadScheduler::update) and the `complete*`
//! methods. Parsers and workers are moved into jobs and handed back when the
//! jobs are joined, so no locks guard any of it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::lines::SplitMode;
use crate::parser::LineParser;
use crate::state::{JobProgress, JobState, JobTimings, ReadState};
use crate::unload::{UnloadEntry, UnloadWorker};
use crate::worker::{
    DecoderFactory, JobOutput, ParseJob, ParseWorker, WorkerPool, utf8_decoder_factory,
};

/// Default decode block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest accepted decode block size in bytes.
pub const MIN_BLOCK_SIZE: usize = 256;

/// Loader settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Decode block size in bytes, clamped to [`MIN_BLOCK_SIZE`].
    pub block_size: usize,
    /// Maximum number of load jobs in flight.
    pub max_job_count: usize,
    /// Line splitting implementation.
    pub split_mode: SplitMode,
    /// Worker threads for an owned runtime; `None` uses the tokio default.
    pub worker_threads: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_job_count: default_max_job_count(),
            split_mode: SplitMode::default(),
            worker_threads: None,
        }
    }
}

impl LoaderConfig {
    /// Creates configuration from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `LINELOADER_BLOCK_SIZE`: decode block size in bytes
    /// - `LINELOADER_MAX_JOBS`: maximum load jobs in flight
    /// - `LINELOADER_SPLIT_MODE`: `accelerated` or `scalar`
    /// - `LINELOADER_WORKER_THREADS`: runtime worker threads
    ///
    /// Missing or unparsable values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |name: &str| std::env::var(name).ok();

        Self {
            block_size: read("LINELOADER_BLOCK_SIZE")
                .and_then(|s| s.parse::<usize>().ok())
                .map_or(defaults.block_size, clamp_block_size),
            max_job_count: read("LINELOADER_MAX_JOBS")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_job_count),
            split_mode: read("LINELOADER_SPLIT_MODE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.split_mode),
            worker_threads: read("LINELOADER_WORKER_THREADS")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&n| n > 0),
        }
    }
}

fn default_max_job_count() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

fn clamp_block_size(size: usize) -> usize {
    size.max(MIN_BLOCK_SIZE)
}

/// Builder for creating a [`LoadScheduler`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use lineloader::{LineCollector, LoadScheduler, LoadSchedulerBuilder};
///
/// # fn main() -> lineloader::Result<()> {
/// let scheduler: LoadScheduler<LineCollector> = LoadSchedulerBuilder::new()
///     .block_size(64 * 1024)
///     .max_job_count(4)
///     .build()?;
/// assert_eq!(scheduler.max_job_count(), 4);
/// # Ok(())
/// # }
/// ```
pub struct LoadSchedulerBuilder {
    config: LoaderConfig,
    runtime: Option<Handle>,
    decoder_factory: DecoderFactory,
}

impl Default for LoadSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSchedulerBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
            runtime: None,
            decoder_factory: utf8_decoder_factory(),
        }
    }

    /// Replaces all settings at once.
    #[must_use]
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the decode block size. Values below [`MIN_BLOCK_SIZE`] are raised.
    #[must_use]
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = clamp_block_size(block_size);
        self
    }

    /// Sets the maximum number of load jobs in flight.
    #[must_use]
    pub const fn max_job_count(mut self, max_job_count: usize) -> Self {
        self.config.max_job_count = max_job_count;
        self
    }

    /// Selects the line splitting implementation.
    #[must_use]
    pub const fn split_mode(mut self, split_mode: SplitMode) -> Self {
        self.config.split_mode = split_mode;
        self
    }

    /// Sets the worker thread count of the owned runtime.
    #[must_use]
    pub const fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = Some(threads);
        self
    }

    /// Runs jobs on an existing runtime instead of an owned one.
    ///
    /// The scheduler must still be driven from outside that runtime's
    /// worker threads, since joining a job blocks.
    #[must_use]
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Sets the decoder used by new workers.
    #[must_use]
    pub fn decoder_factory(mut self, factory: DecoderFactory) -> Self {
        self.decoder_factory = factory;
        self
    }

    /// Builds the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_job_count` is zero and
    /// [`Error::Runtime`] if the owned runtime cannot start.
    pub fn build<P: LineParser>(self) -> Result<LoadScheduler<P>> {
        if self.config.max_job_count == 0 {
            return Err(Error::InvalidConfig("max_job_count must be > 0".into()));
        }
        if self.config.worker_threads == Some(0) {
            return Err(Error::InvalidConfig("worker_threads must be > 0".into()));
        }
        let runtime = match self.runtime {
            Some(handle) => RuntimeHost::Shared(handle),
            None => {
                let mut builder = Builder::new_multi_thread();
                if let Some(threads) = self.config.worker_threads {
                    builder.worker_threads(threads);
                }
                let runtime = builder
                    .thread_name("lineloader")
                    .enable_all()
                    .build()
                    .map_err(Error::Runtime)?;
                RuntimeHost::Owned(runtime)
            }
        };

        Ok(LoadScheduler {
            files: Vec::new(),
            requests: VecDeque::new(),
            load_targets: VecDeque::new(),
            unload_targets: Vec::new(),
            running: Vec::new(),
            pool: WorkerPool::new(self.decoder_factory),
            unloader: UnloadWorker::new(),
            block_size: clamp_block_size(self.config.block_size),
            max_job_count: self.config.max_job_count,
            split_mode: self.config.split_mode,
            flush: false,
            runtime,
        })
    }
}

enum RuntimeHost {
    Owned(Runtime),
    Shared(Handle),
}

impl RuntimeHost {
    fn handle(&self) -> &Handle {
        match self {
            Self::Owned(runtime) => runtime.handle(),
            Self::Shared(handle) => handle,
        }
    }
}

/// What a queued [`Request`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestAction {
    /// Add one reference; the first reference loads the file.
    Store,
    /// Drop one reference; the last one unloads the file.
    Unload,
}

/// A load or unload request waiting for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    /// The file index.
    pub file_index: usize,
    /// The requested action.
    pub action: RequestAction,
}

/// A load job in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunningJobInfo {
    /// The file being loaded.
    pub file_index: usize,
    /// The worker running the job.
    pub worker_id: usize,
}

struct RunningJob<P> {
    info: RunningJobInfo,
    handle: JoinHandle<JobOutput<P>>,
}

impl<P> RunningJob<P> {
    /// A job either returned after `WaitForCallingComplete` or was cancelled.
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct FileSlot<P> {
    path: PathBuf,
    /// `None` while a job or an unload batch owns the parser.
    parser: Option<P>,
    progress: Arc<JobProgress>,
    ref_count: usize,
    queued: bool,
    lost: bool,
    timings: JobTimings,
}

/// Loads many text files in the background with a bounded number of jobs.
///
/// Files are registered once with [`add_file`](Self::add_file) and then
/// reference counted with [`load_file`](Self::load_file) and
/// [`unload_file`](Self::unload_file). Requests take effect on the next
/// [`update`](Self::update) tick.
///
/// # Example
///
/// ```rust,no_run
/// use lineloader::{LineCollector, LoadScheduler, LoadSchedulerBuilder};
///
/// # fn main() -> lineloader::Result<()> {
/// let mut scheduler: LoadScheduler<LineCollector> = LoadSchedulerBuilder::new().build()?;
/// let index = scheduler.add_file("data/items.csv")?;
///
/// scheduler.load_file(index)?;
/// scheduler.update()?;
/// scheduler.complete()?;
///
/// let lines = scheduler.parser(index)?.lines();
/// println!("{} lines", lines.len());
/// # Ok(())
/// # }
/// ```
pub struct LoadScheduler<P: LineParser> {
    files: Vec<FileSlot<P>>,
    requests: VecDeque<Request>,
    load_targets: VecDeque<usize>,
    unload_targets: Vec<usize>,
    running: Vec<RunningJob<P>>,
    pool: WorkerPool,
    unloader: UnloadWorker<P>,
    block_size: usize,
    max_job_count: usize,
    split_mode: SplitMode,
    flush: bool,
    runtime: RuntimeHost,
}

impl<P: LineParser> LoadScheduler<P> {
    /// Creates a scheduler with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if the runtime cannot start.
    pub fn new() -> Result<Self> {
        LoadSchedulerBuilder::new().build()
    }

    /// Registers a file with a default parser and returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if `path` is not an existing file.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<usize>
    where
        P: Default,
    {
        self.add_file_with(path, P::default())
    }

    /// Registers a file with the given parser and returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if `path` is not an existing file.
    pub fn add_file_with(&mut self, path: impl AsRef<Path>, mut parser: P) -> Result<usize> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        parser.init();
        self.files.push(FileSlot {
            path: path.to_path_buf(),
            parser: Some(parser),
            progress: Arc::new(JobProgress::default()),
            ref_count: 0,
            queued: false,
            lost: false,
            timings: JobTimings::default(),
        });
        Ok(self.files.len() - 1)
    }

    /// Requests one more reference to file `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index and
    /// [`Error::JobCancelled`] if the file's parser was lost with a cancelled
    /// job.
    pub fn load_file(&mut self, index: usize) -> Result<()> {
        if self.slot(index)?.lost {
            return Err(Error::JobCancelled { index });
        }
        self.requests.push_back(Request {
            file_index: index,
            action: RequestAction::Store,
        });
        Ok(())
    }

    /// Drops one reference to file `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index and
    /// [`Error::RefCountUnderflow`] if this would release more references
    /// than were requested. Nothing is queued on error.
    pub fn unload_file(&mut self, index: usize) -> Result<()> {
        let current = self.slot(index)?.ref_count;
        let (stores, unloads) = self
            .requests
            .iter()
            .filter(|r| r.file_index == index)
            .fold((0, 0), |(s, u), r| match r.action {
                RequestAction::Store => (s + 1, u),
                RequestAction::Unload => (s, u + 1),
            });
        if current + stores <= unloads {
            return Err(Error::RefCountUnderflow { index });
        }
        self.requests.push_back(Request {
            file_index: index,
            action: RequestAction::Unload,
        });
        Ok(())
    }

    /// Returns a snapshot of file `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn get_state(&self, index: usize) -> Result<ReadState> {
        let slot = self.slot(index)?;
        Ok(ReadState {
            job_state: slot.progress.state(),
            length: slot.progress.length(),
            read: slot.progress.read(),
            ref_count: slot.ref_count,
            timings: slot.timings,
        })
    }

    /// Returns the parser of file `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStandby`] unless the file is completed or unloaded,
    /// and [`Error::JobInFlight`] while an unload batch holds the parser.
    pub fn parser(&self, index: usize) -> Result<&P> {
        let slot = self.slot(index)?;
        Self::standby_parser(index, slot)?;
        slot.parser.as_ref().ok_or(Error::JobInFlight { index })
    }

    /// Returns the parser of file `index` mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStandby`] unless the file is completed or unloaded,
    /// and [`Error::JobInFlight`] while an unload batch holds the parser.
    pub fn parser_mut(&mut self, index: usize) -> Result<&mut P> {
        let len = self.files.len();
        let slot = self
            .files
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, len })?;
        Self::standby_parser(index, slot)?;
        slot.parser.as_mut().ok_or(Error::JobInFlight { index })
    }

    fn standby_parser(index: usize, slot: &FileSlot<P>) -> Result<()> {
        let state = slot.progress.state();
        if state.is_standby() {
            Ok(())
        } else {
            Err(Error::NotStandby { index, state })
        }
    }

    /// Runs one scheduling tick. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns the first error of any job reaped during this tick. The tick
    /// still completes its bookkeeping for every other file.
    pub fn update(&mut self) -> Result<()> {
        let flush = std::mem::take(&mut self.flush);
        let mut first_error = None;

        // 1. Reap finished jobs.
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.running)
            .into_iter()
            .partition(RunningJob::is_finished);
        self.running = running;
        for job in finished {
            if let Err(e) = self.finish_job(job) {
                first_error.get_or_insert(e);
            }
        }
        if self.unloader.is_finished() {
            if let Err(e) = self.drain_unloads() {
                first_error.get_or_insert(e);
            }
        }

        // 2. Back off when there is nothing this tick can do.
        let limit = if flush {
            usize::MAX
        } else {
            self.max_job_count
        };
        let no_new_work = self.requests.is_empty()
            && self.unload_targets.is_empty()
            && self.unloader.pending_count() == 0;
        if no_new_work && (self.load_targets.is_empty() || self.running.len() >= limit) {
            return first_error.map_or(Ok(()), Err);
        }

        // 3. Requests become ref count deltas.
        for request in std::mem::take(&mut self.requests) {
            self.apply_request(request);
        }

        // 4. Resolve files whose last reference is gone.
        for index in std::mem::take(&mut self.unload_targets) {
            self.resolve_unload(index);
        }
        self.unloader.launch(self.runtime.handle());

        // 5. Grow the pool toward the pending work.
        let wanted = (self.running.len() + self.load_targets.len()).min(limit);
        self.pool.grow_to(wanted);

        // 6. Launch jobs in FIFO order.
        let mut deferred = Vec::new();
        while self.running.len() < limit {
            let Some(index) = self.load_targets.pop_front() else {
                break;
            };
            if self.files[index].parser.is_none() {
                // Still inside an unload batch; retry next tick.
                deferred.push(index);
                continue;
            }
            let Some(worker) = self.pool.acquire() else {
                self.load_targets.push_front(index);
                break;
            };
            self.launch(index, worker);
        }
        for index in deferred.into_iter().rev() {
            self.load_targets.push_front(index);
        }

        first_error.map_or(Ok(()), Err)
    }

    fn apply_request(&mut self, request: Request) {
        let index = request.file_index;
        let slot = &mut self.files[index];
        match request.action {
            RequestAction::Store => {
                if slot.lost {
                    return;
                }
                slot.ref_count += 1;
                if slot.ref_count > 1 || slot.queued {
                    return;
                }
                let state = slot.progress.state();
                let loaded = state == JobState::Completed && slot.parser.is_some();
                if !state.is_in_flight() && !loaded {
                    slot.queued = true;
                    self.load_targets.push_back(index);
                }
            }
            RequestAction::Unload => {
                // Underflow is rejected in `unload_file`.
                slot.ref_count = slot.ref_count.saturating_sub(1);
                if slot.ref_count == 0 {
                    self.unload_targets.push(index);
                }
            }
        }
    }

    fn resolve_unload(&mut self, index: usize) {
        let slot = &mut self.files[index];
        if slot.ref_count > 0 {
            return;
        }
        if slot.queued {
            slot.queued = false;
            self.load_targets.retain(|&i| i != index);
            tracing::debug!(index, "queued load cancelled");
            return;
        }
        let state = slot.progress.state();
        if state.is_in_flight() {
            self.unload_targets.push(index);
            return;
        }
        if state != JobState::Completed {
            return;
        }
        if let Some(parser) = slot.parser.take() {
            self.unloader.push(UnloadEntry { index, parser });
        }
    }

    fn launch(&mut self, index: usize, worker: ParseWorker) {
        let slot = &mut self.files[index];
        let Some(parser) = slot.parser.take() else {
            return;
        };
        slot.queued = false;
        slot.progress.begin();

        let info = RunningJobInfo {
            file_index: index,
            worker_id: worker.id(),
        };
        let job = ParseJob {
            index,
            path: slot.path.clone(),
            parser,
            worker,
            progress: Arc::clone(&slot.progress),
            block_size: self.block_size,
            split_mode: self.split_mode,
        };
        let runtime = self.runtime.handle().clone();
        let handle = self
            .runtime
            .handle()
            .spawn_blocking(move || job.run(&runtime));
        tracing::debug!(index, worker_id = info.worker_id, "load job launched");

        self.running.push(RunningJob { info, handle });
    }

    /// Joins one job and returns its worker and parser to their homes.
    fn finish_job(&mut self, job: RunningJob<P>) -> Result<()> {
        let RunningJobInfo {
            file_index: index,
            worker_id,
        } = job.info;
        let output = match self.runtime.handle().block_on(job.handle) {
            Ok(output) => output,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {
                tracing::warn!(index, worker_id, "load job cancelled");
                self.pool.forget(worker_id);
                self.lose_file(index);
                return Err(Error::JobCancelled { index });
            }
        };

        let slot = &mut self.files[index];
        slot.parser = Some(output.parser);
        slot.timings = output.timings;
        self.pool.release(output.worker, self.max_job_count);

        match output.result {
            Ok(()) => {
                slot.progress.set_state(JobState::Completed);
                tracing::debug!(index, worker_id, "load job completed");
                Ok(())
            }
            Err(e) => {
                // The failed load consumes every reference applied so far.
                slot.ref_count = 0;
                slot.progress.set_state(JobState::Idle);
                Err(e)
            }
        }
    }

    /// Returns released parsers to their slots and marks the files unloaded.
    fn drain_unloads(&mut self) -> Result<()> {
        match self.unloader.complete(self.runtime.handle()) {
            Ok(released) => {
                for (index, parser) in released {
                    let slot = &mut self.files[index];
                    slot.parser = Some(parser);
                    slot.progress.set_state(JobState::UnLoaded);
                }
                Ok(())
            }
            Err(e) => {
                if let Error::UnloadCancelled { indices } = &e {
                    for &index in indices {
                        self.lose_file(index);
                    }
                }
                Err(e)
            }
        }
    }

    /// Retires a file whose parser went down with a cancelled task.
    fn lose_file(&mut self, index: usize) {
        let slot = &mut self.files[index];
        slot.lost = true;
        slot.queued = false;
        slot.ref_count = 0;
        slot.progress.set_state(JobState::Idle);
        self.load_targets.retain(|&i| i != index);
    }

    /// Joins every job in flight and the running unload batch.
    ///
    /// # Errors
    ///
    /// Returns the first job error after all jobs have been joined.
    pub fn complete(&mut self) -> Result<()> {
        let mut first_error = None;
        for job in std::mem::take(&mut self.running) {
            if let Err(e) = self.finish_job(job) {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.drain_unloads() {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Joins the job in flight for file `index`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index, or the job's error.
    pub fn complete_file(&mut self, index: usize) -> Result<()> {
        self.slot(index)?;
        match self.running.iter().position(|j| j.info.file_index == index) {
            Some(pos) => {
                let job = self.running.remove(pos);
                self.finish_job(job)
            }
            None => Ok(()),
        }
    }

    /// Forgets every registered file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllStandby`] while any work is queued or running.
    pub fn clear(&mut self) -> Result<()> {
        if !self.is_all_standby() {
            return Err(Error::NotAllStandby);
        }
        self.files.clear();
        self.unload_targets.clear();
        Ok(())
    }

    /// Returns `true` when no work is queued or running and every file is
    /// idle or in standby.
    #[must_use]
    pub fn is_all_standby(&self) -> bool {
        self.running.is_empty()
            && self.requests.is_empty()
            && self.load_targets.is_empty()
            && self.unload_targets.is_empty()
            && !self.unloader.is_running()
            && self.unloader.pending_count() == 0
            && self.files.iter().all(|slot| {
                let state = slot.progress.state();
                state.is_standby() || state == JobState::Idle
            })
    }

    /// Returns `true` if file `index` is completed or unloaded and its parser
    /// can be read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn is_standby(&self, index: usize) -> Result<bool> {
        let slot = self.slot(index)?;
        Ok(slot.progress.state().is_standby() && slot.parser.is_some())
    }

    /// Returns the number of registered files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Returns the path of file `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn path(&self, index: usize) -> Result<&Path> {
        Ok(&self.slot(index)?.path)
    }

    /// Returns the number of loads waiting for a worker.
    #[must_use]
    pub fn pending_load_count(&self) -> usize {
        self.load_targets.len()
    }

    /// Returns the number of load jobs in flight.
    #[must_use]
    pub fn running_job_count(&self) -> usize {
        self.running.len()
    }

    /// Iterates over the load jobs in flight.
    pub fn running_jobs(&self) -> impl Iterator<Item = RunningJobInfo> + '_ {
        self.running.iter().map(|job| job.info)
    }

    /// Returns the number of workers in the pool.
    #[must_use]
    pub fn worker_pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Returns the decode block size.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Sets the decode block size for jobs launched from now on.
    ///
    /// Values below [`MIN_BLOCK_SIZE`] are raised to it.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = clamp_block_size(block_size);
    }

    /// Returns the maximum number of load jobs in flight.
    #[must_use]
    pub const fn max_job_count(&self) -> usize {
        self.max_job_count
    }

    /// Sets the maximum number of load jobs in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero.
    pub fn set_max_job_count(&mut self, max_job_count: usize) -> Result<()> {
        if max_job_count == 0 {
            return Err(Error::InvalidConfig("max_job_count must be > 0".into()));
        }
        self.max_job_count = max_job_count;
        self.pool.trim(max_job_count.max(self.running.len()));
        Ok(())
    }

    /// Returns the line splitting implementation.
    #[must_use]
    pub const fn split_mode(&self) -> SplitMode {
        self.split_mode
    }

    /// Selects the line splitting implementation for jobs launched from now on.
    pub const fn set_split_mode(&mut self, split_mode: SplitMode) {
        self.split_mode = split_mode;
    }

    /// Lifts the job limit for the next tick only.
    pub const fn flush_load_jobs(&mut self) {
        self.flush = true;
    }

    fn slot(&self, index: usize) -> Result<&FileSlot<P>> {
        self.files.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.files.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::error::BoxError;
    use crate::lines::LineBatch;
    use crate::parser::LineCollector;

    fn files(contents: &[&str]) -> (TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = contents
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let path = dir.path().join(format!("file_{i}.txt"));
                std::fs::write(&path, text).unwrap();
                path
            })
            .collect();
        (dir, paths)
    }

    fn scheduler<P: LineParser>(max_job_count: usize) -> LoadScheduler<P> {
        LoadSchedulerBuilder::new()
            .max_job_count(max_job_count)
            .worker_threads(2)
            .build()
            .unwrap()
    }

    /// Ticks until nothing is queued or running.
    fn settle<P: LineParser>(scheduler: &mut LoadScheduler<P>) -> Result<()> {
        for _ in 0..10_000 {
            scheduler.update()?;
            if scheduler.is_all_standby() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("scheduler did not settle");
    }

    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }

        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }
    }

    /// Blocks inside the first callback until the gate opens.
    struct GatedParser {
        gate: Arc<Gate>,
        lines: usize,
    }

    impl LineParser for GatedParser {
        fn clear(&mut self) {
            self.lines = 0;
        }

        fn parse_lines(&mut self, batch: &LineBatch) -> std::result::Result<bool, BoxError> {
            self.gate.wait();
            self.lines += batch.len();
            Ok(true)
        }

        fn unload(&mut self) {
            self.lines = 0;
        }
    }

    struct FailingParser;

    impl LineParser for FailingParser {
        fn parse_lines(&mut self, _batch: &LineBatch) -> std::result::Result<bool, BoxError> {
            Err("bad row".into())
        }
    }

    #[test]
    fn test_load_and_read() {
        let (_dir, paths) = files(&["a\nb\r\nc"]);
        let mut scheduler = scheduler::<LineCollector>(2);
        let index = scheduler.add_file(&paths[0]).unwrap();
        assert!(matches!(
            scheduler.parser(index),
            Err(Error::NotStandby { state: JobState::Idle, .. })
        ));

        scheduler.load_file(index).unwrap();
        settle(&mut scheduler).unwrap();

        let state = scheduler.get_state(index).unwrap();
        assert_eq!(state.job_state, JobState::Completed);
        assert_eq!(state.ref_count, 1);
        assert_eq!(state.length, 1);
        assert_eq!(state.read, 1);
        assert_eq!(scheduler.parser(index).unwrap().text(), "a\nb\r\nc");
        assert_eq!(scheduler.path(index).unwrap(), paths[0].as_path());
    }

    #[test]
    fn test_double_load_double_unload() {
        let (_dir, paths) = files(&["one\ntwo\n"]);
        let mut scheduler = scheduler::<LineCollector>(2);
        let index = scheduler.add_file(&paths[0]).unwrap();

        scheduler.load_file(index).unwrap();
        scheduler.load_file(index).unwrap();
        scheduler.update().unwrap();
        assert_eq!(scheduler.get_state(index).unwrap().ref_count, 2);
        assert!(scheduler.running_job_count() <= 1);
        scheduler.complete().unwrap();
        assert_eq!(scheduler.parser(index).unwrap().len(), 2);

        scheduler.unload_file(index).unwrap();
        scheduler.update().unwrap();
        assert_eq!(scheduler.get_state(index).unwrap().ref_count, 1);
        assert_eq!(scheduler.parser(index).unwrap().len(), 2);

        scheduler.unload_file(index).unwrap();
        settle(&mut scheduler).unwrap();
        let state = scheduler.get_state(index).unwrap();
        assert_eq!(state.ref_count, 0);
        assert_eq!(state.job_state, JobState::UnLoaded);
        assert!(scheduler.parser(index).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_before_assignment() {
        let (_dir, paths) = files(&["x\n", "y\n"]);
        let mut scheduler = scheduler::<LineCollector>(1);
        let a = scheduler.add_file(&paths[0]).unwrap();
        let b = scheduler.add_file(&paths[1]).unwrap();

        scheduler.load_file(a).unwrap();
        scheduler.load_file(b).unwrap();
        scheduler.update().unwrap();
        assert_eq!(scheduler.running_job_count(), 1);
        assert_eq!(scheduler.pending_load_count(), 1);
        assert!(scheduler.running_jobs().all(|job| job.file_index == a));

        scheduler.unload_file(b).unwrap();
        scheduler.update().unwrap();
        assert_eq!(scheduler.pending_load_count(), 0);
        assert!(scheduler.running_jobs().all(|job| job.file_index == a));

        settle(&mut scheduler).unwrap();
        let state = scheduler.get_state(b).unwrap();
        assert_eq!(state.job_state, JobState::Idle);
        assert_eq!(state.read, 0);
    }

    #[test]
    fn test_concurrency_bound_and_flush() {
        let contents = ["1\n"; 5];
        let (_dir, paths) = files(&contents);
        let gate = Arc::new(Gate::default());
        let mut scheduler = scheduler::<GatedParser>(2);
        for path in &paths {
            let parser = GatedParser {
                gate: Arc::clone(&gate),
                lines: 0,
            };
            let index = scheduler.add_file_with(path, parser).unwrap();
            scheduler.load_file(index).unwrap();
        }

        scheduler.update().unwrap();
        assert_eq!(scheduler.running_job_count(), 2);
        assert_eq!(scheduler.pending_load_count(), 3);
        assert_eq!(scheduler.worker_pool_size(), 2);

        scheduler.update().unwrap();
        assert_eq!(scheduler.running_job_count(), 2);

        scheduler.flush_load_jobs();
        scheduler.update().unwrap();
        assert_eq!(scheduler.running_job_count(), 5);
        assert_eq!(scheduler.pending_load_count(), 0);

        gate.open();
        scheduler.complete().unwrap();
        assert_eq!(scheduler.running_job_count(), 0);
        assert!(scheduler.worker_pool_size() <= 2);
        for index in 0..5 {
            assert_eq!(scheduler.parser(index).unwrap().lines, 1);
        }
    }

    #[test]
    fn test_unload_deferred_while_in_flight() {
        let (_dir, paths) = files(&["a\nb\n"]);
        let gate = Arc::new(Gate::default());
        let mut scheduler = scheduler::<GatedParser>(1);
        let index = scheduler
            .add_file_with(
                &paths[0],
                GatedParser {
                    gate: Arc::clone(&gate),
                    lines: 0,
                },
            )
            .unwrap();

        scheduler.load_file(index).unwrap();
        scheduler.update().unwrap();
        scheduler.unload_file(index).unwrap();
        scheduler.update().unwrap();
        assert!(scheduler.get_state(index).unwrap().job_state.is_in_flight());
        assert_eq!(scheduler.running_job_count(), 1);

        gate.open();
        settle(&mut scheduler).unwrap();
        assert_eq!(
            scheduler.get_state(index).unwrap().job_state,
            JobState::UnLoaded
        );
        assert_eq!(scheduler.parser(index).unwrap().lines, 0);
    }

    #[test]
    fn test_job_error_is_isolated() {
        let (_dir, paths) = files(&["bad\n"]);
        let mut scheduler = scheduler::<FailingParser>(2);
        let index = scheduler.add_file_with(&paths[0], FailingParser).unwrap();

        scheduler.load_file(index).unwrap();
        scheduler.update().unwrap();
        let err = scheduler.complete().unwrap_err();
        assert!(matches!(err, Error::Callback { index: 0, .. }));

        let state = scheduler.get_state(index).unwrap();
        assert_eq!(state.job_state, JobState::Idle);
        assert_eq!(state.ref_count, 0);
        assert!(scheduler.is_all_standby());
    }

    #[test]
    fn test_failure_leaves_other_files_loaded() {
        let (_dir, paths) = files(&["ok\n", ""]);
        std::fs::write(&paths[1], b"\xFFok\n").unwrap();

        let mut scheduler = scheduler::<LineCollector>(2);
        let good = scheduler.add_file(&paths[0]).unwrap();
        let broken = scheduler.add_file(&paths[1]).unwrap();
        scheduler.load_file(good).unwrap();
        scheduler.load_file(broken).unwrap();
        scheduler.update().unwrap();

        assert!(matches!(
            scheduler.complete_file(broken),
            Err(Error::Decode { offset: 0 })
        ));
        scheduler.complete_file(good).unwrap();
        assert_eq!(scheduler.parser(good).unwrap().text(), "ok\n");
        assert_eq!(
            scheduler.get_state(broken).unwrap().job_state,
            JobState::Idle
        );

        // A failed load is retried only when asked for again.
        std::fs::write(&paths[1], "fixed\n").unwrap();
        scheduler.load_file(broken).unwrap();
        settle(&mut scheduler).unwrap();
        assert_eq!(scheduler.parser(broken).unwrap().text(), "fixed\n");
    }

    #[test]
    fn test_ref_count_underflow_rejected() {
        let (_dir, paths) = files(&["x"]);
        let mut scheduler = scheduler::<LineCollector>(1);
        let index = scheduler.add_file(&paths[0]).unwrap();

        assert!(matches!(
            scheduler.unload_file(index),
            Err(Error::RefCountUnderflow { index: 0 })
        ));
        scheduler.load_file(index).unwrap();
        scheduler.unload_file(index).unwrap();
        assert!(scheduler.unload_file(index).is_err());
    }

    #[test]
    fn test_argument_errors() {
        let mut scheduler = scheduler::<LineCollector>(1);
        assert!(matches!(
            scheduler.add_file("/nonexistent/lineloader.txt"),
            Err(Error::FileNotFound { .. })
        ));
        assert!(matches!(
            scheduler.load_file(3),
            Err(Error::IndexOutOfRange { index: 3, len: 0 })
        ));
        assert!(scheduler.get_state(0).is_err());
        assert!(scheduler.set_max_job_count(0).is_err());
        assert!(
            LoadSchedulerBuilder::new()
                .max_job_count(0)
                .build::<LineCollector>()
                .is_err()
        );

        scheduler.set_block_size(1);
        assert_eq!(scheduler.block_size(), MIN_BLOCK_SIZE);
        scheduler.set_max_job_count(3).unwrap();
        assert_eq!(scheduler.max_job_count(), 3);
        scheduler.set_split_mode(SplitMode::Scalar);
        assert_eq!(scheduler.split_mode(), SplitMode::Scalar);
    }

    #[test]
    fn test_clear_requires_standby() {
        let (_dir, paths) = files(&["x\n"]);
        let mut scheduler = scheduler::<LineCollector>(1);
        let index = scheduler.add_file(&paths[0]).unwrap();
        scheduler.load_file(index).unwrap();
        assert!(matches!(scheduler.clear(), Err(Error::NotAllStandby)));

        settle(&mut scheduler).unwrap();
        scheduler.clear().unwrap();
        assert_eq!(scheduler.file_count(), 0);
    }

    #[test]
    fn test_scalar_and_accelerated_agree() {
        let text = "α\r\nβ\rγ\n\nδ";
        let (_dir, paths) = files(&[text, text]);
        let mut scheduler = scheduler::<LineCollector>(2);
        scheduler.set_block_size(MIN_BLOCK_SIZE);

        let a = scheduler.add_file(&paths[0]).unwrap();
        scheduler.load_file(a).unwrap();
        settle(&mut scheduler).unwrap();

        scheduler.set_split_mode(SplitMode::Scalar);
        let b = scheduler.add_file(&paths[1]).unwrap();
        scheduler.load_file(b).unwrap();
        settle(&mut scheduler).unwrap();

        assert_eq!(scheduler.parser(a).unwrap().text(), text);
        assert_eq!(scheduler.parser(b).unwrap().text(), text);
    }

    #[test]
    fn test_config_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.max_job_count > 0);
        assert_eq!(config.split_mode, SplitMode::Accelerated);

        let scheduler: LoadScheduler<LineCollector> = LoadSchedulerBuilder::new()
            .config(LoaderConfig {
                block_size: 10,
                ..config
            })
            .build()
            .unwrap();
        assert_eq!(scheduler.block_size(), MIN_BLOCK_SIZE);
    }

    /// A parser whose callbacks can block, fail, stall or panic on demand.
    #[derive(Default)]
    struct Scripted {
        gate: Option<Arc<Gate>>,
        fail: bool,
        unload_delay: Option<Duration>,
        unload_panics: bool,
        lines: usize,
    }

    impl LineParser for Scripted {
        fn clear(&mut self) {
            self.lines = 0;
        }

        fn parse_lines(&mut self, batch: &LineBatch) -> std::result::Result<bool, BoxError> {
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            if self.fail {
                return Err("bad row".into());
            }
            self.lines += batch.len();
            Ok(true)
        }

        fn unload(&mut self) {
            if let Some(delay) = self.unload_delay {
                std::thread::sleep(delay);
            }
            if self.unload_panics {
                panic!("unload hook failed");
            }
            self.lines = 0;
        }
    }

    fn wait_for<P: LineParser>(scheduler: &LoadScheduler<P>, index: usize, state: JobState) {
        for _ in 0..5_000 {
            if scheduler.get_state(index).unwrap().job_state == state {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("file {index} never reached {state:?}");
    }

    fn external_runtime() -> Runtime {
        Builder::new_multi_thread().worker_threads(1).build().unwrap()
    }

    #[test]
    fn test_not_standby_while_unload_batch_holds_parser() {
        let (_dir, paths) = files(&["a\nb\n"]);
        let mut scheduler = scheduler::<Scripted>(1);
        let index = scheduler
            .add_file_with(
                &paths[0],
                Scripted {
                    unload_delay: Some(Duration::from_millis(300)),
                    ..Scripted::default()
                },
            )
            .unwrap();
        scheduler.load_file(index).unwrap();
        settle(&mut scheduler).unwrap();
        assert!(scheduler.is_standby(index).unwrap());

        scheduler.unload_file(index).unwrap();
        scheduler.update().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(!scheduler.is_standby(index).unwrap());
        assert!(matches!(
            scheduler.parser(index),
            Err(Error::JobInFlight { index: 0 })
        ));
        assert_eq!(
            scheduler.get_state(index).unwrap().job_state,
            JobState::Completed
        );

        settle(&mut scheduler).unwrap();
        assert!(scheduler.is_standby(index).unwrap());
        assert_eq!(
            scheduler.get_state(index).unwrap().job_state,
            JobState::UnLoaded
        );
        assert_eq!(scheduler.parser(index).unwrap().lines, 0);
    }

    #[test]
    #[should_panic(expected = "unload hook failed")]
    fn test_unload_hook_panic_reaches_caller() {
        let (_dir, paths) = files(&["a\n"]);
        let mut scheduler = scheduler::<Scripted>(1);
        let index = scheduler
            .add_file_with(
                &paths[0],
                Scripted {
                    unload_panics: true,
                    ..Scripted::default()
                },
            )
            .unwrap();
        scheduler.load_file(index).unwrap();
        settle(&mut scheduler).unwrap();

        scheduler.unload_file(index).unwrap();
        let _ = settle(&mut scheduler);
    }

    #[test]
    fn test_timings_recorded_after_load() {
        let text = "0123456789,abcdefghij\n".repeat(2_000);
        let (_dir, paths) = files(&[text.as_str()]);
        let mut scheduler = scheduler::<LineCollector>(1);
        let index = scheduler.add_file(&paths[0]).unwrap();
        assert_eq!(
            scheduler.get_state(index).unwrap().timings,
            JobTimings::default()
        );

        scheduler.load_file(index).unwrap();
        settle(&mut scheduler).unwrap();
        let timings = scheduler.get_state(index).unwrap().timings;
        assert!(timings.read > Duration::ZERO);
        assert!(timings.parse > Duration::ZERO);
        assert_eq!(scheduler.parser(index).unwrap().len(), 2_000);
    }

    #[test]
    fn test_update_keeps_job_error_when_unload_batch_is_cancelled() {
        let (_dir, paths) = files(&["keep\n", "bad\n"]);
        let rt = external_runtime();
        let mut scheduler: LoadScheduler<Scripted> = LoadSchedulerBuilder::new()
            .max_job_count(2)
            .runtime_handle(rt.handle().clone())
            .build()
            .unwrap();
        let gate = Arc::new(Gate::default());
        let kept = scheduler.add_file_with(&paths[0], Scripted::default()).unwrap();
        let failing = scheduler
            .add_file_with(
                &paths[1],
                Scripted {
                    gate: Some(Arc::clone(&gate)),
                    fail: true,
                    ..Scripted::default()
                },
            )
            .unwrap();
        scheduler.load_file(kept).unwrap();
        settle(&mut scheduler).unwrap();

        scheduler.load_file(failing).unwrap();
        scheduler.update().unwrap();
        wait_for(&scheduler, failing, JobState::ParseText);
        rt.shutdown_background();

        // Launched on a stopped runtime, so the batch never runs.
        scheduler.unload_file(kept).unwrap();
        scheduler.update().unwrap();

        gate.open();
        wait_for(&scheduler, failing, JobState::WaitForCallingComplete);
        std::thread::sleep(Duration::from_millis(50));

        let err = scheduler.update().unwrap_err();
        assert!(matches!(err, Error::Callback { index: 1, .. }));
        assert_eq!(
            scheduler.get_state(failing).unwrap().job_state,
            JobState::Idle
        );
        assert_eq!(scheduler.get_state(kept).unwrap().job_state, JobState::Idle);
        assert!(matches!(
            scheduler.load_file(kept),
            Err(Error::JobCancelled { index: 0 })
        ));
        assert!(scheduler.is_all_standby());
    }

    #[test]
    fn test_cancelled_job_drops_queued_reload() {
        let (_dir, paths) = files(&["x\n"]);
        let rt = external_runtime();
        let mut scheduler: LoadScheduler<LineCollector> = LoadSchedulerBuilder::new()
            .max_job_count(1)
            .runtime_handle(rt.handle().clone())
            .build()
            .unwrap();
        let index = scheduler.add_file(&paths[0]).unwrap();
        rt.shutdown_background();

        scheduler.load_file(index).unwrap();
        scheduler.update().unwrap();
        assert_eq!(scheduler.running_job_count(), 1);

        // Accepted before the cancellation is observed.
        scheduler.load_file(index).unwrap();
        let err = scheduler.update().unwrap_err();
        assert!(matches!(err, Error::JobCancelled { index: 0 }));

        assert_eq!(scheduler.running_job_count(), 0);
        assert_eq!(scheduler.pending_load_count(), 0);
        assert_eq!(scheduler.get_state(index).unwrap().ref_count, 0);
        assert!(scheduler.is_all_standby());
        assert!(scheduler.load_file(index).is_err());
        scheduler.clear().unwrap();
    }

    #[test]
    fn test_failure_consumes_load_applied_while_in_flight() {
        let (_dir, paths) = files(&["bad\n"]);
        let gate = Arc::new(Gate::default());
        let mut scheduler = scheduler::<Scripted>(1);
        let index = scheduler
            .add_file_with(
                &paths[0],
                Scripted {
                    gate: Some(Arc::clone(&gate)),
                    fail: true,
                    ..Scripted::default()
                },
            )
            .unwrap();

        scheduler.load_file(index).unwrap();
        scheduler.update().unwrap();
        scheduler.load_file(index).unwrap();
        scheduler.update().unwrap();
        assert_eq!(scheduler.get_state(index).unwrap().ref_count, 2);

        gate.open();
        assert!(scheduler.complete().is_err());
        let state = scheduler.get_state(index).unwrap();
        assert_eq!(state.job_state, JobState::Idle);
        assert_eq!(state.ref_count, 0);

        scheduler.update().unwrap();
        assert_eq!(scheduler.running_job_count(), 0);
        assert_eq!(scheduler.pending_load_count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Load(usize),
        Unload(usize),
        Tick,
        Flush,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3).prop_map(Op::Load),
            (0usize..3).prop_map(Op::Unload),
            Just(Op::Tick),
            Just(Op::Flush),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn jobs_stay_bounded_and_refs_balance(ops in proptest::collection::vec(op(), 1..40)) {
            let (_dir, paths) = files(&["a\nb\n", "c\n", "d\ne\nf\n"]);
            let mut scheduler = scheduler::<LineCollector>(2);
            for path in &paths {
                scheduler.add_file(path).unwrap();
            }
            let mut expected = [0usize; 3];
            let mut ever_loaded = [false; 3];
            let mut flush_requested = false;
            // Jobs launched by a flush tick may still be running afterwards.
            let mut burst = false;

            for op in ops {
                match op {
                    Op::Load(i) => {
                        scheduler.load_file(i).unwrap();
                        expected[i] += 1;
                    }
                    Op::Unload(i) => {
                        let accepted = scheduler.unload_file(i).is_ok();
                        prop_assert_eq!(accepted, expected[i] > 0);
                        if accepted {
                            expected[i] -= 1;
                        }
                    }
                    Op::Flush => {
                        scheduler.flush_load_jobs();
                        flush_requested = true;
                    }
                    Op::Tick => {
                        scheduler.update().unwrap();
                        burst |= std::mem::take(&mut flush_requested);
                        if !burst {
                            prop_assert!(scheduler.running_job_count() <= 2);
                        }
                        if scheduler.running_job_count() <= 2 {
                            burst = false;
                        }
                        for (i, loaded) in ever_loaded.iter_mut().enumerate() {
                            *loaded |= scheduler.get_state(i).unwrap().job_state != JobState::Idle;
                        }
                    }
                }
            }

            for (i, &count) in expected.iter().enumerate() {
                for _ in 0..count {
                    scheduler.unload_file(i).unwrap();
                }
            }
            settle(&mut scheduler).unwrap();
            for (i, &loaded) in ever_loaded.iter().enumerate() {
                let state = scheduler.get_state(i).unwrap();
                prop_assert_eq!(state.ref_count, 0);
                if loaded {
                    prop_assert_eq!(state.job_state, JobState::UnLoaded);
                }
            }
        }
    }
}
