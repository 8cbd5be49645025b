//! # lineloader
//!
//! Background loading of many text files, line by line, with a bounded
//! number of jobs in flight and reference-counted unloading.
//!
//! ## Features
//!
//! - **Packed Line Storage**: Variable-length sequences share one contiguous buffer
//! - **Generation-Checked Views**: Views fail cleanly once the buffer has moved
//! - **Streaming Decode**: Files are decoded block by block, with split sequences carried over
//! - **Early Stop**: Parsers can stop a load after any batch of lines
//! - **Bounded Concurrency**: At most `max_job_count` loads run at once, with a one-tick flush
//! - **Ref-Counted Unloading**: The last unload releases parsed data in a background batch
//!
//! ## Example
//!
//! ```rust,no_run
//! use lineloader::{LineCollector, LoadScheduler, LoadSchedulerBuilder};
//!
//! # fn main() -> lineloader::Result<()> {
//! let mut scheduler: LoadScheduler<LineCollector> = LoadSchedulerBuilder::new()
//!     .max_job_count(4)
//!     .build()?;
//!
//! let index = scheduler.add_file("data/items.csv")?;
//! scheduler.load_file(index)?;
//!
//! // Drive the scheduler from the main loop.
//! while !scheduler.is_standby(index)? {
//!     scheduler.update()?;
//! }
//!
//! for (line, _ending) in scheduler.parser(index)?.lines().iter() {
//!     println!("{line}");
//! }
//!
//! scheduler.unload_file(index)?;
//! scheduler.update()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Packed Storage Example
//!
//! ```rust
//! use lineloader::PackedSequenceStore;
//!
//! # fn main() -> lineloader::Result<()> {
//! let mut store = PackedSequenceStore::new();
//! store.add(b"first");
//! store.add(b"second");
//!
//! let view = store.at(1)?;
//! assert_eq!(store.resolve(&view)?, b"second");
//!
//! store.remove_at(0)?;
//! store.re_adjustment();
//! assert!(store.resolve(&view).is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod decoder;
mod error;
mod lines;
mod packed;
mod parser;
mod scheduler;
mod staging;
mod state;
mod unload;
mod worker;

pub use decoder::{Decoder, Utf8Decoder};
pub use error::{BoxError, Error, Result};
pub use lines::{LineBatch, LineEnding, SplitMode, split_lines};
pub use packed::{PackedSequenceStore, Span, View};
pub use parser::{LineCollector, LineParser};
pub use scheduler::{
    DEFAULT_BLOCK_SIZE, LoadScheduler, LoadSchedulerBuilder, LoaderConfig, MIN_BLOCK_SIZE,
    Request, RequestAction, RunningJobInfo,
};
pub use staging::HeadRemovableSequence;
pub use state::{JobState, JobTimings, ReadState};
pub use worker::{DecoderFactory, ParseWorker, block_count, utf8_decoder_factory};
