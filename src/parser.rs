//! User parser capability.
//!
//! A [`LineParser`] owns the parsed data of one file. The scheduler moves it
//! into the background job that loads the file and hands it back when the
//! job is joined, so a parser is never touched by two threads at once.

use crate::error::BoxError;
use crate::lines::LineBatch;

/// Receives the lines of one file and keeps whatever it derives from them.
///
/// # Example
///
/// ```rust
/// use lineloader::{BoxError, LineBatch, LineParser};
///
/// #[derive(Default)]
/// struct Sum(i64);
///
/// impl LineParser for Sum {
///     fn clear(&mut self) {
///         self.0 = 0;
///     }
///
///     fn parse_lines(&mut self, batch: &LineBatch) -> Result<bool, BoxError> {
///         for (line, _) in batch.iter() {
///             self.0 += line.trim().parse::<i64>()?;
///         }
///         Ok(true)
///     }
///
///     fn unload(&mut self) {
///         self.0 = 0;
///     }
/// }
/// ```
pub trait LineParser: Send + 'static {
    /// Called once when the file is registered.
    fn init(&mut self) {}

    /// Called before every read of the file.
    fn clear(&mut self) {}

    /// Consumes one batch of lines.
    ///
    /// Returning `Ok(false)` stops reading this file; the remaining blocks
    /// are never decoded.
    ///
    /// # Errors
    ///
    /// An error aborts the load of this file only and is reported when the
    /// scheduler joins the job.
    fn parse_lines(&mut self, batch: &LineBatch) -> Result<bool, BoxError>;

    /// Called after the last batch, or after an early stop.
    ///
    /// # Errors
    ///
    /// Handled like an error from [`parse_lines`](Self::parse_lines).
    fn post_read_proc(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Releases the parsed data. Runs on a background thread.
    fn unload(&mut self) {}
}

/// A parser that keeps every line of the file.
#[derive(Debug, Default)]
pub struct LineCollector {
    lines: LineBatch,
}

impl LineCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected lines.
    #[must_use]
    pub const fn lines(&self) -> &LineBatch {
        &self.lines
    }

    /// Returns the number of collected lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns the collected text with its original terminators.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.lines.rejoin_into(&mut out);
        out
    }
}

impl LineParser for LineCollector {
    fn clear(&mut self) {
        self.lines.clear(0);
    }

    fn parse_lines(&mut self, batch: &LineBatch) -> Result<bool, BoxError> {
        for (line, ending) in batch.iter() {
            self.lines.push(line, ending);
        }
        Ok(true)
    }

    fn unload(&mut self) {
        self.lines = LineBatch::new();
    }
}
