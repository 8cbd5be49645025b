//! Line splitting into a reusable packed batch.
//!
//! Lines end at `\n`, `\r` or `\r\n`. A `\r` that is the last byte of a block
//! stays in the staging buffer until the next block shows whether a `\n`
//! follows it.

use crate::error::{Error, Result};
use crate::packed::{PackedSequenceStore, View};
use crate::staging::HeadRemovableSequence;

/// Terminator that ended a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineEnding {
    /// `\n`
    Lf,
    /// `\r`
    Cr,
    /// `\r\n`
    CrLf,
    /// Trailing data at end of file with no terminator.
    None,
}

impl LineEnding {
    /// Returns the terminator text.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::Cr => "\r",
            Self::CrLf => "\r\n",
            Self::None => "",
        }
    }
}

/// Line splitting implementation.
///
/// Both modes produce identical output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SplitMode {
    /// Vectorized terminator search.
    #[default]
    Accelerated,
    /// Byte-at-a-time terminator search.
    Scalar,
}

impl SplitMode {
    fn find_terminator(self, haystack: &[u8]) -> Option<usize> {
        match self {
            Self::Accelerated => memchr::memchr2(b'\n', b'\r', haystack),
            Self::Scalar => haystack.iter().position(|&b| b == b'\n' || b == b'\r'),
        }
    }
}

impl std::str::FromStr for SplitMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "accelerated" | "burst" => Ok(Self::Accelerated),
            "scalar" => Ok(Self::Scalar),
            other => Err(Error::InvalidConfig(format!("unknown split mode: {other}"))),
        }
    }
}

/// A batch of lines handed to a parser callback.
///
/// The batch is backed by one packed buffer that is cleared and reused
/// between blocks, so lines must be copied out if they are needed after the
/// callback returns.
#[derive(Debug, Default)]
pub struct LineBatch {
    store: PackedSequenceStore<u8>,
    endings: Vec<LineEnding>,
    first_line: usize,
}

impl LineBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of lines.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` if the batch has no lines.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Returns the file line number of the first line in this batch.
    #[inline]
    #[must_use]
    pub const fn first_line_number(&self) -> usize {
        self.first_line
    }

    /// Returns line `index` without its terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn line(&self, index: usize) -> Result<&str> {
        self.store.get(index).map(Self::as_text)
    }

    /// Returns the terminator of line `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn ending(&self, index: usize) -> Result<LineEnding> {
        self.endings
            .get(index)
            .copied()
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.endings.len(),
            })
    }

    /// Returns a detached view of line `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn view(&self, index: usize) -> Result<View> {
        self.store.at(index)
    }

    /// Resolves a view issued by this batch.
    ///
    /// # Errors
    ///
    /// Fails once the batch has been cleared or has grown since the view was
    /// issued.
    pub fn resolve(&self, view: &View) -> Result<&str> {
        self.store.resolve(view).map(Self::as_text)
    }

    /// Iterates over `(line, ending)` pairs.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, LineEnding)> + '_ {
        self.store
            .iter()
            .map(Self::as_text)
            .zip(self.endings.iter().copied())
    }

    /// Appends every line with its original terminator to `out`.
    pub fn rejoin_into(&self, out: &mut String) {
        for (line, ending) in self.iter() {
            out.push_str(line);
            out.push_str(ending.as_str());
        }
    }

    /// Appends a line.
    pub fn push(&mut self, line: &str, ending: LineEnding) {
        self.store.add(line.as_bytes());
        self.endings.push(ending);
    }

    /// Removes all lines and sets the number of the next line pushed.
    pub fn clear(&mut self, first_line: usize) {
        self.store.clear();
        self.endings.clear();
        self.first_line = first_line;
    }

    fn as_text(bytes: &[u8]) -> &str {
        // SAFETY: the store is private and only filled by `push`, which takes `&str`.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }
}

/// Moves completed lines from `staging` into `batch`.
///
/// When `last` is set, a lone trailing `\r` ends a line and any remaining
/// text is flushed as a final line without terminator.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the staged text is not valid UTF-8. The
/// reported offset is relative to the start of the staged text.
pub fn split_lines(
    mode: SplitMode,
    staging: &mut HeadRemovableSequence<u8>,
    batch: &mut LineBatch,
    last: bool,
) -> Result<()> {
    let data = staging.as_slice();
    let mut pos = 0;

    while let Some(found) = mode.find_terminator(&data[pos..]) {
        let end = pos + found;
        let (ending, next) = if data[end] == b'\n' {
            (LineEnding::Lf, end + 1)
        } else if end + 1 < data.len() {
            if data[end + 1] == b'\n' {
                (LineEnding::CrLf, end + 2)
            } else {
                (LineEnding::Cr, end + 1)
            }
        } else if last {
            (LineEnding::Cr, end + 1)
        } else {
            break;
        };
        batch.push(to_text(&data[pos..end], pos)?, ending);
        pos = next;
    }

    if last && pos < data.len() {
        batch.push(to_text(&data[pos..], pos)?, LineEnding::None);
        pos = data.len();
    }

    staging.remove_front(pos);
    Ok(())
}

fn to_text(bytes: &[u8], offset: usize) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::Decode {
        offset: offset + e.valid_up_to(),
    })
}
