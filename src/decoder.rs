//! Stateful byte-to-text decoding.
//!
//! Files are decoded one block at a time, so a multi-byte sequence may be
//! split across two blocks. A [`Decoder`] keeps the unfinished tail of one
//! block and completes it with the head of the next.

use crate::error::{Error, Result};
use crate::staging::HeadRemovableSequence;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// A stateful decoder producing UTF-8 text.
pub trait Decoder: Send {
    /// Forgets any state carried over from a previous stream.
    fn reset(&mut self);

    /// Decodes `input` and appends the resulting UTF-8 text to `output`.
    ///
    /// `last` marks the final block of the stream; an unfinished sequence at
    /// that point is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] with the absolute offset of the first byte
    /// that could not be decoded.
    fn decode(
        &mut self,
        input: &[u8],
        last: bool,
        output: &mut HeadRemovableSequence<u8>,
    ) -> Result<()>;
}

/// UTF-8 decoder that strips a leading byte order mark.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    pending: [u8; 4],
    pending_len: usize,
    /// Bytes of input consumed so far, pending bytes included.
    position: usize,
    started: bool,
}

impl Utf8Decoder {
    /// Creates a decoder at the start of a stream.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: [0; 4],
            pending_len: 0,
            position: 0,
            started: false,
        }
    }

    fn emit(&mut self, mut bytes: &[u8], output: &mut HeadRemovableSequence<u8>) {
        if bytes.is_empty() {
            return;
        }
        if !self.started {
            self.started = true;
            if let Some(rest) = bytes.strip_prefix(&UTF8_BOM) {
                bytes = rest;
            }
        }
        output.push_slice(bytes);
    }

    /// Completes a sequence left over from the previous block.
    ///
    /// Returns the number of input bytes used.
    fn finish_pending(
        &mut self,
        input: &[u8],
        last: bool,
        output: &mut HeadRemovableSequence<u8>,
    ) -> Result<usize> {
        let pending_offset = self.position - self.pending_len;
        let width = sequence_width(self.pending[0]);
        let take = (width - self.pending_len).min(input.len());
        self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&input[..take]);
        self.pending_len += take;
        self.position += take;

        if self.pending_len < width {
            if last {
                return Err(Error::Decode {
                    offset: pending_offset,
                });
            }
            return Ok(take);
        }

        let sequence = self.pending;
        let sequence = &sequence[..width];
        if std::str::from_utf8(sequence).is_err() {
            return Err(Error::Decode {
                offset: pending_offset,
            });
        }
        self.pending_len = 0;
        self.emit(sequence, output);
        Ok(take)
    }
}

impl Decoder for Utf8Decoder {
    fn reset(&mut self) {
        *self = Self::new();
    }

    fn decode(
        &mut self,
        mut input: &[u8],
        last: bool,
        output: &mut HeadRemovableSequence<u8>,
    ) -> Result<()> {
        if self.pending_len > 0 {
            let used = self.finish_pending(input, last, output)?;
            input = &input[used..];
            if self.pending_len > 0 {
                return Ok(());
            }
        }

        let base = self.position;
        self.position += input.len();
        match std::str::from_utf8(input) {
            Ok(_) => {
                self.emit(input, output);
                Ok(())
            }
            Err(e) => {
                let valid = e.valid_up_to();
                self.emit(&input[..valid], output);
                if e.error_len().is_some() || last {
                    return Err(Error::Decode {
                        offset: base + valid,
                    });
                }
                let tail = &input[valid..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                Ok(())
            }
        }
    }
}

/// Length of the UTF-8 sequence introduced by `lead`.
const fn sequence_width(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}
