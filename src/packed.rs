//! Append-only packed storage with generation-checked views.
//!
//! A [`PackedSequenceStore`] keeps every element's data back-to-back in one
//! contiguous buffer and locates each element through a [`Span`]. Borrowed
//! access through [`PackedSequenceStore::get`] is checked by the borrow
//! checker. Detached handles ([`View`]) carry the generation they were issued
//! under and are checked against the store's current generation on every use.
//!
//! The generation is bumped whenever the buffer's backing allocation changes,
//! in address or in capacity (growth past capacity, [`shrink_to_fit`](PackedSequenceStore::shrink_to_fit),
//! [`set_capacity`](PackedSequenceStore::set_capacity)) and whenever live
//! data is moved ([`re_adjustment`](PackedSequenceStore::re_adjustment),
//! [`clear`](PackedSequenceStore::clear)).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Location of one element inside a packed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    start: usize,
    len: usize,
}

impl Span {
    /// Creates a new span.
    #[inline]
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// Returns the start offset.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Returns the number of elements covered.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the span covers nothing.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the end offset (exclusive).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }
}

/// A detached handle to one element of a [`PackedSequenceStore`].
///
/// A view stays valid exactly until the next operation that changes the
/// store's buffer address or moves its live data.
#[derive(Debug, Clone)]
pub struct View {
    span: Span,
    captured: u64,
    generation: Arc<AtomicU64>,
}

impl View {
    /// Returns the span this view points at.
    #[inline]
    #[must_use]
    pub const fn span(&self) -> Span {
        self.span
    }

    /// Returns the number of elements in the view.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.span.len
    }

    /// Returns `true` if the view covers nothing.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.span.len == 0
    }

    /// Returns the generation the view was issued under.
    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.captured
    }

    /// Returns `true` if the issuing store has not invalidated this view.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.generation.load(Ordering::Acquire) == self.captured
    }

    /// Fails with [`Error::StaleView`] if the view has been invalidated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleView`] when the store's generation moved on.
    pub fn check(&self) -> Result<()> {
        let current = self.generation.load(Ordering::Acquire);
        if current == self.captured {
            Ok(())
        } else {
            Err(Error::StaleView {
                captured: self.captured,
                current,
            })
        }
    }
}

/// An append-only buffer of `T` plus an ordered index of spans.
///
/// Removing elements only edits the span index; the gaps left in the buffer
/// are reclaimed by [`re_adjustment`](Self::re_adjustment).
///
/// # Example
///
/// ```rust
/// use lineloader::PackedSequenceStore;
///
/// # fn main() -> lineloader::Result<()> {
/// let mut store = PackedSequenceStore::new();
/// store.add(b"hello");
/// store.add(b"world");
///
/// let view = store.at(1)?;
/// assert_eq!(store.resolve(&view)?, b"world");
///
/// store.remove_at(0)?;
/// store.re_adjustment();
/// assert!(store.resolve(&view).is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PackedSequenceStore<T> {
    buffer: Vec<T>,
    spans: Vec<Span>,
    generation: Arc<AtomicU64>,
}

impl<T: Copy> Default for PackedSequenceStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> PackedSequenceStore<T> {
    /// Creates an empty store without allocating.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            spans: Vec::new(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates an empty store with room for `capacity` elements of data.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            spans: Vec::new(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the number of logical elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns `true` if the store holds no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Returns the current generation.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the span index in logical order.
    #[inline]
    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Returns the number of buffer slots in use, gaps included.
    #[inline]
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of buffer slots covered by live spans.
    #[must_use]
    pub fn used_len(&self) -> usize {
        self.spans.iter().map(Span::len).sum()
    }

    /// Returns the buffer capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Sets the buffer capacity, reallocating if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `capacity` is below the current
    /// buffer length.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        let len = self.buffer.len();
        if capacity < len {
            return Err(Error::InvalidConfig(format!(
                "capacity {capacity} is below buffer length {len}"
            )));
        }
        self.track_address(|buffer| {
            if capacity > buffer.capacity() {
                buffer.reserve_exact(capacity - len);
            } else {
                buffer.shrink_to(capacity);
            }
        });
        Ok(())
    }

    /// Appends one element and returns its index.
    pub fn add(&mut self, elements: &[T]) -> usize {
        let span = Span::new(self.buffer.len(), elements.len());
        self.track_address(|buffer| buffer.extend_from_slice(elements));
        self.spans.push(span);
        self.spans.len() - 1
    }

    /// Returns element `index` as a borrowed slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn get(&self, index: usize) -> Result<&[T]> {
        let span = self.span(index)?;
        Ok(&self.buffer[span.start..span.end()])
    }

    /// Returns a detached view of element `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn at(&self, index: usize) -> Result<View> {
        let span = self.span(index)?;
        Ok(View {
            span,
            captured: self.generation(),
            generation: Arc::clone(&self.generation),
        })
    }

    /// Resolves a view into a borrowed slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForeignView`] if another store issued the view and
    /// [`Error::StaleView`] if the view was invalidated.
    pub fn resolve(&self, view: &View) -> Result<&[T]> {
        if !Arc::ptr_eq(&self.generation, &view.generation) {
            return Err(Error::ForeignView);
        }
        view.check()?;
        self.buffer
            .get(view.span.start..view.span.end())
            .ok_or(Error::StaleView {
                captured: view.captured,
                current: self.generation(),
            })
    }

    /// Removes element `index`, leaving its data as a gap in the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] for a bad index.
    pub fn remove_at(&mut self, index: usize) -> Result<()> {
        self.remove_range(index, 1)
    }

    /// Removes `count` elements starting at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if the range exceeds the store.
    pub fn remove_range(&mut self, index: usize, count: usize) -> Result<()> {
        let len = self.spans.len();
        match index.checked_add(count) {
            Some(end) if end <= len => {
                self.spans.drain(index..end);
                Ok(())
            }
            _ => Err(Error::IndexOutOfRange {
                index: index.saturating_add(count),
                len,
            }),
        }
    }

    /// Compacts live data to the front of the buffer, removing gaps.
    ///
    /// Always invalidates outstanding views.
    pub fn re_adjustment(&mut self) {
        let mut cursor = 0;
        for span in &mut self.spans {
            if span.start != cursor {
                self.buffer.copy_within(span.start..span.end(), cursor);
                span.start = cursor;
            }
            cursor += span.len;
        }
        self.buffer.truncate(cursor);
        self.bump();
    }

    /// Drops trailing gaps and releases unused capacity.
    ///
    /// Invalidates outstanding views only if the buffer was reallocated.
    pub fn shrink_to_fit(&mut self) {
        let end = self.spans.last().map_or(0, Span::end);
        self.buffer.truncate(end);
        self.track_address(Vec::shrink_to_fit);
    }

    /// Removes every element, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.spans.clear();
        self.bump();
    }

    /// Iterates over elements in logical order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &[T]> + '_ {
        self.spans
            .iter()
            .map(|span| &self.buffer[span.start..span.end()])
    }

    fn span(&self, index: usize) -> Result<Span> {
        self.spans
            .get(index)
            .copied()
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.spans.len(),
            })
    }

    /// Runs `f` on the buffer and bumps the generation if it was reallocated.
    ///
    /// A capacity change counts as a reallocation even when the allocator
    /// resized the block in place.
    fn track_address<R>(&mut self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let before = (self.buffer.as_ptr(), self.buffer.capacity());
        let result = f(&mut self.buffer);
        if (self.buffer.as_ptr(), self.buffer.capacity()) != before {
            self.bump();
        }
        result
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
