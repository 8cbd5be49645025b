//! Staging buffer with O(1) removal from the front.
//!
//! Decoded text is appended at the back while completed lines are consumed
//! from the front. The consumed prefix is only reclaimed by [`shrink`], which
//! runs automatically once the dead head grows past half of the buffer.
//!
//! [`shrink`]: HeadRemovableSequence::shrink

/// Dead-head size below which automatic compaction is skipped.
const SHRINK_THRESHOLD: usize = 1024;

/// A growable sequence that can drop elements from its front in O(1).
#[derive(Debug, Clone)]
pub struct HeadRemovableSequence<T> {
    buffer: Vec<T>,
    head: usize,
}

impl<T: Copy> Default for HeadRemovableSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> HeadRemovableSequence<T> {
    /// Creates an empty sequence.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            head: 0,
        }
    }

    /// Creates an empty sequence with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            head: 0,
        }
    }

    /// Returns the number of live elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len() - self.head
    }

    /// Returns `true` if there are no live elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the offset of the first live element in the buffer.
    #[inline]
    #[must_use]
    pub const fn head(&self) -> usize {
        self.head
    }

    /// Returns the live elements.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.buffer[self.head..]
    }

    /// Appends elements at the back.
    pub fn push_slice(&mut self, elements: &[T]) {
        if self.head > SHRINK_THRESHOLD && self.head * 2 > self.buffer.len() {
            self.shrink();
        }
        self.buffer.extend_from_slice(elements);
    }

    /// Drops up to `count` elements from the front.
    pub fn remove_front(&mut self, count: usize) {
        self.head = (self.head + count).min(self.buffer.len());
        if self.head == self.buffer.len() {
            self.buffer.clear();
            self.head = 0;
        }
    }

    /// Moves the live elements to the front of the buffer.
    pub fn shrink(&mut self) {
        if self.head == 0 {
            return;
        }
        self.buffer.drain(..self.head);
        self.head = 0;
    }

    /// Removes every element, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.head = 0;
    }
}
