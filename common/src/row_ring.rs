//! Fixed-height circular buffer of image lines.
//!
//! Scanline detectors keep a sliding window of the last `height` lines.
//! Pushing a line overwrites the oldest slot and advances the head, so rows are
//! addressed by logical index (0 = oldest) through modular arithmetic instead of
//! rotating row pointers.

use crate::buffer2::Buffer2;

#[derive(Debug, Clone)]
pub struct RowRing<T> {
    rows: Buffer2<T>,
    head: usize,
}

impl<T: Clone + Default> RowRing<T> {
    pub fn new(width: usize, height: usize) -> Self {
        assert!(height > 0, "ring height must be > 0");
        Self {
            rows: Buffer2::new_default(width, height),
            head: 0,
        }
    }

    /// Overwrites the oldest line with `line`; it becomes the newest one.
    pub fn push(&mut self, line: &[T]) {
        let slot = self.head;
        self.rows.row_mut(slot).clone_from_slice(line);
        self.head = (self.head + 1) % self.rows.height();
    }

    /// Rotates without copying and returns the newest slot for in-place filling.
    pub fn push_slot(&mut self) -> &mut [T] {
        let slot = self.head;
        self.head = (self.head + 1) % self.rows.height();
        self.rows.row_mut(slot)
    }

    pub fn fill(&mut self, value: T) {
        self.rows.fill(value);
        self.head = 0;
    }
}

impl<T> RowRing<T> {
    /// Logical row `idx`, where 0 is the oldest and `height - 1` the newest line.
    #[inline]
    pub fn row(&self, idx: usize) -> &[T] {
        debug_assert!(idx < self.rows.height());
        self.rows.row((self.head + idx) % self.rows.height())
    }

    #[inline]
    pub fn get(&self, x: usize, idx: usize) -> &T {
        &self.row(idx)[x]
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.rows.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.rows.height()
    }
}
