use std::ops::{Deref, DerefMut, Index, IndexMut};

/// Row-major 2-D buffer addressed as `(x, y)` = `(column, line)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer2<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> Buffer2<T> {
    pub fn new(width: usize, height: usize, pixels: Vec<T>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixels length must equal width * height"
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> &T {
        debug_assert!(x < self.width && y < self.height);
        &self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        debug_assert!(x < self.width && y < self.height);
        &mut self.pixels[y * self.width + x]
    }

    /// Returns line `y` as a slice of `width` elements.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.width;
        &self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.width;
        &mut self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [T] {
        &mut self.pixels
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.pixels
    }
}

impl<T: Default + Clone> Buffer2<T> {
    pub fn new_default(width: usize, height: usize) -> Self {
        Self {
            pixels: vec![T::default(); width * height],
            width,
            height,
        }
    }
}

impl<T: Clone> Buffer2<T> {
    pub fn new_filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }

    #[inline]
    pub fn fill(&mut self, value: T) {
        self.pixels.fill(value);
    }
}

impl<T> Index<(usize, usize)> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.pixels[y * self.width + x]
    }
}

impl<T> Deref for Buffer2<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.pixels
    }
}

impl<T> DerefMut for Buffer2<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stores_dimensions() {
        let buf = Buffer2::new(3, 2, vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(buf.width(), 3);
        assert_eq!(buf.height(), 2);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    #[should_panic(expected = "pixels length must equal width * height")]
    fn test_new_panics_on_size_mismatch() {
        Buffer2::new(3, 2, vec![1, 2, 3]);
    }

    #[test]
    fn test_get_is_column_line() {
        // row 0 = [10, 20, 30], row 1 = [40, 50, 60]
        let buf = Buffer2::new(3, 2, vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(*buf.get(2, 0), 30);
        assert_eq!(*buf.get(0, 1), 40);
        assert_eq!(buf[(2, 1)], 60);
    }

    #[test]
    fn test_row_views() {
        let mut buf = Buffer2::new(3, 2, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.row(1), &[4, 5, 6]);
        buf.row_mut(0).copy_from_slice(&[7, 8, 9]);
        assert_eq!(buf.pixels(), &[7, 8, 9, 4, 5, 6]);
    }

    #[test]
    fn test_new_filled_and_fill() {
        let mut buf = Buffer2::new_filled(2, 3, 42u8);
        assert!(buf.iter().all(|&v| v == 42));
        buf.fill(0);
        assert!(buf.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_new_default_zeroed() {
        let buf: Buffer2<f32> = Buffer2::new_default(4, 3);
        assert_eq!(buf.len(), 12);
        assert!(buf.iter().all(|&v| v == 0.0));
    }
}
