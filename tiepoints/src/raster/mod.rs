//! Raster access collaborators and window loading.
//!
//! The locator never reads files itself. It works against the [`Raster`] trait
//! (band/row/column reads, a [`RasterGrid`] and an [`AccessPolicy`]) and loads
//! the target windows it needs into normalised [`Matrix`] buffers through
//! [`load_raster_window`] and [`load_mask_window`].


use common::Buffer2;
use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::MatrixError;
use crate::matrix::{Matrix, MemoryPolicy};

// ============================================================================
// Raster collaborators
// ============================================================================

/// What a raster allows callers to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    NoAccess,
    #[default]
    Read,
    Write,
    ReadWrite,
}

impl AccessPolicy {
    pub fn can_read(self) -> bool {
        matches!(self, AccessPolicy::Read | AccessPolicy::ReadWrite)
    }
}

/// Geo-referencing of a raster: pixel size and the upper-left corner.
///
/// Grid coordinates address pixel centres, `(0, 0)` being the centre of the
/// upper-left pixel. Rows grow southwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub columns: usize,
    pub rows: usize,
    pub resolution_x: f64,
    pub resolution_y: f64,
    /// Geographic coordinate of the upper-left corner of the first pixel.
    pub upper_left: DVec2,
}

impl RasterGrid {
    /// A unit-resolution grid whose geo coordinates mirror pixel indices.
    pub fn new(columns: usize, rows: usize) -> Self {
        Self {
            columns,
            rows,
            resolution_x: 1.0,
            resolution_y: 1.0,
            upper_left: DVec2::new(0.0, rows as f64),
        }
    }

    pub fn with_resolution(mut self, resolution_x: f64, resolution_y: f64) -> Self {
        self.resolution_x = resolution_x;
        self.resolution_y = resolution_y;
        self
    }

    pub fn with_upper_left(mut self, upper_left: DVec2) -> Self {
        self.upper_left = upper_left;
        self
    }

    /// `(column, row)` → geographic coordinate.
    pub fn grid_to_geo(&self, grid: DVec2) -> DVec2 {
        DVec2::new(
            self.upper_left.x + (grid.x + 0.5) * self.resolution_x,
            self.upper_left.y - (grid.y + 0.5) * self.resolution_y,
        )
    }

    /// Geographic coordinate → `(column, row)`.
    pub fn geo_to_grid(&self, geo: DVec2) -> DVec2 {
        DVec2::new(
            (geo.x - self.upper_left.x) / self.resolution_x - 0.5,
            (self.upper_left.y - geo.y) / self.resolution_y - 0.5,
        )
    }
}

/// Read access to a multi-band raster.
pub trait Raster: Send + Sync {
    fn bands(&self) -> usize;

    fn rows(&self) -> usize;

    fn columns(&self) -> usize;

    /// Value at `(row, column)` of `band`. Callers stay within bounds.
    fn value(&self, band: usize, row: usize, column: usize) -> f64;

    fn grid(&self) -> &RasterGrid;

    fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::Read
    }
}

/// Raster held entirely in memory, one [`Buffer2`] per band.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    bands: Vec<Buffer2<f64>>,
    grid: RasterGrid,
    access: AccessPolicy,
}

impl MemoryRaster {
    /// Zero-filled raster.
    pub fn new(columns: usize, rows: usize, bands: usize) -> Self {
        Self {
            bands: (0..bands)
                .map(|_| Buffer2::new_default(columns, rows))
                .collect(),
            grid: RasterGrid::new(columns, rows),
            access: AccessPolicy::ReadWrite,
        }
    }

    /// # Panics
    ///
    /// Panics if `bands` is empty or the bands differ in size.
    pub fn from_bands(bands: Vec<Buffer2<f64>>) -> Self {
        assert!(!bands.is_empty(), "raster needs at least one band");
        let (columns, rows) = (bands[0].width(), bands[0].height());
        assert!(
            bands
                .iter()
                .all(|b| b.width() == columns && b.height() == rows),
            "all bands must have the same size"
        );
        Self {
            bands,
            grid: RasterGrid::new(columns, rows),
            access: AccessPolicy::ReadWrite,
        }
    }

    /// Single-band raster whose pixels are `f(column, row)`.
    pub fn from_fn(columns: usize, rows: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut band = Buffer2::new_default(columns, rows);
        for row in 0..rows {
            for (column, v) in band.row_mut(row).iter_mut().enumerate() {
                *v = f(column, row);
            }
        }
        Self::from_bands(vec![band])
    }

    pub fn with_grid(mut self, grid: RasterGrid) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_access_policy(mut self, access: AccessPolicy) -> Self {
        self.access = access;
        self
    }

    pub fn band(&self, band: usize) -> &Buffer2<f64> {
        &self.bands[band]
    }

    pub fn set_value(&mut self, band: usize, row: usize, column: usize, value: f64) {
        self.bands[band][(column, row)] = value;
    }
}

impl Raster for MemoryRaster {
    fn bands(&self) -> usize {
        self.bands.len()
    }

    fn rows(&self) -> usize {
        self.grid.rows
    }

    fn columns(&self) -> usize {
        self.grid.columns
    }

    #[inline]
    fn value(&self, band: usize, row: usize, column: usize) -> f64 {
        self.bands[band][(column, row)]
    }

    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn access_policy(&self) -> AccessPolicy {
        self.access
    }
}

// ============================================================================
// Interpolation
// ============================================================================

/// Resampling method used when a raster window is rescaled.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum InterpolationMethod {
    #[default]
    Nearest,
    Bilinear,
    /// Catmull-Rom cubic convolution.
    Bicubic,
}

/// Samples one raster at fractional `(column, row)` positions.
///
/// Positions outside the raster are clamped to the nearest edge pixel.
pub struct Interpolator<'a> {
    raster: &'a dyn Raster,
    method: InterpolationMethod,
}

impl<'a> Interpolator<'a> {
    pub fn new(raster: &'a dyn Raster, method: InterpolationMethod) -> Self {
        Self { raster, method }
    }

    pub fn method(&self) -> InterpolationMethod {
        self.method
    }

    pub fn value(&self, band: usize, column: f64, row: f64) -> f64 {
        match self.method {
            InterpolationMethod::Nearest => {
                self.pixel(band, column.round() as i64, row.round() as i64)
            }
            InterpolationMethod::Bilinear => self.bilinear(band, column, row),
            InterpolationMethod::Bicubic => self.bicubic(band, column, row),
        }
    }

    #[inline]
    fn pixel(&self, band: usize, column: i64, row: i64) -> f64 {
        let column = column.clamp(0, self.raster.columns() as i64 - 1) as usize;
        let row = row.clamp(0, self.raster.rows() as i64 - 1) as usize;
        self.raster.value(band, row, column)
    }

    fn bilinear(&self, band: usize, column: f64, row: f64) -> f64 {
        let x0 = column.floor() as i64;
        let y0 = row.floor() as i64;
        let fx = column - x0 as f64;
        let fy = row - y0 as f64;

        let p00 = self.pixel(band, x0, y0);
        let p10 = self.pixel(band, x0 + 1, y0);
        let p01 = self.pixel(band, x0, y0 + 1);
        let p11 = self.pixel(band, x0 + 1, y0 + 1);

        let top = p00 + fx * (p10 - p00);
        let bottom = p01 + fx * (p11 - p01);
        top + fy * (bottom - top)
    }

    fn bicubic(&self, band: usize, column: f64, row: f64) -> f64 {
        let x0 = column.floor() as i64;
        let y0 = row.floor() as i64;
        let fx = column - x0 as f64;
        let fy = row - y0 as f64;

        let wx = [
            bicubic_kernel(fx + 1.0),
            bicubic_kernel(fx),
            bicubic_kernel(fx - 1.0),
            bicubic_kernel(fx - 2.0),
        ];
        let wy = [
            bicubic_kernel(fy + 1.0),
            bicubic_kernel(fy),
            bicubic_kernel(fy - 1.0),
            bicubic_kernel(fy - 2.0),
        ];

        let mut sum = 0.0;
        for (j, wyj) in wy.iter().enumerate() {
            let y = y0 - 1 + j as i64;
            let mut row_sum = 0.0;
            for (i, wxi) in wx.iter().enumerate() {
                row_sum += wxi * self.pixel(band, x0 - 1 + i as i64, y);
            }
            sum += wyj * row_sum;
        }
        sum
    }
}

/// Catmull-Rom cubic convolution kernel (a = -0.5).
#[inline]
pub(crate) fn bicubic_kernel(x: f64) -> f64 {
    const A: f64 = -0.5;

    let abs_x = x.abs();

    if abs_x <= 1.0 {
        ((A + 2.0) * abs_x - (A + 3.0)) * abs_x * abs_x + 1.0
    } else if abs_x < 2.0 {
        ((A * abs_x - 5.0 * A) * abs_x + 8.0 * A) * abs_x - 4.0 * A
    } else {
        0.0
    }
}

// ============================================================================
// Window loading
// ============================================================================

/// A rectangular pixel window of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetArea {
    pub first_column: usize,
    pub first_row: usize,
    pub columns: usize,
    pub rows: usize,
}

impl TargetArea {
    pub fn new(first_column: usize, first_row: usize, columns: usize, rows: usize) -> Self {
        Self {
            first_column,
            first_row,
            columns,
            rows,
        }
    }

    /// The whole raster.
    pub fn full(raster: &dyn Raster) -> Self {
        Self::new(0, 0, raster.columns(), raster.rows())
    }

    pub fn area(&self) -> usize {
        self.columns * self.rows
    }

    /// `true` when the window is non-empty and lies inside the raster.
    pub fn fits(&self, raster: &dyn Raster) -> bool {
        self.columns > 0
            && self.rows > 0
            && self.first_column + self.columns <= raster.columns()
            && self.first_row + self.rows <= raster.rows()
    }

    /// Size of the window after rescaling, truncated to whole pixels.
    pub fn rescaled_size(&self, factor_x: f64, factor_y: f64) -> (usize, usize) {
        (
            (self.columns as f64 * factor_x) as usize,
            (self.rows as f64 * factor_y) as usize,
        )
    }
}

/// Allocation settings for loaded windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    pub interpolation: InterpolationMethod,
    pub memory_policy: MemoryPolicy,
    pub memory_budget: u64,
}

/// Loads `area` of `band`, rescaled by `(factor_x, factor_y)`, min/max
/// normalised to `[0, 1]`.
///
/// A constant window loads as all zeros.
pub fn load_raster_window(
    raster: &dyn Raster,
    band: usize,
    area: &TargetArea,
    factor_x: f64,
    factor_y: f64,
    options: &LoadOptions,
) -> Result<Matrix<f32>, MatrixError> {
    let (columns, rows) = area.rescaled_size(factor_x, factor_y);

    // Samples are written straight into the matrix, stored relative to the
    // first one so large offsets keep their f32 precision.
    let mut matrix = Matrix::new(rows, columns, options.memory_policy, options.memory_budget)?;
    let interpolator = Interpolator::new(raster, options.interpolation);
    let mut reference = None;
    let mut min = f64::MAX;
    let mut max = f64::MIN;

    for out_row in 0..rows {
        let in_row = out_row as f64 / factor_y + area.first_row as f64;
        for (out_column, dst) in matrix.row_mut(out_row).iter_mut().enumerate() {
            let in_column = out_column as f64 / factor_x + area.first_column as f64;
            let v = interpolator.value(band, in_column, in_row);
            let offset = *reference.get_or_insert(v);
            *dst = (v - offset) as f32;
            min = min.min(v);
            max = max.max(v);
        }
    }

    let gain = if max > min { 1.0 / (max - min) } else { 0.0 };
    let shift = reference.unwrap_or(0.0) - min;
    for v in matrix.as_mut_slice() {
        *v = ((*v as f64 + shift) * gain).clamp(0.0, 1.0) as f32;
    }

    Ok(matrix)
}

/// Loads `area` of a mask band by nearest neighbour: 0 stays 0, anything
/// else becomes 255.
pub fn load_mask_window(
    mask: &dyn Raster,
    band: usize,
    area: &TargetArea,
    factor_x: f64,
    factor_y: f64,
    options: &LoadOptions,
) -> Result<Matrix<u8>, MatrixError> {
    let (columns, rows) = area.rescaled_size(factor_x, factor_y);
    let mut matrix = Matrix::new(rows, columns, options.memory_policy, options.memory_budget)?;

    for out_row in 0..rows {
        let in_row = ((out_row as f64 / factor_y) as usize + area.first_row)
            .min(mask.rows().saturating_sub(1));
        for (out_column, dst) in matrix.row_mut(out_row).iter_mut().enumerate() {
            let in_column = ((out_column as f64 / factor_x) as usize + area.first_column)
                .min(mask.columns().saturating_sub(1));
            *dst = if mask.value(band, in_row, in_column) == 0.0 {
                0
            } else {
                255
            };
        }
    }

    Ok(matrix)
}

/// Pixel size of raster 1 relative to raster 2 along x and y.
pub fn pixel_size_relation(grid1: &RasterGrid, grid2: &RasterGrid) -> (f64, f64) {
    (
        grid1.resolution_x / grid2.resolution_x,
        grid1.resolution_y / grid2.resolution_y,
    )
}
