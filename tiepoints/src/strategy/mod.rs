//! Interest point strategies.
//!
//! A strategy detects interest points on both rasters independently, builds a
//! feature vector for each of them and matches the two sets into mutual-best
//! pairs. [`StrategyKind`] selects one of:
//! - [`MoravecStrategy`]: directional-variance corners, rotation-normalised
//!   intensity windows compared by normalised correlation
//! - [`SurfStrategy`]: box-filter Hessian blobs, 128-element Haar descriptors
//!   compared by Euclidean distance
//!
//! Both share the raster loading, the spatially balanced candidate sets
//! ([`SectorGrid`]) and the matching kernel in `matching`.

#[cfg(test)]
mod tests;

pub(crate) mod matching;
pub mod moravec;
pub mod surf;

pub use moravec::{MoravecConfig, MoravecStrategy};
pub use surf::{SurfConfig, SurfStrategy};

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::{LocatorError, MatrixError};
use crate::matrix::{Matrix, MemoryPolicy};
use crate::raster::{
    InterpolationMethod, LoadOptions, Raster, TargetArea, load_mask_window, load_raster_window,
};
use crate::transform::GeometricTransformation;

// ============================================================================
// Interest points
// ============================================================================

/// A detected pixel in a working (loaded and rescaled) raster window.
///
/// Feature meaning depends on the strategy. Moravec: `feature1` is the corner
/// response. SURF: `feature1` is the Hessian response, `feature2` the filter
/// size and `feature3` the Laplacian sign.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InterestPoint {
    pub x: usize,
    pub y: usize,
    pub feature1: f64,
    pub feature2: f64,
    pub feature3: f64,
}

impl InterestPoint {
    pub fn new(x: usize, y: usize, feature1: f64) -> Self {
        Self {
            x,
            y,
            feature1,
            ..Default::default()
        }
    }
}

impl Eq for InterestPoint {}

impl Ord for InterestPoint {
    /// Weakest first: by `feature1`, then position, then the other features.
    fn cmp(&self, other: &Self) -> Ordering {
        self.feature1
            .total_cmp(&other.feature1)
            .then(self.x.cmp(&other.x))
            .then(self.y.cmp(&other.y))
            .then(self.feature2.total_cmp(&other.feature2))
            .then(self.feature3.total_cmp(&other.feature3))
    }
}

impl PartialOrd for InterestPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keeps at most `capacity` of the strongest points offered to it.
#[derive(Debug, Clone)]
pub struct InterestPointSet {
    points: BTreeSet<InterestPoint>,
    capacity: usize,
}

impl InterestPointSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: BTreeSet::new(),
            capacity,
        }
    }

    /// Offers `point`; the weakest point is evicted when the set is full.
    pub fn insert(&mut self, point: InterestPoint) {
        if self.capacity == 0 {
            return;
        }
        if self.points.len() < self.capacity {
            self.points.insert(point);
            return;
        }
        let beats_weakest = self.points.first().is_some_and(|weakest| point > *weakest);
        if beats_weakest && self.points.insert(point) {
            self.points.pop_first();
        }
    }

    pub fn merge(&mut self, other: InterestPointSet) {
        for point in other.points {
            self.insert(point);
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Points from weakest to strongest.
    pub fn iter(&self) -> impl Iterator<Item = &InterestPoint> {
        self.points.iter()
    }
}

/// Splits a working window into `split x split` sectors, each keeping its own
/// strongest points so candidates are spread over the whole window.
#[derive(Debug, Clone)]
pub struct SectorGrid {
    columns: usize,
    rows: usize,
    split: usize,
    max_points: usize,
    sectors: Vec<InterestPointSet>,
}

impl SectorGrid {
    /// `split` of 0 or 1 keeps one sector.
    pub fn new(columns: usize, rows: usize, split: usize, max_points: usize) -> Self {
        let split = split.max(1);
        let per_sector = max_points.div_ceil(split * split);
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
            split,
            max_points,
            sectors: vec![InterestPointSet::new(per_sector); split * split],
        }
    }

    /// An empty grid with the same geometry, for worker-local collection.
    pub fn empty_like(&self) -> Self {
        Self::new(self.columns, self.rows, self.split, self.max_points)
    }

    fn sector_index(&self, x: usize, y: usize) -> usize {
        let sx = (x * self.split / self.columns).min(self.split - 1);
        let sy = (y * self.split / self.rows).min(self.split - 1);
        sy * self.split + sx
    }

    pub fn insert(&mut self, point: InterestPoint) {
        let idx = self.sector_index(point.x, point.y);
        self.sectors[idx].insert(point);
    }

    pub fn merge(&mut self, other: SectorGrid) {
        debug_assert_eq!(self.sectors.len(), other.sectors.len());
        for (dst, src) in self.sectors.iter_mut().zip(other.sectors) {
            dst.merge(src);
        }
    }

    /// All kept points, trimmed to the strongest `max_points`, weakest first.
    pub fn into_points(self) -> Vec<InterestPoint> {
        let mut points: Vec<InterestPoint> = self
            .sectors
            .into_iter()
            .flat_map(|sector| sector.points)
            .collect();
        points.sort_unstable();
        let excess = points.len().saturating_sub(self.max_points);
        points.drain(..excess);
        points
    }
}

/// Two matched interest points in their rasters' pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub point1: DVec2,
    pub point2: DVec2,
    /// Match quality combined with feature strength; higher is better.
    pub score: f64,
}

// ============================================================================
// Strategy parameters
// ============================================================================

/// Which interest point strategy to run.
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
pub enum StrategyKind {
    #[default]
    Moravec,
    #[strum(serialize = "SURF")]
    #[serde(rename = "SURF")]
    Surf,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn InterestPointStrategy> {
        match self {
            StrategyKind::Moravec => Box::new(MoravecStrategy::default()),
            StrategyKind::Surf => Box::new(SurfStrategy::default()),
        }
    }
}

/// One raster taking part in a location run.
#[derive(Clone)]
pub struct RasterInput {
    pub raster: Arc<dyn Raster>,
    pub bands: Vec<usize>,
    pub area: TargetArea,
    /// One-band mask; zero pixels are excluded from detection.
    pub mask: Option<Arc<dyn Raster>>,
}

impl std::fmt::Debug for RasterInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterInput")
            .field("columns", &self.raster.columns())
            .field("rows", &self.raster.rows())
            .field("bands", &self.bands)
            .field("area", &self.area)
            .field("mask", &self.mask.is_some())
            .finish()
    }
}

impl RasterInput {
    /// The whole raster, first band, no mask.
    pub fn new(raster: Arc<dyn Raster>) -> Self {
        let area = TargetArea::full(raster.as_ref());
        Self {
            raster,
            bands: vec![0],
            area,
            mask: None,
        }
    }

    pub fn with_bands(mut self, bands: Vec<usize>) -> Self {
        self.bands = bands;
        self
    }

    pub fn with_area(mut self, area: TargetArea) -> Self {
        self.area = area;
        self
    }

    pub fn with_mask(mut self, mask: Arc<dyn Raster>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// The single band a strategy works on.
    pub(crate) fn single_band(&self, raster: u8) -> Result<usize, LocatorError> {
        match self.bands.as_slice() {
            &[band] => Ok(band),
            bands => Err(LocatorError::InvalidBands {
                raster,
                reason: format!("exactly one band is required, got {}", bands.len()),
            }),
        }
    }
}

/// Everything a strategy needs for one run.
#[derive(Debug, Clone)]
pub struct StrategyParameters {
    pub raster1: RasterInput,
    pub raster2: RasterInput,
    /// Maximum number of tie-points; 0 = derived from the target areas.
    pub max_tie_points: usize,
    /// Raster 1 pixel size divided by raster 2 pixel size.
    pub pixel_size_x_relation: f64,
    pub pixel_size_y_relation: f64,
    /// Extra rescale applied to both rasters, in (0, 1].
    pub subsample_factor: f64,
    pub sub_sectors_split_factor: usize,
    /// Maximum raster 1 to raster 2 coordinate offset in pixels; 0 = off.
    pub max_r1_to_r2_offset: f64,
    pub interpolation: InterpolationMethod,
    pub memory_policy: MemoryPolicy,
    pub max_memory_percent: f64,
    pub enable_multi_thread: bool,
    pub moravec: MoravecConfig,
    pub surf: SurfConfig,
}

impl StrategyParameters {
    pub fn new(raster1: RasterInput, raster2: RasterInput) -> Self {
        Self {
            raster1,
            raster2,
            max_tie_points: 0,
            pixel_size_x_relation: 1.0,
            pixel_size_y_relation: 1.0,
            subsample_factor: 1.0,
            sub_sectors_split_factor: 3,
            max_r1_to_r2_offset: 0.0,
            interpolation: InterpolationMethod::default(),
            memory_policy: MemoryPolicy::default(),
            max_memory_percent: 40.0,
            enable_multi_thread: true,
            moravec: MoravecConfig::default(),
            surf: SurfConfig::default(),
        }
    }
}

/// Contract shared by every interest point strategy.
pub trait InterestPointStrategy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// Validates and stores `params`. A `max_tie_points` of 0 is replaced by
    /// [`InterestPointStrategy::auto_max_tie_points`].
    fn initialize(&mut self, params: StrategyParameters) -> Result<(), LocatorError>;

    fn reset(&mut self);

    fn is_initialized(&self) -> bool;

    /// Detects, describes and matches interest points on both rasters.
    ///
    /// With a `prior` transformation, a raster 1 point is only compared with
    /// raster 2 points within `expected_error` pixels of its mapped position.
    fn matched_interest_points(
        &self,
        prior: Option<&GeometricTransformation>,
        expected_error: f64,
    ) -> Result<Vec<MatchedPair>, LocatorError>;

    /// Tie-points budget derived from the target areas and available memory.
    fn auto_max_tie_points(&self, params: &StrategyParameters) -> usize;

    /// `params` with strategy-specific knobs shrunk for rasters rescaled by
    /// `factor`.
    fn subsampled_parameters(&self, factor: f64, params: &StrategyParameters)
    -> StrategyParameters;
}

// ============================================================================
// Shared helpers
// ============================================================================

/// How a raster's target area maps onto its loaded working window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WorkingWindow {
    pub area: TargetArea,
    pub factor_x: f64,
    pub factor_y: f64,
}

impl WorkingWindow {
    pub fn size(&self) -> (usize, usize) {
        self.area.rescaled_size(self.factor_x, self.factor_y)
    }

    pub fn working_area(&self) -> usize {
        let (columns, rows) = self.size();
        columns * rows
    }

    /// Working pixel to raster pixel coordinates.
    pub fn to_raster(&self, x: usize, y: usize) -> DVec2 {
        DVec2::new(
            x as f64 / self.factor_x + self.area.first_column as f64,
            y as f64 / self.factor_y + self.area.first_row as f64,
        )
    }
}

/// Working windows for both rasters, equalising pixel sizes and applying the
/// subsample factor.
pub(crate) fn working_windows(params: &StrategyParameters) -> (WorkingWindow, WorkingWindow) {
    let (r1x, r2x) = relation_factors(params.pixel_size_x_relation);
    let (r1y, r2y) = relation_factors(params.pixel_size_y_relation);
    let s = params.subsample_factor;

    (
        WorkingWindow {
            area: params.raster1.area,
            factor_x: r1x * s,
            factor_y: r1y * s,
        },
        WorkingWindow {
            area: params.raster2.area,
            factor_x: r2x * s,
            factor_y: r2y * s,
        },
    )
}

/// The raster with smaller pixels is shrunk to the other's pixel size.
fn relation_factors(relation: f64) -> (f64, f64) {
    if relation > 1.0 {
        (1.0, 1.0 / relation)
    } else if relation < 1.0 {
        (relation, 1.0)
    } else {
        (1.0, 1.0)
    }
}

/// Splits `max_tie_points` into per-raster interest point budgets: the larger
/// working window gets proportionally more points.
pub(crate) fn per_raster_max_points(
    max_tie_points: usize,
    area1: usize,
    area2: usize,
) -> (usize, usize) {
    if area1 == 0 || area2 == 0 {
        return (max_tie_points, max_tie_points);
    }
    let scale = |larger: usize, smaller: usize| {
        (max_tie_points as f64 * larger as f64 / smaller as f64) as usize
    };
    if area1 > area2 {
        (scale(area1, area2), max_tie_points)
    } else if area2 > area1 {
        (max_tie_points, scale(area2, area1))
    } else {
        (max_tie_points, max_tie_points)
    }
}

/// Tie-points budget: one point per `4 * window^2` pixels of the larger area,
/// capped so a `points x feature_len` feature matrix plus a `points x points`
/// match matrix fit in 40 % of `available_memory`.
pub(crate) fn auto_max_tie_points(
    max_area: usize,
    max_window: usize,
    feature_len: usize,
    available_memory: u64,
) -> usize {
    let by_area = max_area / (4 * max_window * max_window).max(1);

    let free = 0.4 * available_memory as f64;
    let feat = feature_len as f64;
    let by_memory = ((feat * feat + free / size_of::<f32>() as f64).sqrt() - feat).max(0.0);

    by_area.min(by_memory as usize)
}

/// Validation shared by both strategies for the common tunables.
pub(crate) fn validate_common(params: &StrategyParameters) -> Result<(), LocatorError> {
    params.raster1.single_band(1)?;
    params.raster2.single_band(2)?;

    for (name, value) in [
        ("pixel_size_x_relation", params.pixel_size_x_relation),
        ("pixel_size_y_relation", params.pixel_size_y_relation),
    ] {
        if !(value.is_finite() && value > 0.0) {
            return Err(LocatorError::invalid(name, "must be a positive number"));
        }
    }
    if !(params.subsample_factor > 0.0 && params.subsample_factor <= 1.0) {
        return Err(LocatorError::invalid(
            "subsample_factor",
            "must be within (0, 1]",
        ));
    }
    if params.max_r1_to_r2_offset.is_nan() || params.max_r1_to_r2_offset < 0.0 {
        return Err(LocatorError::invalid(
            "max_r1_to_r2_offset",
            "must be non-negative",
        ));
    }
    if !(params.max_memory_percent > 0.0 && params.max_memory_percent <= 100.0) {
        return Err(LocatorError::invalid(
            "max_memory_percent",
            "must be within (0, 100]",
        ));
    }
    Ok(())
}

/// A loaded working raster and its optional mask.
pub(crate) struct WorkingRaster {
    pub data: Matrix<f32>,
    pub mask: Option<Matrix<u8>>,
}

pub(crate) fn load_working_raster(
    input: &RasterInput,
    window: &WorkingWindow,
    options: &LoadOptions,
) -> Result<WorkingRaster, MatrixError> {
    let band = input.bands.first().copied().unwrap_or(0);
    let data = load_raster_window(
        input.raster.as_ref(),
        band,
        &window.area,
        window.factor_x,
        window.factor_y,
        options,
    )?;
    let mask = input
        .mask
        .as_ref()
        .map(|mask| {
            load_mask_window(
                mask.as_ref(),
                0,
                &window.area,
                window.factor_x,
                window.factor_y,
                options,
            )
        })
        .transpose()?;

    Ok(WorkingRaster { data, mask })
}

/// Maps `feature1` values of a point set linearly onto `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FeatureNormalizer {
    min: f64,
    gain: f64,
}

impl FeatureNormalizer {
    pub fn new(points: &[InterestPoint]) -> Self {
        let (min, max) = points.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| {
            (lo.min(p.feature1), hi.max(p.feature1))
        });
        let gain = if max > min { 1.0 / (max - min) } else { 0.0 };
        Self { min, gain }
    }

    pub fn normalize(&self, value: f64) -> f64 {
        (value - self.min) * self.gain
    }
}

/// Final match score: twice the match similarity plus the weaker of the two
/// normalised point strengths.
pub(crate) fn match_score(similarity: f64, strength1: f64, strength2: f64) -> f64 {
    2.0 * similarity + strength1.min(strength2)
}
