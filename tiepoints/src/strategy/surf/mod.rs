//! SURF-like blob strategy.
//!
//! Works on the integral image of each working raster:
//! - box-filter approximations of the second derivatives (Dxx, Dyy, Dxy)
//!   give a Hessian determinant response `Dxx*Dyy - (0.9*Dxy)^2` per scale
//! - octave `o` uses filter step `2^(o+1)`, base size `3 + 3*step` and filter
//!   size `base + 3*step*scale`
//! - maxima in a 3x3x3 scale-space neighbourhood become interest points,
//!   tagged with filter size and Laplacian sign
//! - a dominant orientation from Haar responses rotates a 4x4 grid of
//!   sub-regions, each contributing 8 sums (128 values, L2-normalised)
//!
//! Matching compares descriptors by Euclidean distance and only pairs points
//! with the same Laplacian sign. The filter size (`feature2`) is kept on each
//! point but not compared: the same blob is often the strongest response at
//! neighbouring scales in the two rasters, and requiring equal sizes would
//! drop those pairs.

#[cfg(test)]
mod tests;

use std::f64::consts::{PI, SQRT_2, TAU};

use common::Buffer2;
use common::parallel::{self, WorkCounter};
use glam::DVec2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::matching::{SearchRegion, match_mutual_best};
use super::{
    FeatureNormalizer, InterestPoint, InterestPointStrategy, MatchedPair, RasterInput,
    SectorGrid, StrategyKind, StrategyParameters, WorkingRaster, WorkingWindow,
    auto_max_tie_points, load_working_raster, match_score, per_raster_max_points,
    validate_common, working_windows,
};
use crate::error::{LocatorError, MatrixError};
use crate::matrix::{self, Matrix, MemoryPolicy};
use crate::raster::LoadOptions;
use crate::transform::GeometricTransformation;

/// Descriptor length: 4x4 sub-regions of 8 sums.
pub const DESCRIPTOR_LEN: usize = 128;

/// Dxy weight balancing the box approximation against Gaussian derivatives.
const DXY_WEIGHT: f64 = 0.9;

/// Orientation windows evaluated around the circle.
const ORIENTATION_STEPS: usize = 42;

/// Minimum lines per detection work unit.
const MIN_BLOCK_LINES: usize = 16;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfConfig {
    /// Scales per octave, at least 3.
    pub scales_number: usize,
    /// At least 1.
    pub octaves_number: usize,
    /// Maximum descriptor distance of a match, as a fraction of the largest
    /// possible distance between unit descriptors, in [0, 1].
    pub max_normalized_distance: f64,
}

impl Default for SurfConfig {
    fn default() -> Self {
        Self {
            scales_number: 4,
            octaves_number: 2,
            max_normalized_distance: 0.75,
        }
    }
}

impl SurfConfig {
    pub fn validate(&self) -> Result<(), LocatorError> {
        if self.scales_number < 3 {
            return Err(LocatorError::invalid("surf.scales_number", "must be >= 3"));
        }
        if self.octaves_number == 0 {
            return Err(LocatorError::invalid("surf.octaves_number", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.max_normalized_distance) {
            return Err(LocatorError::invalid(
                "surf.max_normalized_distance",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Largest filter size used by this configuration.
    pub fn max_filter_size(&self) -> usize {
        filter_size(
            self.octaves_number.saturating_sub(1),
            self.scales_number.saturating_sub(1),
        )
    }
}

pub fn octave_filter_step(octave: usize) -> usize {
    1 << (octave + 1)
}

pub fn octave_base_filter_size(octave: usize) -> usize {
    3 + 3 * octave_filter_step(octave)
}

pub fn filter_size(octave: usize, scale: usize) -> usize {
    octave_base_filter_size(octave) + 3 * octave_filter_step(octave) * scale
}

// ============================================================================
// Strategy
// ============================================================================

#[derive(Debug, Default)]
pub struct SurfStrategy {
    state: Option<State>,
}

#[derive(Debug)]
struct State {
    params: StrategyParameters,
    memory_budget: u64,
}

struct DescribedPoints {
    points: Vec<InterestPoint>,
    descriptors: Matrix<f32>,
    positions: Vec<DVec2>,
}

impl InterestPointStrategy for SurfStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Surf
    }

    fn initialize(&mut self, mut params: StrategyParameters) -> Result<(), LocatorError> {
        self.state = None;

        validate_common(&params)?;
        params.surf.validate()?;

        if params.max_tie_points == 0 {
            params.max_tie_points = self.auto_max_tie_points(&params);
        }

        let memory_budget =
            matrix::memory_budget(matrix::available_memory(), params.max_memory_percent);

        tracing::debug!(
            max_tie_points = params.max_tie_points,
            scales = params.surf.scales_number,
            octaves = params.surf.octaves_number,
            memory_budget,
            "SURF strategy initialized"
        );

        self.state = Some(State {
            params,
            memory_budget,
        });
        Ok(())
    }

    fn reset(&mut self) {
        self.state = None;
    }

    fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn matched_interest_points(
        &self,
        prior: Option<&GeometricTransformation>,
        expected_error: f64,
    ) -> Result<Vec<MatchedPair>, LocatorError> {
        let state = self.state.as_ref().ok_or(LocatorError::NotInitialized)?;
        let params = &state.params;
        let workers = parallel::worker_count(params.enable_multi_thread);

        let (window1, window2) = working_windows(params);
        let (max_points1, max_points2) = per_raster_max_points(
            params.max_tie_points,
            window1.working_area(),
            window2.working_area(),
        );
        let options = LoadOptions {
            interpolation: params.interpolation,
            memory_policy: params.memory_policy,
            memory_budget: state.memory_budget,
        };

        let set1 = describe_raster(params, &params.raster1, &window1, max_points1, &options, workers)?;
        let set2 = describe_raster(params, &params.raster2, &window2, max_points2, &options, workers)?;

        let region = SearchRegion::new(prior, expected_error, params.max_r1_to_r2_offset);
        let max_distance = params.surf.max_normalized_distance;
        let matches = match_mutual_best(
            &set1.positions,
            &set2.positions,
            region,
            workers,
            |i, j| {
                descriptor_similarity(
                    (&set1.points[i], set1.descriptors.row(i)),
                    (&set2.points[j], set2.descriptors.row(j)),
                    max_distance,
                )
            },
        )?;

        let normalizer1 = FeatureNormalizer::new(&set1.points);
        let normalizer2 = FeatureNormalizer::new(&set2.points);
        let pairs: Vec<MatchedPair> = matches
            .iter()
            .map(|m| MatchedPair {
                point1: set1.positions[m.index1],
                point2: set2.positions[m.index2],
                score: match_score(
                    m.similarity,
                    normalizer1.normalize(set1.points[m.index1].feature1),
                    normalizer2.normalize(set2.points[m.index2].feature1),
                ),
            })
            .collect();

        tracing::info!(
            points1 = set1.points.len(),
            points2 = set2.points.len(),
            matches = pairs.len(),
            constrained = prior.is_some(),
            "SURF matching finished"
        );

        Ok(pairs)
    }

    fn auto_max_tie_points(&self, params: &StrategyParameters) -> usize {
        let max_area = params.raster1.area.area().max(params.raster2.area.area());
        auto_max_tie_points(
            max_area,
            params.surf.max_filter_size(),
            DESCRIPTOR_LEN,
            matrix::available_memory(),
        )
    }

    /// Drops one octave for every halving of the raster size.
    fn subsampled_parameters(
        &self,
        factor: f64,
        params: &StrategyParameters,
    ) -> StrategyParameters {
        let halvings = if factor > 0.0 && factor < 1.0 {
            (1.0 / factor).log2().floor() as usize
        } else {
            0
        };
        let mut scaled = params.clone();
        scaled.surf.octaves_number = params.surf.octaves_number.saturating_sub(halvings).max(1);
        scaled
    }
}

fn describe_raster(
    params: &StrategyParameters,
    input: &RasterInput,
    window: &WorkingWindow,
    max_points: usize,
    options: &LoadOptions,
    workers: usize,
) -> Result<DescribedPoints, LocatorError> {
    let WorkingRaster { data, mask } = load_working_raster(input, window, options)?;
    let integral = IntegralImage::new(&data, options.memory_policy, options.memory_budget)?;

    let candidates = locate_interest_points(
        &integral,
        mask.as_ref(),
        &params.surf,
        max_points,
        params.sub_sectors_split_factor,
        workers,
    )?;

    let (points, descriptors) = generate_descriptors(
        &candidates,
        &integral,
        options.memory_policy,
        options.memory_budget,
    )?;
    let positions = points.iter().map(|p| window.to_raster(p.x, p.y)).collect();

    Ok(DescribedPoints {
        points,
        descriptors,
        positions,
    })
}

// ============================================================================
// Integral image
// ============================================================================

/// Summed-area table: `sum(x, y)` is the sum of all pixels in `[0, x] x [0, y]`.
#[derive(Debug)]
pub struct IntegralImage {
    sums: Matrix<f64>,
}

impl IntegralImage {
    pub fn new(data: &Matrix<f32>, policy: MemoryPolicy, budget: u64) -> Result<Self, MatrixError> {
        let mut sums = Matrix::<f64>::new(data.lines(), data.columns(), policy, budget)?;
        let columns = data.columns();
        let mut previous = vec![0.0f64; columns];

        for line in 0..data.lines() {
            let mut running = 0.0f64;
            let out = sums.row_mut(line);
            for (col, &value) in data.row(line).iter().enumerate() {
                running += f64::from(value);
                out[col] = previous[col] + running;
            }
            previous.copy_from_slice(out);
        }

        Ok(Self { sums })
    }

    pub fn columns(&self) -> usize {
        self.sums.columns()
    }

    pub fn lines(&self) -> usize {
        self.sums.lines()
    }

    /// Sum over the inclusive box `[x0, x1] x [y0, y1]`.
    #[inline]
    pub fn box_sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        debug_assert!(x0 <= x1 && y0 <= y1);
        let at = |x: usize, y: usize| self.sums.row(y)[x];

        let mut sum = at(x1, y1);
        if y0 > 0 {
            sum -= at(x1, y0 - 1);
        }
        if x0 > 0 {
            sum -= at(x0 - 1, y1);
        }
        if x0 > 0 && y0 > 0 {
            sum += at(x0 - 1, y0 - 1);
        }
        sum
    }

    /// Right half minus left half of the `(2r+1)` square around `(x, y)`.
    #[inline]
    pub fn haar_x(&self, x: usize, y: usize, r: usize) -> f64 {
        self.box_sum(x + 1, y - r, x + r, y + r) - self.box_sum(x - r, y - r, x - 1, y + r)
    }

    /// Lower half minus upper half of the `(2r+1)` square around `(x, y)`.
    #[inline]
    pub fn haar_y(&self, x: usize, y: usize, r: usize) -> f64 {
        self.box_sum(x - r, y + 1, x + r, y + r) - self.box_sum(x - r, y - r, x + r, y - 1)
    }
}

// ============================================================================
// Hessian response
// ============================================================================

/// Hessian determinant response and Laplacian sign of a `filter` sized box
/// filter centred at `(x, y)`. The filter must fit inside the image.
pub fn hessian_response(integral: &IntegralImage, x: usize, y: usize, filter: usize) -> (f64, f64) {
    let lobe = filter / 3;
    let lobe_radius = lobe / 2;

    let dyy = integral.box_sum(
        x + 1 - lobe,
        y - lobe - lobe_radius,
        x + lobe - 1,
        y + lobe + lobe_radius,
    ) - 3.0
        * integral.box_sum(x + 1 - lobe, y - lobe_radius, x + lobe - 1, y + lobe_radius);

    let dxx = integral.box_sum(
        x - lobe - lobe_radius,
        y + 1 - lobe,
        x + lobe + lobe_radius,
        y + lobe - 1,
    ) - 3.0
        * integral.box_sum(x - lobe_radius, y + 1 - lobe, x + lobe_radius, y + lobe - 1);

    let dxy = integral.box_sum(x - lobe, y - lobe, x - 1, y - 1)
        + integral.box_sum(x + 1, y + 1, x + lobe, y + lobe)
        - integral.box_sum(x + 1, y - lobe, x + lobe, y - 1)
        - integral.box_sum(x - lobe, y + 1, x - 1, y + lobe);

    let area = (filter * filter) as f64;
    let (dxx, dyy, dxy) = (dxx / area, dyy / area, dxy / area);

    let response = dxx * dyy - (DXY_WEIGHT * dxy) * (DXY_WEIGHT * dxy);
    let laplacian = if dxx + dyy >= 0.0 { 1.0 } else { -1.0 };
    (response, laplacian)
}

/// Blob centres over all octaves, at most `max_points`, spread over
/// `split x split` sectors.
pub fn locate_interest_points(
    integral: &IntegralImage,
    mask: Option<&Matrix<u8>>,
    config: &SurfConfig,
    max_points: usize,
    split: usize,
    workers: usize,
) -> Result<Vec<InterestPoint>, rayon::ThreadPoolBuildError> {
    let lines = integral.lines();
    let columns = integral.columns();
    if max_points == 0 || lines == 0 || columns == 0 {
        return Ok(Vec::new());
    }

    let block_size = if workers > 1 {
        MIN_BLOCK_LINES.max(lines.div_ceil(workers))
    } else {
        lines
    };
    let blocks = lines.div_ceil(block_size);

    let grid = Mutex::new(SectorGrid::new(columns, lines, split, max_points));
    let counter = WorkCounter::new(blocks * config.octaves_number);

    parallel::broadcast_workers(workers, |_| {
        let mut local = grid.lock().empty_like();

        while let Some(unit) = counter.next_unit() {
            let octave = unit / blocks;
            let first_y = (unit % blocks) * block_size;
            let end_y = (first_y + block_size).min(lines);
            locate_octave_block(integral, mask, config, octave, first_y, end_y, &mut local);
        }

        grid.lock().merge(local);
    })?;

    let points = grid.into_inner().into_points();
    tracing::debug!(points = points.len(), max_points, "SURF interest points located");
    Ok(points)
}

/// Scale-space maxima of one octave with `y` in `first_y..end_y`.
fn locate_octave_block(
    integral: &IntegralImage,
    mask: Option<&Matrix<u8>>,
    config: &SurfConfig,
    octave: usize,
    first_y: usize,
    end_y: usize,
    out: &mut SectorGrid,
) {
    let lines = integral.lines();
    let columns = integral.columns();
    let scales = config.scales_number;

    // Every scale of the octave, and their neighbours, must fit.
    let margin = filter_size(octave, scales - 1) / 2 + 1;
    if lines < 2 * margin + 1 || columns < 2 * margin + 1 {
        return;
    }
    let y_from = first_y.max(margin);
    let y_to = end_y.min(lines - margin);
    if y_from >= y_to {
        return;
    }

    // Responses for lines y_from - 1 ..= y_to, row 0 = y_from - 1.
    let height = y_to - y_from + 2;
    let mut responses: Vec<Buffer2<f32>> = (0..scales)
        .map(|_| Buffer2::new_default(columns, height))
        .collect();
    let mut laplacians: Vec<Buffer2<f32>> = (0..scales)
        .map(|_| Buffer2::new_default(columns, height))
        .collect();

    for scale in 0..scales {
        let filter = filter_size(octave, scale);
        for row in 0..height {
            let y = y_from - 1 + row;
            for x in margin - 1..=columns - margin {
                let (response, laplacian) = hessian_response(integral, x, y, filter);
                *responses[scale].get_mut(x, row) = response as f32;
                *laplacians[scale].get_mut(x, row) = laplacian as f32;
            }
        }
    }

    for scale in 1..scales - 1 {
        let filter = filter_size(octave, scale) as f64;
        for y in y_from..y_to {
            let row = y - y_from + 1;
            for x in margin..columns - margin {
                if let Some(mask) = mask {
                    if mask.row(y)[x] == 0 {
                        continue;
                    }
                }
                let center = *responses[scale].get(x, row);
                if center <= 0.0 || !is_scale_space_maximum(&responses, scale, x, row, center) {
                    continue;
                }
                out.insert(InterestPoint {
                    x,
                    y,
                    feature1: f64::from(center),
                    feature2: filter,
                    feature3: f64::from(*laplacians[scale].get(x, row)),
                });
            }
        }
    }
}

fn is_scale_space_maximum(
    responses: &[Buffer2<f32>],
    scale: usize,
    x: usize,
    row: usize,
    center: f32,
) -> bool {
    for layer in &responses[scale - 1..=scale + 1] {
        for r in row - 1..=row + 1 {
            for c in x - 1..=x + 1 {
                if *layer.get(c, r) > center {
                    return false;
                }
            }
        }
    }
    true
}

// ============================================================================
// Descriptors
// ============================================================================

/// Sampling scale of a filter size.
fn filter_scale(filter: f64) -> f64 {
    1.2 * filter / 9.0
}

/// Distance from a point to the farthest pixel its descriptor reads.
fn descriptor_margin(scale: f64) -> usize {
    (10.0 * scale * SQRT_2).ceil() as usize + haar_radius(scale) + 2
}

fn haar_radius(scale: f64) -> usize {
    (scale.round() as usize).max(1)
}

fn gaussian(d2: f64, sigma: f64) -> f64 {
    (-d2 / (2.0 * sigma * sigma)).exp()
}

/// Builds one 128-element descriptor row per point whose rotated descriptor
/// window fits in the image. Returns the kept points and their rows.
pub fn generate_descriptors(
    points: &[InterestPoint],
    integral: &IntegralImage,
    policy: MemoryPolicy,
    budget: u64,
) -> Result<(Vec<InterestPoint>, Matrix<f32>), MatrixError> {
    let columns = integral.columns();
    let lines = integral.lines();

    let valid: Vec<InterestPoint> = points
        .iter()
        .filter(|p| {
            let margin = descriptor_margin(filter_scale(p.feature2));
            p.x >= margin && p.y >= margin && p.x + margin < columns && p.y + margin < lines
        })
        .copied()
        .collect();

    let mut descriptors = Matrix::new(valid.len(), DESCRIPTOR_LEN, policy, budget)?;
    for (idx, point) in valid.iter().enumerate() {
        let scale = filter_scale(point.feature2);
        let angle = orientation(integral, point.x, point.y, scale);
        describe(integral, point.x, point.y, scale, angle, descriptors.row_mut(idx));
    }

    Ok((valid, descriptors))
}

/// Dominant gradient direction from Gaussian-weighted Haar responses within
/// `6 * scale`, summed over sliding windows of pi/3.
pub fn orientation(integral: &IntegralImage, x: usize, y: usize, scale: f64) -> f64 {
    let radius = haar_radius(2.0 * scale);
    let mut samples = Vec::with_capacity(113);

    for j in -6i64..=6 {
        for i in -6i64..=6 {
            let d2 = (i * i + j * j) as f64;
            if d2 >= 36.0 {
                continue;
            }
            let sx = (x as f64 + i as f64 * scale).round() as usize;
            let sy = (y as f64 + j as f64 * scale).round() as usize;
            let weight = gaussian(d2, 2.5);
            let dx = weight * integral.haar_x(sx, sy, radius);
            let dy = weight * integral.haar_y(sx, sy, radius);
            if dx != 0.0 || dy != 0.0 {
                samples.push((dy.atan2(dx), DVec2::new(dx, dy)));
            }
        }
    }

    let mut best = DVec2::ZERO;
    for step in 0..ORIENTATION_STEPS {
        let start = -PI + step as f64 * TAU / ORIENTATION_STEPS as f64;
        let sum: DVec2 = samples
            .iter()
            .filter(|(angle, _)| (angle - start).rem_euclid(TAU) < PI / 3.0)
            .map(|&(_, v)| v)
            .sum();
        if sum.length_squared() > best.length_squared() {
            best = sum;
        }
    }

    if best == DVec2::ZERO {
        0.0
    } else {
        best.y.atan2(best.x)
    }
}

/// Writes the L2-normalised descriptor of a `20 * scale` window rotated by
/// `angle` into `out`. A window without gradients yields zeros.
fn describe(
    integral: &IntegralImage,
    x: usize,
    y: usize,
    scale: f64,
    angle: f64,
    out: &mut [f32],
) {
    let (sin, cos) = angle.sin_cos();
    let radius = haar_radius(scale);
    let mut sums = [0.0f64; DESCRIPTOR_LEN];

    for j in 0..20 {
        for i in 0..20 {
            let u = (i as f64 - 9.5) * scale;
            let v = (j as f64 - 9.5) * scale;
            let sx = (x as f64 + u * cos - v * sin).round() as usize;
            let sy = (y as f64 + u * sin + v * cos).round() as usize;

            let weight = gaussian(u * u + v * v, 3.3 * scale);
            let dx = integral.haar_x(sx, sy, radius);
            let dy = integral.haar_y(sx, sy, radius);
            let rx = weight * (dx * cos + dy * sin);
            let ry = weight * (dy * cos - dx * sin);

            let bin = ((j / 5) * 4 + i / 5) * 8;
            let cell = &mut sums[bin..bin + 8];
            if ry >= 0.0 {
                cell[0] += rx;
                cell[1] += rx.abs();
            } else {
                cell[2] += rx;
                cell[3] += rx.abs();
            }
            if rx >= 0.0 {
                cell[4] += ry;
                cell[5] += ry.abs();
            } else {
                cell[6] += ry;
                cell[7] += ry.abs();
            }
        }
    }

    let norm = sums.iter().map(|v| v * v).sum::<f64>().sqrt();
    let gain = if norm > 0.0 { 1.0 / norm } else { 0.0 };
    for (dst, src) in out.iter_mut().zip(sums) {
        *dst = (src * gain) as f32;
    }
}

/// Similarity `1 - distance / 2` of two described points, `None` when their
/// Laplacian signs differ or the normalised distance exceeds `max_distance`.
/// Filter sizes are not compared.
pub(crate) fn descriptor_similarity(
    (point1, descriptor1): (&InterestPoint, &[f32]),
    (point2, descriptor2): (&InterestPoint, &[f32]),
    max_distance: f64,
) -> Option<f64> {
    if point1.feature3 != point2.feature3 {
        return None;
    }
    // Unit vectors are at most 2 apart.
    let normalized = euclidean_distance(descriptor1, descriptor2) / 2.0;
    (normalized <= max_distance).then_some(1.0 - normalized)
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = f64::from(x - y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}
