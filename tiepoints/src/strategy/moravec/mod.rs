//! Moravec corner strategy.
//!
//! 1. Optional 3x3 mean filtering of each working raster
//! 2. Directional variance (minimum over horizontal, vertical, diagonal and
//!    anti-diagonal sums of squared differences) over a sliding window
//! 3. Local maxima of the variance, kept per sector of a [`SectorGrid`]
//! 4. A rotation-normalised intensity window per point, min/max normalised
//! 5. Mutual-best matching by normalised correlation

#[cfg(test)]
mod tests;

use common::RowRing;
use common::parallel::{self, WorkCounter};
use glam::DVec2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::matching::{SearchRegion, match_mutual_best};
use super::{
    FeatureNormalizer, InterestPoint, InterestPointStrategy, MatchedPair, RasterInput,
    SectorGrid, StrategyKind, StrategyParameters, WorkingRaster, WorkingWindow, auto_max_tie_points,
    load_working_raster, match_score, per_raster_max_points, validate_common, working_windows,
};
use crate::error::{LocatorError, MatrixError};
use crate::matrix::{self, Matrix, MemoryPolicy};
use crate::raster::LoadOptions;
use crate::transform::GeometricTransformation;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoravecConfig {
    /// Corner detection window width; even widths are bumped to odd.
    pub window_width: usize,
    /// Feature window width; even widths are bumped to odd.
    pub correlation_window_width: usize,
    /// Minimum absolute correlation of a match, in [0, 1].
    pub min_abs_correlation: f64,
    /// Mean filter passes before detection.
    pub noise_filter_iterations: usize,
}

impl Default for MoravecConfig {
    fn default() -> Self {
        Self {
            window_width: 5,
            correlation_window_width: 11,
            min_abs_correlation: 0.5,
            noise_filter_iterations: 1,
        }
    }
}

impl MoravecConfig {
    /// Copy with both window widths made odd.
    pub fn normalized(&self) -> Self {
        Self {
            window_width: odd(self.window_width),
            correlation_window_width: odd(self.correlation_window_width),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), LocatorError> {
        let config = self.normalized();
        if config.window_width <= 2 {
            return Err(LocatorError::invalid("moravec.window_width", "must be > 2"));
        }
        if config.correlation_window_width <= 2 {
            return Err(LocatorError::invalid(
                "moravec.correlation_window_width",
                "must be > 2",
            ));
        }
        if !(0.0..=1.0).contains(&config.min_abs_correlation) {
            return Err(LocatorError::invalid(
                "moravec.min_abs_correlation",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

fn odd(width: usize) -> usize {
    if width % 2 == 0 { width + 1 } else { width }
}

// ============================================================================
// Strategy
// ============================================================================

#[derive(Debug, Default)]
pub struct MoravecStrategy {
    state: Option<State>,
}

#[derive(Debug)]
struct State {
    params: StrategyParameters,
    config: MoravecConfig,
    memory_budget: u64,
}

/// Detected points of one raster, their features and raster coordinates.
struct DescribedPoints {
    points: Vec<InterestPoint>,
    features: Matrix<f32>,
    positions: Vec<DVec2>,
}

impl InterestPointStrategy for MoravecStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Moravec
    }

    fn initialize(&mut self, mut params: StrategyParameters) -> Result<(), LocatorError> {
        self.state = None;

        validate_common(&params)?;
        params.moravec.validate()?;
        params.moravec = params.moravec.normalized();

        if params.max_tie_points == 0 {
            params.max_tie_points = self.auto_max_tie_points(&params);
        }

        let memory_budget =
            matrix::memory_budget(matrix::available_memory(), params.max_memory_percent);
        let config = params.moravec.clone();

        tracing::debug!(
            max_tie_points = params.max_tie_points,
            window_width = config.window_width,
            correlation_window_width = config.correlation_window_width,
            memory_budget,
            "Moravec strategy initialized"
        );

        self.state = Some(State {
            params,
            config,
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
        let config = &state.config;
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

        let set1 = describe_raster(
            state,
            &params.raster1,
            &window1,
            max_points1,
            &options,
            workers,
        )?;
        let set2 = describe_raster(
            state,
            &params.raster2,
            &window2,
            max_points2,
            &options,
            workers,
        )?;

        let region = SearchRegion::new(prior, expected_error, params.max_r1_to_r2_offset);

        let min_abs_correlation = config.min_abs_correlation;
        let matches = match_mutual_best(
            &set1.positions,
            &set2.positions,
            region,
            workers,
            |i, j| {
                let corr = correlation(set1.features.row(i), set2.features.row(j)).abs();
                (corr >= min_abs_correlation).then_some(corr)
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
            "Moravec matching finished"
        );

        Ok(pairs)
    }

    fn auto_max_tie_points(&self, params: &StrategyParameters) -> usize {
        let config = params.moravec.normalized();
        let max_area = params.raster1.area.area().max(params.raster2.area.area());
        let max_window = config.window_width.max(config.correlation_window_width);
        auto_max_tie_points(
            max_area,
            max_window,
            config.correlation_window_width * config.correlation_window_width,
            matrix::available_memory(),
        )
    }

    fn subsampled_parameters(
        &self,
        factor: f64,
        params: &StrategyParameters,
    ) -> StrategyParameters {
        let shrink = |width: usize| odd(((width as f64 * factor).round() as usize).max(3));
        let mut scaled = params.clone();
        scaled.moravec.window_width = shrink(params.moravec.window_width);
        scaled.moravec.correlation_window_width = shrink(params.moravec.correlation_window_width);
        scaled
    }
}

/// Loads, filters, detects and describes one raster.
fn describe_raster(
    state: &State,
    input: &RasterInput,
    window: &WorkingWindow,
    max_points: usize,
    options: &LoadOptions,
    workers: usize,
) -> Result<DescribedPoints, LocatorError> {
    let config = &state.config;
    let WorkingRaster { mut data, mask } = load_working_raster(input, window, options)?;

    for _ in 0..config.noise_filter_iterations {
        data = mean_filter(&data, options.memory_policy, options.memory_budget)?;
    }

    let candidates = locate_interest_points(
        &data,
        mask.as_ref(),
        config.window_width,
        max_points,
        state.params.sub_sectors_split_factor,
        workers,
    )?;

    let (points, features) = correlation_features(
        &candidates,
        config.correlation_window_width,
        &data,
        options.memory_policy,
        options.memory_budget,
    )?;
    let positions = points.iter().map(|p| window.to_raster(p.x, p.y)).collect();

    Ok(DescribedPoints {
        points,
        features,
        positions,
    })
}

// ============================================================================
// Noise filter
// ============================================================================

/// 3x3 mean of the eight neighbours of every pixel; the one-pixel border is 0.
///
/// Rasters smaller than 3x3 are returned unchanged.
pub fn mean_filter(
    input: &Matrix<f32>,
    policy: MemoryPolicy,
    budget: u64,
) -> Result<Matrix<f32>, MatrixError> {
    let lines = input.lines();
    let columns = input.columns();
    let mut output = Matrix::new(lines, columns, policy, budget)?;

    if lines < 3 || columns < 3 {
        output.as_mut_slice().copy_from_slice(input.as_slice());
        return Ok(output);
    }

    for line in 1..lines - 1 {
        let above = input.row(line - 1);
        let center = input.row(line);
        let below = input.row(line + 1);
        let out = output.row_mut(line);
        for col in 1..columns - 1 {
            let sum = above[col - 1]
                + above[col]
                + above[col + 1]
                + center[col - 1]
                + center[col + 1]
                + below[col - 1]
                + below[col]
                + below[col + 1];
            out[col] = sum / 8.0;
        }
    }

    Ok(output)
}

// ============================================================================
// Interest points
// ============================================================================

/// Local maxima of the directional variance, at most `max_points` of them,
/// spread over `split x split` sectors.
///
/// Lines are processed in blocks handed out to `workers`; each block also
/// reads the `window_width - 1` lines around it. Pixels where `mask` is 0 are
/// skipped. Rasters smaller than `2 * window_width - 1` in either direction
/// yield no points.
pub fn locate_interest_points(
    data: &Matrix<f32>,
    mask: Option<&Matrix<u8>>,
    window_width: usize,
    max_points: usize,
    split: usize,
    workers: usize,
) -> Result<Vec<InterestPoint>, rayon::ThreadPoolBuildError> {
    let lines = data.lines();
    let columns = data.columns();
    let min_size = 2 * window_width - 1;
    if lines < min_size || columns < min_size || max_points == 0 {
        return Ok(Vec::new());
    }

    let block_size = if workers > 1 {
        (2 * min_size).max(lines.div_ceil(workers))
    } else {
        lines
    };
    let blocks = lines.div_ceil(block_size);

    let grid = Mutex::new(SectorGrid::new(columns, lines, split, max_points));
    let counter = WorkCounter::new(blocks);

    parallel::broadcast_workers(workers, |_| {
        let mut local = grid.lock().empty_like();
        let mut variance = RowRing::<f32>::new(columns, window_width);

        while let Some(block) = counter.next_unit() {
            let first_y = block * block_size;
            let end_y = (first_y + block_size).min(lines);
            locate_block(
                data,
                mask,
                window_width,
                first_y,
                end_y,
                &mut variance,
                &mut local,
            );
        }

        grid.lock().merge(local);
    })?;

    let points = grid.into_inner().into_points();
    tracing::debug!(
        points = points.len(),
        max_points,
        blocks,
        "Moravec interest points located"
    );
    Ok(points)
}

/// Finds maxima with `y` in `first_y..end_y`.
fn locate_block(
    data: &Matrix<f32>,
    mask: Option<&Matrix<u8>>,
    w: usize,
    first_y: usize,
    end_y: usize,
    variance: &mut RowRing<f32>,
    out: &mut SectorGrid,
) {
    let r = w / 2;
    let lines = data.lines();
    let columns = data.columns();

    variance.fill(0.0);
    let mut variance_lines = 0;

    // Variance line centred on raster line `c` needs lines `c - r ..= c + r`;
    // a maximum at `y` needs variance lines `y - r ..= y + r`.
    let first_line = first_y.saturating_sub(2 * r);
    let last_line = (end_y + 2 * r).min(lines);

    for line in first_line..last_line {
        if line + 1 < first_line + w {
            continue;
        }
        let top = line + 1 - w;

        let slot = variance.push_slot();
        slot.fill(0.0);
        for c in 0..=columns - w {
            slot[c + r] = directional_variance(data, top, c, w);
        }
        variance_lines += 1;

        if variance_lines < w {
            continue;
        }
        // The middle ring line is centred on raster line `line - 2r`.
        let y = line - 2 * r;
        if y < first_y || y >= end_y {
            continue;
        }

        for c in 0..=columns - w {
            let x = c + r;
            if let Some(mask) = mask {
                if mask.row(y)[x] == 0 {
                    continue;
                }
            }
            if let Some(strength) = local_maximum(variance, c, w) {
                out.insert(InterestPoint::new(x, y, strength));
            }
        }
    }
}

/// Minimum directional sum of squared differences to the window centre for the
/// `w x w` window with top-left `(c, top)`.
fn directional_variance(data: &Matrix<f32>, top: usize, c: usize, w: usize) -> f32 {
    let r = w / 2;
    let center = data.row(top + r)[c + r];

    let mut horizontal = 0.0f32;
    let mut vertical = 0.0f32;
    let mut diagonal = 0.0f32;
    let mut anti_diagonal = 0.0f32;

    let middle = data.row(top + r);
    for o in 0..w {
        let d = middle[c + o] - center;
        horizontal += d * d;

        let d = data.row(top + o)[c + r] - center;
        vertical += d * d;

        let d = data.row(top + o)[c + o] - center;
        diagonal += d * d;

        let d = data.row(top + w - 1 - o)[c + o] - center;
        anti_diagonal += d * d;
    }

    horizontal.min(vertical).min(diagonal).min(anti_diagonal)
}

/// Strength of the variance maximum centred at column `c + r` of the middle
/// ring line, or `None` when a neighbour is larger or the response is flat.
///
/// Strength is the summed absolute difference to the window's other values.
fn local_maximum(variance: &RowRing<f32>, c: usize, w: usize) -> Option<f64> {
    let r = w / 2;
    let center = variance.row(r)[c + r];
    if center <= 0.0 {
        return None;
    }

    let mut strength = 0.0f64;
    for line in 0..w {
        for &value in &variance.row(line)[c..c + w] {
            if value > center {
                return None;
            }
            strength += f64::from(center - value);
        }
    }
    Some(strength)
}

// ============================================================================
// Features
// ============================================================================

/// Radius of a `width` window rotated by 45 degrees, rounded up.
fn rotated_window_radius(width: usize) -> usize {
    ((2.0 * (width * width) as f64).sqrt() / 2.0).ceil() as usize
}

/// Builds one `width x width` feature row per point far enough from the
/// border for a rotated window.
///
/// Each window is rotated so its intensity vector (right minus left, top
/// minus bottom halves) points along +x, then min/max normalised to [0, 1]
/// (a flat window becomes all zeros). Returns the kept points and their rows.
pub fn correlation_features(
    points: &[InterestPoint],
    width: usize,
    data: &Matrix<f32>,
    policy: MemoryPolicy,
    budget: u64,
) -> Result<(Vec<InterestPoint>, Matrix<f32>), MatrixError> {
    let margin = rotated_window_radius(width);
    let columns = data.columns();
    let lines = data.lines();

    let valid: Vec<InterestPoint> = if columns < 2 * margin + 3 || lines < 2 * margin + 3 {
        Vec::new()
    } else {
        let x_range = margin + 1..=columns - margin - 2;
        let y_range = margin + 1..=lines - margin - 2;
        points
            .iter()
            .filter(|p| x_range.contains(&p.x) && y_range.contains(&p.y))
            .copied()
            .collect()
    };

    let mut features = Matrix::new(valid.len(), width * width, policy, budget)?;
    let mut window = vec![0.0f32; width * width];
    let radius = (width / 2) as i64;

    for (idx, point) in valid.iter().enumerate() {
        let x_start = point.x as i64 - radius;
        let y_start = point.y as i64 - radius;
        let x_end = x_start + width as i64 - 1;
        let y_end = y_start + width as i64 - 1;
        let at = |x: i64, y: i64| data.row(y as usize)[x as usize];

        let mut dir_x = 0.0f32;
        for y in y_start..=y_end {
            for offset in 0..radius {
                dir_x += at(x_end - offset, y) - at(x_start + offset, y);
            }
        }
        let mut dir_y = 0.0f32;
        for x in x_start..=x_end {
            for offset in 0..radius {
                dir_y += at(x, y_start + offset) - at(x, y_end - offset);
            }
        }

        let norm = (dir_x * dir_x + dir_y * dir_y).sqrt();
        let (cos, sin) = if norm != 0.0 {
            (dir_x / norm, dir_y / norm)
        } else {
            (1.0, 0.0)
        };

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        let r = radius as f32;
        for wy in 0..width {
            for wx in 0..width {
                let cx = wx as f32 - r;
                let cy = wy as f32 - r;
                let rx = (cos * cx + sin * cy + r).round() as i64;
                let ry = (cos * cy - sin * cx + r).round() as i64;
                let value = at(x_start + rx, y_start + ry);
                window[wy * width + wx] = value;
                min = min.min(value);
                max = max.max(value);
            }
        }

        let gain = if max > min { 1.0 / (max - min) } else { 0.0 };
        for (dst, &src) in features.row_mut(idx).iter_mut().zip(&window) {
            *dst = (src - min) * gain;
        }
    }

    Ok((valid, features))
}

/// Normalised cross-correlation `sum(a*b) / sqrt(sum(a^2) * sum(b^2))`; 0 when
/// either vector is all zeros.
pub fn correlation(a: &[f32], b: &[f32]) -> f64 {
    let mut sum_aa = 0.0f32;
    let mut sum_bb = 0.0f32;
    let mut sum_ab = 0.0f32;
    for (&x, &y) in a.iter().zip(b) {
        sum_aa += x * x;
        sum_bb += y * y;
        sum_ab += x * y;
    }
    let norm = (sum_aa * sum_bb).sqrt();
    if norm == 0.0 {
        0.0
    } else {
        f64::from(sum_ab / norm)
    }
}
