use std::sync::Arc;

use common::FloatExt;
use glam::DVec2;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use super::*;
use crate::raster::MemoryRaster;
use crate::strategy::RasterInput;
use crate::transform::{GTParameters, TiePoint, TransformRegistry};

fn matrix_from_fn(columns: usize, lines: usize, f: impl Fn(usize, usize) -> f32) -> Matrix<f32> {
    let mut m = Matrix::new(lines, columns, MemoryPolicy::Ram, 0).unwrap();
    for y in 0..lines {
        for (x, v) in m.row_mut(y).iter_mut().enumerate() {
            *v = f(x, y);
        }
    }
    m
}

fn impulses(columns: usize, lines: usize, peaks: &[(usize, usize, f32)]) -> Matrix<f32> {
    matrix_from_fn(columns, lines, |x, y| {
        peaks
            .iter()
            .find(|&&(px, py, _)| px == x && py == y)
            .map_or(0.0, |&(_, _, h)| h)
    })
}

/// Uniform noise over a `size x size` grid.
fn noise_base(size: usize, seed: u64) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..size * size).map(|_| rng.random::<f64>()).collect()
}

fn crop(base: &[f64], size: usize, offset: (usize, usize), extent: usize) -> MemoryRaster {
    MemoryRaster::from_fn(extent, extent, |c, r| {
        base[(r + offset.1) * size + c + offset.0]
    })
}

fn shifted_pair_params() -> StrategyParameters {
    let base = noise_base(100, 11);
    let raster1 = crop(&base, 100, (0, 0), 80);
    let raster2 = crop(&base, 100, (7, 4), 80);

    let mut params = StrategyParameters::new(
        RasterInput::new(Arc::new(raster1)),
        RasterInput::new(Arc::new(raster2)),
    );
    params.max_tie_points = 100;
    params.memory_policy = MemoryPolicy::Ram;
    params.moravec = MoravecConfig {
        noise_filter_iterations: 0,
        min_abs_correlation: 0.97,
        ..Default::default()
    };
    params
}

fn consistent_with_shift(pair: &MatchedPair) -> bool {
    pair.point1.distance(pair.point2 + DVec2::new(7.0, 4.0)) < 1e-9
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_bumps_even_widths() {
    let config = MoravecConfig {
        window_width: 4,
        correlation_window_width: 10,
        ..Default::default()
    }
    .normalized();
    assert_eq!(config.window_width, 5);
    assert_eq!(config.correlation_window_width, 11);
}

#[test]
fn test_config_validation() {
    assert!(MoravecConfig::default().validate().is_ok());

    let narrow = MoravecConfig {
        window_width: 1,
        ..Default::default()
    };
    assert!(matches!(
        narrow.validate(),
        Err(LocatorError::InvalidParameter {
            name: "moravec.window_width",
            ..
        })
    ));

    // 2 is bumped to 3 and accepted.
    let bumped = MoravecConfig {
        correlation_window_width: 2,
        ..Default::default()
    };
    assert!(bumped.validate().is_ok());

    let correlation = MoravecConfig {
        min_abs_correlation: 1.5,
        ..Default::default()
    };
    assert!(correlation.validate().is_err());
}

// ============================================================================
// Noise filter
// ============================================================================

#[test]
fn test_mean_filter_averages_neighbours() {
    let input = matrix_from_fn(4, 4, |x, y| (x + 4 * y) as f32);
    let output = mean_filter(&input, MemoryPolicy::Ram, 0).unwrap();

    // Neighbours of (1, 1): 0 1 2 4 6 8 9 10.
    assert!(output.row(1)[1].approx_eq_eps(5.0, 1e-6));
    assert_eq!(output.row(0), &[0.0; 4]);
    assert_eq!(output.row(3), &[0.0; 4]);
    assert_eq!(output.row(2)[0], 0.0);
    assert_eq!(output.row(2)[3], 0.0);
}

#[test]
fn test_mean_filter_keeps_tiny_rasters() {
    let input = matrix_from_fn(2, 5, |x, y| (x * y) as f32);
    let output = mean_filter(&input, MemoryPolicy::Ram, 0).unwrap();
    assert_eq!(output.as_slice(), input.as_slice());
}

// ============================================================================
// Interest points
// ============================================================================

#[test]
fn test_single_impulse_is_the_only_point() {
    let data = impulses(21, 21, &[(10, 10, 1.0)]);
    let points = locate_interest_points(&data, None, 5, 100, 1, 1).unwrap();

    assert_eq!(points.len(), 1);
    assert_eq!((points[0].x, points[0].y), (10, 10));
    // Variance 4 at the centre, 0 on the other 24 window cells.
    assert!(points[0].feature1.approx_eq_eps(96.0, 1e-9));
}

#[test]
fn test_flat_raster_has_no_points() {
    let data = matrix_from_fn(30, 30, |_, _| 0.5);
    let points = locate_interest_points(&data, None, 5, 100, 3, 1).unwrap();
    assert!(points.is_empty());
}

#[test]
fn test_small_raster_has_no_points() {
    let data = impulses(8, 30, &[(4, 10, 1.0)]);
    let points = locate_interest_points(&data, None, 5, 100, 1, 1).unwrap();
    assert!(points.is_empty());
}

#[test]
fn test_mask_excludes_points() {
    let data = impulses(21, 21, &[(10, 10, 1.0)]);
    let mut mask = Matrix::<u8>::new(21, 21, MemoryPolicy::Ram, 0).unwrap();
    mask.fill(255);
    mask.row_mut(10)[10] = 0;

    let points = locate_interest_points(&data, Some(&mask), 5, 100, 1, 1).unwrap();
    assert!(points.is_empty());
}

#[test]
fn test_sectors_spread_points() {
    let data = impulses(
        40,
        40,
        &[
            (6, 6, 1.0),
            (12, 6, 1.0),
            (6, 12, 1.0),
            (12, 12, 1.0),
            (30, 6, 0.5),
            (6, 30, 0.5),
            (30, 30, 0.5),
        ],
    );

    // One sector: the four strongest, all in the upper-left quadrant.
    let clustered = locate_interest_points(&data, None, 5, 4, 1, 1).unwrap();
    assert_eq!(clustered.len(), 4);
    assert!(clustered.iter().all(|p| p.x < 20 && p.y < 20));

    // 2x2 sectors, one point each.
    let spread = locate_interest_points(&data, None, 5, 4, 2, 1).unwrap();
    assert_eq!(spread.len(), 4);
    let quadrants: std::collections::BTreeSet<_> =
        spread.iter().map(|p| (p.x >= 20, p.y >= 20)).collect();
    assert_eq!(quadrants.len(), 4);
}

#[test]
fn test_cap_keeps_strongest() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let values: Vec<f32> = (0..60 * 60).map(|_| rng.random::<f32>()).collect();
    let data = matrix_from_fn(60, 60, |x, y| values[y * 60 + x]);

    let all = locate_interest_points(&data, None, 5, usize::MAX / 2, 1, 1).unwrap();
    let top = locate_interest_points(&data, None, 5, 10, 1, 1).unwrap();

    assert_eq!(top.len(), 10);
    assert_eq!(top.as_slice(), &all[all.len() - 10..]);
}

#[test]
fn test_worker_count_does_not_change_points() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let values: Vec<f32> = (0..90 * 90).map(|_| rng.random::<f32>()).collect();
    let data = matrix_from_fn(90, 90, |x, y| values[y * 90 + x]);

    let single = locate_interest_points(&data, None, 5, 200, 3, 1).unwrap();
    let multi = locate_interest_points(&data, None, 5, 200, 3, 4).unwrap();
    assert!(!single.is_empty());
    assert_eq!(single, multi);
}

// ============================================================================
// Features
// ============================================================================

#[test]
fn test_features_skip_border_points() {
    let data = matrix_from_fn(21, 21, |x, y| (x * y) as f32);
    let points = vec![
        InterestPoint::new(3, 10, 1.0),
        InterestPoint::new(10, 10, 2.0),
        InterestPoint::new(16, 10, 3.0),
    ];

    // Width 5 rotates into a radius of 4: x and y must lie in 5..=15.
    let (valid, features) = correlation_features(&points, 5, &data, MemoryPolicy::Ram, 0).unwrap();
    assert_eq!(valid, vec![InterestPoint::new(10, 10, 2.0)]);
    assert_eq!(features.lines(), 1);
    assert_eq!(features.columns(), 25);
    assert!(features.row(0).iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_flat_window_feature_is_zero() {
    let data = matrix_from_fn(21, 21, |_, _| 0.7);
    let points = vec![InterestPoint::new(10, 10, 1.0)];
    let (_, features) = correlation_features(&points, 5, &data, MemoryPolicy::Ram, 0).unwrap();
    assert!(features.row(0).iter().all(|&v| v == 0.0));
}

#[test]
fn test_features_are_rotation_normalised() {
    // A ramp along x and the same ramp along y describe identically.
    let along_x = matrix_from_fn(31, 31, |x, _| x as f32);
    let along_y = matrix_from_fn(31, 31, |_, y| y as f32);
    let points = vec![InterestPoint::new(15, 15, 1.0)];

    let (_, fx) = correlation_features(&points, 7, &along_x, MemoryPolicy::Ram, 0).unwrap();
    let (_, fy) = correlation_features(&points, 7, &along_y, MemoryPolicy::Ram, 0).unwrap();

    assert_eq!(fx.row(0), fy.row(0));
    assert!(correlation(fx.row(0), fy.row(0)).approx_eq_eps(1.0, 1e-6));
}

#[test]
fn test_correlation() {
    let a = [1.0f32, 0.0, 2.0];
    assert!(correlation(&a, &a).approx_eq_eps(1.0, 1e-6));
    assert_eq!(correlation(&a, &[0.0; 3]), 0.0);
    assert!(correlation(&[1.0, 0.0], &[0.0, 1.0]).approx_eq_eps(0.0, 1e-9));
}

// ============================================================================
// Strategy
// ============================================================================

#[test]
fn test_uninitialized_strategy_fails() {
    let strategy = MoravecStrategy::default();
    assert!(!strategy.is_initialized());
    assert!(matches!(
        strategy.matched_interest_points(None, 0.0),
        Err(LocatorError::NotInitialized)
    ));
}

#[test]
fn test_initialize_requires_single_band() {
    let mut params = shifted_pair_params();
    params.raster2.bands = vec![0, 1];

    let mut strategy = MoravecStrategy::default();
    assert!(matches!(
        strategy.initialize(params),
        Err(LocatorError::InvalidBands { raster: 2, .. })
    ));
    assert!(!strategy.is_initialized());
}

#[test]
fn test_shifted_rasters_match() {
    let mut strategy = MoravecStrategy::default();
    strategy.initialize(shifted_pair_params()).unwrap();

    let pairs = strategy.matched_interest_points(None, 0.0).unwrap();
    let consistent = pairs.iter().filter(|p| consistent_with_shift(p)).count();

    assert!(consistent >= 10, "only {consistent} consistent pairs");
    assert!(consistent * 10 >= pairs.len() * 8);
    assert!(pairs.iter().all(|p| p.score > 0.0 && p.score <= 3.0));
}

#[test]
fn test_prior_transformation_constrains_matches() {
    let mut transformation = TransformRegistry::default().build("RST").unwrap();
    let shift = DVec2::new(-7.0, -4.0);
    let tie_points = [(0.0, 0.0), (50.0, 0.0), (0.0, 50.0)]
        .into_iter()
        .map(|(x, y)| TiePoint::new(DVec2::new(x, y), DVec2::new(x, y) + shift))
        .collect();
    transformation
        .initialize(GTParameters::from_tie_points(tie_points))
        .unwrap();

    let mut params = shifted_pair_params();
    params.moravec.min_abs_correlation = 0.5;
    let mut strategy = MoravecStrategy::default();
    strategy.initialize(params).unwrap();

    let pairs = strategy
        .matched_interest_points(Some(&transformation), 1.0)
        .unwrap();
    assert!(!pairs.is_empty());
    assert!(pairs.iter().all(|p| p.point1.distance(p.point2 - shift) <= 1.0));
}

#[test]
fn test_zero_texture_yields_no_matches() {
    let flat = || Arc::new(MemoryRaster::from_fn(64, 64, |_, _| 42.0));
    let params = StrategyParameters::new(RasterInput::new(flat()), RasterInput::new(flat()));

    let mut strategy = MoravecStrategy::default();
    strategy.initialize(params).unwrap();
    assert!(strategy.matched_interest_points(None, 0.0).unwrap().is_empty());
}

#[test]
fn test_subsampled_parameters_shrink_windows() {
    let params = shifted_pair_params();
    let strategy = MoravecStrategy::default();

    let scaled = strategy.subsampled_parameters(0.5, &params);
    assert_eq!(scaled.moravec.window_width, 3);
    assert_eq!(scaled.moravec.correlation_window_width, 7);
    assert_eq!(scaled.max_tie_points, params.max_tie_points);
}

#[test]
fn test_auto_max_tie_points_follows_area() {
    let mut params = shifted_pair_params();
    params.max_tie_points = 0;
    let strategy = MoravecStrategy::default();

    // 80 * 80 / (4 * 11 * 11)
    assert_eq!(strategy.auto_max_tie_points(&params), 13);
}
