use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

use common::FloatExt;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use super::*;
use crate::raster::MemoryRaster;

fn matrix_from_fn(columns: usize, lines: usize, f: impl Fn(usize, usize) -> f32) -> Matrix<f32> {
    let mut m = Matrix::new(lines, columns, MemoryPolicy::Ram, 0).unwrap();
    for y in 0..lines {
        for (x, v) in m.row_mut(y).iter_mut().enumerate() {
            *v = f(x, y);
        }
    }
    m
}

fn integral_of(data: &Matrix<f32>) -> IntegralImage {
    IntegralImage::new(data, MemoryPolicy::Ram, 0).unwrap()
}

fn gaussian_blob(columns: usize, lines: usize, cx: f64, cy: f64, sigma: f64, height: f32) -> Matrix<f32> {
    matrix_from_fn(columns, lines, |x, y| {
        let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
        0.5 + height * (-d2 / (2.0 * sigma * sigma)).exp() as f32
    })
}

/// Random bright and dark Gaussian blobs over a `size x size` grid.
fn blob_field(size: usize, count: usize, seed: u64) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let blobs: Vec<(f64, f64, f64, f64)> = (0..count)
        .map(|_| {
            let sign = if rng.random::<bool>() { 1.0 } else { -1.0 };
            (
                rng.random::<f64>() * size as f64,
                rng.random::<f64>() * size as f64,
                1.5 + rng.random::<f64>() * 1.5,
                sign * (0.5 + rng.random::<f64>() * 0.5),
            )
        })
        .collect();

    let mut field = vec![0.0; size * size];
    for (idx, value) in field.iter_mut().enumerate() {
        let (x, y) = ((idx % size) as f64, (idx / size) as f64);
        *value = blobs
            .iter()
            .map(|&(bx, by, sigma, h)| {
                let d2 = (x - bx).powi(2) + (y - by).powi(2);
                h * (-d2 / (2.0 * sigma * sigma)).exp()
            })
            .sum();
    }
    field
}

fn crop(base: &[f64], size: usize, offset: (usize, usize), extent: usize) -> MemoryRaster {
    MemoryRaster::from_fn(extent, extent, |c, r| {
        base[(r + offset.1) * size + c + offset.0]
    })
}

const SHIFT: (usize, usize) = (9, 5);

fn shifted_pair_params(invert_second: bool) -> StrategyParameters {
    let base = blob_field(160, 320, 3);
    let raster1 = crop(&base, 160, (0, 0), 140);
    let raster2 = if invert_second {
        MemoryRaster::from_fn(140, 140, |c, r| -base[r * 160 + c])
    } else {
        crop(&base, 160, SHIFT, 140)
    };

    let mut params = StrategyParameters::new(
        RasterInput::new(Arc::new(raster1)),
        RasterInput::new(Arc::new(raster2)),
    );
    params.max_tie_points = 300;
    params.memory_policy = MemoryPolicy::Ram;
    params.surf = SurfConfig {
        max_normalized_distance: 0.25,
        ..Default::default()
    };
    params
}

#[test]
fn test_filter_sizes() {
    let octave0: Vec<usize> = (0..4).map(|s| filter_size(0, s)).collect();
    let octave1: Vec<usize> = (0..4).map(|s| filter_size(1, s)).collect();
    assert_eq!(octave0, vec![9, 15, 21, 27]);
    assert_eq!(octave1, vec![15, 27, 39, 51]);
    assert_eq!(SurfConfig::default().max_filter_size(), 51);
}

#[test]
fn test_config_validation() {
    assert!(SurfConfig::default().validate().is_ok());

    let config = SurfConfig {
        scales_number: 2,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(LocatorError::InvalidParameter {
            name: "surf.scales_number",
            ..
        })
    ));

    let config = SurfConfig {
        octaves_number: 0,
        ..Default::default()
    };
    assert!(config.validate().is_err());

    let config = SurfConfig {
        max_normalized_distance: 1.5,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_box_sum_matches_brute_force() {
    let data = matrix_from_fn(9, 7, |x, y| (x * 3 + y * 5 % 7) as f32);
    let integral = integral_of(&data);

    for (x0, y0, x1, y1) in [(0, 0, 8, 6), (0, 0, 0, 0), (2, 1, 5, 4), (3, 0, 3, 6), (0, 4, 8, 4)] {
        let mut expected = 0.0;
        for y in y0..=y1 {
            for x in x0..=x1 {
                expected += f64::from(data.row(y)[x]);
            }
        }
        assert_eq!(integral.box_sum(x0, y0, x1, y1), expected, "box {x0},{y0} {x1},{y1}");
    }
}

#[test]
fn test_haar_responses_follow_gradient() {
    let ramp_x = integral_of(&matrix_from_fn(11, 11, |x, _| x as f32));
    assert!(ramp_x.haar_x(5, 5, 2) > 0.0);
    assert_eq!(ramp_x.haar_y(5, 5, 2), 0.0);

    let ramp_y = integral_of(&matrix_from_fn(11, 11, |_, y| y as f32));
    assert_eq!(ramp_y.haar_x(5, 5, 2), 0.0);
    assert!(ramp_y.haar_y(5, 5, 2) > 0.0);
}

#[test]
fn test_hessian_response_of_blobs() {
    let bright = integral_of(&gaussian_blob(41, 41, 20.0, 20.0, 2.0, 0.5));
    let (response, laplacian) = hessian_response(&bright, 20, 20, 9);
    assert!(response > 0.0);
    assert_eq!(laplacian, -1.0);

    let dark = integral_of(&gaussian_blob(41, 41, 20.0, 20.0, 2.0, -0.5));
    let (response, laplacian) = hessian_response(&dark, 20, 20, 9);
    assert!(response > 0.0);
    assert_eq!(laplacian, 1.0);

    let flat = integral_of(&matrix_from_fn(41, 41, |_, _| 0.3));
    let (response, _) = hessian_response(&flat, 20, 20, 15);
    assert!(response.approx_eq_eps(0.0, 1e-12));
}

#[test]
fn test_single_blob_is_located_at_its_centre() {
    let integral = integral_of(&gaussian_blob(80, 80, 40.0, 40.0, 2.5, 0.5));
    let points =
        locate_interest_points(&integral, None, &SurfConfig::default(), 10, 1, 1).unwrap();

    assert!(!points.is_empty());
    let strongest = points.last().unwrap();
    assert_eq!((strongest.x, strongest.y), (40, 40));
    assert_eq!(strongest.feature3, -1.0);
    assert!(strongest.feature2 >= 9.0);
}

#[test]
fn test_flat_raster_has_no_points() {
    let integral = integral_of(&matrix_from_fn(80, 80, |_, _| 0.5));
    let points =
        locate_interest_points(&integral, None, &SurfConfig::default(), 10, 3, 2).unwrap();
    assert!(points.is_empty());
}

#[test]
fn test_mask_excludes_points() {
    let integral = integral_of(&gaussian_blob(80, 80, 40.0, 40.0, 2.5, 0.5));
    let mut mask = Matrix::<u8>::new(80, 80, MemoryPolicy::Ram, 0).unwrap();
    mask.fill(1);
    for y in 30..50 {
        mask.row_mut(y)[30..50].fill(0);
    }

    let points =
        locate_interest_points(&integral, Some(&mask), &SurfConfig::default(), 10, 1, 1).unwrap();
    assert!(
        points
            .iter()
            .all(|p| !(30..50).contains(&p.x) || !(30..50).contains(&p.y))
    );
}

#[test]
fn test_worker_count_does_not_change_points() {
    let base = blob_field(120, 200, 5);
    let data = matrix_from_fn(120, 120, |x, y| base[y * 120 + x] as f32);
    let integral = integral_of(&data);
    let config = SurfConfig::default();

    let single = locate_interest_points(&integral, None, &config, 60, 3, 1).unwrap();
    let multi = locate_interest_points(&integral, None, &config, 60, 3, 4).unwrap();
    assert!(!single.is_empty());
    assert_eq!(single, multi);
}

#[test]
fn test_orientation_follows_ramp() {
    let ramp_x = integral_of(&matrix_from_fn(61, 61, |x, _| x as f32));
    assert!(orientation(&ramp_x, 30, 30, 1.2).approx_eq_eps(0.0, 1e-9));

    let ramp_y = integral_of(&matrix_from_fn(61, 61, |_, y| y as f32));
    assert!(orientation(&ramp_y, 30, 30, 1.2).approx_eq_eps(FRAC_PI_2, 1e-9));

    let flat = integral_of(&matrix_from_fn(61, 61, |_, _| 1.0));
    assert_eq!(orientation(&flat, 30, 30, 1.2), 0.0);
}

#[test]
fn test_descriptors_are_unit_length_and_skip_borders() {
    let data = gaussian_blob(80, 80, 40.0, 40.0, 3.0, 0.5);
    let integral = integral_of(&data);
    let points = [
        InterestPoint {
            x: 40,
            y: 40,
            feature1: 1.0,
            feature2: 9.0,
            feature3: -1.0,
        },
        InterestPoint {
            x: 5,
            y: 40,
            feature1: 1.0,
            feature2: 9.0,
            feature3: -1.0,
        },
    ];

    let (kept, descriptors) =
        generate_descriptors(&points, &integral, MemoryPolicy::Ram, 0).unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!((kept[0].x, kept[0].y), (40, 40));
    assert_eq!(descriptors.columns(), DESCRIPTOR_LEN);

    let norm: f64 = descriptors
        .row(0)
        .iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt();
    assert!(norm.approx_eq_eps(1.0, 1e-5));
}

#[test]
fn test_flat_window_descriptor_is_zero() {
    let integral = integral_of(&matrix_from_fn(80, 80, |_, _| 0.25));
    let point = InterestPoint {
        x: 40,
        y: 40,
        feature1: 1.0,
        feature2: 9.0,
        feature3: 1.0,
    };
    let (_, descriptors) = generate_descriptors(&[point], &integral, MemoryPolicy::Ram, 0).unwrap();
    assert!(descriptors.row(0).iter().all(|&v| v == 0.0));
}

#[test]
fn test_euclidean_distance() {
    assert_eq!(euclidean_distance(&[0.0, 3.0], &[4.0, 0.0]), 5.0);
    assert_eq!(euclidean_distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
}

#[test]
fn test_similarity_checks_sign_but_not_filter_size() {
    let point = |feature2: f64, feature3: f64| InterestPoint {
        x: 10,
        y: 10,
        feature1: 1.0,
        feature2,
        feature3,
    };
    let a = [0.6f32, 0.8];
    let b = [0.8f32, 0.6];

    let same = descriptor_similarity((&point(9.0, 1.0), &a), (&point(9.0, 1.0), &a), 0.75);
    assert_eq!(same, Some(1.0));

    // Neighbouring scales still match.
    let sized = descriptor_similarity((&point(9.0, 1.0), &a), (&point(15.0, 1.0), &b), 0.75)
        .unwrap();
    assert!(sized.approx_eq_eps(1.0 - 0.08f64.sqrt() / 2.0, 1e-6));

    assert_eq!(
        descriptor_similarity((&point(9.0, 1.0), &a), (&point(9.0, -1.0), &a), 0.75),
        None
    );
    assert_eq!(
        descriptor_similarity((&point(9.0, 1.0), &[1.0, 0.0]), (&point(9.0, 1.0), &[-1.0, 0.0]), 0.75),
        None
    );
}

#[test]
fn test_uninitialized_strategy_fails() {
    let strategy = SurfStrategy::default();
    assert!(!strategy.is_initialized());
    assert!(matches!(
        strategy.matched_interest_points(None, 0.0),
        Err(LocatorError::NotInitialized)
    ));
}

#[test]
fn test_initialize_rejects_bad_config() {
    let mut params = shifted_pair_params(false);
    params.surf.scales_number = 2;

    let mut strategy = SurfStrategy::default();
    assert!(strategy.initialize(params).is_err());
    assert!(!strategy.is_initialized());
}

#[test]
fn test_shifted_rasters_match() {
    let mut strategy = SurfStrategy::default();
    strategy.initialize(shifted_pair_params(false)).unwrap();
    let pairs = strategy.matched_interest_points(None, 0.0).unwrap();

    let shift = DVec2::new(SHIFT.0 as f64, SHIFT.1 as f64);
    let consistent = pairs
        .iter()
        .filter(|p| (p.point1 - shift - p.point2).length() < 0.5)
        .count();

    assert!(consistent >= 5, "only {consistent} consistent of {}", pairs.len());
    assert!(consistent * 10 >= pairs.len() * 8);
    assert!(pairs.iter().all(|p| p.score > 0.0 && p.score <= 3.0));

    strategy.reset();
    assert!(!strategy.is_initialized());
}

#[test]
fn test_inverted_raster_does_not_match() {
    let mut strategy = SurfStrategy::default();
    strategy.initialize(shifted_pair_params(true)).unwrap();
    let pairs = strategy.matched_interest_points(None, 0.0).unwrap();
    assert!(pairs.is_empty());
}

#[test]
fn test_subsampled_parameters_drop_octaves() {
    let mut params = shifted_pair_params(false);
    params.surf.octaves_number = 3;
    let strategy = SurfStrategy::default();

    assert_eq!(strategy.subsampled_parameters(1.0, &params).surf.octaves_number, 3);
    assert_eq!(strategy.subsampled_parameters(0.5, &params).surf.octaves_number, 2);
    assert_eq!(strategy.subsampled_parameters(0.3, &params).surf.octaves_number, 2);
    assert_eq!(strategy.subsampled_parameters(0.25, &params).surf.octaves_number, 1);
    assert_eq!(strategy.subsampled_parameters(0.01, &params).surf.octaves_number, 1);
}

#[test]
fn test_auto_max_tie_points_follows_area() {
    let raster = || RasterInput::new(Arc::new(MemoryRaster::new(1000, 1000, 1)));
    let params = StrategyParameters::new(raster(), raster());
    // 1_000_000 / (4 * 51 * 51)
    assert_eq!(SurfStrategy::default().auto_max_tie_points(&params), 96);
}
