use std::str::FromStr;
use std::sync::Arc;

use common::FloatExt;

use super::*;
use crate::raster::MemoryRaster;

fn point(x: usize, y: usize, strength: f64) -> InterestPoint {
    InterestPoint::new(x, y, strength)
}

fn raster_input(columns: usize, rows: usize) -> RasterInput {
    RasterInput::new(Arc::new(MemoryRaster::new(columns, rows, 1)))
}

#[test]
fn test_interest_point_order_is_by_strength_then_position() {
    assert!(point(9, 9, 1.0) < point(0, 0, 2.0));
    assert!(point(1, 5, 1.0) < point(2, 0, 1.0));
    assert!(point(1, 1, 1.0) < point(1, 2, 1.0));
}

#[test]
fn test_point_set_evicts_weakest() {
    let mut set = InterestPointSet::new(3);
    for (i, strength) in [5.0, 1.0, 4.0, 3.0, 2.0].into_iter().enumerate() {
        set.insert(point(i, 0, strength));
    }

    let strengths: Vec<f64> = set.iter().map(|p| p.feature1).collect();
    assert_eq!(strengths, vec![3.0, 4.0, 5.0]);

    // Weaker than everything kept.
    set.insert(point(9, 9, 0.5));
    assert_eq!(set.len(), 3);
    assert_eq!(set.iter().next().unwrap().feature1, 3.0);
}

#[test]
fn test_point_set_ignores_duplicates_and_zero_capacity() {
    let mut set = InterestPointSet::new(2);
    set.insert(point(1, 1, 1.0));
    set.insert(point(1, 1, 1.0));
    assert_eq!(set.len(), 1);

    let mut empty = InterestPointSet::new(0);
    empty.insert(point(1, 1, 1.0));
    assert!(empty.is_empty());
}

#[test]
fn test_point_set_merge_is_order_independent() {
    let points: Vec<_> = (0..20).map(|i| point(i, i, (i * 7 % 13) as f64)).collect();

    let mut forward = InterestPointSet::new(5);
    let mut a = InterestPointSet::new(5);
    let mut b = InterestPointSet::new(5);
    for (i, p) in points.iter().enumerate() {
        forward.insert(*p);
        if i % 2 == 0 {
            a.insert(*p);
        } else {
            b.insert(*p);
        }
    }
    b.merge(a);

    let left: Vec<_> = forward.iter().copied().collect();
    let right: Vec<_> = b.iter().copied().collect();
    assert_eq!(left, right);
}

#[test]
fn test_sector_grid_caps_each_sector() {
    let mut grid = SectorGrid::new(100, 100, 2, 4);
    // Five points in the upper-left sector, one in the lower-right.
    for i in 0..5 {
        grid.insert(point(i * 5, i * 5, 10.0 + i as f64));
    }
    grid.insert(point(90, 90, 1.0));

    let points = grid.into_points();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0], point(90, 90, 1.0));
    assert_eq!(points[1], point(20, 20, 14.0));
}

#[test]
fn test_sector_grid_trims_to_total() {
    // 10 points over 9 sectors round up to 2 per sector.
    let mut grid = SectorGrid::new(90, 90, 3, 10);
    for sx in 0..3 {
        for sy in 0..3 {
            for k in 0..2 {
                grid.insert(point(sx * 30 + k, sy * 30, (sx * 10 + sy * 3 + k) as f64));
            }
        }
    }

    let points = grid.into_points();
    assert_eq!(points.len(), 10);
    assert!(points.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_strategy_kind_names() {
    assert_eq!(StrategyKind::Moravec.to_string(), "Moravec");
    assert_eq!(StrategyKind::Surf.to_string(), "SURF");
    assert_eq!(StrategyKind::from_str("SURF").unwrap(), StrategyKind::Surf);
    assert_eq!(
        StrategyKind::from_str("Harris"),
        Err(strum::ParseError::VariantNotFound)
    );
    assert_eq!(StrategyKind::Surf.build().kind(), StrategyKind::Surf);
    assert_eq!(StrategyKind::default().build().kind(), StrategyKind::Moravec);
}

#[test]
fn test_working_windows_equalise_pixel_sizes() {
    let mut params = StrategyParameters::new(raster_input(100, 100), raster_input(200, 100));

    // Raster 1 pixels are twice as large along x: raster 2 is shrunk.
    params.pixel_size_x_relation = 2.0;
    params.pixel_size_y_relation = 0.5;
    params.subsample_factor = 0.5;

    let (w1, w2) = working_windows(&params);
    assert_eq!((w1.factor_x, w1.factor_y), (0.5, 0.25));
    assert_eq!((w2.factor_x, w2.factor_y), (0.25, 0.5));
    assert_eq!(w1.size(), (50, 25));
    assert_eq!(w2.size(), (50, 50));
}

#[test]
fn test_working_window_maps_back_to_raster() {
    let window = WorkingWindow {
        area: TargetArea::new(10, 20, 100, 100),
        factor_x: 0.5,
        factor_y: 0.25,
    };
    assert_eq!(window.to_raster(4, 4), DVec2::new(18.0, 36.0));
}

#[test]
fn test_per_raster_max_points() {
    assert_eq!(per_raster_max_points(100, 1000, 1000), (100, 100));
    assert_eq!(per_raster_max_points(100, 4000, 1000), (400, 100));
    assert_eq!(per_raster_max_points(100, 1000, 2000), (100, 200));
    assert_eq!(per_raster_max_points(100, 0, 2000), (100, 100));
}

#[test]
fn test_auto_max_tie_points() {
    // Area bound: 1_000_000 / (4 * 11 * 11).
    assert_eq!(auto_max_tie_points(1_000_000, 11, 121, 1 << 40), 2066);
    // Memory bound: sqrt(121^2 + 0.4 * 4000 / 4) - 121 = 1.63...
    assert_eq!(auto_max_tie_points(1_000_000, 11, 121, 4000), 1);
    assert_eq!(auto_max_tie_points(1_000_000, 11, 121, 0), 0);
}

#[test]
fn test_validate_common() {
    let params = StrategyParameters::new(raster_input(10, 10), raster_input(10, 10));
    assert!(validate_common(&params).is_ok());

    let mut bad = params.clone();
    bad.raster1.bands = vec![];
    assert!(matches!(
        validate_common(&bad),
        Err(LocatorError::InvalidBands { raster: 1, .. })
    ));

    let mut bad = params.clone();
    bad.subsample_factor = 1.5;
    assert!(validate_common(&bad).is_err());

    let mut bad = params.clone();
    bad.pixel_size_y_relation = 0.0;
    assert!(validate_common(&bad).is_err());

    let mut bad = params.clone();
    bad.max_r1_to_r2_offset = -1.0;
    assert!(validate_common(&bad).is_err());

    let mut bad = params;
    bad.max_memory_percent = 0.0;
    assert!(validate_common(&bad).is_err());
}

#[test]
fn test_feature_normalizer_and_score() {
    let points = [point(0, 0, 2.0), point(1, 0, 6.0), point(2, 0, 4.0)];
    let normalizer = FeatureNormalizer::new(&points);
    assert!(normalizer.normalize(2.0).approx_eq_eps(0.0, 1e-12));
    assert!(normalizer.normalize(4.0).approx_eq_eps(0.5, 1e-12));
    assert!(normalizer.normalize(6.0).approx_eq_eps(1.0, 1e-12));

    let flat = FeatureNormalizer::new(&[point(0, 0, 3.0)]);
    assert_eq!(flat.normalize(3.0), 0.0);

    assert!(match_score(0.9, 0.25, 0.75).approx_eq_eps(2.05, 1e-12));
}

#[test]
fn test_raster_input_debug_hides_raster() {
    let input = raster_input(12, 7).with_bands(vec![0]);
    let text = format!("{input:?}");
    assert!(text.contains("columns: 12"));
    assert!(text.contains("mask: false"));
}
