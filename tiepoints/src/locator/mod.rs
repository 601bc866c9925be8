//! Tie-points locator: the single entry point tying strategies and RANSAC
//! together.
//!
//! Single pass (`subsample_factor == 1`): match interest points at full
//! resolution, turn them into tie-points and filter them.
//!
//! Two passes (`subsample_factor < 1`):
//! 1. Match on rasters shrunk by the factor and fit a coarse transformation.
//!    It is rejected when it keeps fewer than `min_tie_points_factor` times
//!    the model's minimum, or its tie-points cover less than
//!    `min_area_coverage_percent` of the raster 1 target area.
//! 2. Match at full resolution, searching raster 2 only around the coarse
//!    mapping of every raster 1 point.
//! 3. Filter the result at full tolerance.

mod config;

pub use config::TiePointsLocatorConfig;

use crate::error::{LocatorError, RansacError};
use crate::geometry::convex_hull_area;
use crate::progress::{LocatorStage, ProgressReporter};
use crate::ransac::{RansacConfig, RansacFilter};
use crate::strategy::{
    InterestPointStrategy, MatchedPair, RasterInput, StrategyParameters,
};
use crate::transform::{GTParameters, GeometricTransformation, TiePoint, TransformRegistry};

/// Result of a locator run.
#[derive(Debug, Clone, Default)]
pub struct LocatorOutput {
    /// `None` when no transformation fits the located tie-points.
    pub transformation: Option<GeometricTransformation>,
    /// Raster 1 -> raster 2 pixel coordinates.
    pub tie_points: Vec<TiePoint>,
    /// One per tie-point, in (0, 1]; the best match weighs 1.
    pub weights: Vec<f64>,
}

impl LocatorOutput {
    fn not_found() -> Self {
        Self::default()
    }
}

/// Coarse guide for the full resolution pass.
struct CoarseEstimate {
    transformation: GeometricTransformation,
    /// Search radius around the mapped point, in raster 2 pixels.
    expected_error: f64,
}

#[derive(Debug)]
pub struct TiePointsLocator {
    config: TiePointsLocatorConfig,
    filter: RansacFilter,
}

impl TiePointsLocator {
    /// Locator over the default transformation registry.
    pub fn new(config: TiePointsLocatorConfig) -> Result<Self, LocatorError> {
        Self::with_registry(config, TransformRegistry::default())
    }

    pub fn with_registry(
        config: TiePointsLocatorConfig,
        registry: TransformRegistry,
    ) -> Result<Self, LocatorError> {
        config.validate()?;
        if !registry.contains(&config.transformation_name) {
            return Err(LocatorError::UnknownTransformation(
                config.transformation_name.clone(),
            ));
        }
        Ok(Self {
            config,
            filter: RansacFilter::new(registry),
        })
    }

    pub fn config(&self) -> &TiePointsLocatorConfig {
        &self.config
    }

    /// Locates tie-points between two rasters and fits the configured
    /// transformation to them.
    ///
    /// Invalid inputs are errors; failing to find a transformation is not.
    pub fn locate(
        &self,
        raster1: RasterInput,
        raster2: RasterInput,
    ) -> Result<LocatorOutput, LocatorError> {
        validate_input(&raster1, 1)?;
        validate_input(&raster2, 2)?;

        let config = &self.config;
        let params = self.strategy_parameters(raster1, raster2);
        let mut strategy = config.strategy.build();

        let progress = config.progress.clone().filter(|_| config.enable_progress);
        let total = if config.is_two_pass() { 5 } else { 3 };
        let mut progress = ProgressReporter::new(progress, total);

        tracing::info!(
            strategy = %config.strategy,
            transformation = %config.transformation_name,
            subsample_factor = config.subsample_factor,
            "Locating tie-points"
        );

        let coarse = if config.is_two_pass() {
            progress.report(LocatorStage::CoarseMatching);
            let factor = config.subsample_factor;
            let mut coarse_params = strategy.subsampled_parameters(factor, &params);
            coarse_params.subsample_factor = factor;
            strategy.initialize(coarse_params)?;
            let pairs = strategy.matched_interest_points(None, 0.0)?;

            progress.report(LocatorStage::CoarseFiltering);
            match self.coarse_estimate(&pairs, &params)? {
                Some(estimate) => Some(estimate),
                None => {
                    progress.report(LocatorStage::Done);
                    return Ok(LocatorOutput::not_found());
                }
            }
        } else {
            None
        };

        progress.report(LocatorStage::Matching);
        strategy.initialize(params)?;
        let pairs = match &coarse {
            Some(estimate) => strategy
                .matched_interest_points(Some(&estimate.transformation), estimate.expected_error)?,
            None => strategy.matched_interest_points(None, 0.0)?,
        };
        strategy.reset();

        progress.report(LocatorStage::Filtering);
        let output = self.fit(&pairs, config.geometric_filter_max_error)?;
        progress.report(LocatorStage::Done);

        tracing::info!(
            matches = pairs.len(),
            tie_points = output.tie_points.len(),
            found = output.transformation.is_some(),
            "Tie-points location finished"
        );

        Ok(output)
    }

    fn strategy_parameters(&self, raster1: RasterInput, raster2: RasterInput) -> StrategyParameters {
        let config = &self.config;
        let mut params = StrategyParameters::new(raster1, raster2);
        params.max_tie_points = config.max_tie_points;
        params.pixel_size_x_relation = config.pixel_size_x_relation;
        params.pixel_size_y_relation = config.pixel_size_y_relation;
        params.sub_sectors_split_factor = config.sub_sectors_split_factor;
        params.max_r1_to_r2_offset = config.max_r1_to_r2_offset;
        params.interpolation = config.interpolation;
        params.memory_policy = config.memory_policy;
        params.max_memory_percent = config.max_memory_percent;
        params.enable_multi_thread = config.enable_multi_thread;
        params.moravec = config.moravec.clone();
        params.surf = config.surf.clone();
        params
    }

    /// Fits the coarse transformation and checks it is good enough to guide
    /// the full resolution pass.
    fn coarse_estimate(
        &self,
        pairs: &[MatchedPair],
        params: &StrategyParameters,
    ) -> Result<Option<CoarseEstimate>, LocatorError> {
        let config = &self.config;
        // Coarse pixels are 1 / factor raster pixels wide.
        let tolerance = config.geometric_filter_max_error / config.subsample_factor;

        let output = self.fit(pairs, tolerance)?;
        let Some(transformation) = output.transformation else {
            tracing::warn!(matches = pairs.len(), "Coarse pass found no transformation");
            return Ok(None);
        };

        let required = (transformation.min_required_tie_points() as f64
            * config.min_tie_points_factor)
            .ceil() as usize;
        if output.tie_points.len() < required {
            tracing::warn!(
                tie_points = output.tie_points.len(),
                required,
                "Coarse pass rejected: too few tie-points"
            );
            return Ok(None);
        }

        let points1: Vec<_> = output.tie_points.iter().map(|tp| tp.pt1).collect();
        let target_area = params.raster1.area.area() as f64;
        let coverage = if target_area > 0.0 {
            100.0 * convex_hull_area(&points1) / target_area
        } else {
            0.0
        };
        if coverage < config.min_area_coverage_percent {
            tracing::warn!(
                coverage,
                min_coverage = config.min_area_coverage_percent,
                "Coarse pass rejected: tie-points cover too little of raster 1"
            );
            return Ok(None);
        }

        tracing::info!(
            tie_points = output.tie_points.len(),
            coverage,
            expected_error = tolerance,
            "Coarse transformation accepted"
        );

        Ok(Some(CoarseEstimate {
            transformation,
            expected_error: tolerance,
        }))
    }

    /// Turns matches into tie-points and fits the transformation, through
    /// RANSAC when the geometry filter is enabled.
    fn fit(&self, pairs: &[MatchedPair], max_error: f64) -> Result<LocatorOutput, LocatorError> {
        let config = &self.config;
        let tie_points: Vec<TiePoint> = pairs
            .iter()
            .map(|p| TiePoint::new(p.point1, p.point2))
            .collect();
        let scores: Vec<f64> = pairs.iter().map(|p| p.score).collect();

        let Some(mut transformation) = self.filter.registry().build(&config.transformation_name)
        else {
            return Err(LocatorError::UnknownTransformation(
                config.transformation_name.clone(),
            ));
        };
        if tie_points.len() < transformation.min_required_tie_points() {
            tracing::debug!(
                supplied = tie_points.len(),
                required = transformation.min_required_tie_points(),
                "Not enough tie-points to fit"
            );
            return Ok(LocatorOutput::not_found());
        }

        if !config.enable_geometry_filter {
            let found = transformation
                .initialize(GTParameters::from_tie_points(tie_points.clone()))
                .is_ok();
            return Ok(LocatorOutput {
                transformation: found.then_some(transformation),
                weights: normalized_weights(&scores),
                tie_points,
            });
        }

        let ransac = RansacConfig {
            max_direct_map_error: max_error,
            max_inverse_map_error: max_error,
            max_iterations: 0,
            assurance: config.geometry_filter_assurance,
            enable_multi_thread: config.enable_multi_thread,
            seed: config.ransac_seed,
        };

        match self
            .filter
            .apply(&config.transformation_name, &tie_points, Some(&scores), &ransac)
        {
            Ok(outcome) => {
                tracing::debug!(
                    inliers = outcome.tie_points.len(),
                    supplied = tie_points.len(),
                    direct_rmse = outcome.direct_rmse,
                    inverse_rmse = outcome.inverse_rmse,
                    iterations = outcome.iterations,
                    "Geometry filter finished"
                );
                Ok(LocatorOutput {
                    transformation: Some(outcome.transformation),
                    weights: normalized_weights(&outcome.weights),
                    tie_points: outcome.tie_points,
                })
            }
            Err(RansacError::NoConsensus | RansacError::NotEnoughTiePoints { .. }) => {
                tracing::debug!(supplied = tie_points.len(), "Geometry filter found no consensus");
                Ok(LocatorOutput::not_found())
            }
            Err(RansacError::UnknownTransformation(name)) => {
                Err(LocatorError::UnknownTransformation(name))
            }
            Err(err) => Err(LocatorError::Ransac(err)),
        }
    }
}

/// Scales scores so the largest is 1. Non-positive maxima give 1 everywhere.
fn normalized_weights(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(0.0f64, f64::max);
    if max > 0.0 {
        scores.iter().map(|s| s / max).collect()
    } else {
        vec![1.0; scores.len()]
    }
}

fn validate_input(input: &RasterInput, raster: u8) -> Result<(), LocatorError> {
    if !input.raster.access_policy().can_read() {
        return Err(LocatorError::NoReadAccess { raster });
    }
    if !input.area.fits(input.raster.as_ref()) {
        return Err(LocatorError::InvalidTargetArea {
            raster,
            reason: format!(
                "{}x{} at ({}, {}) does not fit a {}x{} raster",
                input.area.columns,
                input.area.rows,
                input.area.first_column,
                input.area.first_row,
                input.raster.columns(),
                input.raster.rows()
            ),
        });
    }
    if let [band] = input.bands.as_slice() {
        if *band >= input.raster.bands() {
            return Err(LocatorError::InvalidBands {
                raster,
                reason: format!("band {band} of {}", input.raster.bands()),
            });
        }
    }
    if let Some(mask) = input.mask.as_ref() {
        if !mask.access_policy().can_read() {
            return Err(LocatorError::NoReadAccess { raster });
        }
        if mask.bands() == 0
            || mask.columns() != input.raster.columns()
            || mask.rows() != input.raster.rows()
        {
            return Err(LocatorError::InvalidBands {
                raster,
                reason: "mask must have the raster's size and at least one band".to_string(),
            });
        }
    }
    Ok(())
}
