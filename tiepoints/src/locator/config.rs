use serde::{Deserialize, Serialize};

use crate::error::LocatorError;
use crate::matrix::MemoryPolicy;
use crate::progress::ProgressCallback;
use crate::raster::InterpolationMethod;
use crate::strategy::{MoravecConfig, StrategyKind, SurfConfig};

/// Tie-points locator configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiePointsLocatorConfig {
    pub strategy: StrategyKind,
    /// Maximum tie-points to locate. 0 = derived from the target areas and
    /// available memory.
    pub max_tie_points: usize,
    /// Raster 1 pixel width over raster 2 pixel width.
    pub pixel_size_x_relation: f64,
    /// Raster 1 pixel height over raster 2 pixel height.
    pub pixel_size_y_relation: f64,
    /// Registry name of the fitted transformation.
    pub transformation_name: String,
    /// Maximum direct and inverse mapping error of a tie-point, in pixels.
    pub geometric_filter_max_error: f64,
    /// Run RANSAC over the matched tie-points.
    pub enable_geometry_filter: bool,
    /// RANSAC assurance in [0, 1]; 0 = derived from the transformation.
    pub geometry_filter_assurance: f64,
    /// Rescale factor of the coarse pass in (0, 1]. 1 = single pass.
    pub subsample_factor: f64,
    /// The coarse pass needs at least `min_tie_points_factor` times the
    /// transformation's minimum number of tie-points.
    pub min_tie_points_factor: f64,
    /// Minimum convex-hull coverage of the raster 1 target area by the coarse
    /// tie-points, in percent.
    pub min_area_coverage_percent: f64,
    pub enable_multi_thread: bool,
    /// Call `progress` at each stage.
    pub enable_progress: bool,
    /// Interest points are capped per cell of a `split x split` grid.
    pub sub_sectors_split_factor: usize,
    /// Maximum x and y distance between matched points in pixels. 0 = off.
    pub max_r1_to_r2_offset: f64,
    pub interpolation: InterpolationMethod,
    pub memory_policy: MemoryPolicy,
    /// Share of the available memory working matrices may use, in (0, 100].
    pub max_memory_percent: f64,
    pub moravec: MoravecConfig,
    pub surf: SurfConfig,
    /// Base seed for RANSAC workers. `None` seeds from OS entropy.
    pub ransac_seed: Option<u64>,
    #[serde(skip)]
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for TiePointsLocatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiePointsLocatorConfig")
            .field("strategy", &self.strategy)
            .field("max_tie_points", &self.max_tie_points)
            .field("pixel_size_x_relation", &self.pixel_size_x_relation)
            .field("pixel_size_y_relation", &self.pixel_size_y_relation)
            .field("transformation_name", &self.transformation_name)
            .field("geometric_filter_max_error", &self.geometric_filter_max_error)
            .field("enable_geometry_filter", &self.enable_geometry_filter)
            .field("geometry_filter_assurance", &self.geometry_filter_assurance)
            .field("subsample_factor", &self.subsample_factor)
            .field("min_tie_points_factor", &self.min_tie_points_factor)
            .field("min_area_coverage_percent", &self.min_area_coverage_percent)
            .field("enable_multi_thread", &self.enable_multi_thread)
            .field("enable_progress", &self.enable_progress)
            .field("sub_sectors_split_factor", &self.sub_sectors_split_factor)
            .field("max_r1_to_r2_offset", &self.max_r1_to_r2_offset)
            .field("interpolation", &self.interpolation)
            .field("memory_policy", &self.memory_policy)
            .field("max_memory_percent", &self.max_memory_percent)
            .field("moravec", &self.moravec)
            .field("surf", &self.surf)
            .field("ransac_seed", &self.ransac_seed)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Default for TiePointsLocatorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Moravec,
            max_tie_points: 0,
            pixel_size_x_relation: 1.0,
            pixel_size_y_relation: 1.0,
            transformation_name: "Affine".to_string(),
            geometric_filter_max_error: 2.0,
            enable_geometry_filter: true,
            geometry_filter_assurance: 0.75,
            subsample_factor: 1.0,
            min_tie_points_factor: 2.0,
            min_area_coverage_percent: 25.0,
            enable_multi_thread: true,
            enable_progress: false,
            sub_sectors_split_factor: 3,
            max_r1_to_r2_offset: 0.0,
            interpolation: InterpolationMethod::Nearest,
            memory_policy: MemoryPolicy::Auto,
            max_memory_percent: 40.0,
            moravec: MoravecConfig::default(),
            surf: SurfConfig::default(),
            ransac_seed: None,
            progress: None,
        }
    }
}

impl TiePointsLocatorConfig {
    pub fn is_two_pass(&self) -> bool {
        self.subsample_factor < 1.0
    }

    /// Checks every tunable. Raster-dependent checks happen in `locate`.
    pub fn validate(&self) -> Result<(), LocatorError> {
        for (name, value) in [
            ("pixel_size_x_relation", self.pixel_size_x_relation),
            ("pixel_size_y_relation", self.pixel_size_y_relation),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(LocatorError::invalid(name, "must be a positive number"));
            }
        }
        if self.geometric_filter_max_error.is_nan() || self.geometric_filter_max_error < 0.0 {
            return Err(LocatorError::invalid(
                "geometric_filter_max_error",
                "must not be negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.geometry_filter_assurance) {
            return Err(LocatorError::invalid(
                "geometry_filter_assurance",
                "must be within [0, 1]",
            ));
        }
        if self.subsample_factor.is_nan()
            || self.subsample_factor <= 0.0
            || self.subsample_factor > 1.0
        {
            return Err(LocatorError::invalid("subsample_factor", "must be within (0, 1]"));
        }
        if self.min_tie_points_factor.is_nan() || self.min_tie_points_factor < 1.0 {
            return Err(LocatorError::invalid("min_tie_points_factor", "must be >= 1"));
        }
        if !(0.0..=100.0).contains(&self.min_area_coverage_percent) {
            return Err(LocatorError::invalid(
                "min_area_coverage_percent",
                "must be within [0, 100]",
            ));
        }
        if self.sub_sectors_split_factor == 0 {
            return Err(LocatorError::invalid("sub_sectors_split_factor", "must be >= 1"));
        }
        if self.max_r1_to_r2_offset.is_nan() || self.max_r1_to_r2_offset < 0.0 {
            return Err(LocatorError::invalid("max_r1_to_r2_offset", "must not be negative"));
        }
        if self.max_memory_percent.is_nan()
            || self.max_memory_percent <= 0.0
            || self.max_memory_percent > 100.0
        {
            return Err(LocatorError::invalid("max_memory_percent", "must be within (0, 100]"));
        }
        match self.strategy {
            StrategyKind::Moravec => self.moravec.validate(),
            StrategyKind::Surf => self.surf.validate(),
        }
    }
}
