//! Tiepoints - tie-point location and robust transformation fitting between
//! overlapping rasters.
//!
//! This library provides:
//! - Interest point strategies (Moravec corners, SURF-like blobs) with
//!   mutual-best descriptor matching
//! - A registry of geometric transformations fitted by least squares
//! - A RANSAC outlier filter with weighted sampling
//! - A one or two pass locator tying it all together
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tiepoints::{RasterInput, TiePointsLocator, TiePointsLocatorConfig};
//!
//! let locator = TiePointsLocator::new(TiePointsLocatorConfig {
//!     transformation_name: "RST".to_string(),
//!     subsample_factor: 0.5,
//!     ..Default::default()
//! })?;
//!
//! let output = locator.locate(
//!     RasterInput::new(Arc::new(reference)),
//!     RasterInput::new(Arc::new(adjusted)),
//! )?;
//!
//! if let Some(transformation) = output.transformation {
//!     println!("{} tie-points, rmse {:.3}", output.tie_points.len(), transformation.direct_map_rmse());
//! }
//! ```

pub mod error;
pub mod geometry;
pub mod locator;
pub mod matrix;
pub mod progress;
pub mod ransac;
pub mod raster;
pub mod spatial;
pub mod strategy;
pub mod transform;

pub use error::{LocatorError, MatrixError, RansacError, TransformError};
pub use locator::{LocatorOutput, TiePointsLocator, TiePointsLocatorConfig};
pub use matrix::{Matrix, MemoryPolicy};
pub use progress::{LocatorProgress, LocatorStage, ProgressCallback};
pub use ransac::{RansacConfig, RansacFilter, RansacOutcome};
pub use raster::{
    AccessPolicy, InterpolationMethod, MemoryRaster, Raster, RasterGrid, TargetArea,
    pixel_size_relation,
};
pub use strategy::{
    InterestPointStrategy, MatchedPair, MoravecConfig, MoravecStrategy, RasterInput,
    StrategyKind, StrategyParameters, SurfConfig, SurfStrategy,
};
pub use transform::{GTParameters, GeometricTransformation, TiePoint, TransformRegistry};
