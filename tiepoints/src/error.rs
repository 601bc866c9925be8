//! Error types for tie-points location.
//!
//! Configuration problems are reported eagerly by the `validate` methods and at
//! locator initialization. Numerical dead ends ("no transformation found") are
//! not errors: they surface as an absent transformation in a successful result.

use std::io;

use thiserror::Error;

/// Errors from fitting a geometric transformation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("Insufficient tie-points: {supplied} supplied, {required} required")]
    InsufficientTiePoints { required: usize, supplied: usize },

    #[error("Singular least-squares system")]
    SingularSystem,

    #[error("Transformation parameters are not valid for this model")]
    InvalidParameters,
}

/// Errors from the RANSAC outlier filter.
#[derive(Debug, Error)]
pub enum RansacError {
    #[error("Mapping error thresholds must be non-negative")]
    NegativeThreshold,

    #[error("Assurance must be within [0, 1], got {0}")]
    InvalidAssurance(f64),

    #[error("Weights length {weights} does not match tie-points count {tie_points}")]
    WeightsLengthMismatch { weights: usize, tie_points: usize },

    #[error("Tie-point weights must be non-negative with a positive sum")]
    InvalidWeights,

    #[error("Unknown transformation '{0}'")]
    UnknownTransformation(String),

    #[error("Not enough tie-points: {supplied} supplied, {required} required")]
    NotEnoughTiePoints { required: usize, supplied: usize },

    #[error("No transformation reached consensus")]
    NoConsensus,

    #[error("Failed to start RANSAC workers: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors from allocating working matrices.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("Matrix size overflow: {lines} x {columns} elements of {element_size} bytes")]
    SizeOverflow {
        lines: usize,
        columns: usize,
        element_size: usize,
    },

    #[error("Failed to create matrix spill file: {0}")]
    CreateTempFile(#[source] io::Error),

    #[error("Failed to resize matrix spill file to {bytes} bytes: {source}")]
    ResizeTempFile {
        bytes: u64,
        #[source]
        source: io::Error,
    },

    #[error("Failed to memory-map matrix spill file: {0}")]
    MapTempFile(#[source] io::Error),
}

/// Errors reported by the tie-points locator and its strategies.
#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Unknown interest point strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Unknown transformation '{0}'")]
    UnknownTransformation(String),

    #[error("Invalid band selection for raster {raster}: {reason}")]
    InvalidBands { raster: u8, reason: String },

    #[error("Invalid target area for raster {raster}: {reason}")]
    InvalidTargetArea { raster: u8, reason: String },

    #[error("Raster {raster} has no read access")]
    NoReadAccess { raster: u8 },

    #[error("Strategy used before initialization")]
    NotInitialized,

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("Failed to start locator workers: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Geometry filter failed: {0}")]
    Ransac(#[source] RansacError),
}

impl LocatorError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        LocatorError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_tie_points_message() {
        let err = TransformError::InsufficientTiePoints {
            required: 3,
            supplied: 2,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient tie-points: 2 supplied, 3 required"
        );
    }

    #[test]
    fn test_invalid_parameter_message() {
        let err = LocatorError::invalid("geometry_filter_assurance", "must be within [0, 1]");
        assert_eq!(
            err.to_string(),
            "Invalid parameter 'geometry_filter_assurance': must be within [0, 1]"
        );
    }

    #[test]
    fn test_matrix_error_is_transparent() {
        let err: LocatorError = MatrixError::SizeOverflow {
            lines: usize::MAX,
            columns: 2,
            element_size: 4,
        }
        .into();
        assert!(err.to_string().starts_with("Matrix size overflow"));
    }

    #[test]
    fn test_weights_mismatch_message() {
        let err = RansacError::WeightsLengthMismatch {
            weights: 3,
            tie_points: 4,
        };
        assert_eq!(
            err.to_string(),
            "Weights length 3 does not match tie-points count 4"
        );
    }
}
