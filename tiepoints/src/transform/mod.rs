//! Parametric 2-D geometric transformations fitted by least squares.
//!
//! A model ([`TransformModel`]) only knows how to write the linear equations a
//! tie-point contributes and how to evaluate its coefficients. Fitting, mapping
//! and error metrics are shared by every model and exposed both as provided trait
//! methods (stateless, parameters passed in) and through
//! [`GeometricTransformation`], which owns its current fitted [`GTParameters`].
//!
//! Direct mapping goes from raster 1 coordinates (`pt1`) to raster 2
//! coordinates (`pt2`); inverse mapping goes the other way. Both directions are
//! fitted independently from the same tie-points.


mod models;
mod registry;

pub use models::{AffineDecomposition, AffineModel, PolynomialModel, ProjectiveModel, RstModel};
pub use registry::{ModelConstructor, TransformRegistry};

use glam::DVec2;
use nalgebra::{DMatrix, DVector, SVD};
use serde::{Deserialize, Serialize};

use crate::error::TransformError;

/// Ratio between smallest and largest singular value below which a system is singular.
const SINGULAR_VALUE_RATIO: f64 = 1e-12;

/// A correspondence between a raster 1 coordinate and a raster 2 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TiePoint {
    pub pt1: DVec2,
    pub pt2: DVec2,
}

impl TiePoint {
    pub fn new(pt1: DVec2, pt2: DVec2) -> Self {
        Self { pt1, pt2 }
    }

    pub fn from_coords(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            pt1: DVec2::new(x1, y1),
            pt2: DVec2::new(x2, y2),
        }
    }
}

/// Tie-points used for fitting plus the fitted direct and inverse coefficients.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GTParameters {
    pub tie_points: Vec<TiePoint>,
    pub direct_parameters: Vec<f64>,
    pub inverse_parameters: Vec<f64>,
}

impl GTParameters {
    pub fn from_tie_points(tie_points: Vec<TiePoint>) -> Self {
        Self {
            tie_points,
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        self.tie_points.clear();
        self.direct_parameters.clear();
        self.inverse_parameters.clear();
    }
}

/// One family of 2-D mappings.
pub trait TransformModel: Send + Sync + std::fmt::Debug {
    /// Registry identifier.
    fn name(&self) -> &'static str;

    fn min_required_tie_points(&self) -> usize;

    /// Coefficients per direction.
    fn parameters_count(&self) -> usize;

    /// Writes the x and y equations of the correspondence `src -> dst` into
    /// design rows `row` and `row + 1`.
    fn write_equations(
        &self,
        src: DVec2,
        dst: DVec2,
        design: &mut DMatrix<f64>,
        target: &mut DVector<f64>,
        row: usize,
    );

    /// Evaluates the mapping described by `coefficients` at `pt`.
    fn evaluate(&self, coefficients: &[f64], pt: DVec2) -> DVec2;

    fn clone_box(&self) -> Box<dyn TransformModel>;

    /// Structural check of the coefficient vector lengths.
    fn is_valid(&self, params: &GTParameters) -> bool {
        params.direct_parameters.len() == self.parameters_count()
            && params.inverse_parameters.len() == self.parameters_count()
    }

    /// Fits direct and inverse coefficients from `params.tie_points`.
    ///
    /// On failure the coefficient vectors of `params` are left untouched.
    fn compute_parameters(&self, params: &mut GTParameters) -> Result<(), TransformError> {
        let required = self.min_required_tie_points();
        if params.tie_points.len() < required {
            return Err(TransformError::InsufficientTiePoints {
                required,
                supplied: params.tie_points.len(),
            });
        }

        let direct = solve_least_squares(self, &params.tie_points, |tp| (tp.pt1, tp.pt2))?;
        let inverse = solve_least_squares(self, &params.tie_points, |tp| (tp.pt2, tp.pt1))?;

        params.direct_parameters = direct;
        params.inverse_parameters = inverse;
        Ok(())
    }

    #[inline]
    fn direct_map(&self, params: &GTParameters, pt1: DVec2) -> DVec2 {
        debug_assert!(self.is_valid(params));
        self.evaluate(&params.direct_parameters, pt1)
    }

    #[inline]
    fn inverse_map(&self, params: &GTParameters, pt2: DVec2) -> DVec2 {
        debug_assert!(self.is_valid(params));
        self.evaluate(&params.inverse_parameters, pt2)
    }

    #[inline]
    fn direct_mapping_error(&self, tie_point: &TiePoint, params: &GTParameters) -> f64 {
        self.direct_map(params, tie_point.pt1).distance(tie_point.pt2)
    }

    #[inline]
    fn inverse_mapping_error(&self, tie_point: &TiePoint, params: &GTParameters) -> f64 {
        self.inverse_map(params, tie_point.pt2).distance(tie_point.pt1)
    }

    /// Direct RMSE over `tie_points`; 0 for an empty set.
    fn direct_map_rmse(&self, tie_points: &[TiePoint], params: &GTParameters) -> f64 {
        rmse(tie_points.iter().map(|tp| self.direct_mapping_error(tp, params)))
    }

    /// Inverse RMSE over `tie_points`; 0 for an empty set.
    fn inverse_map_rmse(&self, tie_points: &[TiePoint], params: &GTParameters) -> f64 {
        rmse(tie_points.iter().map(|tp| self.inverse_mapping_error(tp, params)))
    }
}

/// A transformation model together with its current fitted state.
#[derive(Debug)]
pub struct GeometricTransformation {
    model: Box<dyn TransformModel>,
    parameters: GTParameters,
}

impl Clone for GeometricTransformation {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone_box(),
            parameters: self.parameters.clone(),
        }
    }
}

impl GeometricTransformation {
    pub fn new(model: Box<dyn TransformModel>) -> Self {
        Self {
            model,
            parameters: GTParameters::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.model.name()
    }

    pub fn model(&self) -> &dyn TransformModel {
        self.model.as_ref()
    }

    pub fn min_required_tie_points(&self) -> usize {
        self.model.min_required_tie_points()
    }

    /// Fits the model to `params.tie_points` and adopts the result.
    ///
    /// On failure the previous state is kept.
    pub fn initialize(&mut self, mut params: GTParameters) -> Result<(), TransformError> {
        self.model.compute_parameters(&mut params)?;
        self.parameters = params;
        Ok(())
    }

    /// Adopts already fitted parameters without refitting.
    pub fn set_parameters(&mut self, params: GTParameters) -> Result<(), TransformError> {
        if !self.model.is_valid(&params) {
            return Err(TransformError::InvalidParameters);
        }
        self.parameters = params;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.model.is_valid(&self.parameters)
    }

    pub fn parameters(&self) -> &GTParameters {
        &self.parameters
    }

    pub fn tie_points(&self) -> &[TiePoint] {
        &self.parameters.tie_points
    }

    pub fn direct_map(&self, pt1: DVec2) -> DVec2 {
        self.model.direct_map(&self.parameters, pt1)
    }

    pub fn inverse_map(&self, pt2: DVec2) -> DVec2 {
        self.model.inverse_map(&self.parameters, pt2)
    }

    pub fn direct_mapping_error(&self, tie_point: &TiePoint) -> f64 {
        self.model.direct_mapping_error(tie_point, &self.parameters)
    }

    pub fn inverse_mapping_error(&self, tie_point: &TiePoint) -> f64 {
        self.model.inverse_mapping_error(tie_point, &self.parameters)
    }

    /// Direct RMSE over the tie-points the transformation was fitted with.
    pub fn direct_map_rmse(&self) -> f64 {
        self.model
            .direct_map_rmse(&self.parameters.tie_points, &self.parameters)
    }

    pub fn inverse_map_rmse(&self) -> f64 {
        self.model
            .inverse_map_rmse(&self.parameters.tie_points, &self.parameters)
    }

    pub fn direct_map_rmse_of(&self, tie_points: &[TiePoint]) -> f64 {
        self.model.direct_map_rmse(tie_points, &self.parameters)
    }

    pub fn inverse_map_rmse_of(&self, tie_points: &[TiePoint]) -> f64 {
        self.model.inverse_map_rmse(tie_points, &self.parameters)
    }

    /// Largest direct mapping error over the fitted tie-points; 0 when empty.
    pub fn max_direct_mapping_error(&self) -> f64 {
        self.max_direct_mapping_error_of(&self.parameters.tie_points)
    }

    pub fn max_inverse_mapping_error(&self) -> f64 {
        self.max_inverse_mapping_error_of(&self.parameters.tie_points)
    }

    pub fn max_direct_mapping_error_of(&self, tie_points: &[TiePoint]) -> f64 {
        tie_points
            .iter()
            .map(|tp| self.direct_mapping_error(tp))
            .fold(0.0, f64::max)
    }

    pub fn max_inverse_mapping_error_of(&self, tie_points: &[TiePoint]) -> f64 {
        tie_points
            .iter()
            .map(|tp| self.inverse_mapping_error(tp))
            .fold(0.0, f64::max)
    }
}

impl std::fmt::Display for GeometricTransformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(tie_points={}, direct={:?})",
            self.name(),
            self.parameters.tie_points.len(),
            self.parameters.direct_parameters
        )
    }
}

fn rmse(errors: impl Iterator<Item = f64>) -> f64 {
    let (sum_sq, count) = errors.fold((0.0, 0usize), |(sum, n), e| (sum + e * e, n + 1));
    if count == 0 {
        0.0
    } else {
        (sum_sq / count as f64).sqrt()
    }
}

/// Solves the over-determined system of `model` for the `(src, dst)` pairs.
///
/// Columns are equilibrated before the SVD so polynomial terms of very
/// different magnitudes do not masquerade as rank deficiency.
fn solve_least_squares<M, F>(
    model: &M,
    tie_points: &[TiePoint],
    select: F,
) -> Result<Vec<f64>, TransformError>
where
    M: TransformModel + ?Sized,
    F: Fn(&TiePoint) -> (DVec2, DVec2),
{
    let cols = model.parameters_count();
    let rows = tie_points.len() * 2;

    let mut design = DMatrix::<f64>::zeros(rows, cols);
    let mut target = DVector::<f64>::zeros(rows);
    for (idx, tp) in tie_points.iter().enumerate() {
        let (src, dst) = select(tp);
        model.write_equations(src, dst, &mut design, &mut target, idx * 2);
    }

    let mut scales = vec![1.0; cols];
    for (col, scale) in scales.iter_mut().enumerate() {
        let norm = design.column(col).norm();
        if norm > 0.0 {
            *scale = 1.0 / norm;
            design.column_mut(col).scale_mut(*scale);
        }
    }

    let svd = SVD::new(design, true, true);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if max_sv.is_nan() || max_sv <= 0.0 || min_sv / max_sv < SINGULAR_VALUE_RATIO {
        return Err(TransformError::SingularSystem);
    }

    let solution = svd
        .solve(&target, max_sv * f64::EPSILON)
        .map_err(|_| TransformError::SingularSystem)?;

    let coefficients: Vec<f64> = solution
        .iter()
        .zip(&scales)
        .map(|(value, scale)| value * scale)
        .collect();

    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(TransformError::SingularSystem);
    }
    Ok(coefficients)
}
