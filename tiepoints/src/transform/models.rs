//! Built-in transformation models.

use glam::DVec2;
use nalgebra::{DMatrix, DVector};

use super::TransformModel;

// ============================================================================
// Rotation + uniform scale + translation
// ============================================================================

/// `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`.
///
/// Coefficients: `[a, b, tx, ty]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RstModel;

impl TransformModel for RstModel {
    fn name(&self) -> &'static str {
        "RST"
    }

    fn min_required_tie_points(&self) -> usize {
        2
    }

    fn parameters_count(&self) -> usize {
        4
    }

    fn write_equations(
        &self,
        src: DVec2,
        dst: DVec2,
        design: &mut DMatrix<f64>,
        target: &mut DVector<f64>,
        row: usize,
    ) {
        design[(row, 0)] = src.x;
        design[(row, 1)] = -src.y;
        design[(row, 2)] = 1.0;
        target[row] = dst.x;

        design[(row + 1, 0)] = src.y;
        design[(row + 1, 1)] = src.x;
        design[(row + 1, 3)] = 1.0;
        target[row + 1] = dst.y;
    }

    fn evaluate(&self, c: &[f64], pt: DVec2) -> DVec2 {
        DVec2::new(
            c[0] * pt.x - c[1] * pt.y + c[2],
            c[1] * pt.x + c[0] * pt.y + c[3],
        )
    }

    fn clone_box(&self) -> Box<dyn TransformModel> {
        Box::new(*self)
    }
}

// ============================================================================
// Affine
// ============================================================================

/// `x' = a·x + b·y + c`, `y' = d·x + e·y + f`.
///
/// Coefficients: `[a, b, c, d, e, f]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffineModel;

impl TransformModel for AffineModel {
    fn name(&self) -> &'static str {
        "Affine"
    }

    fn min_required_tie_points(&self) -> usize {
        3
    }

    fn parameters_count(&self) -> usize {
        6
    }

    fn write_equations(
        &self,
        src: DVec2,
        dst: DVec2,
        design: &mut DMatrix<f64>,
        target: &mut DVector<f64>,
        row: usize,
    ) {
        design[(row, 0)] = src.x;
        design[(row, 1)] = src.y;
        design[(row, 2)] = 1.0;
        target[row] = dst.x;

        design[(row + 1, 3)] = src.x;
        design[(row + 1, 4)] = src.y;
        design[(row + 1, 5)] = 1.0;
        target[row + 1] = dst.y;
    }

    fn evaluate(&self, c: &[f64], pt: DVec2) -> DVec2 {
        DVec2::new(
            c[0] * pt.x + c[1] * pt.y + c[2],
            c[3] * pt.x + c[4] * pt.y + c[5],
        )
    }

    fn clone_box(&self) -> Box<dyn TransformModel> {
        Box::new(*self)
    }
}

/// Geometric reading of affine coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineDecomposition {
    pub translation_x: f64,
    pub translation_y: f64,
    pub scaling_factor_x: f64,
    pub scaling_factor_y: f64,
    pub skew: f64,
    pub squeeze: f64,
    pub scaling: f64,
    /// Radians, counter-clockwise positive.
    pub rotation: f64,
}

impl AffineDecomposition {
    /// Decomposes `[a, b, c, d, e, f]`; `None` if the linear part is singular
    /// or the slice is not six coefficients long.
    pub fn from_parameters(params: &[f64]) -> Option<Self> {
        let &[a, b, c, d, e, f] = params else {
            return None;
        };

        let det = a * e - b * d;
        if det == 0.0 {
            return None;
        }

        let scaling_factor_x = (a * a + d * d).sqrt();
        let scaling_factor_y = (b * b + e * e).sqrt();

        let squeeze = if det > 0.0 {
            (scaling_factor_x / scaling_factor_y).sqrt()
        } else {
            (scaling_factor_y / scaling_factor_x).sqrt()
        };

        let rotation = if a == 0.0 {
            d.signum() * std::f64::consts::FRAC_PI_2
        } else {
            (d / a).atan()
        };

        Some(Self {
            translation_x: c,
            translation_y: f,
            scaling_factor_x,
            scaling_factor_y,
            skew: (a * b + d * e) / det,
            squeeze,
            scaling: (scaling_factor_x * scaling_factor_y).sqrt(),
            rotation,
        })
    }
}

// ============================================================================
// Polynomial
// ============================================================================

/// Full bivariate polynomial of degree 1..=3.
///
/// Terms are ordered by total degree then by decreasing power of x:
/// `1, x, y, x², xy, y², x³, x²y, xy², y³`. Coefficients hold all x' terms
/// followed by all y' terms.
#[derive(Debug, Clone, Copy)]
pub struct PolynomialModel {
    degree: u32,
}

impl PolynomialModel {
    /// # Panics
    ///
    /// Panics if `degree` is not 1, 2 or 3.
    pub fn new(degree: u32) -> Self {
        assert!(
            (1..=3).contains(&degree),
            "polynomial degree must be 1, 2 or 3"
        );
        Self { degree }
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    fn terms_count(&self) -> usize {
        let d = self.degree as usize;
        (d + 1) * (d + 2) / 2
    }

    fn for_each_term(&self, pt: DVec2, mut f: impl FnMut(usize, f64)) {
        let mut idx = 0;
        for total in 0..=self.degree as i32 {
            for y_pow in 0..=total {
                f(idx, pt.x.powi(total - y_pow) * pt.y.powi(y_pow));
                idx += 1;
            }
        }
    }
}

impl TransformModel for PolynomialModel {
    fn name(&self) -> &'static str {
        match self.degree {
            1 => "FirstDegreePolynomial",
            2 => "SecondDegreePolynomial",
            _ => "ThirdDegreePolynomial",
        }
    }

    fn min_required_tie_points(&self) -> usize {
        self.terms_count() + 1
    }

    fn parameters_count(&self) -> usize {
        self.terms_count() * 2
    }

    fn write_equations(
        &self,
        src: DVec2,
        dst: DVec2,
        design: &mut DMatrix<f64>,
        target: &mut DVector<f64>,
        row: usize,
    ) {
        let n = self.terms_count();
        self.for_each_term(src, |idx, value| {
            design[(row, idx)] = value;
            design[(row + 1, n + idx)] = value;
        });
        target[row] = dst.x;
        target[row + 1] = dst.y;
    }

    fn evaluate(&self, c: &[f64], pt: DVec2) -> DVec2 {
        let n = self.terms_count();
        let mut out = DVec2::ZERO;
        self.for_each_term(pt, |idx, value| {
            out.x += c[idx] * value;
            out.y += c[n + idx] * value;
        });
        out
    }

    fn clone_box(&self) -> Box<dyn TransformModel> {
        Box::new(*self)
    }
}

// ============================================================================
// Projective
// ============================================================================

/// `x' = (a·x + b·y + c) / (g·x + h·y + 1)`,
/// `y' = (d·x + e·y + f) / (g·x + h·y + 1)`.
///
/// Coefficients: `[a, b, c, d, e, f, g, h]`. Fitted by the linearised
/// (multiplied-through) equations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectiveModel;

impl TransformModel for ProjectiveModel {
    fn name(&self) -> &'static str {
        "Projective"
    }

    fn min_required_tie_points(&self) -> usize {
        4
    }

    fn parameters_count(&self) -> usize {
        8
    }

    fn write_equations(
        &self,
        src: DVec2,
        dst: DVec2,
        design: &mut DMatrix<f64>,
        target: &mut DVector<f64>,
        row: usize,
    ) {
        design[(row, 0)] = src.x;
        design[(row, 1)] = src.y;
        design[(row, 2)] = 1.0;
        design[(row, 6)] = -src.x * dst.x;
        design[(row, 7)] = -src.y * dst.x;
        target[row] = dst.x;

        design[(row + 1, 3)] = src.x;
        design[(row + 1, 4)] = src.y;
        design[(row + 1, 5)] = 1.0;
        design[(row + 1, 6)] = -src.x * dst.y;
        design[(row + 1, 7)] = -src.y * dst.y;
        target[row + 1] = dst.y;
    }

    fn evaluate(&self, c: &[f64], pt: DVec2) -> DVec2 {
        let w = c[6] * pt.x + c[7] * pt.y + 1.0;
        DVec2::new(
            (c[0] * pt.x + c[1] * pt.y + c[2]) / w,
            (c[3] * pt.x + c[4] * pt.y + c[5]) / w,
        )
    }

    fn clone_box(&self) -> Box<dyn TransformModel> {
        Box::new(*self)
    }
}
