use std::fmt;

use nalgebra::Matrix2;

use super::frame::Frame;
use super::point::Point;
use crate::jointfit_errors::JointfitError;

/// An affine plane transform: `x' = a11 x + a12 y + dx`,
/// `y' = a21 x + a22 y + dy`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTransform {
    pub a11: f64,
    pub a12: f64,
    pub a21: f64,
    pub a22: f64,
    pub dx: f64,
    pub dy: f64,
}

impl LinearTransform {
    pub fn new(a11: f64, a12: f64, a21: f64, a22: f64, dx: f64, dy: f64) -> Self {
        LinearTransform {
            a11,
            a12,
            a21,
            a22,
            dx,
            dy,
        }
    }

    pub fn identity() -> Self {
        LinearTransform::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0)
    }

    pub fn shift(dx: f64, dy: f64) -> Self {
        LinearTransform::new(1.0, 0.0, 0.0, 1.0, dx, dy)
    }

    /// Rotation by `angle` radians about the origin.
    pub fn rotation(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        LinearTransform::new(c, -s, s, c, 0.0, 0.0)
    }

    pub fn scaling(sx: f64, sy: f64) -> Self {
        LinearTransform::new(sx, 0.0, 0.0, sy, 0.0, 0.0)
    }

    pub fn apply(&self, p: &Point) -> Point {
        Point::new(
            self.a11 * p.x + self.a12 * p.y + self.dx,
            self.a21 * p.x + self.a22 * p.y + self.dy,
        )
    }

    pub fn determinant(&self) -> f64 {
        self.a11 * self.a22 - self.a12 * self.a21
    }

    pub fn jacobian(&self) -> Matrix2<f64> {
        Matrix2::new(self.a11, self.a12, self.a21, self.a22)
    }

    /// The transform equivalent to applying `other` first, then `self`.
    pub fn compose(&self, other: &LinearTransform) -> LinearTransform {
        LinearTransform {
            a11: self.a11 * other.a11 + self.a12 * other.a21,
            a12: self.a11 * other.a12 + self.a12 * other.a22,
            a21: self.a21 * other.a11 + self.a22 * other.a21,
            a22: self.a21 * other.a12 + self.a22 * other.a22,
            dx: self.a11 * other.dx + self.a12 * other.dy + self.dx,
            dy: self.a21 * other.dx + self.a22 * other.dy + self.dy,
        }
    }

    /// Exact inverse. Fails on a (numerically) singular transform.
    pub fn invert(&self) -> Result<LinearTransform, JointfitError> {
        let det = self.determinant();
        if det.abs() < 1e-30 || !det.is_finite() {
            return Err(JointfitError::SingularTransform(det));
        }
        let b11 = self.a22 / det;
        let b12 = -self.a12 / det;
        let b21 = -self.a21 / det;
        let b22 = self.a11 / det;
        Ok(LinearTransform {
            a11: b11,
            a12: b12,
            a21: b21,
            a22: b22,
            dx: -(b11 * self.dx + b12 * self.dy),
            dy: -(b21 * self.dx + b22 * self.dy),
        })
    }
}

impl Default for LinearTransform {
    fn default() -> Self {
        LinearTransform::identity()
    }
}

impl fmt::Display for LinearTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} | {}] [{} {} | {}]",
            self.a11, self.a12, self.dx, self.a21, self.a22, self.dy
        )
    }
}

/// The shift-and-scale transform that maps `frame` onto [-1, 1]^2.
/// Used to precondition polynomial fits.
pub fn normalize_coordinates(frame: &Frame) -> LinearTransform {
    let center = frame.center();
    // degenerate frames keep a unit scale rather than blowing up
    let sx = if frame.width() > 0.0 { 2.0 / frame.width() } else { 1.0 };
    let sy = if frame.height() > 0.0 { 2.0 / frame.height() } else { 1.0 };
    LinearTransform::new(sx, 0.0, 0.0, sy, -sx * center.x, -sy * center.y)
}
