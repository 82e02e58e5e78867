//! The polymorphic 2D transform.
//!
//! The calibration pipeline composes transforms of very different natures:
//! affine frame changes, fitted distortion polynomials, tangent-plane
//! (de)projections and free compositions of all of these. [`Transform`] is
//! the closed set of those variants; operations dispatch by matching, and
//! compositions collapse to a single polynomial whenever both sides are
//! polynomial and the product degree fits the cap.

use nalgebra::Matrix2;

use super::frame::Frame;
use super::linear::LinearTransform;
use super::point::{FatPoint, Point};
use super::poly::PolyTransform;
use super::tangent::{TanPix2RaDec, TanRaDec2Pix};
use crate::constants::{DERIVATIVE_STEP, MAX_POLY_DEGREE};
use crate::jointfit_errors::JointfitError;

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Identity,
    Linear(LinearTransform),
    Poly(PolyTransform),
    /// Sky (ra, dec, degrees) to tangent plane (radians).
    SkyToTangentPlane(TanRaDec2Pix),
    /// Tangent-plane-like input to sky (degrees), with optional corrections.
    TangentPlaneToSky(TanPix2RaDec),
    /// `second ∘ first`: the first element is applied first.
    Composed(Box<Transform>, Box<Transform>),
}

impl Transform {
    pub fn apply(&self, p: &Point) -> Point {
        match self {
            Transform::Identity => *p,
            Transform::Linear(lin) => lin.apply(p),
            Transform::Poly(poly) => poly.apply(p),
            Transform::SkyToTangentPlane(proj) => proj.apply(p),
            Transform::TangentPlaneToSky(wcs) => wcs.apply(p),
            Transform::Composed(first, second) => second.apply(&first.apply(p)),
        }
    }

    /// Transform a point together with its error ellipse, propagating the
    /// covariance through the local Jacobian as J Σ Jᵀ.
    pub fn apply_fat(&self, p: &FatPoint) -> FatPoint {
        let out = self.apply(&p.point());
        let j = self.derivative(&p.point(), DERIVATIVE_STEP);
        let (a, b, c, d) = (j[(0, 0)], j[(0, 1)], j[(1, 0)], j[(1, 1)]);
        FatPoint {
            x: out.x,
            y: out.y,
            vx: a * a * p.vx + b * b * p.vy + 2.0 * a * b * p.vxy,
            vy: c * c * p.vx + d * d * p.vy + 2.0 * c * d * p.vxy,
            vxy: a * c * p.vx + b * d * p.vy + (a * d + b * c) * p.vxy,
        }
    }

    /// Local 2x2 Jacobian at `p`. Analytic for linear and polynomial
    /// variants, two-point finite differences with the given step otherwise.
    pub fn derivative(&self, p: &Point, step: f64) -> Matrix2<f64> {
        match self {
            Transform::Identity => Matrix2::identity(),
            Transform::Linear(lin) => lin.jacobian(),
            Transform::Poly(poly) => poly.derivative(p),
            _ => {
                let dx = self.apply(&Point::new(p.x + step, p.y)) - self.apply(&Point::new(p.x - step, p.y));
                let dy = self.apply(&Point::new(p.x, p.y + step)) - self.apply(&Point::new(p.x, p.y - step));
                let h = 2.0 * step;
                Matrix2::new(dx.x / h, dy.x / h, dx.y / h, dy.y / h)
            }
        }
    }

    /// The transform equivalent to applying `other` first, then `self`.
    ///
    /// Linear and polynomial pairs collapse analytically (the polynomial
    /// product degree being capped at [`MAX_POLY_DEGREE`]); any other pair
    /// becomes a [`Transform::Composed`].
    pub fn compose(&self, other: &Transform) -> Transform {
        match (self, other) {
            (Transform::Identity, _) => other.clone(),
            (_, Transform::Identity) => self.clone(),
            (Transform::Linear(a), Transform::Linear(b)) => Transform::Linear(a.compose(b)),
            (Transform::Linear(a), Transform::Poly(b)) => {
                Transform::Poly(PolyTransform::from(a).compose(b))
            }
            (Transform::Poly(a), Transform::Linear(b)) => Transform::Poly(a.compose_linear(b)),
            (Transform::Poly(a), Transform::Poly(b)) => {
                if a.degree() * b.degree() <= MAX_POLY_DEGREE {
                    Transform::Poly(a.compose(b))
                } else {
                    Transform::Composed(Box::new(other.clone()), Box::new(self.clone()))
                }
            }
            _ => Transform::Composed(Box::new(other.clone()), Box::new(self.clone())),
        }
    }

    /// Inverse transform. Exact for the identity, affine and projection
    /// variants; a least-squares polynomial approximation over `domain` for
    /// polynomials. Generic compositions and corrected plane-to-sky
    /// transforms are not invertible here.
    pub fn invert(&self, domain: &Frame, precision: f64) -> Result<Transform, JointfitError> {
        match self {
            Transform::Identity => Ok(Transform::Identity),
            Transform::Linear(lin) => Ok(Transform::Linear(lin.invert()?)),
            Transform::Poly(poly) => Ok(Transform::Poly(poly.inverse_over(domain, precision)?)),
            Transform::SkyToTangentPlane(proj) => Ok(Transform::TangentPlaneToSky(proj.invert())),
            Transform::TangentPlaneToSky(wcs) => wcs
                .invert()
                .map(Transform::SkyToTangentPlane)
                .ok_or_else(|| {
                    JointfitError::InvalidArgument(
                        "cannot invert a plane-to-sky transform with corrections".into(),
                    )
                }),
            Transform::Composed(_, _) => Err(JointfitError::InvalidArgument(
                "cannot invert a generic transform composition".into(),
            )),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::Identity
    }
}

impl From<LinearTransform> for Transform {
    fn from(lin: LinearTransform) -> Self {
        Transform::Linear(lin)
    }
}

impl From<PolyTransform> for Transform {
    fn from(poly: PolyTransform) -> Self {
        Transform::Poly(poly)
    }
}

#[cfg(test)]
mod test_transform {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_with_inverse_is_identity_on_points() {
        let frame = Frame::new(-1.0, -1.0, 1.0, 1.0);
        let candidates = vec![
            Transform::Linear(LinearTransform::new(1.05, 0.02, -0.01, 0.97, 0.3, -0.1)),
            Transform::Poly(PolyTransform::identity(3)),
            Transform::SkyToTangentPlane(TanRaDec2Pix::new(Point::new(30.0, 10.0))),
        ];
        for t in candidates {
            let inv = t.invert(&frame, 1e-10).unwrap();
            let round = t.compose(&inv); // T ∘ T⁻¹: p = T(T⁻¹(p))
            for &(x, y) in &[(0.2, 0.1), (-0.5, 0.4)] {
                // pick p in the *output* space of T so that T⁻¹(p) is defined
                let p = t.apply(&Point::new(x, y));
                let q = round.apply(&p);
                assert_relative_eq!(q.x, p.x, epsilon = 1e-8);
                assert_relative_eq!(q.y, p.y, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_covariance_propagation_through_linear() {
        let t = Transform::Linear(LinearTransform::scaling(2.0, 3.0));
        let fat = FatPoint::new(1.0, 1.0, 0.01, 0.04, 0.005);
        let out = t.apply_fat(&fat);
        assert_relative_eq!(out.vx, 0.04, epsilon = 1e-12);
        assert_relative_eq!(out.vy, 0.36, epsilon = 1e-12);
        assert_relative_eq!(out.vxy, 6.0 * 0.005, epsilon = 1e-12);
    }

    #[test]
    fn test_poly_pairs_collapse_and_big_ones_stay_composed() {
        let p3 = Transform::Poly(PolyTransform::identity(3));
        let p2 = Transform::Poly(PolyTransform::identity(2));
        assert!(matches!(p3.compose(&p2), Transform::Poly(_)));

        let p5 = Transform::Poly(PolyTransform::identity(5));
        let composed = p5.compose(&Transform::Poly(PolyTransform::identity(4)));
        assert!(matches!(composed, Transform::Composed(_, _)));
    }
}
