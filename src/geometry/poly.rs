//! Bivariate polynomial transforms.
//!
//! A [`PolyTransform`] of degree `d` maps the plane onto itself through two
//! polynomials in (x, y), one per output coordinate, each carrying
//! `(d + 1)(d + 2) / 2` coefficients. The coefficient vector stores the x
//! polynomial first, then the y polynomial, both in row-major monomial order
//! on the exponent pair `(i, j)` with `i + j <= d`:
//!
//! ```text
//! (0,0), (0,1), ..., (0,d), (1,0), ..., (1,d-1), ..., (d,0)
//! ```
//!
//! This ordering is shared by the parameter derivatives handed to the
//! least-squares fitters, so the mapping layer relies on it.

use nalgebra::{DMatrix, Matrix2};
use smallvec::SmallVec;
use tracing::warn;

use super::frame::Frame;
use super::linear::{normalize_coordinates, LinearTransform};
use super::point::Point;
use super::transform::Transform;
use crate::constants::MAX_POLY_DEGREE;
use crate::jointfit_errors::JointfitError;

/// Monomial values, sized to hold a degree-6 transform inline.
pub type Monomials = SmallVec<[f64; 28]>;

/// Number of monomials of a bivariate polynomial of the given degree.
pub fn n_poly_terms(degree: usize) -> usize {
    (degree + 1) * (degree + 2) / 2
}

/// Exponent pairs in coefficient order.
fn exponents(degree: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..=degree).flat_map(move |i| (0..=(degree - i)).map(move |j| (i, j)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolyTransform {
    degree: usize,
    /// `2 * n_poly_terms(degree)` values, x block then y block.
    coeffs: Vec<f64>,
}

impl PolyTransform {
    /// The identity mapping expressed at the given degree (higher-order
    /// coefficients all zero).
    pub fn identity(degree: usize) -> Self {
        let n = n_poly_terms(degree);
        let mut coeffs = vec![0.0; 2 * n];
        for (k, (i, j)) in exponents(degree).enumerate() {
            if i == 1 && j == 0 {
                coeffs[k] = 1.0;
            }
            if i == 0 && j == 1 {
                coeffs[n + k] = 1.0;
            }
        }
        PolyTransform { degree, coeffs }
    }

    pub fn from_coefficients(degree: usize, coeffs: Vec<f64>) -> Result<Self, JointfitError> {
        if coeffs.len() != 2 * n_poly_terms(degree) {
            return Err(JointfitError::InvalidArgument(format!(
                "degree {} polynomial needs {} coefficients, got {}",
                degree,
                2 * n_poly_terms(degree),
                coeffs.len()
            )));
        }
        Ok(PolyTransform { degree, coeffs })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn n_terms(&self) -> usize {
        n_poly_terms(self.degree)
    }

    /// Total number of coefficients (both components).
    pub fn n_coefficients(&self) -> usize {
        self.coeffs.len()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    /// Add `delta` to the coefficient vector (x block then y block).
    pub fn offset_coefficients(&mut self, delta: &[f64]) -> Result<(), JointfitError> {
        if delta.len() != self.coeffs.len() {
            return Err(JointfitError::DeltaSizeMismatch {
                expected: self.coeffs.len(),
                got: delta.len(),
            });
        }
        for (c, d) in self.coeffs.iter_mut().zip(delta) {
            *c += d;
        }
        Ok(())
    }

    /// Monomial values at `p`, in coefficient order.
    pub fn monomials(&self, p: &Point) -> Monomials {
        monomials_of(self.degree, p)
    }

    pub fn apply(&self, p: &Point) -> Point {
        let m = self.monomials(p);
        let n = self.n_terms();
        let mut x = 0.0;
        let mut y = 0.0;
        for k in 0..n {
            x += self.coeffs[k] * m[k];
            y += self.coeffs[n + k] * m[k];
        }
        Point::new(x, y)
    }

    /// Analytic Jacobian at `p`.
    pub fn derivative(&self, p: &Point) -> Matrix2<f64> {
        let n = self.n_terms();
        let xp = powers(p.x, self.degree);
        let yp = powers(p.y, self.degree);
        let mut j = Matrix2::zeros();
        for (k, (i, jj)) in exponents(self.degree).enumerate() {
            let cx = self.coeffs[k];
            let cy = self.coeffs[n + k];
            if i > 0 {
                let dmx = i as f64 * xp[i - 1] * yp[jj];
                j[(0, 0)] += cx * dmx;
                j[(1, 0)] += cy * dmx;
            }
            if jj > 0 {
                let dmy = jj as f64 * xp[i] * yp[jj - 1];
                j[(0, 1)] += cx * dmy;
                j[(1, 1)] += cy * dmy;
            }
        }
        j
    }

    /// The affine transform matching value and first derivatives at `center`.
    pub fn linear_approximation(&self, center: &Point) -> LinearTransform {
        let j = self.derivative(center);
        let at_center = self.apply(center);
        LinearTransform::new(
            j[(0, 0)],
            j[(0, 1)],
            j[(1, 0)],
            j[(1, 1)],
            at_center.x - j[(0, 0)] * center.x - j[(0, 1)] * center.y,
            at_center.y - j[(1, 0)] * center.x - j[(1, 1)] * center.y,
        )
    }

    /// The polynomial equivalent to applying `other` first, then `self`.
    ///
    /// The formal degree is the product of the two degrees; terms beyond
    /// [`MAX_POLY_DEGREE`] are truncated.
    pub fn compose(&self, other: &PolyTransform) -> PolyTransform {
        let result_degree = (self.degree * other.degree).min(MAX_POLY_DEGREE);
        let qx = component_grid(other, 0);
        let qy = component_grid(other, 1);

        // powers of the inner components, on the capped grid
        let mut qx_pows = Vec::with_capacity(self.degree + 1);
        let mut qy_pows = Vec::with_capacity(self.degree + 1);
        qx_pows.push(unit_grid());
        qy_pows.push(unit_grid());
        for i in 1..=self.degree {
            qx_pows.push(grid_mul(&qx_pows[i - 1], &qx));
            qy_pows.push(grid_mul(&qy_pows[i - 1], &qy));
        }

        let n_out = n_poly_terms(result_degree);
        let mut coeffs = vec![0.0; 2 * n_out];
        let n_self = self.n_terms();
        for (k, (i, j)) in exponents(self.degree).enumerate() {
            let cx = self.coeffs[k];
            let cy = self.coeffs[n_self + k];
            if cx == 0.0 && cy == 0.0 {
                continue;
            }
            let term = grid_mul(&qx_pows[i], &qy_pows[j]);
            for (k_out, (io, jo)) in exponents(result_degree).enumerate() {
                let t = term[grid_index(io, jo)];
                coeffs[k_out] += cx * t;
                coeffs[n_out + k_out] += cy * t;
            }
        }
        PolyTransform {
            degree: result_degree,
            coeffs,
        }
    }

    /// The polynomial equivalent to applying the affine `lin` first, then
    /// `self`. Exact and degree-preserving: substituting an affine change
    /// of coordinates never raises the degree, so no truncation is
    /// involved. This is the composition the normalization preconditioners
    /// go through.
    pub fn compose_linear(&self, lin: &LinearTransform) -> PolyTransform {
        self.compose(&PolyTransform::from(lin))
    }

    /// Weighted least-squares fit of a degree-`degree` polynomial mapping
    /// the first point of each pair onto the second.
    ///
    /// The fit is preconditioned by normalizing the source points onto
    /// [-1, 1]^2; the returned transform absorbs the normalization and acts
    /// on the original coordinates.
    pub fn fit(pairs: &[(Point, Point, f64)], degree: usize) -> Result<PolyTransform, JointfitError> {
        let n_terms = n_poly_terms(degree);
        if pairs.len() < n_terms {
            return Err(JointfitError::TransformFitFailure(format!(
                "{} pairs cannot constrain a degree {} polynomial ({} terms)",
                pairs.len(),
                degree,
                n_terms
            )));
        }

        let sources: Vec<Point> = pairs.iter().map(|(p, _, _)| *p).collect();
        let frame = Frame::from_points(sources.iter());
        let norm = normalize_coordinates(&frame);

        let mut a = DMatrix::<f64>::zeros(pairs.len(), n_terms);
        let mut b = DMatrix::<f64>::zeros(pairs.len(), 2);
        for (row, (p1, p2, weight)) in pairs.iter().enumerate() {
            let w = weight.max(0.0).sqrt();
            let m = monomials_of(degree, &norm.apply(p1));
            for k in 0..n_terms {
                a[(row, k)] = w * m[k];
            }
            b[(row, 0)] = w * p2.x;
            b[(row, 1)] = w * p2.y;
        }

        let svd = a.svd(true, true);
        let sol = svd
            .solve(&b, 1e-12)
            .map_err(|e| JointfitError::TransformFitFailure(e.to_string()))?;

        let mut coeffs = vec![0.0; 2 * n_terms];
        for k in 0..n_terms {
            coeffs[k] = sol[(k, 0)];
            coeffs[n_terms + k] = sol[(k, 1)];
        }
        let fitted = PolyTransform { degree, coeffs };
        // absorb the preconditioner so the result acts on raw coordinates
        Ok(fitted.compose_linear(&norm))
    }

    /// Polynomial approximation of an arbitrary transform, fitted over a
    /// regular grid of sample points spanning `frame`.
    pub fn approximate(
        transform: &Transform,
        frame: &Frame,
        degree: usize,
    ) -> Result<PolyTransform, JointfitError> {
        let side = (2 * (degree + 2)).max(8);
        let pairs = sample_pairs(frame, side, |p| transform.apply(p));
        PolyTransform::fit(&pairs, degree)
    }

    /// Least-squares approximation of the inverse, fitted over sample points
    /// spanning `frame` (the domain of `self`). The fitted degree grows from
    /// the degree of `self` until the round-trip error on the samples drops
    /// below `precision`, or [`MAX_POLY_DEGREE`] is reached.
    pub fn inverse_over(&self, frame: &Frame, precision: f64) -> Result<PolyTransform, JointfitError> {
        let side = 50;
        // swap the roles: fit target -> source
        let pairs: Vec<(Point, Point, f64)> = sample_pairs(frame, side, |p| self.apply(p))
            .into_iter()
            .map(|(p, q, w)| (q, p, w))
            .collect();

        let mut best: Option<(f64, PolyTransform)> = None;
        for degree in self.degree.min(MAX_POLY_DEGREE)..=MAX_POLY_DEGREE {
            let candidate = PolyTransform::fit(&pairs, degree)?;
            let max_err = pairs
                .iter()
                .map(|(q, p, _)| candidate.apply(q).distance(p))
                .fold(0.0, f64::max);
            if max_err < precision {
                return Ok(candidate);
            }
            match &best {
                Some((err, _)) if *err <= max_err => {}
                _ => best = Some((max_err, candidate)),
            }
        }
        match best {
            Some((err, candidate)) => {
                warn!(
                    target_precision = precision,
                    reached = err,
                    "inverse polynomial did not reach the requested precision"
                );
                Ok(candidate)
            }
            None => Err(JointfitError::TransformFitFailure(
                "no inverse polynomial candidate could be fitted".into(),
            )),
        }
    }
}

impl From<&LinearTransform> for PolyTransform {
    fn from(lin: &LinearTransform) -> Self {
        // degree-1 coefficient order: (0,0), (0,1), (1,0)
        PolyTransform {
            degree: 1,
            coeffs: vec![lin.dx, lin.a12, lin.a11, lin.dy, lin.a22, lin.a21],
        }
    }
}

fn powers(v: f64, degree: usize) -> Monomials {
    let mut p = Monomials::with_capacity(degree + 1);
    p.push(1.0);
    for i in 1..=degree {
        let prev = p[i - 1];
        p.push(prev * v);
    }
    p
}

fn monomials_of(degree: usize, p: &Point) -> Monomials {
    let xp = powers(p.x, degree);
    let yp = powers(p.y, degree);
    let mut m = Monomials::with_capacity(n_poly_terms(degree));
    for (i, j) in exponents(degree) {
        m.push(xp[i] * yp[j]);
    }
    m
}

// Dense (MAX_POLY_DEGREE + 1)^2 coefficient grids used by composition.
const GRID_SIDE: usize = MAX_POLY_DEGREE + 1;
type Grid = Vec<f64>;

fn grid_index(i: usize, j: usize) -> usize {
    i * GRID_SIDE + j
}

fn unit_grid() -> Grid {
    let mut g = vec![0.0; GRID_SIDE * GRID_SIDE];
    g[0] = 1.0;
    g
}

fn component_grid(poly: &PolyTransform, component: usize) -> Grid {
    let mut g = vec![0.0; GRID_SIDE * GRID_SIDE];
    let offset = component * poly.n_terms();
    for (k, (i, j)) in exponents(poly.degree).enumerate() {
        g[grid_index(i, j)] = poly.coeffs[offset + k];
    }
    g
}

/// Product of two grid polynomials, truncated at [`MAX_POLY_DEGREE`].
fn grid_mul(a: &Grid, b: &Grid) -> Grid {
    let mut out = vec![0.0; GRID_SIDE * GRID_SIDE];
    for ia in 0..GRID_SIDE {
        for ja in 0..(GRID_SIDE - ia) {
            let ca = a[grid_index(ia, ja)];
            if ca == 0.0 {
                continue;
            }
            for ib in 0..(GRID_SIDE - ia) {
                for jb in 0..(GRID_SIDE - ia - ja).min(GRID_SIDE - ib) {
                    let cb = b[grid_index(ib, jb)];
                    if cb == 0.0 {
                        continue;
                    }
                    if ia + ib + ja + jb <= MAX_POLY_DEGREE {
                        out[grid_index(ia + ib, ja + jb)] += ca * cb;
                    }
                }
            }
        }
    }
    out
}

fn sample_pairs(frame: &Frame, side: usize, f: impl Fn(&Point) -> Point) -> Vec<(Point, Point, f64)> {
    let mut pairs = Vec::with_capacity(side * side);
    let step_x = frame.width() / (side - 1) as f64;
    let step_y = frame.height() / (side - 1) as f64;
    for ix in 0..side {
        for iy in 0..side {
            let p = Point::new(frame.x_min + ix as f64 * step_x, frame.y_min + iy as f64 * step_y);
            pairs.push((p, f(&p), 1.0));
        }
    }
    pairs
}
