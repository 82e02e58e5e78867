//! A polynomial mapping preconditioned by a fixed coordinate normalization.
//!
//! The fitted object is the polynomial `P`; the transform actually applied
//! to measurements is `P ∘ S` where `S` is a fixed shift-and-scale (usually
//! mapping the image frame onto [-1, 1]²). Keeping `S` out of the fit keeps
//! the normal equations well conditioned at high polynomial degrees.

use nalgebra::DMatrix;

use super::{propagate_errors, AstrometryMapping};
use crate::geometry::{FatPoint, LinearTransform, PolyTransform};
use crate::jointfit_errors::JointfitError;

#[derive(Debug, Clone)]
pub struct SimplePolyMapping {
    index: usize,
    to_be_fit: bool,
    normalizer: LinearTransform,
    poly: PolyTransform,
    /// Cached `poly ∘ normalizer`, acting on raw coordinates.
    transform: PolyTransform,
    /// Transform used for covariance propagation. Tracks `transform` until
    /// the first `freeze_error_transform` call.
    error_transform: PolyTransform,
    frozen: bool,
}

impl SimplePolyMapping {
    /// `poly` acts on coordinates normalized by `normalizer`.
    pub fn new(normalizer: LinearTransform, poly: PolyTransform) -> Self {
        let transform = poly.compose_linear(&normalizer);
        SimplePolyMapping {
            index: 0,
            to_be_fit: true,
            normalizer,
            error_transform: transform.clone(),
            transform,
            poly,
            frozen: false,
        }
    }

    /// The identity mapping at the given polynomial degree.
    pub fn identity(degree: usize) -> Self {
        SimplePolyMapping::new(LinearTransform::identity(), PolyTransform::identity(degree))
    }

    /// Toggle whether this mapping contributes parameters to the fit
    /// (used to hold the reference chip fixed).
    pub fn set_to_be_fit(&mut self, to_be_fit: bool) {
        self.to_be_fit = to_be_fit;
    }

    pub fn to_be_fit(&self) -> bool {
        self.to_be_fit
    }

    /// The composed transform acting on raw coordinates.
    pub fn transform(&self) -> &PolyTransform {
        &self.transform
    }

    pub fn fitted_poly(&self) -> &PolyTransform {
        &self.poly
    }

    pub fn normalizer(&self) -> &LinearTransform {
        &self.normalizer
    }

    fn refresh(&mut self) {
        self.transform = self.poly.compose_linear(&self.normalizer);
        if !self.frozen {
            self.error_transform = self.transform.clone();
        }
    }
}

impl AstrometryMapping for SimplePolyMapping {
    fn n_par(&self) -> usize {
        if self.to_be_fit {
            self.poly.n_coefficients()
        } else {
            0
        }
    }

    fn index(&self) -> usize {
        self.index
    }

    fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    fn mapping_indices(&self, indices: &mut Vec<usize>) {
        indices.extend(self.index..self.index + self.n_par());
    }

    fn transform_pos_and_errors(&self, input: &FatPoint) -> FatPoint {
        let pos = self.transform.apply(&input.point());
        let mut out = FatPoint::new(pos.x, pos.y, 0.0, 0.0, 0.0);
        let j = self.error_transform.derivative(&input.point());
        propagate_errors(&j, input, &mut out);
        out
    }

    fn compute_transform_and_derivatives(&self, input: &FatPoint, out: &mut FatPoint, h: &mut DMatrix<f64>) {
        *out = self.transform_pos_and_errors(input);
        if !self.to_be_fit {
            return;
        }
        let normalized = self.normalizer.apply(&input.point());
        let monomials = self.poly.monomials(&normalized);
        let n_terms = self.poly.n_terms();
        for (k, &m) in monomials.iter().enumerate() {
            h[(k, 0)] = m;
            h[(n_terms + k, 1)] = m;
        }
    }

    fn offset_params(&mut self, delta: &[f64]) -> Result<(), JointfitError> {
        if delta.len() != self.n_par() {
            return Err(JointfitError::DeltaSizeMismatch {
                expected: self.n_par(),
                got: delta.len(),
            });
        }
        if delta.is_empty() {
            return Ok(());
        }
        self.poly.offset_coefficients(delta)?;
        self.refresh();
        Ok(())
    }

    fn freeze_error_transform(&mut self) {
        self.error_transform = self.transform.clone();
        self.frozen = true;
    }
}
