//! The chip ∘ visit composite mapping of the constrained model.
//!
//! A `TwoTransformMapping` applies a chip-dependent transform first and a
//! visit-dependent transform second. Both sides are shared with the model
//! registry (several exposures of one visit share the visit mapping, and
//! several exposures of one chip share the chip mapping), so parameter
//! offsets go through the registry, never through the composite.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DMatrix;

use super::{AstrometryMapping, SimplePolyMapping};
use crate::geometry::FatPoint;
use crate::jointfit_errors::JointfitError;

pub struct TwoTransformMapping {
    /// Chip side, applied first.
    first: Rc<RefCell<SimplePolyMapping>>,
    /// Visit side, applied second.
    second: Rc<RefCell<SimplePolyMapping>>,
    fit_first: bool,
    fit_second: bool,
}

impl TwoTransformMapping {
    pub fn new(first: Rc<RefCell<SimplePolyMapping>>, second: Rc<RefCell<SimplePolyMapping>>) -> Self {
        TwoTransformMapping {
            first,
            second,
            fit_first: true,
            fit_second: true,
        }
    }

    /// Declare which side(s) contribute derivatives to the fit.
    pub fn set_what_to_fit(&mut self, fit_first: bool, fit_second: bool) {
        self.fit_first = fit_first;
        self.fit_second = fit_second;
    }

    pub fn first(&self) -> Rc<RefCell<SimplePolyMapping>> {
        Rc::clone(&self.first)
    }

    pub fn second(&self) -> Rc<RefCell<SimplePolyMapping>> {
        Rc::clone(&self.second)
    }
}

impl AstrometryMapping for TwoTransformMapping {
    fn n_par(&self) -> usize {
        let mut n = 0;
        if self.fit_first {
            n += self.first.borrow().n_par();
        }
        if self.fit_second {
            n += self.second.borrow().n_par();
        }
        n
    }

    fn index(&self) -> usize {
        if self.fit_first && self.first.borrow().n_par() > 0 {
            self.first.borrow().index()
        } else {
            self.second.borrow().index()
        }
    }

    fn set_index(&mut self, _index: usize) {
        // indices live on the shared chip and visit mappings
    }

    fn mapping_indices(&self, indices: &mut Vec<usize>) {
        if self.fit_first {
            self.first.borrow().mapping_indices(indices);
        }
        if self.fit_second {
            self.second.borrow().mapping_indices(indices);
        }
    }

    fn transform_pos_and_errors(&self, input: &FatPoint) -> FatPoint {
        let intermediate = self.first.borrow().transform_pos_and_errors(input);
        self.second.borrow().transform_pos_and_errors(&intermediate)
    }

    fn compute_transform_and_derivatives(&self, input: &FatPoint, out: &mut FatPoint, h: &mut DMatrix<f64>) {
        let first = self.first.borrow();
        let second = self.second.borrow();
        let intermediate = first.transform_pos_and_errors(input);
        *out = second.transform_pos_and_errors(&intermediate);

        let mut offset = 0;
        if self.fit_first && first.n_par() > 0 {
            // chain rule: the chip derivatives seen through the visit Jacobian
            let j2 = second.transform().derivative(&intermediate.point());
            let normalized = first.normalizer().apply(&input.point());
            let monomials = first.fitted_poly().monomials(&normalized);
            let n_terms = first.fitted_poly().n_terms();
            for (k, &m) in monomials.iter().enumerate() {
                // x coefficients move the intermediate x, y coefficients the
                // intermediate y
                h[(k, 0)] = j2[(0, 0)] * m;
                h[(k, 1)] = j2[(1, 0)] * m;
                h[(n_terms + k, 0)] = j2[(0, 1)] * m;
                h[(n_terms + k, 1)] = j2[(1, 1)] * m;
            }
            offset = first.n_par();
        }
        if self.fit_second && second.n_par() > 0 {
            let normalized = second.normalizer().apply(&intermediate.point());
            let monomials = second.fitted_poly().monomials(&normalized);
            let n_terms = second.fitted_poly().n_terms();
            for (k, &m) in monomials.iter().enumerate() {
                h[(offset + k, 0)] = m;
                h[(offset + n_terms + k, 1)] = m;
            }
        }
    }

    fn offset_params(&mut self, _delta: &[f64]) -> Result<(), JointfitError> {
        Err(JointfitError::InvalidArgument(
            "TwoTransformMapping does not own parameters; offset the chip and visit mappings".into(),
        ))
    }

    fn freeze_error_transform(&mut self) {
        self.first.borrow_mut().freeze_error_transform();
        self.second.borrow_mut().freeze_error_transform();
    }
}
