//! The photometric least-squares fitter.
//!
//! The residual of a valid measurement is
//! `flux − photomFactor(exposure, star) · fittedFlux`, weighted by the
//! measurement flux error; each measurement contributes one Jacobian row.
//!
//! `whatToFit` tokens: `"Model"` (the photometric model parameters) and
//! `"Fluxes"` (one parameter per fitted star).

use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use tracing::{debug, error, info, warn};

use super::{select_outliers, solve_normal_equations, Chi2, MeasuredStarId, TripletList};
use crate::associations::Associations;
use crate::constants::{CcdId, Mjd, VisitId};
use crate::jointfit_errors::JointfitError;
use crate::models::PhotometryModel;
use crate::params::JointfitParams;

/// Per-measurement diagnostic tuple of the photometric fit.
#[derive(Debug, Clone)]
pub struct PhotometryResidualRecord {
    /// Measurement position on its detector (pixels).
    pub xccd: f64,
    pub yccd: f64,
    /// Rough magnitude of the fitted star.
    pub mag: f64,
    pub flux: f64,
    pub eflux: f64,
    pub fitted_flux: f64,
    pub phot_factor: f64,
    pub mjd: Mjd,
    pub color: f64,
    pub fitted_star_index: usize,
    /// Fitted-star position (tangent plane, or sky after deprojection).
    pub ra: f64,
    pub dec: f64,
    /// Chi2 contribution (1 degree of freedom).
    pub chi2: f64,
    pub measurement_count: usize,
    pub ccd: CcdId,
    pub visit: VisitId,
}

pub struct PhotometryFit<'a> {
    associations: &'a mut Associations,
    model: &'a mut dyn PhotometryModel,
    what_to_fit: String,
    fitting_model: bool,
    fitting_fluxes: bool,
    n_par_model: usize,
    n_par_tot: usize,
    last_n_triplets: usize,
}

impl<'a> PhotometryFit<'a> {
    pub fn new(associations: &'a mut Associations, model: &'a mut dyn PhotometryModel) -> Self {
        let mut fit = PhotometryFit {
            associations,
            model,
            what_to_fit: String::new(),
            fitting_model: false,
            fitting_fluxes: false,
            n_par_model: 0,
            n_par_tot: 0,
            last_n_triplets: 0,
        };
        fit.assign_indices("");
        fit
    }

    pub fn n_par_tot(&self) -> usize {
        self.n_par_tot
    }

    /// Decode `what_to_fit`: model parameters first, then one flux
    /// parameter per fitted star when `"Fluxes"` is fitted.
    pub fn assign_indices(&mut self, what_to_fit: &str) {
        for token in what_to_fit.split_whitespace() {
            if !matches!(token, "Model" | "Fluxes") {
                error!(token, "unknown whatToFit token for the photometric fit");
            }
        }
        self.what_to_fit = what_to_fit.to_string();
        info!(what_to_fit, "assign_indices");
        self.fitting_model = self.what_to_fit.contains("Model");
        self.fitting_fluxes = self.what_to_fit.contains("Fluxes");

        for fs in &mut self.associations.fitted_stars {
            fs.index_in_fit = None;
        }
        self.n_par_model = if self.fitting_model {
            self.model.assign_indices(&self.what_to_fit, 0)
        } else {
            0
        };
        let mut ipar = self.n_par_model;
        if self.fitting_fluxes {
            for fs in &mut self.associations.fitted_stars {
                fs.index_in_fit = Some(ipar);
                ipar += 1;
            }
        }
        self.n_par_tot = ipar;
    }

    fn ls_derivatives_for_image(
        &self,
        image_index: usize,
        subset: Option<&[usize]>,
        tlist: &mut TripletList,
        grad: &mut DVector<f64>,
    ) -> Result<(), JointfitError> {
        let image = &self.associations.ccd_images()[image_index];
        let mut indices = Vec::new();
        let mut derivatives = Vec::new();
        let star_indices: Vec<usize> = match subset {
            Some(list) => list.to_vec(),
            None => image.catalog_for_fit().to_vec(),
        };
        let mut row = tlist.next_free_index();
        for ms_index in star_indices {
            let ms = image.star(ms_index);
            if !ms.valid {
                continue;
            }
            let Some(fs_index) = ms.fitted_star else { continue };
            let fs = &self.associations.fitted_stars()[fs_index];
            let sigma = ms.eflux;
            if !(sigma > 0.0) {
                warn!(name = image.name(), star = ms_index, "non-positive flux error");
                continue;
            }
            let pf = self.model.photom_factor(image, ms);
            let res = ms.flux - pf * fs.flux;

            if self.fitting_model {
                self.model.indices_and_derivatives(ms, image, &mut indices, &mut derivatives);
                for (&param, &dpf) in indices.iter().zip(&derivatives) {
                    // d(residual)/d(model param) = -fittedFlux * d(pf)
                    let g = -dpf * fs.flux;
                    tlist.add_triplet(param, row, g / sigma);
                    grad[param] += g * res / (sigma * sigma);
                }
            }
            if self.fitting_fluxes {
                let Some(index) = fs.index_in_fit else {
                    return Err(JointfitError::InvalidArgument(
                        "fitted star has no parameter index while fitting fluxes".into(),
                    ));
                };
                // d(residual)/d(fittedFlux) = -pf
                tlist.add_triplet(index, row, -pf / sigma);
                grad[index] += -pf * res / (sigma * sigma);
            }
            row += 1; // one Jacobian row per measurement
        }
        tlist.set_next_free_index(row);
        Ok(())
    }

    fn ls_derivatives(&mut self, tlist: &mut TripletList, grad: &mut DVector<f64>) -> Result<(), JointfitError> {
        for image_index in 0..self.associations.n_ccd_images() {
            self.ls_derivatives_for_image(image_index, None, tlist, grad)?;
        }
        Ok(())
    }

    fn accumulate_measurement_chi2(&self, mut visit: impl FnMut(f64, MeasuredStarId)) {
        for (image_index, image) in self.associations.ccd_images().iter().enumerate() {
            for &ms_index in image.catalog_for_fit() {
                let ms = image.star(ms_index);
                if !ms.valid {
                    continue;
                }
                let Some(fs_index) = ms.fitted_star else { continue };
                let fs = &self.associations.fitted_stars()[fs_index];
                let sigma = ms.eflux;
                if !(sigma > 0.0) {
                    continue;
                }
                let pf = self.model.photom_factor(image, ms);
                let res = ms.flux - pf * fs.flux;
                visit(
                    (res / sigma) * (res / sigma),
                    MeasuredStarId {
                        image: image_index,
                        star: ms_index,
                    },
                );
            }
        }
    }

    /// Weighted residual sum; `ndof` = measurement count − total
    /// parameter count.
    pub fn compute_chi2(&self) -> Chi2 {
        let mut chi2 = Chi2::new();
        self.accumulate_measurement_chi2(|value, _| chi2.add_entry(value, 1));
        chi2.ndof -= self.n_par_tot as i64;
        if chi2.ndof < 1 {
            error!(ndof = chi2.ndof, n_par_tot = self.n_par_tot, "not enough degrees of freedom");
        }
        chi2
    }

    fn measured_star_indices(&self, id: MeasuredStarId, indices: &mut Vec<usize>) {
        let image = &self.associations.ccd_images()[id.image];
        let ms = image.star(id.star);
        if self.fitting_model {
            let mut derivatives = Vec::new();
            let mut model_indices = Vec::new();
            self.model.indices_and_derivatives(ms, image, &mut model_indices, &mut derivatives);
            indices.extend(model_indices);
        }
        if self.fitting_fluxes {
            if let Some(fs_index) = ms.fitted_star {
                if let Some(index) = self.associations.fitted_stars()[fs_index].index_in_fit {
                    indices.push(index);
                }
            }
        }
    }

    /// Outlier candidates, filtered by the one-outlier-per-parameter rule.
    pub fn find_outliers(&self, n_sig_cut: f64) -> Vec<MeasuredStarId> {
        let mut entries = Vec::new();
        self.accumulate_measurement_chi2(|chi2, id| entries.push((chi2, id)));
        select_outliers(entries, n_sig_cut, self.n_par_tot, |id, indices| {
            self.measured_star_indices(id, indices)
        })
    }

    /// Accumulate the contributions of `outliers`, then invalidate them
    /// and decrement their fitted stars' measurement counts.
    pub(crate) fn outliers_contributions(
        &mut self,
        outliers: &[MeasuredStarId],
        tlist: &mut TripletList,
        grad: &mut DVector<f64>,
    ) -> Result<(), JointfitError> {
        for &id in outliers {
            self.ls_derivatives_for_image(id.image, Some(&[id.star]), tlist, grad)?;
            let ms = self.associations.ccd_images[id.image].star_mut(id.star);
            ms.valid = false;
            if let Some(fs_index) = ms.fitted_star {
                self.associations.fitted_stars[fs_index].measurement_count -= 1;
            }
        }
        Ok(())
    }

    pub fn remove_outliers(&mut self, outliers: &[MeasuredStarId]) -> Result<(), JointfitError> {
        let mut tlist = TripletList::with_capacity(outliers.len() * 4);
        let mut grad = DVector::zeros(self.n_par_tot);
        self.outliers_contributions(outliers, &mut tlist, &mut grad)
    }

    /// Apply a solution offset: model parameters, then fitted-star fluxes.
    pub fn offset_params(&mut self, delta: &DVector<f64>) -> Result<(), JointfitError> {
        if delta.len() != self.n_par_tot {
            return Err(JointfitError::DeltaSizeMismatch {
                expected: self.n_par_tot,
                got: delta.len(),
            });
        }
        if self.fitting_model {
            self.model.offset_params(delta)?;
        }
        if self.fitting_fluxes {
            for fs in &mut self.associations.fitted_stars {
                if let Some(index) = fs.index_in_fit {
                    fs.flux += delta[index];
                }
            }
        }
        Ok(())
    }

    /// Assemble the sparse normal equations for the current index layout.
    pub fn build_normal_equations(&mut self) -> Result<(CscMatrix<f64>, DVector<f64>), JointfitError> {
        let mut tlist = TripletList::with_capacity(self.last_n_triplets.max(4096));
        let mut grad = DVector::zeros(self.n_par_tot);
        self.ls_derivatives(&mut tlist, &mut grad)?;
        self.last_n_triplets = tlist.len();
        let jacobian = tlist.into_jacobian(self.n_par_tot)?;
        let hessian = &jacobian * &jacobian.transpose();
        debug!(
            dim = hessian.nrows(),
            nnz = hessian.nnz(),
            rows = jacobian.ncols(),
            "normal equations assembled"
        );
        Ok((hessian, grad))
    }

    /// One normal-equations step.
    pub fn minimize(&mut self, what_to_fit: &str) -> Result<bool, JointfitError> {
        self.assign_indices(what_to_fit);
        if self.n_par_tot == 0 {
            error!(what_to_fit, "nothing to fit");
            return Ok(false);
        }
        let (hessian, grad) = self.build_normal_equations()?;
        let delta = match solve_normal_equations(&hessian, &grad) {
            Ok(solution) => -solution,
            Err(err) => {
                error!(%err, "minimize: factorization failed");
                return Ok(false);
            }
        };
        self.offset_params(&delta)?;
        Ok(true)
    }

    /// Outer loop: alternate minimize and outlier rejection until the
    /// relative change of chi2/ndof drops below the tolerance or the
    /// iteration bound is reached.
    pub fn fit(&mut self, what_to_fit: &str, params: &JointfitParams) -> Result<Chi2, JointfitError> {
        let mut previous: Option<f64> = None;
        let mut last: Option<Chi2> = None;
        for iteration in 0..params.outer_iterations {
            if !self.minimize(what_to_fit)? {
                return Err(JointfitError::FactorizationFailure(
                    "photometric fit step failed".into(),
                ));
            }
            let chi2 = self.compute_chi2();
            info!(iteration, %chi2, "photometric fit step");
            if iteration == 0 && !self.model.validate(self.associations.ccd_images(), chi2.ndof) {
                warn!("photometric model failed validation; continuing anyway");
            }
            last = Some(chi2);
            let outliers = self.find_outliers(params.n_sig_cut);
            if !outliers.is_empty() {
                self.remove_outliers(&outliers)?;
                previous = None;
                continue;
            }
            if let Some(prev) = previous {
                if (prev - chi2.reduced()).abs() <= params.chi2_tolerance * prev.abs().max(1.0) {
                    break;
                }
            }
            previous = Some(chi2.reduced());
        }
        Ok(last.unwrap_or_else(|| self.compute_chi2()))
    }

    /// Per-measurement diagnostic tuples under the current model state.
    pub fn residual_records(&self) -> Vec<PhotometryResidualRecord> {
        let mut records = Vec::new();
        for image in self.associations.ccd_images() {
            for &ms_index in image.catalog_for_fit() {
                let ms = image.star(ms_index);
                if !ms.valid {
                    continue;
                }
                let Some(fs_index) = ms.fitted_star else { continue };
                let fs = &self.associations.fitted_stars()[fs_index];
                let sigma = ms.eflux;
                if !(sigma > 0.0) {
                    continue;
                }
                let pf = self.model.photom_factor(image, ms);
                let res = ms.flux - pf * fs.flux;
                records.push(PhotometryResidualRecord {
                    xccd: ms.pos.x,
                    yccd: ms.pos.y,
                    mag: fs.mag,
                    flux: ms.flux,
                    eflux: ms.eflux,
                    fitted_flux: fs.flux,
                    phot_factor: pf,
                    mjd: image.mjd(),
                    color: fs.color,
                    fitted_star_index: fs_index,
                    ra: fs.pos.x,
                    dec: fs.pos.y,
                    chi2: (res / sigma) * (res / sigma),
                    measurement_count: fs.measurement_count,
                    ccd: image.ccd(),
                    visit: image.visit(),
                });
            }
        }
        records
    }
}
