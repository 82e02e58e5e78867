//! The astrometric least-squares fitter.
//!
//! Residuals are 2-D: mapped measurement position minus fitted-star
//! position, both on the common tangent plane. Each measurement
//! contributes two Jacobian rows, whitened by the Cholesky factor of its
//! 2×2 weight matrix (the inverse of the measurement covariance propagated
//! through the mapping's frozen error transform). Reference-star ties add
//! two rows per tied fitted star, weighted by the catalog covariance;
//! reference stars themselves are never fit.
//!
//! `whatToFit` tokens: `"Distortions"` (with the `"DistortionsChip"` /
//! `"DistortionsVisit"` refinements understood by the constrained model)
//! and `"Positions"` (two parameters per fitted star).

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CscMatrix;
use tracing::{debug, error, info};

use super::{select_outliers, solve_normal_equations, Chi2, MeasuredStarId, TripletList};
use crate::associations::Associations;
use crate::constants::{CcdId, Mjd, VisitId};
use crate::geometry::FatPoint;
use crate::jointfit_errors::JointfitError;
use crate::models::AstrometryModel;
use crate::params::JointfitParams;

/// Per-measurement diagnostic tuple of the astrometric fit.
#[derive(Debug, Clone)]
pub struct AstrometryResidualRecord {
    /// Measurement position on its detector (pixels).
    pub xccd: f64,
    pub yccd: f64,
    /// Rough magnitude of the measurement.
    pub mag: f64,
    /// Mapped position on the tangent plane (radians).
    pub tp_x: f64,
    pub tp_y: f64,
    /// Fitted-star position on the tangent plane (radians).
    pub fitted_x: f64,
    pub fitted_y: f64,
    /// Residual (mapped minus fitted, radians).
    pub rx: f64,
    pub ry: f64,
    /// Chi2 contribution (2 degrees of freedom).
    pub chi2: f64,
    pub fitted_star_index: usize,
    pub measurement_count: usize,
    pub mjd: Mjd,
    pub ccd: CcdId,
    pub visit: VisitId,
}

struct MeasurementWeight {
    wxx: f64,
    wyy: f64,
    wxy: f64,
    /// Lower Cholesky factor of the weight matrix.
    a00: f64,
    a10: f64,
    a11: f64,
}

fn weight_of(cov: &FatPoint) -> Option<MeasurementWeight> {
    let det = cov.cov_determinant();
    if det <= 0.0 || !det.is_finite() || cov.vx <= 0.0 {
        return None;
    }
    let wxx = cov.vy / det;
    let wyy = cov.vx / det;
    let wxy = -cov.vxy / det;
    let a00 = wxx.sqrt();
    let a10 = wxy / a00;
    let a11 = (wyy - a10 * a10).sqrt();
    if !(a00.is_finite() && a10.is_finite() && a11.is_finite()) {
        return None;
    }
    Some(MeasurementWeight {
        wxx,
        wyy,
        wxy,
        a00,
        a10,
        a11,
    })
}

pub struct AstrometryFit<'a> {
    associations: &'a mut Associations,
    model: &'a mut dyn AstrometryModel,
    what_to_fit: String,
    fitting_distortions: bool,
    fitting_positions: bool,
    n_par_distortions: usize,
    n_par_tot: usize,
    last_n_triplets: usize,
}

impl<'a> AstrometryFit<'a> {
    pub fn new(associations: &'a mut Associations, model: &'a mut dyn AstrometryModel) -> Self {
        let mut fit = AstrometryFit {
            associations,
            model,
            what_to_fit: String::new(),
            fitting_distortions: false,
            fitting_positions: false,
            n_par_distortions: 0,
            n_par_tot: 0,
            last_n_triplets: 0,
        };
        // the parameter counts are valid from the start, so an early
        // compute_chi2 sees a consistent (empty) layout
        fit.assign_indices("");
        fit
    }

    pub fn n_par_tot(&self) -> usize {
        self.n_par_tot
    }

    /// Decode `what_to_fit` and lay out the parameter indices: model
    /// parameters first, then two per fitted star when `"Positions"` is
    /// fitted. Stale star indices from earlier layouts are invalidated
    /// first.
    pub fn assign_indices(&mut self, what_to_fit: &str) {
        for token in what_to_fit.split_whitespace() {
            if !matches!(
                token,
                "Distortions" | "DistortionsChip" | "DistortionsVisit" | "Positions"
            ) {
                error!(token, "unknown whatToFit token for the astrometric fit");
            }
        }
        self.what_to_fit = what_to_fit.to_string();
        info!(what_to_fit, "assign_indices");
        self.fitting_distortions = self.what_to_fit.contains("Distortions");
        self.fitting_positions = self.what_to_fit.contains("Positions");

        for fs in &mut self.associations.fitted_stars {
            fs.index_in_fit = None;
        }
        self.n_par_distortions = if self.fitting_distortions {
            self.model.assign_indices(&self.what_to_fit, 0)
        } else {
            0
        };
        let mut ipar = self.n_par_distortions;
        if self.fitting_positions {
            for fs in &mut self.associations.fitted_stars {
                fs.index_in_fit = Some(ipar);
                ipar += 2;
            }
        }
        self.n_par_tot = ipar;
    }

    /// Jacobian and gradient contributions of the measurements of one
    /// exposure (or of the `subset` of its catalog, during outlier
    /// bookkeeping).
    fn ls_derivatives_for_image(
        &self,
        image_index: usize,
        subset: Option<&[usize]>,
        tlist: &mut TripletList,
        grad: &mut DVector<f64>,
    ) -> Result<(), JointfitError> {
        let image = &self.associations.ccd_images()[image_index];
        let mapping = self
            .model
            .mapping(image)
            .ok_or_else(|| JointfitError::UnknownCcdImage(image.ccd(), image.visit()))?;
        let n_par = if self.fitting_distortions { mapping.n_par() } else { 0 };
        let mut indices = Vec::with_capacity(n_par);
        if self.fitting_distortions {
            mapping.mapping_indices(&mut indices);
        }
        let mut h = DMatrix::<f64>::zeros(n_par.max(1), 2);

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

            let mut out = FatPoint::default();
            if self.fitting_distortions {
                h.fill(0.0);
                mapping.compute_transform_and_derivatives(&ms.pos, &mut out, &mut h);
            } else {
                out = mapping.transform_pos_and_errors(&ms.pos);
            }
            let Some(w) = weight_of(&out) else {
                error!(name = image.name(), star = ms_index, "degenerate measurement covariance");
                continue;
            };
            let rx = out.x - fs.pos.x;
            let ry = out.y - fs.pos.y;
            let wr_x = w.wxx * rx + w.wxy * ry;
            let wr_y = w.wxy * rx + w.wyy * ry;

            for (k, &param) in indices.iter().enumerate() {
                let hx = h[(k, 0)];
                let hy = h[(k, 1)];
                if hx == 0.0 && hy == 0.0 {
                    continue;
                }
                tlist.add_triplet(param, row, hx * w.a00 + hy * w.a10);
                if hy != 0.0 {
                    tlist.add_triplet(param, row + 1, hy * w.a11);
                }
                grad[param] += hx * wr_x + hy * wr_y;
            }
            if self.fitting_positions {
                let Some(i0) = fs.index_in_fit else {
                    return Err(JointfitError::InvalidArgument(
                        "fitted star has no parameter index while fitting positions".into(),
                    ));
                };
                // d(residual)/d(star position) = -identity, whitened
                tlist.add_triplet(i0, row, -w.a00);
                tlist.add_triplet(i0 + 1, row, -w.a10);
                tlist.add_triplet(i0 + 1, row + 1, -w.a11);
                grad[i0] -= wr_x;
                grad[i0 + 1] -= wr_y;
            }
            row += 2;
        }
        tlist.set_next_free_index(row);
        Ok(())
    }

    /// Reference-star rows: when positions are fitted, each tied fitted
    /// star is pulled toward its reference position with the catalog
    /// weight.
    fn ls_derivatives_reference(&self, tlist: &mut TripletList, grad: &mut DVector<f64>) {
        if !self.fitting_positions {
            return;
        }
        let mut row = tlist.next_free_index();
        for fs in self.associations.fitted_stars() {
            let Some(ref_index) = fs.ref_star else { continue };
            let Some(i0) = fs.index_in_fit else { continue };
            let ref_star = &self.associations.ref_stars()[ref_index];
            let Some(w) = weight_of(&ref_star.pos) else {
                error!(ref_index, "degenerate reference covariance");
                continue;
            };
            let rx = fs.pos.x - ref_star.pos.x;
            let ry = fs.pos.y - ref_star.pos.y;
            tlist.add_triplet(i0, row, w.a00);
            tlist.add_triplet(i0 + 1, row, w.a10);
            tlist.add_triplet(i0 + 1, row + 1, w.a11);
            grad[i0] += w.wxx * rx + w.wxy * ry;
            grad[i0 + 1] += w.wxy * rx + w.wyy * ry;
            row += 2;
        }
        tlist.set_next_free_index(row);
    }

    fn ls_derivatives(&mut self, tlist: &mut TripletList, grad: &mut DVector<f64>) -> Result<(), JointfitError> {
        for image_index in 0..self.associations.n_ccd_images() {
            self.ls_derivatives_for_image(image_index, None, tlist, grad)?;
        }
        self.ls_derivatives_reference(tlist, grad);
        Ok(())
    }

    fn accumulate_measurement_chi2(&self, mut visit: impl FnMut(f64, MeasuredStarId)) {
        for (image_index, image) in self.associations.ccd_images().iter().enumerate() {
            let Some(mapping) = self.model.mapping(image) else { continue };
            for &ms_index in image.catalog_for_fit() {
                let ms = image.star(ms_index);
                if !ms.valid {
                    continue;
                }
                let Some(fs_index) = ms.fitted_star else { continue };
                let fs = &self.associations.fitted_stars()[fs_index];
                let out = mapping.transform_pos_and_errors(&ms.pos);
                let Some(w) = weight_of(&out) else { continue };
                let rx = out.x - fs.pos.x;
                let ry = out.y - fs.pos.y;
                let chi2 = w.wxx * rx * rx + w.wyy * ry * ry + 2.0 * w.wxy * rx * ry;
                visit(
                    chi2,
                    MeasuredStarId {
                        image: image_index,
                        star: ms_index,
                    },
                );
            }
        }
    }

    /// Weighted residual sum over measurements and reference ties;
    /// `ndof` = number of squares − total parameter count.
    pub fn compute_chi2(&self) -> Chi2 {
        let mut chi2 = Chi2::new();
        self.accumulate_measurement_chi2(|value, _| chi2.add_entry(value, 2));
        for fs in self.associations.fitted_stars() {
            let Some(ref_index) = fs.ref_star else { continue };
            let ref_star = &self.associations.ref_stars()[ref_index];
            let Some(w) = weight_of(&ref_star.pos) else { continue };
            let rx = fs.pos.x - ref_star.pos.x;
            let ry = fs.pos.y - ref_star.pos.y;
            chi2.add_entry(w.wxx * rx * rx + w.wyy * ry * ry + 2.0 * w.wxy * rx * ry, 2);
        }
        chi2.ndof -= self.n_par_tot as i64;
        if chi2.ndof < 1 {
            error!(ndof = chi2.ndof, n_par_tot = self.n_par_tot, "not enough degrees of freedom");
        }
        chi2
    }

    /// Global parameter indices a measurement constrains, under the
    /// current `whatToFit`.
    fn measured_star_indices(&self, id: MeasuredStarId, indices: &mut Vec<usize>) {
        let image = &self.associations.ccd_images()[id.image];
        if self.fitting_distortions {
            if let Some(mapping) = self.model.mapping(image) {
                mapping.mapping_indices(indices);
            }
        }
        if self.fitting_positions {
            let ms = image.star(id.star);
            if let Some(fs_index) = ms.fitted_star {
                if let Some(i0) = self.associations.fitted_stars()[fs_index].index_in_fit {
                    indices.push(i0);
                    indices.push(i0 + 1);
                }
            }
        }
    }

    /// Outlier candidates above `mean + n_sig_cut·sigma` of the
    /// per-measurement chi2 distribution, filtered by the
    /// one-outlier-per-parameter rule.
    pub fn find_outliers(&self, n_sig_cut: f64) -> Vec<MeasuredStarId> {
        let mut entries = Vec::new();
        self.accumulate_measurement_chi2(|chi2, id| entries.push((chi2, id)));
        select_outliers(entries, n_sig_cut, self.n_par_tot, |id, indices| {
            self.measured_star_indices(id, indices)
        })
    }

    /// Accumulate the (to-be-subtracted) contributions of `outliers` into
    /// `tlist`/`grad`, then invalidate them and decrement their fitted
    /// stars' measurement counts.
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

    /// Drop `outliers` from the fit (see
    /// [`outliers_contributions`](Self::outliers_contributions)).
    pub fn remove_outliers(&mut self, outliers: &[MeasuredStarId]) -> Result<(), JointfitError> {
        let mut tlist = TripletList::with_capacity(outliers.len() * 16);
        let mut grad = DVector::zeros(self.n_par_tot);
        self.outliers_contributions(outliers, &mut tlist, &mut grad)
    }

    /// Apply a solution offset: model parameters, then fitted-star
    /// positions.
    pub fn offset_params(&mut self, delta: &DVector<f64>) -> Result<(), JointfitError> {
        if delta.len() != self.n_par_tot {
            return Err(JointfitError::DeltaSizeMismatch {
                expected: self.n_par_tot,
                got: delta.len(),
            });
        }
        if self.fitting_distortions {
            self.model.offset_params(delta)?;
        }
        if self.fitting_positions {
            for fs in &mut self.associations.fitted_stars {
                if let Some(i0) = fs.index_in_fit {
                    fs.pos.x += delta[i0];
                    fs.pos.y += delta[i0 + 1];
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

    /// One normal-equations step: assign indices, assemble, factor, solve,
    /// offset. Returns false (with an error log) when the factorization
    /// fails.
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
    /// iteration bound is reached. The error-propagation transforms are
    /// frozen after the first step so clipping runs on stable weights.
    pub fn fit(&mut self, what_to_fit: &str, params: &JointfitParams) -> Result<Chi2, JointfitError> {
        let mut previous: Option<f64> = None;
        let mut last: Option<Chi2> = None;
        for iteration in 0..params.outer_iterations {
            if !self.minimize(what_to_fit)? {
                return Err(JointfitError::FactorizationFailure(
                    "astrometric fit step failed".into(),
                ));
            }
            if iteration == 0 {
                self.model.freeze_error_transform();
            }
            let chi2 = self.compute_chi2();
            info!(iteration, %chi2, "astrometric fit step");
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
    pub fn residual_records(&self) -> Vec<AstrometryResidualRecord> {
        let mut records = Vec::new();
        for image in self.associations.ccd_images() {
            let Some(mapping) = self.model.mapping(image) else { continue };
            for &ms_index in image.catalog_for_fit() {
                let ms = image.star(ms_index);
                if !ms.valid {
                    continue;
                }
                let Some(fs_index) = ms.fitted_star else { continue };
                let fs = &self.associations.fitted_stars()[fs_index];
                let out = mapping.transform_pos_and_errors(&ms.pos);
                let Some(w) = weight_of(&out) else { continue };
                let rx = out.x - fs.pos.x;
                let ry = out.y - fs.pos.y;
                records.push(AstrometryResidualRecord {
                    xccd: ms.pos.x,
                    yccd: ms.pos.y,
                    mag: ms.mag,
                    tp_x: out.x,
                    tp_y: out.y,
                    fitted_x: fs.pos.x,
                    fitted_y: fs.pos.y,
                    rx,
                    ry,
                    chi2: w.wxx * rx * rx + w.wyy * ry * ry + 2.0 * w.wxy * rx * ry,
                    fitted_star_index: fs_index,
                    measurement_count: fs.measurement_count,
                    mjd: image.mjd(),
                    ccd: image.ccd(),
                    visit: image.visit(),
                });
            }
        }
        records
    }
}
