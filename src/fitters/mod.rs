//! # Least-squares fitters
//!
//! Both fitters follow the same template: assign parameter indices, walk
//! every valid measurement accumulating sparse-Jacobian triplets and the
//! gradient, form the normal matrix `H = J Jᵀ`, factor it with a sparse
//! Cholesky, solve, and offset the parameters. Outlier rejection runs
//! between steps: per-measurement chi2 values are clipped at
//! `mean + nSigCut·sigma`, walking from the worst down, with the
//! single-outlier-per-parameter rule protecting the rank of the update.
//!
//! This module holds the machinery the two fitters share: the chi2
//! accumulator, the triplet buffer, the sparse solve, and the outlier
//! selection.

pub mod astrometry;
pub mod photometry;

use std::fmt;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use ordered_float::NotNan;
use tracing::{info, warn};

use crate::jointfit_errors::JointfitError;

pub use astrometry::{AstrometryFit, AstrometryResidualRecord};
pub use photometry::{PhotometryFit, PhotometryResidualRecord};

/// Weighted residual sum and degrees of freedom.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chi2 {
    pub chi2: f64,
    /// Number of squares minus number of parameters; can go non-positive
    /// on pathologically small problems.
    pub ndof: i64,
}

impl Chi2 {
    pub fn new() -> Self {
        Chi2::default()
    }

    pub fn add_entry(&mut self, chi2_increment: f64, ndof_increment: usize) {
        self.chi2 += chi2_increment;
        self.ndof += ndof_increment as i64;
    }

    /// Chi2 per degree of freedom (1 at the floor).
    pub fn reduced(&self) -> f64 {
        self.chi2 / self.ndof.max(1) as f64
    }
}

impl fmt::Display for Chi2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chi2/ndof : {:.4}/{} = {:.4}", self.chi2, self.ndof, self.reduced())
    }
}

/// Identifies one measurement: exposure index in the association list,
/// star index in that exposure's catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasuredStarId {
    pub image: usize,
    pub star: usize,
}

/// Append-only buffer of sparse-Jacobian entries.
///
/// The Jacobian is laid out parameters × measurement rows; each
/// measurement claims its rows at the current frontier
/// (`next_free_index`) and advances it.
pub(crate) struct TripletList {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
    next_free_index: usize,
}

impl TripletList {
    pub fn with_capacity(capacity: usize) -> Self {
        TripletList {
            rows: Vec::with_capacity(capacity),
            cols: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            next_free_index: 0,
        }
    }

    pub fn add_triplet(&mut self, param_index: usize, row_index: usize, value: f64) {
        self.rows.push(param_index);
        self.cols.push(row_index);
        self.values.push(value);
    }

    pub fn next_free_index(&self) -> usize {
        self.next_free_index
    }

    pub fn set_next_free_index(&mut self, index: usize) {
        self.next_free_index = index;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Assemble the sparse Jacobian (`n_par` × rows used so far).
    pub fn into_jacobian(self, n_par: usize) -> Result<CscMatrix<f64>, JointfitError> {
        let coo = CooMatrix::try_from_triplets(
            n_par,
            self.next_free_index,
            self.rows,
            self.cols,
            self.values,
        )
        .map_err(|e| JointfitError::InvalidArgument(format!("bad Jacobian triplets: {e}")))?;
        Ok(CscMatrix::from(&coo))
    }
}

/// Factor `H` (symmetric positive definite expected) and solve `H x = b`.
pub(crate) fn solve_normal_equations(
    hessian: &CscMatrix<f64>,
    rhs: &DVector<f64>,
) -> Result<DVector<f64>, JointfitError> {
    let factorization = CscCholesky::factor(hessian)
        .map_err(|e| JointfitError::FactorizationFailure(format!("{e:?}")))?;
    let b = DMatrix::from_column_slice(rhs.len(), 1, rhs.as_slice());
    let solution = factorization.solve(&b);
    Ok(DVector::from_column_slice(solution.as_slice()))
}

/// Betoule outlier selection.
///
/// Entries are (chi2, measurement). The cut is `mean + n_sig_cut·sigma`
/// of the chi2 distribution; candidates are walked from the worst down,
/// and a candidate is kept only when none of the parameters it constrains
/// has already received an outlier in this pass, so that no parameter
/// loses two measurements in a single small-rank update.
pub(crate) fn select_outliers(
    entries: Vec<(f64, MeasuredStarId)>,
    n_sig_cut: f64,
    n_par_tot: usize,
    mut indices_of: impl FnMut(MeasuredStarId, &mut Vec<usize>),
) -> Vec<MeasuredStarId> {
    let mut chi2s: Vec<(NotNan<f64>, MeasuredStarId)> = entries
        .into_iter()
        .filter_map(|(chi2, id)| match NotNan::new(chi2) {
            Ok(value) if chi2.is_finite() => Some((value, id)),
            _ => {
                warn!(?id, "non-finite chi2 contribution ignored");
                None
            }
        })
        .collect();
    if chi2s.is_empty() {
        return Vec::new();
    }
    chi2s.sort_unstable_by_key(|&(chi2, _)| chi2);

    let n = chi2s.len() as f64;
    let sum: f64 = chi2s.iter().map(|(c, _)| c.into_inner()).sum();
    let sum2: f64 = chi2s.iter().map(|(c, _)| c.into_inner() * c.into_inner()).sum();
    let average = sum / n;
    let sigma = (sum2 / n - average * average).max(0.0).sqrt();
    let median = chi2s[chi2s.len() / 2].0.into_inner();
    info!(average, median, sigma, "findOutliers chi2 statistics");
    let cut = average + n_sig_cut * sigma;

    let mut affected = vec![0u32; n_par_tot];
    let mut outliers = Vec::new();
    let mut indices = Vec::new();
    for &(chi2, id) in chi2s.iter().rev() {
        if chi2.into_inner() < cut {
            break; // sorted: everything further down is below the cut
        }
        indices.clear();
        indices_of(id, &mut indices);
        let free = indices.iter().all(|&k| affected[k] == 0);
        if free {
            for &k in &indices {
                affected[k] += 1;
            }
            outliers.push(id);
        }
    }
    info!(found = outliers.len(), "findOutliers done");
    outliers
}
