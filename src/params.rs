//! # Calibration parameters
//!
//! This module defines the [`JointfitParams`] configuration struct and its
//! builder, which control catalog association, model complexity and the
//! behavior of the least-squares fitters.
//!
//! ## Purpose
//!
//! [`JointfitParams`] centralizes the tunable parameters consumed by
//! [`Associations`](crate::associations::Associations) and by the fit
//! drivers ([`AstrometryFit::fit`](crate::fitters::astrometry::AstrometryFit::fit),
//! [`PhotometryFit::fit`](crate::fitters::photometry::PhotometryFit::fit)):
//!
//! - the common tangent point shared by all exposures,
//! - the association cuts (measurement merging, reference matching),
//! - the minimum number of measurements a fitted object must have,
//! - the polynomial degrees of the distortion models,
//! - the sigma clip and iteration bounds of the outlier-rejection loop.
//!
//! ## Example
//!
//! ```rust
//! use jointfit::params::JointfitParams;
//!
//! let params = JointfitParams::builder()
//!     .common_tangent_point(150.0, 2.2)
//!     .match_cut(1.0)
//!     .min_measurements(2)
//!     .chip_degree(2)
//!     .visit_degree(3)
//!     .build()
//!     .unwrap();
//! assert_eq!(params.min_measurements, 2);
//! ```
use std::fmt;

use crate::constants::{ArcSec, Degree, MAX_POLY_DEGREE};
use crate::jointfit_errors::JointfitError;

/// Configuration of the association step and of the fit drivers.
///
/// Fields
/// -----------------
/// * `common_tangent_point` – (ra, dec) in decimal degrees of the point the
///   shared tangent plane is anchored at.
/// * `match_cut` – association radius (arcsec) used when merging repeated
///   measurements into fitted objects.
/// * `ref_match_cut` – association radius (arcsec) used when tying fitted
///   objects to external reference objects.
/// * `min_measurements` – fitted objects with fewer measurements are dropped
///   by the selection step.
/// * `simple_degree` – polynomial degree of the free-per-image model.
/// * `chip_degree`, `visit_degree` – polynomial degrees of the two factors
///   of the constrained chip×visit model.
/// * `n_sig_cut` – outlier threshold, in units of the standard deviation of
///   the per-measurement chi2 distribution.
/// * `outer_iterations` – bound on the minimize / outlier-rejection
///   alternation of the fit drivers.
/// * `chi2_tolerance` – relative change of chi2/ndof below which the fit
///   drivers declare convergence.
#[derive(Debug, Clone)]
pub struct JointfitParams {
    pub common_tangent_point: (Degree, Degree),
    pub match_cut: ArcSec,
    pub ref_match_cut: ArcSec,
    pub min_measurements: usize,
    pub simple_degree: usize,
    pub chip_degree: usize,
    pub visit_degree: usize,
    pub n_sig_cut: f64,
    pub outer_iterations: usize,
    pub chi2_tolerance: f64,
}

impl JointfitParams {
    /// Construct a new [`JointfitParams`] with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new [`JointfitParamsBuilder`] to override defaults step by
    /// step before handing the configuration to the association and fit
    /// entry points.
    pub fn builder() -> JointfitParamsBuilder {
        JointfitParamsBuilder::new()
    }
}

impl Default for JointfitParams {
    fn default() -> Self {
        JointfitParams {
            common_tangent_point: (0.0, 0.0),
            match_cut: 3.0,
            ref_match_cut: 2.0,
            min_measurements: 2,
            simple_degree: 3,
            chip_degree: 2,
            visit_degree: 3,
            n_sig_cut: 5.0,
            outer_iterations: 20,
            chi2_tolerance: 1e-5,
        }
    }
}

/// Builder for [`JointfitParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct JointfitParamsBuilder {
    params: JointfitParams,
}

impl JointfitParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: JointfitParams::default(),
        }
    }

    pub fn common_tangent_point(mut self, ra: Degree, dec: Degree) -> Self {
        self.params.common_tangent_point = (ra, dec);
        self
    }
    pub fn match_cut(mut self, v: ArcSec) -> Self {
        self.params.match_cut = v;
        self
    }
    pub fn ref_match_cut(mut self, v: ArcSec) -> Self {
        self.params.ref_match_cut = v;
        self
    }
    pub fn min_measurements(mut self, v: usize) -> Self {
        self.params.min_measurements = v;
        self
    }
    pub fn simple_degree(mut self, v: usize) -> Self {
        self.params.simple_degree = v;
        self
    }
    pub fn chip_degree(mut self, v: usize) -> Self {
        self.params.chip_degree = v;
        self
    }
    pub fn visit_degree(mut self, v: usize) -> Self {
        self.params.visit_degree = v;
        self
    }
    pub fn n_sig_cut(mut self, v: f64) -> Self {
        self.params.n_sig_cut = v;
        self
    }
    pub fn outer_iterations(mut self, v: usize) -> Self {
        self.params.outer_iterations = v;
        self
    }
    pub fn chi2_tolerance(mut self, v: f64) -> Self {
        self.params.chi2_tolerance = v;
        self
    }

    /// Finalize the builder and produce a [`JointfitParams`] instance.
    ///
    /// Validation rules
    /// -----------------
    /// * `match_cut > 0`, `ref_match_cut > 0` – association radii must be
    ///   strictly positive.
    /// * `min_measurements >= 1`.
    /// * polynomial degrees are in `1..=MAX_POLY_DEGREE`.
    /// * `n_sig_cut > 0`, `chi2_tolerance > 0`, `outer_iterations >= 1`.
    /// * the tangent point declination lies in [-90, 90].
    pub fn build(self) -> Result<JointfitParams, JointfitError> {
        let p = &self.params;

        if !(p.match_cut > 0.0) || !(p.ref_match_cut > 0.0) {
            return Err(JointfitError::InvalidFitParameter(
                "association cuts must be > 0".into(),
            ));
        }
        if p.min_measurements == 0 {
            return Err(JointfitError::InvalidFitParameter(
                "min_measurements must be >= 1".into(),
            ));
        }
        for degree in [p.simple_degree, p.chip_degree, p.visit_degree] {
            if degree == 0 || degree > MAX_POLY_DEGREE {
                return Err(JointfitError::InvalidFitParameter(format!(
                    "polynomial degrees must be in 1..={MAX_POLY_DEGREE}, got {degree}"
                )));
            }
        }
        if !(p.n_sig_cut > 0.0) {
            return Err(JointfitError::InvalidFitParameter(
                "n_sig_cut must be > 0".into(),
            ));
        }
        if !(p.chi2_tolerance > 0.0) {
            return Err(JointfitError::InvalidFitParameter(
                "chi2_tolerance must be > 0".into(),
            ));
        }
        if p.outer_iterations == 0 {
            return Err(JointfitError::InvalidFitParameter(
                "outer_iterations must be >= 1".into(),
            ));
        }
        let dec = p.common_tangent_point.1;
        if !(-90.0..=90.0).contains(&dec) {
            return Err(JointfitError::InvalidFitParameter(format!(
                "tangent point declination {dec} is outside [-90, 90]"
            )));
        }

        Ok(self.params)
    }
}

impl fmt::Display for JointfitParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 42; // width reserved for "name = value"
            writeln!(f, "Joint Calibration Parameters")?;
            writeln!(f, "----------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Association]")?;
            let tangent = format!(
                "({:.5}, {:.5})",
                self.common_tangent_point.0, self.common_tangent_point.1
            );
            line!(
                "common_tangent_point = {}",
                tangent,
                "Shared projection center (deg)"
            )?;
            line!(
                "match_cut            = {:.2}\"",
                self.match_cut,
                "Measurement merging radius"
            )?;
            line!(
                "ref_match_cut        = {:.2}\"",
                self.ref_match_cut,
                "Reference matching radius"
            )?;
            line!(
                "min_measurements     = {}",
                self.min_measurements,
                "Selection floor per fitted star"
            )?;

            writeln!(f, "\n[Models]")?;
            line!(
                "simple_degree        = {}",
                self.simple_degree,
                "Free-per-image polynomial degree"
            )?;
            line!(
                "chip_degree          = {}",
                self.chip_degree,
                "Constrained chip polynomial degree"
            )?;
            line!(
                "visit_degree         = {}",
                self.visit_degree,
                "Constrained visit polynomial degree"
            )?;

            writeln!(f, "\n[Fit driver]")?;
            line!(
                "n_sig_cut            = {:.1}",
                self.n_sig_cut,
                "Outlier clip in chi2 sigmas"
            )?;
            line!(
                "outer_iterations     = {}",
                self.outer_iterations,
                "Bound on minimize/clip alternation"
            )?;
            line!(
                "chi2_tolerance       = {:.1e}",
                self.chi2_tolerance,
                "Relative chi2/ndof convergence"
            )?;

            Ok(())
        } else {
            write!(
                f,
                "JointfitParams(tangent point=({:.5}, {:.5}) deg, match_cut={:.2}\", ref_match_cut={:.2}\", \
                 min_measurements={}, degrees simple/chip/visit={}/{}/{}, n_sig_cut={:.1}, \
                 outer_iterations={}, chi2_tolerance={:.1e})",
                self.common_tangent_point.0,
                self.common_tangent_point.1,
                self.match_cut,
                self.ref_match_cut,
                self.min_measurements,
                self.simple_degree,
                self.chip_degree,
                self.visit_degree,
                self.n_sig_cut,
                self.outer_iterations,
                self.chi2_tolerance,
            )
        }
    }
}
