//! Star records of the association graph.
//!
//! The graph is an arena: [`FittedStar`]s and [`RefStar`]s are owned by the
//! associations container, [`MeasuredStar`]s by their exposure, and every
//! cross-link is an index rather than a reference. Measurement counts are
//! explicit counters maintained by the association and outlier-rejection
//! code, never inferred.

pub mod finder;
pub mod star_match;

use crate::constants::{Degree, Mag};
use crate::geometry::{FatPoint, Point};

pub use finder::NeighborGrid;
pub use star_match::{StarMatch, StarMatchList};

/// A position with its error ellipse and a flux.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseStar {
    pub pos: FatPoint,
    pub flux: f64,
}

impl BaseStar {
    pub fn new(pos: FatPoint, flux: f64) -> Self {
        BaseStar { pos, flux }
    }
}

impl From<&MeasuredStar> for BaseStar {
    fn from(star: &MeasuredStar) -> Self {
        BaseStar::new(star.pos, star.flux)
    }
}

impl From<&FittedStar> for BaseStar {
    fn from(star: &FittedStar) -> Self {
        BaseStar::new(star.pos, star.flux)
    }
}

impl From<&RefStar> for BaseStar {
    fn from(star: &RefStar) -> Self {
        BaseStar::new(star.pos, star.flux)
    }
}

/// One detection of a sky object on one exposure.
///
/// `pos` is in pixel coordinates of the owning exposure; `tp_pos` is the
/// initial tangent-plane position (radians) computed at ingestion through
/// the exposure's input WCS, and is what catalog association matches on.
#[derive(Debug, Clone)]
pub struct MeasuredStar {
    pub pos: FatPoint,
    pub tp_pos: Point,
    pub flux: f64,
    pub eflux: f64,
    pub mag: Mag,
    /// Index of the associated [`FittedStar`], if any.
    pub fitted_star: Option<usize>,
    pub valid: bool,
}

impl MeasuredStar {
    pub fn new(pos: FatPoint, tp_pos: Point, flux: f64, eflux: f64, mag: Mag) -> Self {
        MeasuredStar {
            pos,
            tp_pos,
            flux,
            eflux,
            mag,
            fitted_star: None,
            valid: true,
        }
    }
}

/// The calibration solution's belief about a single sky object.
///
/// While a fit is running the position lives on the common tangent plane
/// (radians); after deprojection it is (ra, dec) in degrees.
#[derive(Debug, Clone)]
pub struct FittedStar {
    pub pos: FatPoint,
    pub flux: f64,
    pub mag: Mag,
    pub color: f64,
    pub measurement_count: usize,
    /// Start index of this star's parameters in the solution vector.
    /// Only meaningful between `assign_indices` and the end of a fit step.
    pub index_in_fit: Option<usize>,
    /// Index of the associated [`RefStar`], if any.
    pub ref_star: Option<usize>,
}

impl FittedStar {
    pub fn from_measurement(measurement: &MeasuredStar) -> Self {
        FittedStar {
            pos: FatPoint::from_point(measurement.tp_pos),
            flux: measurement.flux,
            mag: measurement.mag,
            color: 0.0,
            measurement_count: 1,
            index_in_fit: None,
            ref_star: None,
        }
    }
}

/// An external-catalog object used as an absolute anchor.
#[derive(Debug, Clone)]
pub struct RefStar {
    pub ra: Degree,
    pub dec: Degree,
    /// Tangent-plane position (radians) with the catalog covariance.
    pub pos: FatPoint,
    pub flux: f64,
}
