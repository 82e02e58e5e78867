//! # jointfit
//!
//! Joint astrometric and photometric calibration of sets of overlapping
//! astronomical exposures.
//!
//! Given per-exposure source catalogs with approximate world-coordinate
//! solutions, and optionally an external reference catalog, the crate
//! merges repeated detections of each sky object into fitted stars,
//! parameterizes per-detector and per-visit distortion models, and solves
//! the sparse non-linear weighted least-squares problem tying them all
//! together, with sigma-clipping outlier rejection between steps.
//!
//! The calibration engine is the whole story here: catalog extraction,
//! metadata I/O and WCS serialization live upstream and downstream of
//! this crate.

pub mod associations;
pub mod ccd_image;
pub mod constants;
pub mod fitters;
pub mod geometry;
pub mod jointfit_errors;
pub mod mappings;
pub mod models;
pub mod params;
pub mod stars;

pub use associations::Associations;
pub use ccd_image::{CcdImage, DetectorGeometry, ExposureData, RefSourceRecord, SourceRecord};
pub use fitters::{AstrometryFit, Chi2, MeasuredStarId, PhotometryFit};
pub use jointfit_errors::JointfitError;
pub use models::{
    AstrometryModel, ConstrainedPolyModel, PhotometryModel, SimplePhotometryModel, SimplePolyModel,
};
pub use params::JointfitParams;
