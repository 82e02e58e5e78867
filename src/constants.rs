use std::f64::consts::PI;

pub const RADEG: f64 = PI / 180.0; // Degrees -> radians conversion factor
pub const RADSEC: f64 = PI / 648_000.0; // arcsecond -> radians conversion factor
pub const DEGRAD: f64 = 180.0 / PI; // radians -> degrees conversion factor

/// Highest polynomial degree a transform composition is allowed to reach.
/// Compositions whose formal degree exceeds this are truncated.
pub const MAX_POLY_DEGREE: usize = 9;

/// Step used by the finite-difference fallback of transform derivatives.
pub const DERIVATIVE_STEP: f64 = 0.01;

// type def
pub type Degree = f64;
pub type Radian = f64;
/// An angle in seconds of arc.
pub type ArcSec = f64;
pub type Mag = f64;
/// Modified Julian Date
pub type Mjd = f64;

/// An exposure identifier.
pub type VisitId = i64;
/// A detector identifier.
pub type CcdId = i64;
