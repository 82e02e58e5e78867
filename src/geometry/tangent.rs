//! Gnomonic (tangent-plane) projections.
//!
//! [`TanRaDec2Pix`] projects sky positions onto the plane tangent to the
//! celestial sphere at a chosen point; [`TanPix2RaDec`] goes the other way,
//! optionally through a polynomial correction applied ahead of its linear
//! part (the in-memory equivalent of a SIP WCS).
//!
//! Sky coordinates are decimal degrees at the API boundary; tangent-plane
//! coordinates are radians.

use std::f64::consts::PI;

use super::linear::LinearTransform;
use super::point::Point;
use super::poly::PolyTransform;
use crate::constants::{Degree, Radian, DEGRAD, RADEG};

/// Projection of (ra, dec) onto the plane tangent at `tangent_point`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TanRaDec2Pix {
    ra0: Radian,
    dec0: Radian,
    cos0: f64,
    sin0: f64,
}

impl TanRaDec2Pix {
    /// `tangent_point` is (ra, dec) in decimal degrees.
    pub fn new(tangent_point: Point) -> Self {
        let ra0 = tangent_point.x * RADEG;
        let dec0 = tangent_point.y * RADEG;
        TanRaDec2Pix {
            ra0,
            dec0,
            cos0: dec0.cos(),
            sin0: dec0.sin(),
        }
    }

    /// The tangent point, in decimal degrees.
    pub fn tangent_point(&self) -> Point {
        Point::new(self.ra0 * DEGRAD, self.dec0 * DEGRAD)
    }

    /// Project a sky position (degrees) onto the tangent plane (radians).
    pub fn apply(&self, sky: &Point) -> Point {
        let ra = sky.x * RADEG;
        let dec = sky.y * RADEG;
        let (sin_d, cos_d) = dec.sin_cos();
        let mut dra = ra - self.ra0;
        if dra > PI {
            dra -= 2.0 * PI;
        }
        if dra < -PI {
            dra += 2.0 * PI;
        }
        let (sin_dra, cos_dra) = dra.sin_cos();
        let denom = sin_d * self.sin0 + cos_d * self.cos0 * cos_dra;
        Point::new(
            cos_d * sin_dra / denom,
            (sin_d * self.cos0 - cos_d * self.sin0 * cos_dra) / denom,
        )
    }

    /// Inverse gnomonic projection: tangent plane (radians) back to
    /// (ra, dec) in degrees.
    pub fn deproject(&self, tp: &Point) -> Point {
        let xi = tp.x;
        let eta = tp.y;
        let denom = self.cos0 - eta * self.sin0;
        let mut ra = self.ra0 + xi.atan2(denom);
        if ra < 0.0 {
            ra += 2.0 * PI;
        }
        if ra >= 2.0 * PI {
            ra -= 2.0 * PI;
        }
        let dec = ((self.sin0 + eta * self.cos0) / (xi * xi + denom * denom).sqrt()).atan();
        Point::new(ra * DEGRAD, dec * DEGRAD)
    }

    /// The inverse mapping as a transform (no distortion corrections).
    pub fn invert(&self) -> TanPix2RaDec {
        TanPix2RaDec::new(LinearTransform::identity(), self.tangent_point(), None)
    }
}

/// Plane-to-sky mapping: an optional correction polynomial, a linear part,
/// then the inverse gnomonic deprojection at `tangent_point`.
#[derive(Debug, Clone, PartialEq)]
pub struct TanPix2RaDec {
    lin: LinearTransform,
    projection: TanRaDec2Pix,
    corrections: Option<PolyTransform>,
}

impl TanPix2RaDec {
    /// `tangent_point` is (ra, dec) in decimal degrees; `lin` maps the
    /// input plane onto the tangent plane (radians).
    pub fn new(lin: LinearTransform, tangent_point: Point, corrections: Option<PolyTransform>) -> Self {
        TanPix2RaDec {
            lin,
            projection: TanRaDec2Pix::new(tangent_point),
            corrections,
        }
    }

    pub fn tangent_point(&self) -> Point {
        self.projection.tangent_point()
    }

    pub fn linear_part(&self) -> &LinearTransform {
        &self.lin
    }

    pub fn corrections(&self) -> Option<&PolyTransform> {
        self.corrections.as_ref()
    }

    /// Map an input-plane position to (ra, dec) in degrees.
    pub fn apply(&self, p: &Point) -> Point {
        let corrected = match &self.corrections {
            Some(poly) => poly.apply(p),
            None => *p,
        };
        self.projection.deproject(&self.lin.apply(&corrected))
    }

    /// The corresponding sky-to-plane projection, valid when the linear part
    /// is the identity and no corrections are attached.
    pub fn invert(&self) -> Option<TanRaDec2Pix> {
        if self.corrections.is_some() || self.lin != LinearTransform::identity() {
            return None;
        }
        Some(TanRaDec2Pix::new(self.tangent_point()))
    }
}

#[cfg(test)]
mod test_tangent {
    use super::*;
    use crate::constants::RADSEC;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_at_tangent_point_is_origin() {
        let proj = TanRaDec2Pix::new(Point::new(150.0, 2.2));
        let tp = proj.apply(&Point::new(150.0, 2.2));
        assert_relative_eq!(tp.x, 0.0, epsilon = 1e-15);
        assert_relative_eq!(tp.y, 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_roundtrip_over_a_degree_field() {
        let proj = TanRaDec2Pix::new(Point::new(32.5, -41.0));
        for dra in [-0.5, -0.1, 0.0, 0.2, 0.5] {
            for ddec in [-0.5, 0.0, 0.3, 0.5] {
                let sky = Point::new(32.5 + dra, -41.0 + ddec);
                let back = proj.deproject(&proj.apply(&sky));
                assert_relative_eq!(back.x, sky.x, epsilon = 1e-11);
                assert_relative_eq!(back.y, sky.y, epsilon = 1e-11);
            }
        }
    }

    #[test]
    fn test_small_offsets_are_locally_linear() {
        // one arcsecond east at the equator projects to ~RADSEC in x
        let proj = TanRaDec2Pix::new(Point::new(10.0, 0.0));
        let tp = proj.apply(&Point::new(10.0 + 1.0 / 3600.0, 0.0));
        assert_relative_eq!(tp.x, RADSEC, max_relative = 1e-9);
        assert_relative_eq!(tp.y, 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_tan_pix2radec_matches_deprojection() {
        let tangent = Point::new(200.0, 35.0);
        let proj = TanRaDec2Pix::new(tangent);
        let wcs = proj.invert();
        let sky = Point::new(200.3, 34.8);
        let back = wcs.apply(&proj.apply(&sky));
        assert_relative_eq!(back.x, sky.x, epsilon = 1e-11);
        assert_relative_eq!(back.y, sky.y, epsilon = 1e-11);
    }
}
