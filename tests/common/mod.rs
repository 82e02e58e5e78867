#![allow(dead_code)]
//! Synthetic exposure sets shared by the end-to-end scenarios.
//!
//! The input WCS handed to the association layer is built as a linear
//! pixels → tangent-plane part followed by the gnomonic deprojection at
//! the common tangent point. Re-projecting through the shared tangent
//! plane then recovers the linear part to machine precision, which keeps
//! the ground truth of every scenario exactly representable by the
//! polynomial models.

use jointfit::ccd_image::{ExposureData, SourceRecord};
use jointfit::geometry::{LinearTransform, Point, TanPix2RaDec, TanRaDec2Pix, Transform};
use jointfit::params::JointfitParams;

pub const TANGENT: (f64, f64) = (30.0, 10.0);

pub fn projector() -> TanRaDec2Pix {
    TanRaDec2Pix::new(Point::new(TANGENT.0, TANGENT.1))
}

/// Linear pixels → tangent plane: `tp = scale · (p − center)`.
pub fn pixel_to_tp(scale: f64, center: f64) -> LinearTransform {
    LinearTransform::new(scale, 0.0, 0.0, scale, -scale * center, -scale * center)
}

/// An input WCS whose pixels land on the tangent plane through `lin`.
pub fn wcs_from_linear(lin: LinearTransform) -> Transform {
    Transform::TangentPlaneToSky(TanPix2RaDec::new(lin, Point::new(TANGENT.0, TANGENT.1), None))
}

pub fn exposure(visit: i64, ccd: i64, zero_point: f64) -> ExposureData {
    ExposureData {
        visit,
        ccd,
        filter: "r".into(),
        mjd: 57_000.0 + visit as f64,
        airmass: 1.15,
        zero_point,
    }
}

pub fn source(x: f64, y: f64, var_px: f64, flux: f64, flux_err: f64) -> SourceRecord {
    SourceRecord {
        x,
        y,
        vx: var_px,
        vy: var_px,
        vxy: 0.0,
        flux,
        flux_err,
        object_hint: None,
    }
}

/// A square pixel grid, `n` per side with the given spacing, starting at
/// `start`.
pub fn pixel_grid(n: usize, start: f64, spacing: f64) -> Vec<Point> {
    let mut points = Vec::with_capacity(n * n);
    for ix in 0..n {
        for iy in 0..n {
            points.push(Point::new(
                start + ix as f64 * spacing,
                start + iy as f64 * spacing,
            ));
        }
    }
    points
}

pub fn quick_params() -> JointfitParams {
    JointfitParams::builder()
        .common_tangent_point(TANGENT.0, TANGENT.1)
        .match_cut(1.0)
        .build()
        .unwrap()
}
