//! One detector read of one exposure, and the opaque input records the
//! core consumes.
//!
//! Source extraction, selection and metadata I/O happen upstream; this
//! module only defines the in-memory shape the calibration engine works
//! on. A [`CcdImage`] owns its measurements and knows its initial
//! pixel→tangent-plane transform, built from the input WCS and the shared
//! tangent-point projection.

use std::collections::HashMap;

use crate::constants::{ArcSec, CcdId, Degree, Mag, Mjd, VisitId};
use crate::geometry::{FatPoint, Frame, Point, TanRaDec2Pix, Transform};
use crate::stars::MeasuredStar;

/// One source detection, as handed over by the upstream extraction.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub vxy: f64,
    pub flux: f64,
    pub flux_err: f64,
    /// Upstream object id, carried through for diagnostics only.
    pub object_hint: Option<u64>,
}

/// Exposure metadata for one detector read.
#[derive(Debug, Clone)]
pub struct ExposureData {
    pub visit: VisitId,
    pub ccd: CcdId,
    pub filter: String,
    pub mjd: Mjd,
    pub airmass: f64,
    /// Photometric zero point (mag).
    pub zero_point: Mag,
}

/// Detector geometry used by the constrained chip×visit model.
#[derive(Debug, Clone)]
pub struct DetectorGeometry {
    /// Pixels → focal-plane transform.
    pub pixels_to_focal: Transform,
    /// Detector center in the focal plane.
    pub focal_center: Point,
}

/// One reference-catalog entry. `fluxes` maps a band/field name onto a
/// flux value, mirroring a multi-band external catalog.
#[derive(Debug, Clone)]
pub struct RefSourceRecord {
    pub ra: Degree,
    pub dec: Degree,
    pub ra_err: ArcSec,
    pub dec_err: ArcSec,
    pub fluxes: HashMap<String, f64>,
}

/// One detector's data from one exposure.
#[derive(Debug)]
pub struct CcdImage {
    visit: VisitId,
    ccd: CcdId,
    name: String,
    filter: String,
    mjd: Mjd,
    airmass: f64,
    zero_point: Mag,
    frame: Frame,
    detector: Option<DetectorGeometry>,
    pix_to_tp: Transform,
    catalog: Vec<MeasuredStar>,
    fit_selection: Vec<usize>,
}

pub type CcdImageList = Vec<CcdImage>;

impl CcdImage {
    /// Build a CcdImage from a source catalog and its exposure metadata.
    ///
    /// Every source position is pushed through `wcs` (pixels → sky,
    /// degrees) and the tangent projection at the common tangent point;
    /// the resulting tangent-plane position is stored on the measurement
    /// for catalog association.
    pub fn new(
        catalog: &[SourceRecord],
        wcs: &Transform,
        data: ExposureData,
        frame: Frame,
        detector: Option<DetectorGeometry>,
        sky_to_tp: &TanRaDec2Pix,
    ) -> Self {
        let pix_to_tp = Transform::SkyToTangentPlane(*sky_to_tp).compose(wcs);
        let mut measured = Vec::with_capacity(catalog.len());
        for record in catalog {
            let pos = FatPoint::new(record.x, record.y, record.vx, record.vy, record.vxy);
            let tp_pos = pix_to_tp.apply(&pos.point());
            let mag = rough_mag(record.flux, data.zero_point);
            measured.push(MeasuredStar::new(pos, tp_pos, record.flux, record.flux_err, mag));
        }
        let fit_selection = (0..measured.len()).collect();
        CcdImage {
            name: format!("v{}_c{}", data.visit, data.ccd),
            visit: data.visit,
            ccd: data.ccd,
            filter: data.filter,
            mjd: data.mjd,
            airmass: data.airmass,
            zero_point: data.zero_point,
            frame,
            detector,
            pix_to_tp,
            catalog: measured,
            fit_selection,
        }
    }

    pub fn visit(&self) -> VisitId {
        self.visit
    }

    pub fn ccd(&self) -> CcdId {
        self.ccd
    }

    /// The unique (visit, ccd) key of this image.
    pub fn key(&self) -> (VisitId, CcdId) {
        (self.visit, self.ccd)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn mjd(&self) -> Mjd {
        self.mjd
    }

    pub fn airmass(&self) -> f64 {
        self.airmass
    }

    pub fn zero_point(&self) -> Mag {
        self.zero_point
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn detector(&self) -> Option<&DetectorGeometry> {
        self.detector.as_ref()
    }

    /// Initial pixels → common tangent plane transform, from the input WCS.
    pub fn pix_to_tangent_plane(&self) -> &Transform {
        &self.pix_to_tp
    }

    /// The full detected catalog.
    pub fn whole_catalog(&self) -> &[MeasuredStar] {
        &self.catalog
    }

    pub fn star(&self, index: usize) -> &MeasuredStar {
        &self.catalog[index]
    }

    pub fn star_mut(&mut self, index: usize) -> &mut MeasuredStar {
        &mut self.catalog[index]
    }

    pub(crate) fn catalog_mut(&mut self) -> &mut [MeasuredStar] {
        &mut self.catalog
    }

    /// Indices (into the whole catalog) of the measurements selected for
    /// fitting.
    pub fn catalog_for_fit(&self) -> &[usize] {
        &self.fit_selection
    }

    /// Restrict the fit to the given measurements. Out-of-range indices
    /// are discarded.
    pub fn set_fit_selection(&mut self, mut selection: Vec<usize>) {
        selection.retain(|&i| i < self.catalog.len());
        self.fit_selection = selection;
    }
}

/// Rough magnitude of a measurement, for diagnostics and match ordering.
pub fn rough_mag(flux: f64, zero_point: Mag) -> Mag {
    if flux > 0.0 {
        zero_point - 2.5 * flux.log10()
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod test_ccd_image {
    use super::*;
    use crate::constants::RADSEC;
    use approx::assert_relative_eq;

    fn one_source(x: f64, y: f64) -> SourceRecord {
        SourceRecord {
            x,
            y,
            vx: 1e-4,
            vy: 1e-4,
            vxy: 0.0,
            flux: 1000.0,
            flux_err: 10.0,
            object_hint: None,
        }
    }

    #[test]
    fn test_ingestion_projects_through_wcs_then_tangent_plane() {
        // a WCS that drops pixels onto the sky at 1 arcsec/pixel around (30, 10)
        let scale = 1.0 / 3600.0;
        let wcs = Transform::Linear(crate::geometry::LinearTransform::new(
            scale, 0.0, 0.0, scale, 30.0, 10.0,
        ));
        let sky_to_tp = TanRaDec2Pix::new(Point::new(30.0, 10.0));
        let data = ExposureData {
            visit: 12,
            ccd: 3,
            filter: "r".into(),
            mjd: 57_754.2,
            airmass: 1.1,
            zero_point: 27.0,
        };
        let catalog = vec![one_source(0.0, 0.0), one_source(100.0, -50.0)];
        let image = CcdImage::new(
            &catalog,
            &wcs,
            data,
            Frame::new(0.0, -100.0, 200.0, 100.0),
            None,
            &sky_to_tp,
        );

        assert_eq!(image.key(), (12, 3));
        assert_eq!(image.name(), "v12_c3");
        assert_eq!(image.catalog_for_fit().len(), 2);

        // the reference path: project each pixel by hand
        for (record, ms) in catalog.iter().zip(image.whole_catalog()) {
            let sky = wcs.apply(&Point::new(record.x, record.y));
            let expected = sky_to_tp.apply(&sky);
            assert_relative_eq!(ms.tp_pos.x, expected.x, epsilon = 1e-15);
            assert_relative_eq!(ms.tp_pos.y, expected.y, epsilon = 1e-15);
        }
        // 100 pixels at 1"/pixel is about 100 RADSEC on the tangent plane
        let second = &image.whole_catalog()[1];
        assert_relative_eq!(second.tp_pos.x, 100.0 * RADSEC, max_relative = 1e-4);
    }
}
