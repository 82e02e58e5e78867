//! # The association graph
//!
//! [`Associations`] owns the exposures, the fitted objects and the
//! reference objects, and maintains the links between them:
//!
//! * every valid measurement points to exactly one fitted star,
//! * a fitted star's `measurement_count` equals the number of valid
//!   measurements pointing at it,
//! * at most one reference star is tied to any fitted star.
//!
//! ## Pipeline
//!
//! 1. [`set_common_tangent_point`](Associations::set_common_tangent_point)
//!    anchors the shared tangent plane.
//! 2. [`add_image`](Associations::add_image) ingests one exposure catalog,
//!    projecting every source through the input WCS and the tangent
//!    projection.
//! 3. [`associate_catalogs`](Associations::associate_catalogs) merges
//!    repeated detections into fitted stars.
//! 4. [`collect_ref_stars`](Associations::collect_ref_stars) +
//!    [`associate_ref_stars`](Associations::associate_ref_stars) tie fitted
//!    stars to an external reference catalog.
//! 5. [`select_fitted_stars`](Associations::select_fitted_stars) applies
//!    the minimum-measurement cut before fitting.
//! 6. After the fit, [`deproject_fitted_stars`](Associations::deproject_fitted_stars)
//!    brings the solution back to (ra, dec).
//!
//! Iteration order is insertion order for exposures and creation order for
//! fitted stars, which makes association and parameter indexing
//! deterministic for a given input sequence.

use tracing::{debug, info, warn};

use crate::ccd_image::{CcdImage, CcdImageList, DetectorGeometry, ExposureData, RefSourceRecord, SourceRecord};
use crate::constants::{ArcSec, Degree, DEGRAD, RADSEC};
use crate::geometry::{FatPoint, Frame, Point, TanRaDec2Pix, Transform};
use crate::jointfit_errors::JointfitError;
use crate::stars::star_match::{ambiguity, StarMatch, StarMatchList};
use crate::stars::{FittedStar, NeighborGrid, RefStar};

#[derive(Default)]
pub struct Associations {
    pub(crate) ccd_images: CcdImageList,
    pub(crate) fitted_stars: Vec<FittedStar>,
    pub(crate) ref_stars: Vec<RefStar>,
    common_tangent_point: Option<Point>,
    sky_to_tp: Option<TanRaDec2Pix>,
    in_tangent_plane_coordinates: bool,
}

impl Associations {
    pub fn new() -> Self {
        Associations {
            in_tangent_plane_coordinates: true,
            ..Default::default()
        }
    }

    /// Record the shared projection center (decimal degrees). Must be set
    /// before any image is added.
    pub fn set_common_tangent_point(&mut self, ra: Degree, dec: Degree) {
        let point = Point::new(ra, dec);
        self.common_tangent_point = Some(point);
        self.sky_to_tp = Some(TanRaDec2Pix::new(point));
    }

    pub fn common_tangent_point(&self) -> Option<Point> {
        self.common_tangent_point
    }

    /// The sky → common tangent plane projection.
    pub fn sky_to_tangent_plane(&self) -> Option<&TanRaDec2Pix> {
        self.sky_to_tp.as_ref()
    }

    /// Whether fitted-star positions are still tangent-plane coordinates
    /// (radians) rather than deprojected (ra, dec).
    pub fn in_tangent_plane_coordinates(&self) -> bool {
        self.in_tangent_plane_coordinates
    }

    pub fn ccd_images(&self) -> &[CcdImage] {
        &self.ccd_images
    }

    pub fn n_ccd_images(&self) -> usize {
        self.ccd_images.len()
    }

    pub fn fitted_stars(&self) -> &[FittedStar] {
        &self.fitted_stars
    }

    pub fn ref_stars(&self) -> &[RefStar] {
        &self.ref_stars
    }

    /// Ingest one exposure catalog. Positions go through `wcs` (pixels →
    /// degrees on the sky) and then the common tangent projection.
    pub fn add_image(
        &mut self,
        catalog: &[SourceRecord],
        wcs: &Transform,
        data: ExposureData,
        frame: Frame,
        detector: Option<DetectorGeometry>,
    ) -> Result<(), JointfitError> {
        let sky_to_tp = self.sky_to_tp.as_ref().ok_or(JointfitError::MissingTangentPoint)?;
        let image = CcdImage::new(catalog, wcs, data, frame, detector, sky_to_tp);
        debug!(
            name = image.name(),
            sources = image.whole_catalog().len(),
            "added exposure"
        );
        self.ccd_images.push(image);
        Ok(())
    }

    /// Merge repeated detections into fitted stars.
    ///
    /// Exposures are walked in insertion order. Each selected measurement
    /// looks up the nearest fitted star within `match_cut` arcseconds on
    /// the tangent plane; if one exists and no measurement of the current
    /// exposure took it yet, they are linked. Otherwise, when
    /// `enlarge_fitted_list` is set, a new fitted star is created at the
    /// measured position. When `use_existing_fitted_list` is false the
    /// fitted list is cleared first.
    ///
    /// Ties resolve to the smallest tangent-plane distance, then to fitted
    /// star creation order, so re-running on the same inputs reproduces the
    /// same list.
    pub fn associate_catalogs(
        &mut self,
        match_cut: ArcSec,
        use_existing_fitted_list: bool,
        enlarge_fitted_list: bool,
    ) {
        let cut = match_cut * RADSEC;
        if !use_existing_fitted_list {
            self.fitted_stars.clear();
        }
        for image in &mut self.ccd_images {
            for ms in image.catalog_mut() {
                ms.fitted_star = None;
            }
        }
        for fs in &mut self.fitted_stars {
            fs.measurement_count = 0;
        }

        let images = &mut self.ccd_images;
        let fitted = &mut self.fitted_stars;
        for image in images.iter_mut() {
            let positions: Vec<Point> = fitted.iter().map(|f| f.pos.point()).collect();
            let grid = NeighborGrid::new(&positions, cut.max(f64::MIN_POSITIVE));
            let mut taken = vec![false; fitted.len()];
            let selection = image.catalog_for_fit().to_vec();
            let mut n_linked = 0usize;
            let mut n_created = 0usize;
            for ms_idx in selection {
                let ms = image.star(ms_idx);
                if !ms.valid {
                    continue;
                }
                match grid.nearest_within(&ms.tp_pos, cut) {
                    Some((fs_idx, _)) if !taken[fs_idx] => {
                        taken[fs_idx] = true;
                        fitted[fs_idx].measurement_count += 1;
                        image.star_mut(ms_idx).fitted_star = Some(fs_idx);
                        n_linked += 1;
                    }
                    _ if enlarge_fitted_list => {
                        let new_idx = fitted.len();
                        fitted.push(FittedStar::from_measurement(image.star(ms_idx)));
                        image.star_mut(ms_idx).fitted_star = Some(new_idx);
                        n_created += 1;
                    }
                    _ => {}
                }
            }
            debug!(name = image.name(), n_linked, n_created, "associated exposure");
        }
        self.refresh_fitted_fluxes();
        info!(
            fitted_stars = self.fitted_stars.len(),
            exposures = self.ccd_images.len(),
            "catalog association done"
        );
    }

    /// Reset every fitted star's flux and rough magnitude to the mean over
    /// its valid measurements. Seeds the photometric fit.
    pub fn refresh_fitted_fluxes(&mut self) {
        let mut flux_sum = vec![0.0; self.fitted_stars.len()];
        let mut mag_sum = vec![0.0; self.fitted_stars.len()];
        let mut n_flux = vec![0usize; self.fitted_stars.len()];
        let mut n_mag = vec![0usize; self.fitted_stars.len()];
        for image in &self.ccd_images {
            for ms in image.whole_catalog() {
                let Some(fs_idx) = ms.fitted_star else { continue };
                if !ms.valid {
                    continue;
                }
                flux_sum[fs_idx] += ms.flux;
                n_flux[fs_idx] += 1;
                if ms.mag.is_finite() {
                    mag_sum[fs_idx] += ms.mag;
                    n_mag[fs_idx] += 1;
                }
            }
        }
        for (idx, fs) in self.fitted_stars.iter_mut().enumerate() {
            if n_flux[idx] > 0 {
                fs.flux = flux_sum[idx] / n_flux[idx] as f64;
            }
            if n_mag[idx] > 0 {
                fs.mag = mag_sum[idx] / n_mag[idx] as f64;
            }
        }
    }

    /// Project reference-catalog entries onto the tangent plane and store
    /// them. `flux_field` selects the catalog band; an entry without that
    /// field is an error.
    pub fn collect_ref_stars(
        &mut self,
        records: &[RefSourceRecord],
        flux_field: &str,
    ) -> Result<usize, JointfitError> {
        let proj = self.sky_to_tp.as_ref().ok_or(JointfitError::MissingTangentPoint)?;
        self.ref_stars.clear();
        for record in records {
            let Some(&flux) = record.fluxes.get(flux_field) else {
                return Err(JointfitError::UnknownFluxField(flux_field.to_string()));
            };
            let tp = proj.apply(&Point::new(record.ra, record.dec));
            let sx = record.ra_err * RADSEC;
            let sy = record.dec_err * RADSEC;
            self.ref_stars.push(RefStar {
                ra: record.ra,
                dec: record.dec,
                pos: FatPoint::new(tp.x, tp.y, sx * sx, sy * sy, 0.0),
                flux,
            });
        }
        info!(ref_stars = self.ref_stars.len(), flux_field, "collected reference stars");
        Ok(self.ref_stars.len())
    }

    /// Tie each fitted star to its nearest reference star within
    /// `match_cut` arcseconds, one-to-one after nearest-wins ambiguity
    /// resolution. `transform` is applied to fitted-star positions before
    /// matching (identity when both already live on the tangent plane).
    /// Returns the number of fitted stars tied.
    pub fn associate_ref_stars(&mut self, match_cut: ArcSec, transform: &Transform) -> usize {
        let cut = match_cut * RADSEC;
        for fs in &mut self.fitted_stars {
            fs.ref_star = None;
        }
        if self.ref_stars.is_empty() || self.fitted_stars.is_empty() {
            return 0;
        }

        let ref_positions: Vec<Point> = self.ref_stars.iter().map(|r| r.pos.point()).collect();
        let grid = NeighborGrid::new(&ref_positions, cut.max(f64::MIN_POSITIVE));
        let mut matches = StarMatchList::new(1);
        for (fs_idx, fs) in self.fitted_stars.iter().enumerate() {
            let p = transform.apply(&fs.pos.point());
            if let Some((ref_idx, _)) = grid.nearest_within(&p, cut) {
                matches.push(StarMatch::new(
                    FatPoint::from_point(p),
                    self.ref_stars[ref_idx].pos,
                    fs_idx,
                    ref_idx,
                ));
            }
        }
        matches.set_distances(&Transform::Identity);
        matches.remove_ambiguities(ambiguity::BOTH);
        for m in matches.matches() {
            self.fitted_stars[m.id1].ref_star = Some(m.id2);
        }
        info!(tied = matches.len(), "reference association done");
        matches.len()
    }

    /// Drop fitted stars with fewer than `min_measurements` measurements,
    /// unlinking (and invalidating for the fit) the measurements that
    /// pointed at them.
    pub fn select_fitted_stars(&mut self, min_measurements: usize) {
        let keep: Vec<bool> = self
            .fitted_stars
            .iter()
            .map(|f| f.measurement_count >= min_measurements)
            .collect();
        let mut remap = vec![usize::MAX; self.fitted_stars.len()];
        let mut kept = Vec::with_capacity(self.fitted_stars.len());
        for (idx, fs) in self.fitted_stars.drain(..).enumerate() {
            if keep[idx] {
                remap[idx] = kept.len();
                kept.push(fs);
            }
        }
        let dropped = keep.len() - kept.len();
        self.fitted_stars = kept;

        for image in &mut self.ccd_images {
            for ms in image.catalog_mut() {
                let Some(fs_idx) = ms.fitted_star else { continue };
                if keep[fs_idx] {
                    ms.fitted_star = Some(remap[fs_idx]);
                } else {
                    ms.fitted_star = None;
                    ms.valid = false;
                }
            }
        }
        info!(
            kept = self.fitted_stars.len(),
            dropped, min_measurements, "fitted-star selection done"
        );
    }

    /// Convert fitted-star positions from tangent-plane radians back to
    /// (ra, dec) degrees.
    pub fn deproject_fitted_stars(&mut self) {
        if !self.in_tangent_plane_coordinates {
            warn!("fitted stars are already deprojected");
            return;
        }
        let Some(proj) = self.sky_to_tp.as_ref() else {
            warn!("no tangent point: nothing to deproject");
            return;
        };
        for fs in &mut self.fitted_stars {
            let sky = proj.deproject(&fs.pos.point());
            fs.pos.x = sky.x;
            fs.pos.y = sky.y;
            fs.pos.vx *= DEGRAD * DEGRAD;
            fs.pos.vy *= DEGRAD * DEGRAD;
            fs.pos.vxy *= DEGRAD * DEGRAD;
        }
        self.in_tangent_plane_coordinates = false;
    }

    /// Bounding box of the fitted stars on the sky, in degrees.
    pub fn ra_dec_frame(&self) -> Frame {
        match (&self.sky_to_tp, self.in_tangent_plane_coordinates) {
            (Some(proj), true) => {
                let sky: Vec<Point> = self
                    .fitted_stars
                    .iter()
                    .map(|f| proj.deproject(&f.pos.point()))
                    .collect();
                Frame::from_points(sky.iter())
            }
            _ => {
                let sky: Vec<Point> = self.fitted_stars.iter().map(|f| f.pos.point()).collect();
                Frame::from_points(sky.iter())
            }
        }
    }
}

#[cfg(test)]
mod test_associations {
    use super::*;
    use crate::geometry::LinearTransform;
    use std::collections::HashMap;

    fn sources_on_grid(n: usize, spacing: f64) -> Vec<SourceRecord> {
        let mut records = Vec::new();
        for ix in 0..n {
            for iy in 0..n {
                records.push(SourceRecord {
                    x: ix as f64 * spacing,
                    y: iy as f64 * spacing,
                    vx: 1e-4,
                    vy: 1e-4,
                    vxy: 0.0,
                    flux: 1000.0 + (ix * n + iy) as f64,
                    flux_err: 10.0,
                    object_hint: None,
                });
            }
        }
        records
    }

    fn exposure(visit: i64, ccd: i64) -> ExposureData {
        ExposureData {
            visit,
            ccd,
            filter: "r".into(),
            mjd: 57_000.0 + visit as f64,
            airmass: 1.2,
            zero_point: 27.0,
        }
    }

    /// Two exposures of the same pixel grid through the same WCS.
    fn two_image_associations() -> Associations {
        let mut assoc = Associations::new();
        assoc.set_common_tangent_point(30.0, 10.0);
        let scale = 1.0 / 3600.0;
        let wcs = Transform::Linear(LinearTransform::new(scale, 0.0, 0.0, scale, 30.0, 10.0));
        let frame = Frame::new(0.0, 0.0, 1000.0, 1000.0);
        let catalog = sources_on_grid(5, 100.0);
        assoc.add_image(&catalog, &wcs, exposure(1, 1), frame, None).unwrap();
        assoc.add_image(&catalog, &wcs, exposure(2, 1), frame, None).unwrap();
        assoc
    }

    #[test]
    fn test_add_image_requires_tangent_point() {
        let mut assoc = Associations::new();
        let err = assoc.add_image(
            &[],
            &Transform::Identity,
            exposure(1, 1),
            Frame::default(),
            None,
        );
        assert!(matches!(err, Err(JointfitError::MissingTangentPoint)));
    }

    #[test]
    fn test_identical_exposures_collapse_pairwise() {
        let mut assoc = two_image_associations();
        assoc.associate_catalogs(1.0, false, true);
        assert_eq!(assoc.fitted_stars().len(), 25);
        assert!(assoc.fitted_stars().iter().all(|f| f.measurement_count == 2));
        // every valid measurement points to exactly one fitted star
        for image in assoc.ccd_images() {
            for ms in image.whole_catalog() {
                assert!(ms.fitted_star.is_some());
            }
        }
    }

    #[test]
    fn test_association_is_idempotent() {
        let mut assoc = two_image_associations();
        assoc.associate_catalogs(1.0, false, true);
        let first: Vec<(f64, f64, usize)> = assoc
            .fitted_stars()
            .iter()
            .map(|f| (f.pos.x, f.pos.y, f.measurement_count))
            .collect();
        assoc.associate_catalogs(1.0, false, true);
        let second: Vec<(f64, f64, usize)> = assoc
            .fitted_stars()
            .iter()
            .map(|f| (f.pos.x, f.pos.y, f.measurement_count))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_selection_unlinks_dropped_stars() {
        let mut assoc = two_image_associations();
        // make one measurement of the second image invalid before counting
        assoc.associate_catalogs(1.0, false, true);
        {
            let image = &mut assoc.ccd_images[1];
            let fs_idx = image.star(0).fitted_star.unwrap();
            image.star_mut(0).valid = false;
            assoc.fitted_stars[fs_idx].measurement_count -= 1;
        }
        assoc.select_fitted_stars(2);
        assert_eq!(assoc.fitted_stars().len(), 24);
        // the orphaned measurement of the first image was unlinked
        let orphaned = assoc.ccd_images[0]
            .whole_catalog()
            .iter()
            .filter(|ms| ms.fitted_star.is_none())
            .count();
        assert_eq!(orphaned, 1);
        for fs in assoc.fitted_stars() {
            assert_eq!(fs.measurement_count, 2);
        }
    }

    #[test]
    fn test_ref_star_flux_field_and_matching() {
        let mut assoc = two_image_associations();
        assoc.associate_catalogs(1.0, false, true);

        let mut records = Vec::new();
        for fs in assoc.fitted_stars().iter().take(10) {
            let proj = assoc.sky_to_tangent_plane().unwrap();
            let sky = proj.deproject(&fs.pos.point());
            let mut fluxes = HashMap::new();
            fluxes.insert("r".to_string(), 1200.0);
            records.push(RefSourceRecord {
                ra: sky.x,
                dec: sky.y,
                ra_err: 0.05,
                dec_err: 0.05,
                fluxes,
            });
        }
        assert!(matches!(
            assoc.collect_ref_stars(&records, "z"),
            Err(JointfitError::UnknownFluxField(_))
        ));
        assert_eq!(assoc.collect_ref_stars(&records, "r").unwrap(), 10);
        let tied = assoc.associate_ref_stars(1.0, &Transform::Identity);
        assert_eq!(tied, 10);
        // one-to-one: every ref star is used at most once
        let mut used: Vec<usize> = assoc
            .fitted_stars()
            .iter()
            .filter_map(|f| f.ref_star)
            .collect();
        used.sort_unstable();
        used.dedup();
        assert_eq!(used.len(), 10);
    }

    #[test]
    fn test_deproject_roundtrip() {
        let mut assoc = two_image_associations();
        assoc.associate_catalogs(1.0, false, true);
        let tp_positions: Vec<Point> = assoc.fitted_stars().iter().map(|f| f.pos.point()).collect();
        assoc.deproject_fitted_stars();
        assert!(!assoc.in_tangent_plane_coordinates());
        let proj = assoc.sky_to_tangent_plane().unwrap();
        for (fs, tp) in assoc.fitted_stars().iter().zip(&tp_positions) {
            let back = proj.apply(&fs.pos.point());
            assert!((back.x - tp.x).abs() < 1e-12);
            assert!((back.y - tp.y).abs() < 1e-12);
        }
    }
}
