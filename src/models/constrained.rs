//! The constrained chip×visit astrometric model.
//!
//! Instead of one free transform per exposure, the distortion is factored
//! into one transform per distinct chip (shared across visits) composed
//! with one transform per distinct visit (shared across chips). Two
//! choices remove the otherwise-degenerate degrees of freedom:
//!
//! * the chip whose detector center is closest to the focal-plane origin
//!   is held fixed (`set_to_be_fit(false)`),
//! * the first visit carries an explicit `is_reference` flag and keeps the
//!   identity transform, with no parameters of its own.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use ahash::RandomState;
use nalgebra::DVector;
use tracing::{error, info};

use super::{sip_wcs_from_pix2tp, AstrometryModel};
use crate::ccd_image::CcdImage;
use crate::constants::{CcdId, VisitId};
use crate::geometry::{normalize_coordinates, LinearTransform, PolyTransform, TanPix2RaDec, TanRaDec2Pix};
use crate::jointfit_errors::JointfitError;
use crate::mappings::{AstrometryMapping, SimplePolyMapping, TwoTransformMapping};

struct VisitEntry {
    mapping: Rc<RefCell<SimplePolyMapping>>,
    is_reference: bool,
}

pub struct ConstrainedPolyModel {
    chip_map: BTreeMap<CcdId, Rc<RefCell<SimplePolyMapping>>>,
    visit_map: BTreeMap<VisitId, VisitEntry>,
    mappings: HashMap<(VisitId, CcdId), TwoTransformMapping, RandomState>,
    projector: TanRaDec2Pix,
    reference_chip: CcdId,
    fitting_chips: bool,
    fitting_visits: bool,
}

impl ConstrainedPolyModel {
    pub fn new(
        ccd_images: &[CcdImage],
        projector: &TanRaDec2Pix,
        chip_degree: usize,
        visit_degree: usize,
    ) -> Result<Self, JointfitError> {
        let mut chip_map: BTreeMap<CcdId, Rc<RefCell<SimplePolyMapping>>> = BTreeMap::new();
        let mut visit_map: BTreeMap<VisitId, VisitEntry> = BTreeMap::new();
        let mut first_visit: Option<VisitId> = None;
        let mut min_radius2 = f64::INFINITY;
        let mut reference_chip: Option<CcdId> = None;

        // first loop: initialize every distinct chip and visit transform
        for image in ccd_images {
            let visit = image.visit();
            let chip = image.ccd();
            if !visit_map.contains_key(&visit) {
                let is_reference = first_visit.is_none();
                if is_reference {
                    first_visit = Some(visit);
                }
                let mapping = if is_reference {
                    let mut identity = SimplePolyMapping::identity(1);
                    identity.set_to_be_fit(false);
                    identity
                } else {
                    SimplePolyMapping::new(
                        LinearTransform::identity(),
                        PolyTransform::identity(visit_degree),
                    )
                };
                visit_map.insert(
                    visit,
                    VisitEntry {
                        mapping: Rc::new(RefCell::new(mapping)),
                        is_reference,
                    },
                );
            }
            if !chip_map.contains_key(&chip) {
                let frame = image.frame();
                let (initial, radius2) = match image.detector() {
                    Some(detector) => {
                        let center = &detector.focal_center;
                        (
                            PolyTransform::approximate(&detector.pixels_to_focal, frame, chip_degree)?,
                            center.x * center.x + center.y * center.y,
                        )
                    }
                    // no detector geometry: start from the input WCS and
                    // rank chips by encounter order
                    None => (
                        PolyTransform::approximate(image.pix_to_tangent_plane(), frame, chip_degree)?,
                        f64::INFINITY,
                    ),
                };
                if radius2 < min_radius2 {
                    min_radius2 = radius2;
                    reference_chip = Some(chip);
                } else if reference_chip.is_none() {
                    reference_chip = Some(chip);
                }
                let normalizer = normalize_coordinates(frame);
                let fitted = initial.compose_linear(&normalizer.invert()?);
                chip_map.insert(chip, Rc::new(RefCell::new(SimplePolyMapping::new(normalizer, fitted))));
            }
        }

        let reference_chip = reference_chip.ok_or_else(|| {
            JointfitError::InvalidArgument("cannot build a constrained model over no exposure".into())
        })?;
        // hold the central chip fixed to remove the translation/rotation
        // degeneracy of the chip×visit factorization
        chip_map[&reference_chip].borrow_mut().set_to_be_fit(false);

        // second loop: one composite mapping per exposure
        let mut mappings = HashMap::with_capacity_and_hasher(ccd_images.len(), RandomState::new());
        for image in ccd_images {
            let chip = Rc::clone(&chip_map[&image.ccd()]);
            let visit = Rc::clone(&visit_map[&image.visit()].mapping);
            mappings.insert(image.key(), TwoTransformMapping::new(chip, visit));
        }
        info!(
            chips = chip_map.len(),
            visits = visit_map.len(),
            reference_chip,
            "built constrained chip×visit model"
        );
        Ok(ConstrainedPolyModel {
            chip_map,
            visit_map,
            mappings,
            projector: *projector,
            reference_chip,
            fitting_chips: false,
            fitting_visits: false,
        })
    }

    /// The chip held fixed to anchor the factorization.
    pub fn reference_chip(&self) -> CcdId {
        self.reference_chip
    }

    /// Toggle whether a chip mapping is fitted. Releasing the reference
    /// chip reintroduces the model degeneracy; only do so deliberately.
    pub fn set_chip_fitted(&mut self, chip: CcdId, to_be_fit: bool) -> Result<(), JointfitError> {
        let mapping = self.chip_map.get(&chip).ok_or(JointfitError::UnknownChip(chip))?;
        mapping.borrow_mut().set_to_be_fit(to_be_fit);
        Ok(())
    }

    /// The fitted pixels → focal transform of a chip.
    pub fn chip_transform(&self, chip: CcdId) -> Result<PolyTransform, JointfitError> {
        self.chip_map
            .get(&chip)
            .map(|m| m.borrow().transform().clone())
            .ok_or(JointfitError::UnknownChip(chip))
    }

    /// The fitted per-visit transform.
    pub fn visit_transform(&self, visit: VisitId) -> Result<PolyTransform, JointfitError> {
        self.visit_map
            .get(&visit)
            .map(|e| e.mapping.borrow().transform().clone())
            .ok_or(JointfitError::UnknownVisit(visit))
    }

    /// Visits involved in the solution, in key order.
    pub fn visits(&self) -> Vec<VisitId> {
        self.visit_map.keys().copied().collect()
    }
}

impl AstrometryModel for ConstrainedPolyModel {
    /// Decodes `"DistortionsChip"` and `"DistortionsVisit"`; a bare
    /// `"Distortions"` means both.
    fn assign_indices(&mut self, what_to_fit: &str, first_index: usize) -> usize {
        if !what_to_fit.contains("Distortions") {
            error!(what_to_fit, "assign_indices called without Distortions");
            return first_index;
        }
        self.fitting_chips = what_to_fit.contains("DistortionsChip");
        self.fitting_visits = what_to_fit.contains("DistortionsVisit");
        if !self.fitting_chips && !self.fitting_visits {
            self.fitting_chips = true;
            self.fitting_visits = true;
        }
        let mut index = first_index;
        if self.fitting_chips {
            for mapping in self.chip_map.values() {
                let mut mapping = mapping.borrow_mut();
                mapping.set_index(index);
                index += mapping.n_par();
            }
        }
        if self.fitting_visits {
            for entry in self.visit_map.values() {
                let mut mapping = entry.mapping.borrow_mut();
                mapping.set_index(index);
                index += mapping.n_par();
            }
        }
        // tell the composite mappings which derivative blocks to fill
        for mapping in self.mappings.values_mut() {
            mapping.set_what_to_fit(self.fitting_chips, self.fitting_visits);
        }
        index
    }

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<(), JointfitError> {
        if self.fitting_chips {
            for mapping in self.chip_map.values() {
                let mut mapping = mapping.borrow_mut();
                let (start, n) = (mapping.index(), mapping.n_par());
                if start + n > delta.len() {
                    return Err(JointfitError::DeltaSizeMismatch {
                        expected: start + n,
                        got: delta.len(),
                    });
                }
                mapping.offset_params(&delta.as_slice()[start..start + n])?;
            }
        }
        if self.fitting_visits {
            for entry in self.visit_map.values() {
                let mut mapping = entry.mapping.borrow_mut();
                let (start, n) = (mapping.index(), mapping.n_par());
                if start + n > delta.len() {
                    return Err(JointfitError::DeltaSizeMismatch {
                        expected: start + n,
                        got: delta.len(),
                    });
                }
                mapping.offset_params(&delta.as_slice()[start..start + n])?;
            }
        }
        Ok(())
    }

    fn freeze_error_transform(&mut self) {
        for mapping in self.chip_map.values() {
            mapping.borrow_mut().freeze_error_transform();
        }
        for entry in self.visit_map.values() {
            entry.mapping.borrow_mut().freeze_error_transform();
        }
    }

    fn mapping(&self, ccd_image: &CcdImage) -> Option<&dyn AstrometryMapping> {
        let found = self.mappings.get(&ccd_image.key());
        if found.is_none() {
            error!(name = ccd_image.name(), "exposure unknown to this model");
        }
        found.map(|m| m as &dyn AstrometryMapping)
    }

    fn total_parameters(&self) -> usize {
        let chips: usize = self.chip_map.values().map(|m| m.borrow().n_par()).sum();
        let visits: usize = self.visit_map.values().map(|e| e.mapping.borrow().n_par()).sum();
        chips + visits
    }

    fn produce_sip_wcs(&self, ccd_image: &CcdImage) -> Option<TanPix2RaDec> {
        if !self.mappings.contains_key(&ccd_image.key()) {
            error!(name = ccd_image.name(), "exposure unknown to this model");
            return None;
        }
        let chip = self.chip_map[&ccd_image.ccd()].borrow();
        let entry = &self.visit_map[&ccd_image.visit()];
        let pix2tp = if entry.is_reference {
            chip.transform().clone()
        } else {
            entry.mapping.borrow().transform().compose(chip.transform())
        };
        sip_wcs_from_pix2tp(&pix2tp, ccd_image.frame(), &self.projector)
    }
}

#[cfg(test)]
mod test_constrained_model {
    use super::*;
    use crate::ccd_image::{DetectorGeometry, ExposureData, SourceRecord};
    use crate::geometry::{Frame, Point, Transform};

    fn image(visit: VisitId, ccd: CcdId, focal_center: Point) -> CcdImage {
        let scale = 1e-6;
        let wcs = Transform::Linear(LinearTransform::new(scale, 0.0, 0.0, scale, 30.0, 10.0));
        let detector = DetectorGeometry {
            pixels_to_focal: Transform::Linear(LinearTransform::new(
                scale,
                0.0,
                0.0,
                scale,
                focal_center.x,
                focal_center.y,
            )),
            focal_center,
        };
        CcdImage::new(
            &[SourceRecord {
                x: 1.0,
                y: 1.0,
                vx: 1e-4,
                vy: 1e-4,
                vxy: 0.0,
                flux: 10.0,
                flux_err: 1.0,
                object_hint: None,
            }],
            &wcs,
            ExposureData {
                visit,
                ccd,
                filter: "r".into(),
                mjd: 57_000.0,
                airmass: 1.0,
                zero_point: 27.0,
            },
            Frame::new(0.0, 0.0, 1000.0, 1000.0),
            Some(detector),
            &TanRaDec2Pix::new(Point::new(30.0, 10.0)),
        )
    }

    fn four_images() -> Vec<CcdImage> {
        vec![
            image(100, 0, Point::new(0.01, 0.0)),
            image(100, 1, Point::new(0.5, 0.0)),
            image(200, 0, Point::new(0.01, 0.0)),
            image(200, 1, Point::new(0.5, 0.0)),
        ]
    }

    #[test]
    fn test_reference_chip_and_visit_carry_no_parameters() {
        let images = four_images();
        let projector = TanRaDec2Pix::new(Point::new(30.0, 10.0));
        let model = ConstrainedPolyModel::new(&images, &projector, 1, 1).unwrap();
        // chip 0 sits closest to the focal-plane origin
        assert_eq!(model.reference_chip(), 0);
        // free parameters: one chip (6) + one non-reference visit (6)
        assert_eq!(model.total_parameters(), 12);
    }

    #[test]
    fn test_assign_indices_covers_chips_then_visits() {
        let images = four_images();
        let projector = TanRaDec2Pix::new(Point::new(30.0, 10.0));
        let mut model = ConstrainedPolyModel::new(&images, &projector, 1, 1).unwrap();
        assert_eq!(model.assign_indices("Positions", 5), 5);
        let next = model.assign_indices("Distortions", 0);
        assert_eq!(next, 12);

        let mut indices = Vec::new();
        model.mapping(&images[3]).unwrap().mapping_indices(&mut indices);
        // chip 1 owns 0..6, visit 200 owns 6..12
        assert_eq!(indices, (0..12).collect::<Vec<_>>());

        let chips_only = model.assign_indices("DistortionsChip", 0);
        assert_eq!(chips_only, 6);
    }

    #[test]
    fn test_composite_mapping_matches_chip_then_visit() {
        let images = four_images();
        let projector = TanRaDec2Pix::new(Point::new(30.0, 10.0));
        let model = ConstrainedPolyModel::new(&images, &projector, 1, 1).unwrap();
        let mapping = model.mapping(&images[1]).unwrap();
        let input = crate::geometry::FatPoint::new(250.0, 600.0, 1e-6, 1e-6, 0.0);
        let out = mapping.transform_pos_and_errors(&input);
        let chip = model.chip_transform(1).unwrap();
        let visit = model.visit_transform(100).unwrap();
        let expected = visit.apply(&chip.apply(&input.point()));
        assert!((out.x - expected.x).abs() < 1e-15);
        assert!((out.y - expected.y).abs() < 1e-15);
    }

    #[test]
    fn test_zero_offset_leaves_the_model_unchanged() {
        let images = four_images();
        let projector = TanRaDec2Pix::new(Point::new(30.0, 10.0));
        let mut model = ConstrainedPolyModel::new(&images, &projector, 1, 1).unwrap();
        let next = model.assign_indices("Distortions", 0);
        let chips_before = vec![
            model.chip_transform(0).unwrap(),
            model.chip_transform(1).unwrap(),
        ];
        let visits_before: Vec<_> = model
            .visits()
            .iter()
            .map(|&v| model.visit_transform(v).unwrap())
            .collect();
        model.offset_params(&DVector::zeros(next)).unwrap();
        for (chip, reference) in [0_i64, 1].iter().zip(&chips_before) {
            assert_eq!(&model.chip_transform(*chip).unwrap(), reference);
        }
        for (visit, reference) in model.visits().iter().zip(&visits_before) {
            assert_eq!(&model.visit_transform(*visit).unwrap(), reference);
        }
    }

    #[test]
    fn test_unknown_keys_error() {
        let images = four_images();
        let projector = TanRaDec2Pix::new(Point::new(30.0, 10.0));
        let model = ConstrainedPolyModel::new(&images, &projector, 1, 1).unwrap();
        assert!(model.chip_transform(99).is_err());
        assert!(model.visit_transform(99).is_err());
        let stranger = image(300, 7, Point::new(1.0, 1.0));
        assert!(model.mapping(&stranger).is_none());
    }
}
