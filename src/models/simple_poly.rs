//! One free polynomial mapping per exposure.

use std::collections::HashMap;

use ahash::RandomState;
use nalgebra::DVector;
use tracing::{error, info};

use super::{delta_slice, sip_wcs_from_pix2tp, AstrometryModel};
use crate::ccd_image::CcdImage;
use crate::constants::{CcdId, VisitId};
use crate::geometry::{normalize_coordinates, PolyTransform, TanPix2RaDec, TanRaDec2Pix};
use crate::jointfit_errors::JointfitError;
use crate::mappings::{AstrometryMapping, SimplePolyMapping};

/// The free-per-image astrometric model: every exposure gets its own
/// [`SimplePolyMapping`], initialized by a polynomial approximation of the
/// exposure's initial pixels → tangent-plane transform.
pub struct SimplePolyModel {
    /// One mapping per exposure, in exposure insertion order.
    mappings: Vec<SimplePolyMapping>,
    keys: HashMap<(VisitId, CcdId), usize, RandomState>,
    projector: TanRaDec2Pix,
}

impl SimplePolyModel {
    pub fn new(
        ccd_images: &[CcdImage],
        projector: &TanRaDec2Pix,
        degree: usize,
    ) -> Result<Self, JointfitError> {
        let mut mappings = Vec::with_capacity(ccd_images.len());
        let mut keys = HashMap::with_capacity_and_hasher(ccd_images.len(), RandomState::new());
        for image in ccd_images {
            let frame = image.frame();
            let normalizer = normalize_coordinates(frame);
            let initial = PolyTransform::approximate(image.pix_to_tangent_plane(), frame, degree)?;
            // the fitted polynomial acts on normalized coordinates
            let fitted = initial.compose_linear(&normalizer.invert()?);
            keys.insert(image.key(), mappings.len());
            mappings.push(SimplePolyMapping::new(normalizer, fitted));
        }
        info!(mappings = mappings.len(), degree, "built free-per-image model");
        Ok(SimplePolyModel {
            mappings,
            keys,
            projector: *projector,
        })
    }

    fn mapping_index(&self, ccd_image: &CcdImage) -> Option<usize> {
        let found = self.keys.get(&ccd_image.key()).copied();
        if found.is_none() {
            error!(name = ccd_image.name(), "exposure unknown to this model");
        }
        found
    }

    /// The fitted pixels → tangent-plane transform of one exposure.
    pub fn transform(&self, ccd_image: &CcdImage) -> Option<&PolyTransform> {
        self.mapping_index(ccd_image)
            .map(|idx| self.mappings[idx].transform())
    }
}

impl AstrometryModel for SimplePolyModel {
    fn assign_indices(&mut self, what_to_fit: &str, first_index: usize) -> usize {
        if !what_to_fit.contains("Distortions") {
            error!(what_to_fit, "assign_indices called without Distortions");
            return first_index;
        }
        let mut index = first_index;
        for mapping in &mut self.mappings {
            mapping.set_index(index);
            index += mapping.n_par();
        }
        index
    }

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<(), JointfitError> {
        for mapping in &mut self.mappings {
            let slice = delta_slice(delta, mapping)?;
            mapping.offset_params(slice)?;
        }
        Ok(())
    }

    fn freeze_error_transform(&mut self) {
        for mapping in &mut self.mappings {
            mapping.freeze_error_transform();
        }
    }

    fn mapping(&self, ccd_image: &CcdImage) -> Option<&dyn AstrometryMapping> {
        self.mapping_index(ccd_image)
            .map(|idx| &self.mappings[idx] as &dyn AstrometryMapping)
    }

    fn total_parameters(&self) -> usize {
        self.mappings.iter().map(|m| m.n_par()).sum()
    }

    fn produce_sip_wcs(&self, ccd_image: &CcdImage) -> Option<TanPix2RaDec> {
        let idx = self.mapping_index(ccd_image)?;
        sip_wcs_from_pix2tp(self.mappings[idx].transform(), ccd_image.frame(), &self.projector)
    }
}
