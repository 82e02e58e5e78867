//! Photometric models: the multiplicative factor tying a measured flux to
//! the fitted flux of its sky object.

use std::collections::HashMap;

use ahash::RandomState;
use nalgebra::DVector;
use tracing::{error, info, warn};

use crate::ccd_image::CcdImage;
use crate::constants::{CcdId, VisitId};
use crate::jointfit_errors::JointfitError;
use crate::stars::MeasuredStar;

pub trait PhotometryModel {
    /// Assign parameter indices starting at `first_index` according to the
    /// `what_to_fit` tokens and return the first unused index. Without
    /// `"Model"` in the tokens this is a logged configuration error and
    /// `first_index` comes back unchanged.
    fn assign_indices(&mut self, what_to_fit: &str, first_index: usize) -> usize;

    /// Add the relevant slices of the full solution vector to the model
    /// parameters.
    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<(), JointfitError>;

    /// The factor multiplying the fitted flux to predict this measurement.
    fn photom_factor(&self, ccd_image: &CcdImage, star: &MeasuredStar) -> f64;

    /// Global indices and matching derivatives of the factor with respect
    /// to the model parameters this measurement constrains.
    fn indices_and_derivatives(
        &self,
        star: &MeasuredStar,
        ccd_image: &CcdImage,
        indices: &mut Vec<usize>,
        derivatives: &mut Vec<f64>,
    );

    fn total_parameters(&self) -> usize;

    /// The model must predict a positive flux over the exposure frame.
    fn check_positive_on_frame(&self, ccd_image: &CcdImage) -> bool;

    /// Sanity check before fitting: positivity on every exposure, and at
    /// least one degree of freedom. A non-positive ndof is logged as an
    /// error but does not abort by itself.
    fn validate(&self, ccd_images: &[CcdImage], ndof: i64) -> bool {
        let mut check = true;
        for image in ccd_images {
            check &= self.check_positive_on_frame(image);
        }
        if ndof < 1 {
            check = false;
            error!(
                ndof,
                total_parameters = self.total_parameters(),
                "fitting this model requires at least 1 degree of freedom; \
                 reduce the model complexity to match the measurement count"
            );
        }
        check
    }
}

struct PhotomEntry {
    factor: f64,
    index: usize,
    to_be_fit: bool,
}

/// One multiplicative flux scale per exposure.
///
/// The factor of the first exposure is held fixed: the product
/// `factor × fitted flux` is invariant under a global rescaling, and the
/// fixed entry anchors that scale the same way the fixed reference chip
/// anchors the constrained astrometric model.
pub struct SimplePhotometryModel {
    entries: Vec<PhotomEntry>,
    keys: HashMap<(VisitId, CcdId), usize, RandomState>,
    fitting: bool,
}

impl SimplePhotometryModel {
    pub fn new(ccd_images: &[CcdImage]) -> Self {
        let mut entries = Vec::with_capacity(ccd_images.len());
        let mut keys = HashMap::with_capacity_and_hasher(ccd_images.len(), RandomState::new());
        for (idx, image) in ccd_images.iter().enumerate() {
            keys.insert(image.key(), idx);
            entries.push(PhotomEntry {
                factor: 1.0,
                index: 0,
                to_be_fit: idx != 0,
            });
        }
        info!(exposures = entries.len(), "built per-exposure photometric model");
        SimplePhotometryModel { entries, keys, fitting: false }
    }

    fn entry_of(&self, ccd_image: &CcdImage) -> Option<&PhotomEntry> {
        let found = self.keys.get(&ccd_image.key());
        if found.is_none() {
            error!(name = ccd_image.name(), "exposure unknown to this photometric model");
        }
        found.map(|&idx| &self.entries[idx])
    }

    /// The fitted flux scale of one exposure.
    pub fn factor_of(&self, ccd_image: &CcdImage) -> Option<f64> {
        self.entry_of(ccd_image).map(|e| e.factor)
    }
}

impl PhotometryModel for SimplePhotometryModel {
    fn assign_indices(&mut self, what_to_fit: &str, first_index: usize) -> usize {
        if !what_to_fit.contains("Model") {
            error!(what_to_fit, "assign_indices called without Model");
            return first_index;
        }
        self.fitting = true;
        let mut index = first_index;
        for entry in &mut self.entries {
            if entry.to_be_fit {
                entry.index = index;
                index += 1;
            }
        }
        index
    }

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<(), JointfitError> {
        if !self.fitting {
            return Ok(());
        }
        for entry in &mut self.entries {
            if !entry.to_be_fit {
                continue;
            }
            if entry.index >= delta.len() {
                return Err(JointfitError::DeltaSizeMismatch {
                    expected: entry.index + 1,
                    got: delta.len(),
                });
            }
            entry.factor += delta[entry.index];
        }
        Ok(())
    }

    fn photom_factor(&self, ccd_image: &CcdImage, _star: &MeasuredStar) -> f64 {
        self.entry_of(ccd_image).map_or(1.0, |e| e.factor)
    }

    fn indices_and_derivatives(
        &self,
        _star: &MeasuredStar,
        ccd_image: &CcdImage,
        indices: &mut Vec<usize>,
        derivatives: &mut Vec<f64>,
    ) {
        indices.clear();
        derivatives.clear();
        if let Some(entry) = self.entry_of(ccd_image) {
            if entry.to_be_fit {
                indices.push(entry.index);
                derivatives.push(1.0);
            }
        }
    }

    fn total_parameters(&self) -> usize {
        self.entries.iter().filter(|e| e.to_be_fit).count()
    }

    fn check_positive_on_frame(&self, ccd_image: &CcdImage) -> bool {
        match self.entry_of(ccd_image) {
            Some(entry) if entry.factor > 0.0 => true,
            Some(entry) => {
                warn!(
                    name = ccd_image.name(),
                    factor = entry.factor,
                    "photometric factor is not positive"
                );
                false
            }
            None => false,
        }
    }
}
