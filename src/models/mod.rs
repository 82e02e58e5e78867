//! Distortion and photometric models.
//!
//! A model owns the mappings of a set of exposures, hands out parameter
//! indices on request, and applies solution offsets back onto its
//! mappings. The fitters only ever talk to the trait objects defined
//! here.
//!
//! `whatToFit` is a whitespace-separated token string. The tokens a model
//! understands are `"Distortions"` (optionally narrowed to
//! `"DistortionsChip"` / `"DistortionsVisit"`) for astrometry and
//! `"Model"` for photometry; `"Positions"` and `"Fluxes"` address the
//! per-object parameters and are handled by the fitters. Calling
//! `assign_indices` on a model whose token is absent is a configuration
//! error: it is logged and the first index is returned unchanged.

pub mod constrained;
pub mod photometry;
pub mod simple_poly;

use nalgebra::DVector;
use tracing::error;

use crate::ccd_image::CcdImage;
use crate::geometry::{Frame, PolyTransform, TanPix2RaDec, TanRaDec2Pix};
use crate::jointfit_errors::JointfitError;
use crate::mappings::AstrometryMapping;

pub use constrained::ConstrainedPolyModel;
pub use photometry::{PhotometryModel, SimplePhotometryModel};
pub use simple_poly::SimplePolyModel;

pub trait AstrometryModel {
    /// Assign parameter indices starting at `first_index` according to the
    /// `what_to_fit` tokens, and return the first unused index. Without
    /// `"Distortions"` in the tokens this is a configuration error: it is
    /// logged and `first_index` comes back unchanged.
    fn assign_indices(&mut self, what_to_fit: &str, first_index: usize) -> usize;

    /// Add the relevant slices of `delta` to every fittable mapping.
    /// `delta` is the full solution vector of the fit.
    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<(), JointfitError>;

    /// Latch the current transforms as the error-propagation transforms.
    fn freeze_error_transform(&mut self);

    /// The mapping attached to this exposure, or None (logged) if the
    /// exposure is unknown to the model.
    fn mapping(&self, ccd_image: &CcdImage) -> Option<&dyn AstrometryMapping>;

    fn total_parameters(&self) -> usize;

    /// Build the refined plane-to-sky WCS of an exposure from its fitted
    /// mapping: a linear part taken at the frame center, the residual
    /// polynomial as corrections, and the shared tangent point.
    fn produce_sip_wcs(&self, ccd_image: &CcdImage) -> Option<TanPix2RaDec>;
}

/// Slice `delta` for one mapping, by its index and parameter count.
pub(crate) fn delta_slice<'a>(
    delta: &'a DVector<f64>,
    mapping: &dyn AstrometryMapping,
) -> Result<&'a [f64], JointfitError> {
    let start = mapping.index();
    let end = start + mapping.n_par();
    if end > delta.len() {
        return Err(JointfitError::DeltaSizeMismatch {
            expected: end,
            got: delta.len(),
        });
    }
    Ok(&delta.as_slice()[start..end])
}

/// CD-matrix / corrections split of a fitted pixels → tangent-plane
/// polynomial, shared by the models' `produce_sip_wcs`.
pub(crate) fn sip_wcs_from_pix2tp(
    pix2tp: &PolyTransform,
    frame: &Frame,
    projector: &TanRaDec2Pix,
) -> Option<TanPix2RaDec> {
    let cd = pix2tp.linear_approximation(&frame.center());
    let cd_inv = match cd.invert() {
        Ok(inv) => inv,
        Err(err) => {
            error!(%err, "cannot extract a linear part from the fitted mapping");
            return None;
        }
    };
    // pix2tp = cd ∘ corrections, so corrections = cd⁻¹ ∘ pix2tp
    let corrections = PolyTransform::from(&cd_inv).compose(pix2tp);
    Some(TanPix2RaDec::new(cd, projector.tangent_point(), Some(corrections)))
}
