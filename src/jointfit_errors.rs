use thiserror::Error;

use crate::constants::{CcdId, VisitId};

#[derive(Error, Debug)]
pub enum JointfitError {
    #[error("Invalid fit parameter: {0}")]
    InvalidFitParameter(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Linear transform is not invertible (determinant = {0:e})")]
    SingularTransform(f64),

    #[error("Least-squares transform fit failed: {0}")]
    TransformFitFailure(String),

    #[error("Normal matrix factorization failed: {0}")]
    FactorizationFailure(String),

    #[error("Parameter offset vector has length {got}, expected {expected}")]
    DeltaSizeMismatch { expected: usize, got: usize },

    #[error("Unknown flux field in reference catalog: {0}")]
    UnknownFluxField(String),

    #[error("No mapping registered for ccd {0} of visit {1}")]
    UnknownCcdImage(CcdId, VisitId),

    #[error("No chip mapping for ccd {0}")]
    UnknownChip(CcdId),

    #[error("No visit mapping for visit {0}")]
    UnknownVisit(VisitId),

    #[error("Common tangent point has not been set")]
    MissingTangentPoint,
}
