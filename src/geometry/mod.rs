//! Geometry primitives: points with error ellipses, bounding frames, and
//! the transform family (affine, polynomial, tangent-plane projections)
//! every other layer of the crate is built on.

pub mod frame;
pub mod linear;
pub mod point;
pub mod poly;
pub mod tangent;
pub mod transform;

pub use frame::Frame;
pub use linear::{normalize_coordinates, LinearTransform};
pub use point::{FatPoint, Point};
pub use poly::{n_poly_terms, PolyTransform};
pub use tangent::{TanPix2RaDec, TanRaDec2Pix};
pub use transform::Transform;
