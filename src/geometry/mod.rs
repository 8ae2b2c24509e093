//! Geometry utilities: SE(3) transforms and the affine brightness model.

pub mod affine;
pub mod se3;
pub mod so3;

pub use affine::AffineBrightness;
pub use se3::SE3;
