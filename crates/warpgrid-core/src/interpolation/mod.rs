//! Interpolation types and operations.
//!
//! This module provides the interpolation trait, linear and nearest neighbor
//! implementations, the explicit out-of-bounds mask and gradient sampling.

pub mod trait_;
pub mod linear;
pub mod nearest;
pub mod gradient;

pub use trait_::Interpolator;
pub use linear::LinearInterpolator;
pub use nearest::NearestNeighborInterpolator;
pub use gradient::{inside_mask, sample_gradient, BOUNDS_TOLERANCE};
