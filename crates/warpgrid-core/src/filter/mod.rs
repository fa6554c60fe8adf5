//! Image and field filters.

pub mod gaussian;
pub mod downsample;
pub mod pyramid;
pub mod resample;
pub mod field_resample;

pub use gaussian::GaussianFilter;
pub use downsample::DownsampleFilter;
pub use pyramid::{ImagePyramid, MultiResolutionPyramid};
pub use resample::ResampleImageFilter;
pub use field_resample::FieldResampler;
