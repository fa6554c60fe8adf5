//! Interpolator trait for sampling values at continuous coordinates.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

/// Interpolator trait for sampling values at continuous coordinates.
///
/// Implementations extend the image by edge replication outside its extent;
/// callers that need to distinguish in-bounds samples combine this with
/// [`inside_mask`](super::inside_mask).
///
/// # Type Parameters
/// * `B` - The Burn backend
pub trait Interpolator<B: Backend>: Send + Sync {
    /// Interpolate values from a tensor at given continuous indices.
    ///
    /// # Arguments
    /// * `data` - The source tensor (e.g. 3D volume `[D, H, W]` or 2D image `[H, W]`)
    /// * `indices` - Continuous indices `[Batch, Rank]`, x first; Rank must
    ///   match the dimensionality of `data`
    ///
    /// # Returns
    /// Tensor of sampled values `[Batch]`
    fn interpolate<const D: usize>(&self, data: &Tensor<B, D>, indices: Tensor<B, 2>) -> Tensor<B, 1>;
}
