//! Bounds masks and gradient sampling at continuous indices.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use super::trait_::Interpolator;
use crate::image::Image;

/// Index-space slack allowed when testing whether a sample is in bounds.
pub const BOUNDS_TOLERANCE: f64 = 1e-3;

/// Mask of continuous indices `[Batch, D]` that lie within an extent.
///
/// `dims` is the tensor shape of the sampled data. Returns `1.0` for samples
/// inside `[0, len - 1]` on every axis (within [`BOUNDS_TOLERANCE`]) and
/// `0.0` otherwise.
pub fn inside_mask<B: Backend, const D: usize>(dims: [usize; D], indices: Tensor<B, 2>) -> Tensor<B, 1> {
    let batch_size = indices.dims()[0];
    let mut mask = Tensor::<B, 1>::ones([batch_size], &indices.device());
    for axis in 0..D {
        let upper = (dims[D - 1 - axis] - 1) as f64 + BOUNDS_TOLERANCE;
        let coord = indices.clone().narrow(1, axis, 1).squeeze::<1>(1);
        let above = coord.clone().greater_equal_elem(-BOUNDS_TOLERANCE).float();
        let below = coord.lower_equal_elem(upper).float();
        mask = mask * above * below;
    }
    mask
}

/// Sample the physical-space gradient of an image at continuous indices.
///
/// Uses central differences of the interpolated image one voxel either side
/// of each sample, then maps the index-space derivative through the image
/// spacing and direction. Returns `[Batch, D]`.
pub fn sample_gradient<B, I, const D: usize>(
    interpolator: &I,
    image: &Image<B, D>,
    indices: Tensor<B, 2>,
) -> Tensor<B, 2>
where
    B: Backend,
    I: Interpolator<B>,
{
    let batch_size = indices.dims()[0];
    let device = indices.device();

    let mut columns = Vec::with_capacity(D);
    for axis in 0..D {
        let step = axis_offset::<B, D>(axis, &device);
        let forward = interpolator.interpolate(image.data(), indices.clone() + step.clone());
        let backward = interpolator.interpolate(image.data(), indices.clone() - step);
        columns.push(((forward - backward) * 0.5).reshape([batch_size, 1]));
    }

    image.grid().index_gradient_to_physical_tensor(Tensor::cat(columns, 1))
}

fn axis_offset<B: Backend, const D: usize>(axis: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = [0.0f32; D];
    values[axis] = 1.0;
    Tensor::<B, 1>::from_floats(values, device).reshape([1, D])
}
