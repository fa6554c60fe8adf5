//! Nearest neighbor interpolation implementation.

use burn::tensor::{Int, Tensor};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::trait_::Interpolator;

/// Nearest Neighbor Interpolator.
///
/// Rounds each coordinate to the closest voxel, clamped to the extent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NearestNeighborInterpolator;

impl NearestNeighborInterpolator {
    /// Create a new nearest neighbor interpolator.
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Interpolator<B> for NearestNeighborInterpolator {
    fn interpolate<const D: usize>(&self, data: &Tensor<B, D>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
        let dims = data.dims();
        let batch_size = indices.dims()[0];
        let device = indices.device();
        let total: usize = dims.iter().product();

        let mut offset = Tensor::<B, 1, Int>::zeros([batch_size], &device);
        let mut stride = 1usize;
        for axis in 0..D {
            let len = dims[D - 1 - axis];
            let idx = indices
                .clone()
                .narrow(1, axis, 1)
                .squeeze::<1>(1)
                .round()
                .clamp(0.0, (len - 1) as f64)
                .int();
            offset = offset + idx * (stride as i32);
            stride *= len;
        }

        data.clone().reshape([total]).gather(0, offset)
    }
}
