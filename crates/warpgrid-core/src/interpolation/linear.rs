//! Linear interpolation implementation.
//!
//! N-linear interpolation (linear, bilinear, trilinear) over tensors of any
//! rank. Coordinates are clamped to the sampled extent first, which extends
//! the image by edge replication.

use burn::tensor::{Int, Tensor};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::trait_::Interpolator;

/// Linear Interpolator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinearInterpolator;

impl LinearInterpolator {
    /// Create a new linear interpolator.
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Interpolator<B> for LinearInterpolator {
    fn interpolate<const D: usize>(&self, data: &Tensor<B, D>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
        let dims = data.dims();
        let batch_size = indices.dims()[0];
        let device = indices.device();
        let total: usize = dims.iter().product();
        let flat_data = data.clone().reshape([total]);

        let mut lower: Vec<Tensor<B, 1, Int>> = Vec::with_capacity(D);
        let mut upper: Vec<Tensor<B, 1, Int>> = Vec::with_capacity(D);
        let mut weights: Vec<Tensor<B, 1>> = Vec::with_capacity(D);
        let mut strides: Vec<i32> = Vec::with_capacity(D);
        let mut stride = 1usize;

        // Column `axis` of `indices` addresses tensor dimension D - 1 - axis.
        for axis in 0..D {
            let max_index = (dims[D - 1 - axis] - 1) as f64;
            let coord = indices
                .clone()
                .narrow(1, axis, 1)
                .squeeze::<1>(1)
                .clamp(0.0, max_index);
            let c0 = coord.clone().floor();
            let c1 = (c0.clone() + 1.0).clamp(0.0, max_index);

            weights.push(coord - c0.clone());
            lower.push(c0.int());
            upper.push(c1.int());
            strides.push(stride as i32);
            stride *= dims[D - 1 - axis];
        }

        // Accumulate the 2^D corner contributions.
        let mut result = Tensor::<B, 1>::zeros([batch_size], &device);
        for corner in 0..(1usize << D) {
            let mut offset = Tensor::<B, 1, Int>::zeros([batch_size], &device);
            let mut weight = Tensor::<B, 1>::ones([batch_size], &device);
            for axis in 0..D {
                if corner & (1 << axis) != 0 {
                    offset = offset + upper[axis].clone() * strides[axis];
                    weight = weight * weights[axis].clone();
                } else {
                    offset = offset + lower[axis].clone() * strides[axis];
                    weight = weight * (weights[axis].clone().neg() + 1.0);
                }
            }
            result = result + flat_data.clone().gather(0, offset) * weight;
        }
        result
    }
}
