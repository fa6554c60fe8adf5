use burn::tensor::{Shape, Tensor};
use burn::tensor::backend::Backend;
use burn::tensor::module::conv1d;
use burn::tensor::ops::ConvOptions;

use crate::error::Result;
use crate::image::Image;
use crate::spatial::Spacing;

/// Gaussian smoothing filter.
///
/// Applies separable 1D convolutions along each axis. Sigmas are given per
/// physical axis (x first) in the units of the spacing passed to
/// [`apply_tensor`](Self::apply_tensor); with unit spacing they are in voxels.
/// The signal is extended by edge replication, so constant inputs stay
/// constant up to the border.
pub struct GaussianFilter<B: Backend> {
    sigmas: Vec<f64>,
    max_kernel_width: usize,
    _b: std::marker::PhantomData<B>,
}

impl<B: Backend> GaussianFilter<B> {
    /// Create a new Gaussian filter with the given standard deviations.
    ///
    /// A single sigma applies to every axis.
    pub fn new(sigmas: Vec<f64>) -> Self {
        Self {
            sigmas,
            max_kernel_width: 33,
            _b: std::marker::PhantomData,
        }
    }

    /// Set the maximum kernel width (radius * 2 + 1).
    pub fn with_max_kernel_width(mut self, width: usize) -> Self {
        self.max_kernel_width = width.max(1);
        self
    }

    /// Smooth an image, using its spacing to convert sigmas to voxels.
    pub fn apply<const D: usize>(&self, image: &Image<B, D>) -> Result<Image<B, D>> {
        let data = self.apply_tensor(image.data().clone(), image.spacing());
        image.with_data(data)
    }

    /// Apply the filter to a tensor directly.
    ///
    /// # Arguments
    /// * `input` - Input tensor in tensor order (`[D, H, W]`)
    /// * `spacing` - Physical spacing of the data, x first
    pub fn apply_tensor<const D: usize>(&self, input: Tensor<B, D>, spacing: &Spacing<D>) -> Tensor<B, D> {
        if self.sigmas.is_empty() {
            return input;
        }
        let mut data = input;
        let device = data.device();

        for axis in 0..D {
            let sigma = self.sigmas.get(axis).copied().unwrap_or(self.sigmas[0]);
            if sigma <= 1e-6 {
                continue;
            }

            let pixel_sigma = sigma / spacing[axis];
            let radius = (3.0 * pixel_sigma).ceil() as usize;
            let width = (2 * radius + 1).min(self.max_kernel_width | 1);
            let actual_radius = (width - 1) / 2;
            if actual_radius == 0 {
                continue;
            }

            let kernel = Self::generate_kernel(pixel_sigma, actual_radius);
            let kernel_tensor = Tensor::<B, 1>::from_floats(kernel.as_slice(), &device);

            data = Self::convolve_1d::<D>(data, kernel_tensor, D - 1 - axis, actual_radius);
        }
        data
    }

    fn generate_kernel(sigma: f64, radius: usize) -> Vec<f32> {
        let two_sigma2 = 2.0 * sigma * sigma;
        let raw: Vec<f64> = (0..=(2 * radius))
            .map(|i| {
                let x = i as f64 - radius as f64;
                (-x * x / two_sigma2).exp()
            })
            .collect();
        let sum: f64 = raw.iter().sum();
        raw.into_iter().map(|v| (v / sum) as f32).collect()
    }

    fn convolve_1d<const D: usize>(
        input: Tensor<B, D>,
        kernel: Tensor<B, 1>,
        dim: usize,
        radius: usize,
    ) -> Tensor<B, D> {
        let dims: [usize; D] = input.dims();

        // Move the target dimension last.
        let mut permute_indices = [0isize; D];
        let mut idx = 0;
        for i in 0..D {
            if i != dim {
                permute_indices[idx] = i as isize;
                idx += 1;
            }
        }
        permute_indices[D - 1] = dim as isize;

        let length = dims[dim];
        let batch_size: usize = (0..D).filter(|&i| i != dim).map(|i| dims[i]).product();

        // [Batch, Channels=1, Length] with replicated edges
        let rows = input.permute(permute_indices).reshape([batch_size, 1, length]);
        let left = rows.clone().narrow(2, 0, 1).repeat(&[1, 1, radius]);
        let right = rows.clone().narrow(2, length - 1, 1).repeat(&[1, 1, radius]);
        let padded = Tensor::cat(vec![left, rows, right], 2);

        let kernel_size = kernel.dims()[0];
        let weight = kernel.reshape([1, 1, kernel_size]);
        let options = ConvOptions::new([1], [0], [1], 1);
        let output = conv1d(padded, weight, None, options);

        let mut permuted_shape = [0usize; D];
        for (new_pos, &old_pos) in permute_indices.iter().enumerate() {
            permuted_shape[new_pos] = dims[old_pos as usize];
        }
        let output = output.reshape(Shape::new(permuted_shape));

        let mut inverse = [0isize; D];
        for (new_pos, &old_pos) in permute_indices.iter().enumerate() {
            inverse[old_pos as usize] = new_pos as isize;
        }
        output.permute(inverse)
    }
}
