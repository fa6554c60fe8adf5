//! Resample image filter.
//!
//! Resamples an image onto a reference grid through a transform and an
//! interpolator. Used to warp the moving image with a computed deformation.

use std::marker::PhantomData;

use burn::tensor::backend::Backend;

use crate::error::Result;
use crate::image::{GridSpec, Image};
use crate::interpolation::{inside_mask, Interpolator};
use crate::transform::Transform;

/// Resample image filter.
///
/// The transform maps output physical space to input physical space, which
/// is the direction a fixed-to-moving deformation field is defined in.
///
/// # Type Parameters
/// * `B` - The Burn backend
/// * `T` - The transform type
/// * `I` - The interpolator type
/// * `D` - The dimensionality
pub struct ResampleImageFilter<B, T, I, const D: usize>
where
    B: Backend,
    T: Transform<B, D>,
    I: Interpolator<B>,
{
    grid: GridSpec<D>,
    transform: T,
    interpolator: I,
    default_pixel_value: Option<f64>,
    _phantom: PhantomData<B>,
}

impl<B, T, I, const D: usize> ResampleImageFilter<B, T, I, D>
where
    B: Backend,
    T: Transform<B, D>,
    I: Interpolator<B>,
{
    /// Create a new resample filter producing images on `grid`.
    pub fn new(grid: GridSpec<D>, transform: T, interpolator: I) -> Self {
        Self {
            grid,
            transform,
            interpolator,
            default_pixel_value: None,
            _phantom: PhantomData,
        }
    }

    /// Use the reference image's grid for the output.
    pub fn new_from_reference(reference: &Image<B, D>, transform: T, interpolator: I) -> Self {
        Self::new(reference.grid().clone(), transform, interpolator)
    }

    /// Fill samples that map outside the input with `value`.
    ///
    /// Without a default the input is extended by edge replication.
    pub fn with_default_pixel_value(mut self, value: f64) -> Self {
        self.default_pixel_value = Some(value);
        self
    }

    /// Apply filter to an input image.
    pub fn apply(&self, input: &Image<B, D>) -> Result<Image<B, D>> {
        let device = input.device();

        let output_points = self.grid.physical_points::<B>(&device);
        let input_points = self.transform.transform_points(output_points);
        let input_indices = input.world_to_index_tensor(input_points);

        let mut values = self.interpolator.interpolate(input.data(), input_indices.clone());
        if let Some(default) = self.default_pixel_value {
            let mask = inside_mask(input.shape(), input_indices);
            values = values * mask.clone() + (mask.neg() + 1.0) * default;
        }

        Image::from_grid(values.reshape(self.grid.shape()), self.grid.clone())
    }
}
