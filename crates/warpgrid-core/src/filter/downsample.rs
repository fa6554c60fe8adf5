use burn::tensor::backend::Backend;

use crate::error::Result;
use crate::image::{GridSpec, Image};
use crate::interpolation::{Interpolator, LinearInterpolator};
use crate::spatial::Point;

/// Downsample filter.
///
/// Reduces the image size by integer factors while covering the same
/// physical extent. Along an axis shrunk by `f` the output has
/// `ceil(len / f)` samples at `f` times the spacing, and its first sample
/// sits at the centre of the first block of `f` input voxels, i.e.
/// `(f - 1) / 2` input voxels past the input origin along the grid
/// direction. Sample values are interpolated linearly at those centres;
/// the trailing partial block reads the replicated edge.
pub struct DownsampleFilter<B: Backend> {
    factors: Vec<usize>,
    _b: std::marker::PhantomData<B>,
}

impl<B: Backend> DownsampleFilter<B> {
    /// Create a new downsample filter.
    ///
    /// # Arguments
    /// * `factors` - Factor per physical axis, x first; a single factor applies
    ///   to every axis. Factors of 0 or 1 leave the axis untouched.
    pub fn new(factors: Vec<usize>) -> Self {
        Self {
            factors,
            _b: std::marker::PhantomData,
        }
    }

    fn factor(&self, axis: usize) -> usize {
        self.factors
            .get(axis)
            .or_else(|| self.factors.first())
            .copied()
            .unwrap_or(1)
    }

    /// Grid the filter produces for `source`.
    pub fn output_grid<const D: usize>(&self, source: &GridSpec<D>) -> Result<GridSpec<D>> {
        let mut shape = source.shape();
        let mut spacing = *source.spacing();
        let mut first = [0.0; D];

        for axis in 0..D {
            let factor = self.factor(axis);
            if factor <= 1 {
                continue;
            }
            let dim = D - 1 - axis;
            shape[dim] = shape[dim].div_ceil(factor);
            spacing[axis] *= factor as f64;
            first[axis] = (factor as f64 - 1.0) / 2.0;
        }

        let origin = source.index_to_physical(&Point::new(first));
        GridSpec::new(shape, origin, spacing, *source.direction())
    }

    /// Apply the filter to an image.
    pub fn apply<const D: usize>(&self, image: &Image<B, D>) -> Result<Image<B, D>> {
        if (0..D).all(|axis| self.factor(axis) <= 1) {
            return Ok(image.clone());
        }

        let grid = self.output_grid(image.grid())?;
        let indices = image.world_to_index_tensor(grid.physical_points::<B>(&image.device()));
        let data = LinearInterpolator::new()
            .interpolate(image.data(), indices)
            .reshape(grid.shape());
        Image::from_grid(data, grid)
    }
}
