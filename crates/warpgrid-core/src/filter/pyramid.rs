use burn::tensor::backend::Backend;

use super::downsample::DownsampleFilter;
use super::gaussian::GaussianFilter;
use crate::error::{FieldError, Result};
use crate::image::Image;

/// A coarse-to-fine sequence of images covering the same physical extent.
///
/// Level 0 is the coarsest; resolution increases with the level index.
pub trait ImagePyramid<B: Backend, const D: usize> {
    /// Number of levels available.
    fn levels(&self) -> usize;

    /// Image at `level`, or `None` if the pyramid cannot supply it.
    fn level(&self, level: usize) -> Option<&Image<B, D>>;
}

/// Multi-resolution image pyramid built by Gaussian smoothing followed by
/// integer downsampling.
#[derive(Debug, Clone)]
pub struct MultiResolutionPyramid<B: Backend, const D: usize> {
    images: Vec<Image<B, D>>,
}

impl<B: Backend, const D: usize> MultiResolutionPyramid<B, D> {
    /// Create a pyramid from an input image and schedules.
    ///
    /// # Arguments
    /// * `input` - The original high-resolution image.
    /// * `shrink_factors` - Shrink factors for each level `[level][axis]`.
    /// * `smoothing_sigmas` - Physical smoothing sigmas for each level `[level][axis]`.
    ///
    /// # Errors
    /// Returns [`FieldError::InvalidSchedule`] if the schedules are empty or
    /// have different lengths.
    pub fn new(
        input: &Image<B, D>,
        shrink_factors: &[Vec<usize>],
        smoothing_sigmas: &[Vec<f64>],
    ) -> Result<Self> {
        if shrink_factors.len() != smoothing_sigmas.len() {
            return Err(FieldError::InvalidSchedule(format!(
                "{} shrink factors but {} smoothing sigmas",
                shrink_factors.len(),
                smoothing_sigmas.len()
            )));
        }
        if shrink_factors.is_empty() {
            return Err(FieldError::InvalidSchedule("pyramid needs at least one level".into()));
        }

        let mut images = Vec::with_capacity(shrink_factors.len());
        for (factors, sigmas) in shrink_factors.iter().zip(smoothing_sigmas.iter()) {
            let is_identity_shrink = factors.iter().all(|&f| f <= 1);
            let is_identity_smooth = sigmas.iter().all(|&s| s <= 1e-6);

            let smoothed = if is_identity_smooth {
                input.clone()
            } else {
                GaussianFilter::new(sigmas.clone()).apply(input)?
            };

            let level = if is_identity_shrink {
                smoothed
            } else {
                DownsampleFilter::new(factors.clone()).apply(&smoothed)?
            };

            tracing::debug!(shape = ?level.shape(), spacing = ?level.spacing().to_array(), "built pyramid level");
            images.push(level);
        }

        Ok(Self { images })
    }

    /// Build `levels` levels with the power-of-two [`default_schedule`](Self::default_schedule).
    pub fn with_levels(input: &Image<B, D>, levels: usize) -> Result<Self> {
        let (factors, sigmas) = Self::default_schedule(levels);
        let spacing = input.spacing();
        let physical_sigmas: Vec<Vec<f64>> = sigmas
            .into_iter()
            .map(|level| level.iter().enumerate().map(|(axis, s)| s * spacing[axis]).collect())
            .collect();
        Self::new(input, &factors, &physical_sigmas)
    }

    /// Get image at specific level.
    pub fn get_level(&self, level: usize) -> Option<&Image<B, D>> {
        self.images.get(level)
    }

    /// Get number of levels.
    pub fn levels(&self) -> usize {
        self.images.len()
    }

    /// Create a default schedule for N levels with power-of-2 shrinking.
    ///
    /// Returns `(shrink_factors, smoothing_sigmas)` with sigmas in voxels,
    /// ordered from coarsest to finest.
    /// E.g. levels=3 -> factors [4, 2, 1], sigmas [2.0, 1.0, 0.0]
    pub fn default_schedule(levels: usize) -> (Vec<Vec<usize>>, Vec<Vec<f64>>) {
        let mut shrink_factors = Vec::with_capacity(levels);
        let mut smoothing_sigmas = Vec::with_capacity(levels);

        for i in 0..levels {
            let factor = 2usize.pow((levels - 1 - i) as u32);
            let sigma = if factor > 1 { 0.5 * factor as f64 } else { 0.0 };
            shrink_factors.push(vec![factor; D]);
            smoothing_sigmas.push(vec![sigma; D]);
        }

        (shrink_factors, smoothing_sigmas)
    }
}

impl<B: Backend, const D: usize> ImagePyramid<B, D> for MultiResolutionPyramid<B, D> {
    fn levels(&self) -> usize {
        self.images.len()
    }

    fn level(&self, level: usize) -> Option<&Image<B, D>> {
        self.images.get(level)
    }
}
