//! Deformation field resampling between pyramid levels.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use crate::error::Result;
use crate::image::GridSpec;
use crate::interpolation::{Interpolator, LinearInterpolator};
use crate::transform::{DeformationField, FieldUnits};

/// Grids closer than this in every geometric parameter count as equal.
const GRID_TOLERANCE: f64 = 1e-9;

/// Resizes a deformation field onto another grid.
///
/// Each component is interpolated at the physical locations of the target
/// grid points; samples beyond the source extent take the nearest edge value.
/// Fields stored in [`FieldUnits::Index`] are rescaled so that every vector
/// keeps its physical length and direction: along an axis the voxel-relative
/// component is multiplied by `old_spacing / new_spacing`. Physical-unit
/// fields are carried over unchanged.
#[derive(Debug, Clone)]
pub struct FieldResampler<I = LinearInterpolator> {
    interpolator: I,
}

impl FieldResampler<LinearInterpolator> {
    /// Resampler using linear interpolation.
    pub fn new() -> Self {
        Self::with_interpolator(LinearInterpolator::new())
    }
}

impl Default for FieldResampler<LinearInterpolator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> FieldResampler<I> {
    /// Resampler using a caller-chosen interpolator.
    pub fn with_interpolator(interpolator: I) -> Self {
        Self { interpolator }
    }

    /// Resample `field` onto `target`.
    ///
    /// Returns an equivalent field when `target` matches the field's grid.
    pub fn expand<B, const D: usize>(
        &self,
        field: &DeformationField<B, D>,
        target: &GridSpec<D>,
    ) -> Result<DeformationField<B, D>>
    where
        B: Backend,
        I: Interpolator<B>,
    {
        let source = field.grid();
        if source.approx_eq(target, GRID_TOLERANCE) {
            return DeformationField::new(field.components().to_vec(), target.clone(), field.units());
        }

        let device = field.device();
        let num_points = target.num_points();
        let indices = source.world_to_index_tensor(target.physical_points::<B>(&device));

        let columns = field
            .components()
            .iter()
            .map(|c| self.interpolator.interpolate(c, indices.clone()).reshape([num_points, 1]))
            .collect();
        let mut vectors = Tensor::cat(columns, 1);

        if field.units() == FieldUnits::Index {
            vectors = target.physical_vectors_to_index_tensor(source.index_vectors_to_physical_tensor(vectors));
        }

        tracing::debug!(
            from = ?source.shape(),
            to = ?target.shape(),
            units = ?field.units(),
            "resampled deformation field"
        );

        DeformationField::from_vectors(vectors, target.clone(), field.units())
    }
}
