//! Dense deformation field.
//!
//! One displacement vector per point of a reference grid, mapping fixed-space
//! locations into moving space: `x -> x + u(x)`. Components are stored as one
//! tensor per physical axis, each with the grid's extent.

use burn::tensor::{ElementConversion, Tensor};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::trait_::Transform;
use crate::error::{FieldError, Result};
use crate::image::GridSpec;
use crate::interpolation::{Interpolator, LinearInterpolator};
use crate::spatial::Vector;

/// Units of the stored displacement components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FieldUnits {
    /// Displacements in physical units (e.g. mm) along the physical axes.
    #[default]
    Physical,
    /// Displacements in voxels along the grid axes.
    Index,
}

/// Dense displacement field over a [`GridSpec`].
///
/// The field extent always equals its grid extent; constructors reject any
/// other layout.
#[derive(Debug, Clone)]
pub struct DeformationField<B: Backend, const D: usize> {
    components: Vec<Tensor<B, D>>,
    grid: GridSpec<D>,
    units: FieldUnits,
}

impl<B: Backend, const D: usize> DeformationField<B, D> {
    /// Create a field from per-axis component tensors.
    ///
    /// # Errors
    /// * [`FieldError::ComponentCount`] unless exactly `D` components are given
    /// * [`FieldError::ShapeMismatch`] if a component's extent differs from the grid
    pub fn new(components: Vec<Tensor<B, D>>, grid: GridSpec<D>, units: FieldUnits) -> Result<Self> {
        if components.len() != D {
            return Err(FieldError::ComponentCount {
                expected: D,
                actual: components.len(),
            });
        }
        let expected = grid.shape();
        for component in &components {
            let dims = component.dims();
            if dims != expected {
                return Err(FieldError::shape_mismatch(&expected, &dims));
            }
        }
        Ok(Self { components, grid, units })
    }

    /// Zero displacement in physical units.
    pub fn zeros(grid: GridSpec<D>, device: &B::Device) -> Self {
        Self::zeros_with_units(grid, FieldUnits::Physical, device)
    }

    /// Zero displacement with explicit units.
    pub fn zeros_with_units(grid: GridSpec<D>, units: FieldUnits, device: &B::Device) -> Self {
        let components = (0..D).map(|_| Tensor::zeros(grid.shape(), device)).collect();
        Self { components, grid, units }
    }

    /// The same displacement at every grid point.
    pub fn constant(grid: GridSpec<D>, displacement: Vector<D>, units: FieldUnits, device: &B::Device) -> Self {
        let components = (0..D)
            .map(|axis| Tensor::full(grid.shape(), displacement[axis] as f32, device))
            .collect();
        Self { components, grid, units }
    }

    /// Build a field from a flattened `[N, D]` vector tensor.
    ///
    /// Row `n` is the displacement at the grid point with row-major offset `n`.
    pub fn from_vectors(vectors: Tensor<B, 2>, grid: GridSpec<D>, units: FieldUnits) -> Result<Self> {
        let dims = vectors.dims();
        let expected = [grid.num_points(), D];
        if dims != expected {
            return Err(FieldError::shape_mismatch(&expected, &dims));
        }
        let components = (0..D)
            .map(|axis| {
                vectors
                    .clone()
                    .narrow(1, axis, 1)
                    .reshape(grid.shape())
            })
            .collect();
        Ok(Self { components, grid, units })
    }

    /// Geometry of the reference grid.
    pub fn grid(&self) -> &GridSpec<D> {
        &self.grid
    }

    /// Units of the stored components.
    pub fn units(&self) -> FieldUnits {
        self.units
    }

    /// Per-axis component tensors, x first.
    pub fn components(&self) -> &[Tensor<B, D>] {
        &self.components
    }

    /// Mutable access to the component tensors.
    ///
    /// The extent of each tensor must be preserved.
    pub fn components_mut(&mut self) -> &mut [Tensor<B, D>] {
        &mut self.components
    }

    /// Consume the field, returning its components.
    pub fn into_components(self) -> Vec<Tensor<B, D>> {
        self.components
    }

    /// Device holding the components.
    pub fn device(&self) -> B::Device {
        self.components[0].device()
    }

    /// Flattened `[N, D]` view in row-major grid order.
    pub fn to_vectors(&self) -> Tensor<B, 2> {
        let n = self.grid.num_points();
        let columns = self
            .components
            .iter()
            .map(|c| c.clone().reshape([n, 1]))
            .collect();
        Tensor::cat(columns, 1)
    }

    /// Flattened `[N, D]` vectors converted to physical units.
    pub fn to_physical_vectors(&self) -> Tensor<B, 2> {
        match self.units {
            FieldUnits::Physical => self.to_vectors(),
            FieldUnits::Index => self.grid.index_vectors_to_physical_tensor(self.to_vectors()),
        }
    }

    /// Host copy of the vectors, `N * D` values with the components of each
    /// point contiguous.
    pub fn to_vec(&self) -> Vec<f32> {
        self.to_vectors().into_data().iter::<f32>().collect()
    }

    /// Replace the displacement vectors, keeping grid and units.
    pub fn with_vectors(&self, vectors: Tensor<B, 2>) -> Result<Self> {
        Self::from_vectors(vectors, self.grid.clone(), self.units)
    }

    /// Add a flattened `[N, D]` increment expressed in this field's units.
    pub fn add_vectors(&self, increment: Tensor<B, 2>) -> Result<Self> {
        let dims = increment.dims();
        let expected = [self.grid.num_points(), D];
        if dims != expected {
            return Err(FieldError::shape_mismatch(&expected, &dims));
        }
        self.with_vectors(self.to_vectors() + increment)
    }

    /// Re-express the field in other units.
    pub fn to_units(&self, units: FieldUnits) -> Self {
        if units == self.units {
            return self.clone();
        }
        let vectors = match units {
            FieldUnits::Physical => self.grid.index_vectors_to_physical_tensor(self.to_vectors()),
            FieldUnits::Index => self.grid.physical_vectors_to_index_tensor(self.to_vectors()),
        };
        let components = (0..D)
            .map(|axis| vectors.clone().narrow(1, axis, 1).reshape(self.grid.shape()))
            .collect();
        Self {
            components,
            grid: self.grid.clone(),
            units,
        }
    }

    /// Physical displacement at arbitrary physical points `[Batch, D]`.
    ///
    /// Components are linearly interpolated; points outside the grid take
    /// the value at the nearest edge.
    pub fn sample(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        self.sample_with(&LinearInterpolator::new(), points)
    }

    /// Like [`sample`](Self::sample) with a caller-chosen interpolator.
    pub fn sample_with<I: Interpolator<B>>(&self, interpolator: &I, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let batch_size = points.dims()[0];
        let indices = self.grid.world_to_index_tensor(points);
        let columns = self
            .components
            .iter()
            .map(|c| interpolator.interpolate(c, indices.clone()).reshape([batch_size, 1]))
            .collect();
        let sampled = Tensor::cat(columns, 1);
        match self.units {
            FieldUnits::Physical => sampled,
            FieldUnits::Index => self.grid.index_vectors_to_physical_tensor(sampled),
        }
    }

    /// Mean physical displacement over the grid.
    pub fn mean_displacement(&self) -> Vector<D> {
        let mean = self.to_physical_vectors().mean_dim(0).into_data();
        let values: Vec<f32> = mean.iter::<f32>().collect();
        Vector::new(std::array::from_fn(|i| values[i] as f64))
    }

    /// Largest physical displacement magnitude over the grid.
    pub fn max_magnitude(&self) -> f64 {
        let vectors = self.to_physical_vectors();
        let norms = (vectors.clone() * vectors).sum_dim(1).sqrt();
        norms.max().into_scalar().elem::<f64>()
    }

    /// Same grid and units, and components within `tolerance` of each other.
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        if self.units != other.units || !self.grid.approx_eq(&other.grid, 1e-9) {
            return false;
        }
        let diff = (self.to_vectors() - other.to_vectors()).abs().max();
        diff.into_scalar().elem::<f64>() <= tolerance
    }
}

impl<B: Backend, const D: usize> Transform<B, D> for DeformationField<B, D> {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        points.clone() + self.sample(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{Direction, Point, Spacing};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn grid_2d() -> GridSpec<2> {
        GridSpec::new([3, 4], Point::new([1.0, -2.0]), Spacing::new([2.0, 0.5]), Direction::identity()).unwrap()
    }

    #[test]
    fn test_rejects_wrong_layout() {
        let device = Default::default();
        let grid = grid_2d();
        let one = vec![Tensor::<TestBackend, 2>::zeros([3, 4], &device)];
        assert!(matches!(
            DeformationField::new(one, grid.clone(), FieldUnits::Physical),
            Err(FieldError::ComponentCount { expected: 2, actual: 1 })
        ));

        let wrong = vec![
            Tensor::<TestBackend, 2>::zeros([3, 4], &device),
            Tensor::<TestBackend, 2>::zeros([4, 3], &device),
        ];
        assert!(matches!(
            DeformationField::new(wrong, grid, FieldUnits::Physical),
            Err(FieldError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_vectors_roundtrip_layout() {
        let device = Default::default();
        let grid = grid_2d();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0], &device)
            .reshape([3, 4]);
        let y = x.clone() * -1.0;
        let field = DeformationField::new(vec![x, y], grid.clone(), FieldUnits::Physical).unwrap();

        let values = field.to_vec();
        assert_eq!(&values[0..6], &[0.0, 0.0, 1.0, -1.0, 2.0, -2.0]);

        let rebuilt = DeformationField::from_vectors(field.to_vectors(), grid, FieldUnits::Physical).unwrap();
        assert!(rebuilt.approx_eq(&field, 0.0));
    }

    #[test]
    fn test_unit_conversion_and_statistics() {
        let device = Default::default();
        let grid = grid_2d();
        let field = DeformationField::<TestBackend, 2>::constant(
            grid,
            Vector::new([1.0, 2.0]),
            FieldUnits::Index,
            &device,
        );

        let mean = field.mean_displacement();
        assert!((mean[0] - 2.0).abs() < 1e-6);
        assert!((mean[1] - 1.0).abs() < 1e-6);
        assert!((field.max_magnitude() - 5f64.sqrt()).abs() < 1e-5);

        let physical = field.to_units(FieldUnits::Physical);
        assert_eq!(physical.units(), FieldUnits::Physical);
        assert_eq!(&physical.to_vec()[0..2], &[2.0, 1.0]);
        assert!(physical.to_units(FieldUnits::Index).approx_eq(&field, 1e-6));
    }

    #[test]
    fn test_transform_points_adds_displacement() {
        let device = Default::default();
        let field = DeformationField::<TestBackend, 2>::constant(
            grid_2d(),
            Vector::new([0.5, -1.5]),
            FieldUnits::Physical,
            &device,
        );
        let points = Tensor::<TestBackend, 2>::from_floats([[3.0, -1.0], [100.0, 100.0]], &device);
        let moved = field.transform_points(points).into_data();
        assert_eq!(moved.as_slice::<f32>().unwrap(), &[3.5, -2.5, 100.5, 98.5]);
    }

    #[test]
    fn test_add_vectors_checks_extent() {
        let device = Default::default();
        let field = DeformationField::<TestBackend, 2>::zeros(grid_2d(), &device);
        let bad = Tensor::<TestBackend, 2>::ones([5, 2], &device);
        assert!(field.add_vectors(bad).is_err());

        let good = Tensor::<TestBackend, 2>::ones([12, 2], &device);
        let shifted = field.add_vectors(good).unwrap();
        assert!((shifted.mean_displacement()[1] - 1.0).abs() < 1e-6);
    }
}
