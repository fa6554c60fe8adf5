//! Image type with physical metadata and coordinate transformations.
//!
//! This module provides the Image struct which pairs tensor data with the
//! [`GridSpec`] describing where each sample sits in physical space.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use crate::error::{FieldError, Result};
use crate::image::GridSpec;
use crate::spatial::{Direction, Point, Spacing};

/// Scalar image with physical metadata.
///
/// # Type Parameters
/// * `B` - The backend (CPU or GPU) for tensor operations
/// * `D` - The dimensionality of the image (1, 2 or 3)
///
/// # Coordinate Systems
/// * **Index Space**: Continuous voxel indices, x first
/// * **Physical Space**: Continuous coordinates in mm or other units
///
/// # Examples
/// ```rust
/// use warpgrid_core::Image;
/// use warpgrid_core::spatial::{Point3, Spacing3, Direction3};
/// use burn::tensor::Tensor;
/// use burn_ndarray::NdArray;
///
/// type Backend = NdArray<f32>;
///
/// let device = Default::default();
/// let data = Tensor::<Backend, 3>::zeros([10, 10, 10], &device);
/// let image = Image::new(
///     data,
///     Point3::new([0.0, 0.0, 0.0]),
///     Spacing3::new([1.0, 1.0, 1.0]),
///     Direction3::identity(),
/// )
/// .unwrap();
/// assert_eq!(image.shape(), [10, 10, 10]);
/// ```
#[derive(Debug, Clone)]
pub struct Image<B: Backend, const D: usize> {
    data: Tensor<B, D>,
    grid: GridSpec<D>,
}

impl<B: Backend, const D: usize> Image<B, D> {
    /// Create a new image with the given data and metadata.
    ///
    /// # Errors
    /// Returns [`FieldError::InvalidGrid`] when the metadata is degenerate.
    pub fn new(
        data: Tensor<B, D>,
        origin: Point<D>,
        spacing: Spacing<D>,
        direction: Direction<D>,
    ) -> Result<Self> {
        let grid = GridSpec::new(data.dims(), origin, spacing, direction)?;
        Ok(Self { data, grid })
    }

    /// Attach data to an existing grid.
    ///
    /// # Errors
    /// Returns [`FieldError::ShapeMismatch`] when the tensor extent differs
    /// from the grid extent.
    pub fn from_grid(data: Tensor<B, D>, grid: GridSpec<D>) -> Result<Self> {
        let dims = data.dims();
        if dims != grid.shape() {
            return Err(FieldError::shape_mismatch(&grid.shape(), &dims));
        }
        Ok(Self { data, grid })
    }

    /// Replace the samples while keeping the geometry.
    pub fn with_data(&self, data: Tensor<B, D>) -> Result<Self> {
        Self::from_grid(data, self.grid.clone())
    }

    /// Get the image data tensor.
    pub fn data(&self) -> &Tensor<B, D> {
        &self.data
    }

    /// Consume the image, returning its samples.
    pub fn into_data(self) -> Tensor<B, D> {
        self.data
    }

    /// Geometry of the sampling grid.
    pub fn grid(&self) -> &GridSpec<D> {
        &self.grid
    }

    /// Get the origin (physical coordinate of first pixel).
    pub fn origin(&self) -> &Point<D> {
        self.grid.origin()
    }

    /// Get the spacing (physical distance between pixels).
    pub fn spacing(&self) -> &Spacing<D> {
        self.grid.spacing()
    }

    /// Get the direction (orientation matrix).
    pub fn direction(&self) -> &Direction<D> {
        self.grid.direction()
    }

    /// Get the image shape in tensor order.
    pub fn shape(&self) -> [usize; D] {
        self.grid.shape()
    }

    /// Device holding the samples.
    pub fn device(&self) -> B::Device {
        self.data.device()
    }

    /// Samples flattened in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone().into_data().iter::<f32>().collect()
    }

    /// Convert a continuous physical point to a continuous index.
    pub fn transform_physical_point_to_continuous_index(&self, point: &Point<D>) -> Point<D> {
        self.grid.physical_to_index(point)
    }

    /// Convert a continuous index to a physical point.
    pub fn transform_continuous_index_to_physical_point(&self, index: &Point<D>) -> Point<D> {
        self.grid.index_to_physical(index)
    }

    /// Batch transform physical points `[Batch, D]` to continuous indices.
    pub fn world_to_index_tensor(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        self.grid.world_to_index_tensor(points)
    }

    /// Batch transform continuous indices `[Batch, D]` to physical points.
    pub fn index_to_world_tensor(&self, indices: Tensor<B, 2>) -> Tensor<B, 2> {
        self.grid.index_to_world_tensor(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type Backend = NdArray<f32>;
    type Point3 = Point<3>;
    type Spacing3 = Spacing<3>;
    type Direction3 = Direction<3>;

    fn volume(origin: Point3, spacing: Spacing3) -> Image<Backend, 3> {
        let device = Default::default();
        let data = Tensor::<Backend, 3>::zeros([10, 10, 10], &device);
        Image::new(data, origin, spacing, Direction3::identity()).unwrap()
    }

    #[test]
    fn test_image_creation() {
        let origin = Point3::new([0.0, 0.0, 0.0]);
        let spacing = Spacing3::new([1.0, 1.0, 1.0]);
        let image = volume(origin, spacing);

        assert_eq!(image.shape(), [10, 10, 10]);
        assert_eq!(image.origin(), &origin);
        assert_eq!(image.spacing(), &spacing);
        assert_eq!(image.direction(), &Direction3::identity());
    }

    #[test]
    fn test_from_grid_rejects_wrong_extent() {
        let device = Default::default();
        let grid = GridSpec::<2>::from_shape([4, 4]).unwrap();
        let data = Tensor::<Backend, 2>::zeros([4, 5], &device);
        assert!(matches!(
            Image::from_grid(data, grid),
            Err(FieldError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_non_unit_spacing() {
        let image = volume(Point3::origin(), Spacing3::new([2.0, 2.0, 2.0]));
        let index = image.transform_physical_point_to_continuous_index(&Point3::new([10.0, 10.0, 10.0]));

        assert!((index[0] - 5.0).abs() < 1e-6);
        assert!((index[1] - 5.0).abs() < 1e-6);
        assert!((index[2] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_non_zero_origin_roundtrip() {
        let image = volume(Point3::new([10.0, 20.0, 30.0]), Spacing3::uniform(1.0));
        let point = Point3::new([15.0, 25.5, 35.0]);
        let index = image.transform_physical_point_to_continuous_index(&point);
        assert!((index[1] - 5.5).abs() < 1e-6);

        let back = image.transform_continuous_index_to_physical_point(&index);
        assert!((back - point).norm() < 1e-9);
    }

    #[test]
    fn test_to_vec_row_major() {
        let device = Default::default();
        let data = Tensor::<Backend, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);
        let image = Image::new(data, Point::origin(), Spacing::uniform(1.0), Direction::identity()).unwrap();
        assert_eq!(image.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
