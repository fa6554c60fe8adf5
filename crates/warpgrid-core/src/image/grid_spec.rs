//! Reference grid geometry.
//!
//! A [`GridSpec`] is the extent, origin, spacing and direction of a sampling
//! lattice. Images and deformation fields both carry one, and the field
//! resampler takes one as its target.
//!
//! # Axis convention
//! `shape` is stored in tensor order (`[D, H, W]` for 3D). Physical and index
//! axis `i` (x first) is tensor dimension `D - 1 - i`, so x is the
//! fastest-varying dimension of the row-major buffer.

use burn::tensor::{Tensor, TensorData, Shape};
use burn::tensor::backend::Backend;

use crate::error::{FieldError, Result};
use crate::image::grid::generate_grid;
use crate::spatial::{Direction, Point, Spacing, Vector};

/// Geometry of a D-dimensional sampling grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec<const D: usize> {
    shape: [usize; D],
    origin: Point<D>,
    spacing: Spacing<D>,
    direction: Direction<D>,
    inverse_direction: Direction<D>,
}

impl<const D: usize> GridSpec<D> {
    /// Create a grid, validating its geometry.
    ///
    /// # Errors
    /// Returns [`FieldError::InvalidGrid`] for a zero extent, a non-positive or
    /// non-finite spacing, or a singular direction matrix.
    pub fn new(
        shape: [usize; D],
        origin: Point<D>,
        spacing: Spacing<D>,
        direction: Direction<D>,
    ) -> Result<Self> {
        if shape.iter().any(|&s| s == 0) {
            return Err(FieldError::invalid_grid(format!("zero extent in shape {:?}", shape)));
        }
        if !spacing.is_valid_spacing() {
            return Err(FieldError::invalid_grid(format!(
                "spacing must be finite and positive, got {:?}",
                spacing.to_array()
            )));
        }
        if (0..D).any(|i| !origin[i].is_finite()) {
            return Err(FieldError::invalid_grid("origin must be finite"));
        }
        let inverse_direction = direction
            .try_inverse()
            .ok_or_else(|| FieldError::invalid_grid("direction matrix is singular"))?;

        Ok(Self {
            shape,
            origin,
            spacing,
            direction,
            inverse_direction,
        })
    }

    /// Unit spacing, zero origin and identity direction.
    pub fn from_shape(shape: [usize; D]) -> Result<Self> {
        Self::new(shape, Point::origin(), Spacing::uniform(1.0), Direction::identity())
    }

    /// Same geometry with a different extent.
    pub fn with_shape(&self, shape: [usize; D]) -> Result<Self> {
        Self::new(shape, self.origin, self.spacing, self.direction)
    }

    /// Same extent and direction with new origin and spacing.
    pub fn with_origin_spacing(&self, origin: Point<D>, spacing: Spacing<D>) -> Result<Self> {
        Self::new(self.shape, origin, spacing, self.direction)
    }

    /// Extent in tensor order.
    pub fn shape(&self) -> [usize; D] {
        self.shape
    }

    /// Number of samples along physical axis `axis`.
    pub fn size(&self, axis: usize) -> usize {
        self.shape[D - 1 - axis]
    }

    /// Total number of grid points.
    pub fn num_points(&self) -> usize {
        self.shape.iter().product()
    }

    /// Physical coordinate of index zero.
    pub fn origin(&self) -> &Point<D> {
        &self.origin
    }

    /// Physical distance between adjacent samples along each axis.
    pub fn spacing(&self) -> &Spacing<D> {
        &self.spacing
    }

    /// Orientation of the grid axes.
    pub fn direction(&self) -> &Direction<D> {
        &self.direction
    }

    /// Map a continuous index to a physical point.
    ///
    /// `point = origin + Direction * (index * spacing)`
    pub fn index_to_physical(&self, index: &Point<D>) -> Point<D> {
        let scaled = index.coords().component_mul(&self.spacing);
        self.origin + self.direction * scaled
    }

    /// Map a physical point to a continuous index.
    ///
    /// `index = (Direction^-1 * (point - origin)) / spacing`
    pub fn physical_to_index(&self, point: &Point<D>) -> Point<D> {
        let rotated = self.inverse_direction * (*point - self.origin);
        Point::origin() + rotated.component_div(&self.spacing)
    }

    /// Convert a vector expressed in physical units to grid (index) units.
    pub fn physical_vector_to_index(&self, vector: &Vector<D>) -> Vector<D> {
        (self.inverse_direction * *vector).component_div(&self.spacing)
    }

    /// Convert a vector expressed in grid (index) units to physical units.
    pub fn index_vector_to_physical(&self, vector: &Vector<D>) -> Vector<D> {
        self.direction * vector.component_mul(&self.spacing)
    }

    /// True when the continuous index lies within the sampled extent.
    pub fn contains_index(&self, index: &Point<D>, tolerance: f64) -> bool {
        (0..D).all(|axis| {
            let upper = (self.size(axis) - 1) as f64;
            index[axis] >= -tolerance && index[axis] <= upper + tolerance
        })
    }

    /// True when the physical point maps inside the sampled extent.
    pub fn contains_point(&self, point: &Point<D>) -> bool {
        self.contains_index(&self.physical_to_index(point), 1e-6)
    }

    /// Compare two grids with an absolute tolerance on the metadata.
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        if self.shape != other.shape {
            return false;
        }
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance;
        (0..D).all(|i| close(self.origin[i], other.origin[i]))
            && (0..D).all(|i| close(self.spacing[i], other.spacing[i]))
            && (0..D).all(|r| (0..D).all(|c| close(self.direction[(r, c)], other.direction[(r, c)])))
    }

    /// Batch transform physical points `[Batch, D]` to continuous indices.
    pub fn world_to_index_tensor<B: Backend>(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = points.device();
        let origin = self.origin_tensor::<B>(&device);
        (points - origin).matmul(self.to_index_matrix::<B>(&device))
    }

    /// Batch transform continuous indices `[Batch, D]` to physical points.
    pub fn index_to_world_tensor<B: Backend>(&self, indices: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = indices.device();
        let origin = self.origin_tensor::<B>(&device);
        indices.matmul(self.to_physical_matrix::<B>(&device)) + origin
    }

    /// Convert index-space gradients `[Batch, D]` into physical-space gradients.
    ///
    /// `g_phys = Direction^-T * S^-1 * g_index`, applied row-wise.
    pub fn index_gradient_to_physical_tensor<B: Backend>(&self, gradients: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = gradients.device();
        let mut m_data = Vec::with_capacity(D * D);
        for r in 0..D {
            for c in 0..D {
                m_data.push((self.inverse_direction[(r, c)] / self.spacing[r]) as f32);
            }
        }
        let m = Tensor::<B, 2>::from_data(TensorData::new(m_data, Shape::new([D, D])), &device);
        gradients.matmul(m)
    }

    /// Convert physical vectors `[Batch, D]` to index units.
    pub fn physical_vectors_to_index_tensor<B: Backend>(&self, vectors: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = vectors.device();
        vectors.matmul(self.to_index_matrix::<B>(&device))
    }

    /// Convert index-unit vectors `[Batch, D]` to physical units.
    pub fn index_vectors_to_physical_tensor<B: Backend>(&self, vectors: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = vectors.device();
        vectors.matmul(self.to_physical_matrix::<B>(&device))
    }

    /// Physical coordinates of every grid point, `[N, D]` in row-major order.
    pub fn physical_points<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        self.index_to_world_tensor(generate_grid::<B, D>(self.shape, device))
    }

    // P = O + I @ M with M[r, c] = S[r] * D[c, r]
    fn to_physical_matrix<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let mut m_data = Vec::with_capacity(D * D);
        for r in 0..D {
            for c in 0..D {
                m_data.push((self.spacing[r] * self.direction[(c, r)]) as f32);
            }
        }
        Tensor::<B, 2>::from_data(TensorData::new(m_data, Shape::new([D, D])), device)
    }

    // I = (P - O) @ T with T[r, c] = (D^-1)[c, r] / S[c]
    fn to_index_matrix<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let mut t_data = Vec::with_capacity(D * D);
        for r in 0..D {
            for c in 0..D {
                t_data.push((self.inverse_direction[(c, r)] / self.spacing[c]) as f32);
            }
        }
        Tensor::<B, 2>::from_data(TensorData::new(t_data, Shape::new([D, D])), device)
    }

    fn origin_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_data(
            TensorData::new(self.origin.to_f32_array().to_vec(), Shape::new([D])),
            device,
        )
        .reshape([1, D])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn rotated_grid() -> GridSpec<2> {
        let mut direction = Direction::<2>::zeros();
        direction[(0, 1)] = -1.0;
        direction[(1, 0)] = 1.0;
        GridSpec::new(
            [4, 6],
            Point::new([10.0, -5.0]),
            Spacing::new([0.5, 2.0]),
            direction,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_grids_rejected() {
        assert!(GridSpec::<2>::from_shape([0, 3]).is_err());
        assert!(GridSpec::new([2, 2], Point::origin(), Spacing::new([1.0, 0.0]), Direction::identity()).is_err());
        assert!(GridSpec::new([2, 2], Point::origin(), Spacing::uniform(1.0), Direction::zeros()).is_err());
    }

    #[test]
    fn test_axis_sizes_follow_tensor_order() {
        let grid = GridSpec::<3>::from_shape([2, 3, 4]).unwrap();
        assert_eq!(grid.size(0), 4);
        assert_eq!(grid.size(1), 3);
        assert_eq!(grid.size(2), 2);
        assert_eq!(grid.num_points(), 24);
    }

    #[test]
    fn test_point_mapping_roundtrip() {
        let grid = rotated_grid();
        let index = Point::new([1.5, 2.25]);
        let point = grid.index_to_physical(&index);
        let back = grid.physical_to_index(&point);
        assert!((back[0] - 1.5).abs() < 1e-12);
        assert!((back[1] - 2.25).abs() < 1e-12);
    }

    #[test]
    fn test_vector_unit_conversion() {
        let grid = rotated_grid();
        let v = Vector::new([1.0, 3.0]);
        let idx = grid.physical_vector_to_index(&v);
        let back = grid.index_vector_to_physical(&idx);
        assert!((back - v).norm() < 1e-12);
    }

    #[test]
    fn test_tensor_mapping_matches_scalar_mapping() {
        let device = Default::default();
        let grid = rotated_grid();
        let indices = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [3.0, 0.5]], &device);
        let points = grid.index_to_world_tensor(indices.clone());
        let data = points.clone().into_data();
        let values = data.as_slice::<f32>().unwrap();

        let expected = grid.index_to_physical(&Point::new([1.0, 2.0]));
        assert!((values[0] as f64 - expected[0]).abs() < 1e-5);
        assert!((values[1] as f64 - expected[1]).abs() < 1e-5);

        let back = grid.world_to_index_tensor(points);
        let diff = (back - indices).abs().max().into_scalar();
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_physical_gradient_scaling() {
        let device = Default::default();
        let grid = GridSpec::new([3, 3], Point::origin(), Spacing::new([2.0, 4.0]), Direction::identity()).unwrap();
        let g = Tensor::<TestBackend, 2>::from_floats([[2.0, 4.0]], &device);
        let data = grid.index_gradient_to_physical_tensor(g).into_data();
        assert_eq!(data.as_slice::<f32>().unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn test_contains_and_approx_eq() {
        let grid = GridSpec::<2>::from_shape([3, 5]).unwrap();
        assert!(grid.contains_point(&Point::new([4.0, 2.0])));
        assert!(!grid.contains_point(&Point::new([4.5, 2.0])));

        let nudged = grid
            .with_origin_spacing(Point::new([1e-9, 0.0]), Spacing::uniform(1.0))
            .unwrap();
        assert!(grid.approx_eq(&nudged, 1e-6));
        assert!(!grid.approx_eq(&grid.with_shape([3, 4]).unwrap(), 1e-6));
    }
}
