//! Per-level solver strategies.
//!
//! A [`SolverStrategy`] refines a deformation field on one pyramid level.
//! Two families are provided:
//! * [`VoxelPdeSolver`] iterates a per-voxel force + diffusion update.
//! * [`MeshLoadSolver`] assembles nodal loads on a regular mesh and solves a
//!   linear elastic system for each increment.

pub mod pde;
pub mod mesh;

pub use pde::{PdeSolverConfig, PdeUpdateRule, VoxelPdeSolver};
pub use mesh::{IntegrationPoint, MeshSolverConfig, MeshLoadSolver, RegularMesh};

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use warpgrid_core::filter::GaussianFilter;
use warpgrid_core::{DeformationField, GridSpec, Image, Spacing};

use crate::error::Result;
use crate::monitor::SolveMonitor;

/// Refines a deformation field at one resolution.
///
/// Selected at configuration time and never re-bound mid-run. The field is
/// handed over by value for the duration of the solve and returned refined.
pub trait SolverStrategy<B: Backend, const D: usize> {
    /// Registry name of the strategy.
    fn name(&self) -> &'static str;

    /// Run `iterations` refinement steps.
    ///
    /// The initial field must be defined on the fixed image's grid. Zero
    /// iterations return it unchanged. The monitor is checked for
    /// cancellation before every iteration and receives the energy after it.
    fn solve(
        &mut self,
        fixed: &Image<B, D>,
        moving: &Image<B, D>,
        initial: DeformationField<B, D>,
        iterations: usize,
        monitor: &SolveMonitor<'_>,
    ) -> Result<DeformationField<B, D>>;

    /// [`solve`](Self::solve) without progress reporting or cancellation.
    fn run(
        &mut self,
        fixed: &Image<B, D>,
        moving: &Image<B, D>,
        initial: DeformationField<B, D>,
        iterations: usize,
    ) -> Result<DeformationField<B, D>> {
        self.solve(fixed, moving, initial, iterations, &SolveMonitor::detached())
    }

    /// Aggregate metric value after the last completed iteration, if any.
    fn current_energy(&self) -> Option<f64>;
}

/// Gaussian-smooth flattened `[N, D]` vectors laid out on `grid`.
///
/// `sigma` is in voxels; values `<= 0` return the input.
pub(crate) fn smooth_vectors<B: Backend, const D: usize>(
    vectors: Tensor<B, 2>,
    grid: &GridSpec<D>,
    sigma: f64,
) -> Tensor<B, 2> {
    if sigma <= 0.0 {
        return vectors;
    }
    let n = grid.num_points();
    let filter = GaussianFilter::<B>::new(vec![sigma]);
    let voxel = Spacing::<D>::uniform(1.0);

    let columns = (0..D)
        .map(|axis| {
            let component = vectors.clone().narrow(1, axis, 1).reshape(grid.shape());
            filter.apply_tensor(component, &voxel).reshape([n, 1])
        })
        .collect();
    Tensor::cat(columns, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_smooth_vectors_keeps_constant_field() {
        let device = Default::default();
        let grid = GridSpec::<2>::from_shape([6, 7]).unwrap();
        let n = grid.num_points();
        let column_x = Tensor::<TestBackend, 2>::full([n, 1], 1.5, &device);
        let column_y = Tensor::<TestBackend, 2>::full([n, 1], -0.5, &device);
        let vectors = Tensor::cat(vec![column_x, column_y], 1);

        let smoothed = smooth_vectors(vectors, &grid, 1.5);
        assert_eq!(smoothed.dims(), [n, 2]);
        for row in smoothed.into_data().iter::<f32>().collect::<Vec<_>>().chunks(2) {
            assert!((row[0] - 1.5).abs() < 1e-5);
            assert!((row[1] + 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_smooth_vectors_spreads_impulse() {
        let device = Default::default();
        let grid = GridSpec::<2>::from_shape([5, 5]).unwrap();
        let mut values = vec![0.0f32; 50];
        values[2 * 12] = 1.0; // x component at the centre voxel
        let vectors = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([25, 2]);

        let smoothed: Vec<f32> = smooth_vectors(vectors, &grid, 1.0).into_data().iter::<f32>().collect();
        assert!(smoothed[2 * 12] < 1.0);
        assert!(smoothed[2 * 13] > 0.0);
        assert!(smoothed.iter().skip(1).step_by(2).all(|v| v.abs() < 1e-7));
    }
}
