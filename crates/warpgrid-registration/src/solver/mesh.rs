//! Finite-element load solver.
//!
//! The fixed grid is covered by a regular mesh of multilinear
//! quadrilateral/hexahedral elements. Each iteration samples the metric force
//! at the Gauss points of every element, spreads it onto the element's nodes
//! as a load vector and solves the semi-implicit elastic step
//! `(K + I/tau) du = gamma * f - K u` with Jacobi-preconditioned conjugate
//! gradients. Nodal displacements are projected back onto the voxels when
//! the level finishes.
//!
//! Metric loads grow with the square of the image intensities, so they are
//! rescaled once per level: the strongest nodal load of the first iteration
//! maps to `gamma` element widths of rigid motion. Later iterations reuse that
//! scale, letting the loads decay as the images align.

use burn::config::Config;
use burn::tensor::{Shape, Tensor, TensorData};
use burn::tensor::backend::Backend;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use warpgrid_core::image::unflatten_offset;
use warpgrid_core::interpolation::{Interpolator, LinearInterpolator};
use warpgrid_core::spatial::{Point, Vector};
use warpgrid_core::{DeformationField, FieldUnits, GridSpec, Image};

use super::SolverStrategy;
use crate::error::{self, RegistrationError};
use crate::force::MetricForceEvaluator;
use crate::metric::LocalMetric;
use crate::monitor::SolveMonitor;
use crate::validation::{validate_field_grid, validate_positive, ConvergenceChecker};

/// Configuration for [`MeshLoadSolver`].
#[derive(Config, Debug, PartialEq)]
pub struct MeshSolverConfig {
    /// Element edge length in voxels of the level being solved.
    #[config(default = "4")]
    pub element_size: usize,
    /// Gauss-Legendre points per element axis (1 to 3).
    #[config(default = "2")]
    pub integration_order: usize,
    #[config(default = "1.0")]
    pub youngs_modulus: f64,
    #[config(default = "0.3")]
    pub poisson_ratio: f64,
    /// Scale of the metric load, in element widths of motion produced by
    /// the strongest load of a level's first iteration.
    #[config(default = "0.5")]
    pub gamma: f64,
    /// Semi-implicit time step; smaller values damp each increment.
    #[config(default = "1.0")]
    pub time_step: f64,
    /// Largest admissible nodal increment, in element widths. Larger
    /// increments abort the run.
    #[config(default = "10.0")]
    pub max_increment: f64,
    /// Relative residual at which the linear solve stops.
    #[config(default = "1e-6")]
    pub cg_tolerance: f64,
    #[config(default = "200")]
    pub cg_max_iterations: usize,
    /// Stop a level early once the energy improves by less than this
    /// (relative) over `energy_patience` iterations.
    pub energy_tolerance: Option<f64>,
    #[config(default = "3")]
    pub energy_patience: usize,
}

impl MeshSolverConfig {
    /// Check all tunables.
    pub fn validate(&self) -> error::Result<()> {
        if self.element_size == 0 {
            return Err(RegistrationError::configuration("element_size must be at least 1"));
        }
        if !(1..=3).contains(&self.integration_order) {
            return Err(RegistrationError::configuration(format!(
                "integration_order must be 1, 2 or 3, got {}",
                self.integration_order
            )));
        }
        validate_positive("youngs_modulus", self.youngs_modulus)?;
        if !(self.poisson_ratio > -1.0 && self.poisson_ratio < 0.5) {
            return Err(RegistrationError::configuration(format!(
                "poisson_ratio must lie in (-1, 0.5), got {}",
                self.poisson_ratio
            )));
        }
        validate_positive("gamma", self.gamma)?;
        validate_positive("time_step", self.time_step)?;
        validate_positive("max_increment", self.max_increment)?;
        validate_positive("cg_tolerance", self.cg_tolerance)?;
        if self.cg_max_iterations == 0 {
            return Err(RegistrationError::configuration("cg_max_iterations must be at least 1"));
        }
        if let Some(tolerance) = self.energy_tolerance {
            validate_positive("energy_tolerance", tolerance)?;
        }
        Ok(())
    }
}

/// Gauss-Legendre points and weights on `[0, 1]`.
pub fn gauss_legendre(order: usize) -> error::Result<(Vec<f64>, Vec<f64>)> {
    match order {
        1 => Ok((vec![0.5], vec![1.0])),
        2 => {
            let d = 0.5 / 3f64.sqrt();
            Ok((vec![0.5 - d, 0.5 + d], vec![0.5, 0.5]))
        }
        3 => {
            let d = 0.5 * 0.6f64.sqrt();
            Ok((vec![0.5 - d, 0.5, 0.5 + d], vec![5.0 / 18.0, 4.0 / 9.0, 5.0 / 18.0]))
        }
        _ => Err(RegistrationError::configuration(format!(
            "no Gauss-Legendre rule of order {}",
            order
        ))),
    }
}

/// A sampling location inside one mesh element.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationPoint<const D: usize> {
    /// Physical location.
    pub position: Point<D>,
    /// Nodes of the enclosing element, one per element corner.
    pub nodes: Vec<usize>,
    /// Shape function value of each node at the point; sums to one.
    pub weights: Vec<f64>,
    /// Quadrature weight times the element's physical volume.
    pub volume_weight: f64,
}

/// Regular mesh covering a grid, with nodes on the grid's first and last
/// voxel along every axis.
#[derive(Debug, Clone)]
pub struct RegularMesh<const D: usize> {
    grid: GridSpec<D>,
    nodes_per_axis: [usize; D],
    node_step: [f64; D],
}

impl<const D: usize> RegularMesh<D> {
    /// Mesh `grid` with elements about `element_size` voxels wide.
    ///
    /// # Errors
    /// Returns [`RegistrationError::Configuration`] for a zero element size or
    /// when an axis has fewer than two voxels.
    pub fn new(grid: &GridSpec<D>, element_size: usize) -> error::Result<Self> {
        if element_size == 0 {
            return Err(RegistrationError::configuration("element_size must be at least 1"));
        }
        let mut nodes_per_axis = [0; D];
        let mut node_step = [0.0; D];
        for axis in 0..D {
            let len = grid.size(axis);
            if len < 2 {
                return Err(RegistrationError::configuration(format!(
                    "mesh needs at least two voxels along axis {}, got {}",
                    axis, len
                )));
            }
            let elements = (len - 1).div_ceil(element_size);
            nodes_per_axis[axis] = elements + 1;
            node_step[axis] = (len - 1) as f64 / elements as f64;
        }
        Ok(Self {
            grid: grid.clone(),
            nodes_per_axis,
            node_step,
        })
    }

    pub fn nodes_per_axis(&self) -> [usize; D] {
        self.nodes_per_axis
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes_per_axis.iter().product()
    }

    pub fn num_elements(&self) -> usize {
        self.nodes_per_axis.iter().map(|n| n - 1).product()
    }

    /// Distance between neighbouring nodes in voxels.
    pub fn node_step(&self) -> [f64; D] {
        self.node_step
    }

    /// Physical edge length of an element along each axis.
    pub fn element_extent(&self) -> Vector<D> {
        let spacing = self.grid.spacing();
        Vector::new(std::array::from_fn(|axis| self.node_step[axis] * spacing[axis]))
    }

    /// Physical location of a node.
    pub fn node_position(&self, node: usize) -> Point<D> {
        let coords = self.node_coords(node);
        let index = Point::new(std::array::from_fn(|axis| coords[axis] as f64 * self.node_step[axis]));
        self.grid.index_to_physical(&index)
    }

    /// Integration points of every element, element by element.
    ///
    /// Points of element `e` occupy indices `e * order^D .. (e + 1) * order^D`.
    pub fn integration_points(&self, order: usize) -> error::Result<Vec<IntegrationPoint<D>>> {
        let (abscissae, weights) = gauss_legendre(order)?;
        let per_element = order.pow(D as u32);
        let volume = self.element_volume();
        let element_counts: [usize; D] = std::array::from_fn(|axis| self.nodes_per_axis[axis] - 1);

        let mut points = Vec::with_capacity(self.num_elements() * per_element);
        for element in 0..self.num_elements() {
            let origin = Self::coords_in(&element_counts, element);
            let nodes: Vec<usize> = (0..1usize << D)
                .map(|corner| self.node_offset(&Self::corner_of(&origin, corner)))
                .collect();

            for g in 0..per_element {
                let mut xi = [0.0; D];
                let mut weight = 1.0;
                let mut rem = g;
                for axis in 0..D {
                    xi[axis] = abscissae[rem % order];
                    weight *= weights[rem % order];
                    rem /= order;
                }
                let index = Point::new(std::array::from_fn(|axis| {
                    (origin[axis] as f64 + xi[axis]) * self.node_step[axis]
                }));
                points.push(IntegrationPoint {
                    position: self.grid.index_to_physical(&index),
                    nodes: nodes.clone(),
                    weights: (0..1usize << D).map(|corner| shape_value(&xi, corner)).collect(),
                    volume_weight: weight * volume,
                });
            }
        }
        Ok(points)
    }

    /// Element stiffness matrix of isotropic linear elasticity.
    ///
    /// All elements share it. Degrees of freedom are ordered corner-major:
    /// `corner * D + axis`.
    pub fn element_stiffness(&self, youngs_modulus: f64, poisson_ratio: f64) -> error::Result<DMatrix<f64>> {
        let lambda = youngs_modulus * poisson_ratio / ((1.0 + poisson_ratio) * (1.0 - 2.0 * poisson_ratio));
        let mu = youngs_modulus / (2.0 * (1.0 + poisson_ratio));

        let corners = 1usize << D;
        let dofs = corners * D;
        let shear: Vec<(usize, usize)> = (0..D).flat_map(|i| (i + 1..D).map(move |j| (i, j))).collect();
        let voigt = D + shear.len();

        let mut c = DMatrix::<f64>::zeros(voigt, voigt);
        for i in 0..D {
            for j in 0..D {
                c[(i, j)] = if i == j { lambda + 2.0 * mu } else { lambda };
            }
        }
        for s in 0..shear.len() {
            c[(D + s, D + s)] = mu;
        }

        // d(physical) / d(local) for the unit element.
        let direction = self.grid.direction();
        let spacing = self.grid.spacing();
        let jacobian = DMatrix::<f64>::from_fn(D, D, |r, col| {
            direction[(r, col)] * spacing[col] * self.node_step[col]
        });
        let det = jacobian.determinant().abs();
        let inverse_t = jacobian
            .try_inverse()
            .ok_or_else(|| RegistrationError::numerical_instability("singular element Jacobian"))?
            .transpose();

        let (abscissae, weights) = gauss_legendre(2)?;
        let mut stiffness = DMatrix::<f64>::zeros(dofs, dofs);
        for g in 0..2usize.pow(D as u32) {
            let mut xi = [0.0; D];
            let mut weight = 1.0;
            for axis in 0..D {
                let k = (g >> axis) & 1;
                xi[axis] = abscissae[k];
                weight *= weights[k];
            }

            let mut strain = DMatrix::<f64>::zeros(voigt, dofs);
            for corner in 0..corners {
                let local = DVector::<f64>::from_fn(D, |axis, _| shape_derivative(&xi, corner, axis));
                let grad = &inverse_t * local;
                for i in 0..D {
                    strain[(i, corner * D + i)] = grad[i];
                }
                for (s, &(i, j)) in shear.iter().enumerate() {
                    strain[(D + s, corner * D + i)] = grad[j];
                    strain[(D + s, corner * D + j)] = grad[i];
                }
            }
            stiffness += strain.transpose() * &c * &strain * (weight * det);
        }
        Ok(stiffness)
    }

    /// `output = (K + shift * I) input` for the assembled global stiffness
    /// `K`, without forming it. Vectors hold `D` values per node.
    pub fn apply_stiffness(&self, element: &DMatrix<f64>, input: &[f64], output: &mut [f64], shift: f64) {
        output.par_chunks_mut(D).enumerate().for_each(|(node, out)| {
            for i in 0..D {
                out[i] = shift * input[node * D + i];
            }
            self.for_each_element_of(node, |origin, corner| {
                for other in 0..1usize << D {
                    let neighbour = self.node_offset(&Self::corner_of(&origin, other));
                    for i in 0..D {
                        for j in 0..D {
                            out[i] += element[(corner * D + i, other * D + j)] * input[neighbour * D + j];
                        }
                    }
                }
            });
        });
    }

    /// Diagonal of `K + shift * I`.
    pub fn stiffness_diagonal(&self, element: &DMatrix<f64>, shift: f64) -> DVector<f64> {
        let mut diagonal = DVector::<f64>::zeros(self.num_nodes() * D);
        diagonal.as_mut_slice().par_chunks_mut(D).enumerate().for_each(|(node, out)| {
            for value in out.iter_mut() {
                *value = shift;
            }
            self.for_each_element_of(node, |_, corner| {
                for i in 0..D {
                    out[i] += element[(corner * D + i, corner * D + i)];
                }
            });
        });
        diagonal
    }

    /// Nodal loads from forces at the points of
    /// [`integration_points`](Self::integration_points) (`D` values each).
    pub fn assemble_loads(&self, points: &[IntegrationPoint<D>], forces: &[f32]) -> DVector<f64> {
        let per_element = points.len() / self.num_elements().max(1);
        let element_counts: [usize; D] = std::array::from_fn(|axis| self.nodes_per_axis[axis] - 1);

        let mut loads = DVector::<f64>::zeros(self.num_nodes() * D);
        loads.as_mut_slice().par_chunks_mut(D).enumerate().for_each(|(node, out)| {
            self.for_each_element_of(node, |origin, corner| {
                let element = Self::offset_in(&element_counts, &origin);
                for p in element * per_element..(element + 1) * per_element {
                    let point = &points[p];
                    let weight = point.weights[corner] * point.volume_weight;
                    for i in 0..D {
                        out[i] += weight * forces[p * D + i] as f64;
                    }
                }
            });
        });
        loads
    }

    /// Displacement at a continuous voxel index, interpolated from nodal values.
    pub fn interpolate(&self, nodal: &[f64], index: &[f64; D]) -> [f64; D] {
        let mut origin = [0usize; D];
        let mut xi = [0.0; D];
        for axis in 0..D {
            let m = index[axis] / self.node_step[axis];
            let last = (self.nodes_per_axis[axis] - 2) as f64;
            let e = m.floor().clamp(0.0, last);
            origin[axis] = e as usize;
            xi[axis] = (m - e).clamp(0.0, 1.0);
        }

        let mut value = [0.0; D];
        for corner in 0..1usize << D {
            let weight = shape_value(&xi, corner);
            let node = self.node_offset(&Self::corner_of(&origin, corner));
            for i in 0..D {
                value[i] += weight * nodal[node * D + i];
            }
        }
        value
    }

    /// Nodal values interpolated at every voxel of the grid, `N * D` values
    /// in row-major grid order.
    pub fn project(&self, nodal: &[f64]) -> Vec<f32> {
        let shape = self.grid.shape();
        let mut voxels = vec![0.0f32; self.grid.num_points() * D];
        voxels.par_chunks_mut(D).enumerate().for_each(|(offset, out)| {
            let index = unflatten_offset(&shape, offset);
            let value = self.interpolate(nodal, &std::array::from_fn(|axis| index[axis] as f64));
            for i in 0..D {
                out[i] = value[i] as f32;
            }
        });
        voxels
    }

    fn element_volume(&self) -> f64 {
        let extent = self.element_extent();
        (0..D).map(|axis| extent[axis]).product::<f64>() * self.grid.direction().determinant().abs()
    }

    // Calls `f(element_origin, local_corner)` for every element touching `node`.
    fn for_each_element_of<F: FnMut([usize; D], usize)>(&self, node: usize, mut f: F) {
        let coords = self.node_coords(node);
        'corners: for corner in 0..1usize << D {
            let mut origin = [0usize; D];
            for axis in 0..D {
                let bit = (corner >> axis) & 1;
                if coords[axis] < bit || coords[axis] - bit >= self.nodes_per_axis[axis] - 1 {
                    continue 'corners;
                }
                origin[axis] = coords[axis] - bit;
            }
            f(origin, corner);
        }
    }

    fn node_offset(&self, coords: &[usize; D]) -> usize {
        Self::offset_in(&self.nodes_per_axis, coords)
    }

    fn node_coords(&self, node: usize) -> [usize; D] {
        Self::coords_in(&self.nodes_per_axis, node)
    }

    fn corner_of(origin: &[usize; D], corner: usize) -> [usize; D] {
        std::array::from_fn(|axis| origin[axis] + ((corner >> axis) & 1))
    }

    // Counts are per physical axis, x first and fastest.
    fn offset_in(counts: &[usize; D], coords: &[usize; D]) -> usize {
        let mut offset = 0;
        let mut stride = 1;
        for axis in 0..D {
            offset += coords[axis] * stride;
            stride *= counts[axis];
        }
        offset
    }

    fn coords_in(counts: &[usize; D], offset: usize) -> [usize; D] {
        let mut rem = offset;
        std::array::from_fn(|axis| {
            let c = rem % counts[axis];
            rem /= counts[axis];
            c
        })
    }
}

fn shape_value<const D: usize>(xi: &[f64; D], corner: usize) -> f64 {
    (0..D)
        .map(|axis| if (corner >> axis) & 1 == 1 { xi[axis] } else { 1.0 - xi[axis] })
        .product()
}

fn shape_derivative<const D: usize>(xi: &[f64; D], corner: usize, wrt: usize) -> f64 {
    (0..D)
        .map(|axis| {
            let upper = (corner >> axis) & 1 == 1;
            match (axis == wrt, upper) {
                (true, true) => 1.0,
                (true, false) => -1.0,
                (false, true) => xi[axis],
                (false, false) => 1.0 - xi[axis],
            }
        })
        .product()
}

/// Outcome of a conjugate-gradient solve.
#[derive(Debug, Clone)]
pub struct LinearSolve {
    pub solution: DVector<f64>,
    pub iterations: usize,
    /// Final residual norm relative to the right-hand side.
    pub relative_residual: f64,
    pub converged: bool,
}

/// Jacobi-preconditioned conjugate gradients for a symmetric positive
/// definite operator, starting from zero.
pub fn conjugate_gradient<F>(
    apply: F,
    rhs: &DVector<f64>,
    diagonal: &DVector<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> LinearSolve
where
    F: Fn(&DVector<f64>, &mut DVector<f64>),
{
    let n = rhs.len();
    let mut x = DVector::<f64>::zeros(n);
    let rhs_norm = rhs.norm();
    if rhs_norm < 1e-30 {
        return LinearSolve {
            solution: x,
            iterations: 0,
            relative_residual: 0.0,
            converged: true,
        };
    }

    let inverse_diagonal = diagonal.map(|d| if d.abs() > 1e-30 { 1.0 / d } else { 1.0 });
    let mut r = rhs.clone();
    let mut z = r.component_mul(&inverse_diagonal);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    let mut ap = DVector::<f64>::zeros(n);

    let mut relative_residual = 1.0;
    for iteration in 1..=max_iterations {
        apply(&p, &mut ap);
        let pap = p.dot(&ap);
        if pap.abs() < 1e-300 {
            return LinearSolve {
                solution: x,
                iterations: iteration,
                relative_residual,
                converged: false,
            };
        }

        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);

        relative_residual = r.norm() / rhs_norm;
        if relative_residual <= tolerance {
            return LinearSolve {
                solution: x,
                iterations: iteration,
                relative_residual,
                converged: true,
            };
        }

        z = r.component_mul(&inverse_diagonal);
        let rz_next = r.dot(&z);
        p = &z + &p * (rz_next / rz);
        rz = rz_next;
    }

    LinearSolve {
        solution: x,
        iterations: max_iterations,
        relative_residual,
        converged: false,
    }
}

/// Largest per-node vector norm of an interleaved nodal vector. NaN if any
/// component is NaN.
fn largest_nodal_norm<const D: usize>(values: &[f64]) -> f64 {
    values
        .chunks(D)
        .map(|v| v.iter().map(|c| c * c).sum::<f64>().sqrt())
        .fold(0.0f64, |acc, m| if m.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(m) })
}

/// Treats the field as nodal displacements of a regular elastic mesh driven
/// by metric loads.
pub struct MeshLoadSolver<B: Backend, const D: usize, I = LinearInterpolator> {
    config: MeshSolverConfig,
    metric: Box<dyn LocalMetric<B> + Send + Sync>,
    interpolator: I,
    radius: [usize; D],
    maximize: Option<bool>,
    energy: Option<f64>,
    energy_history: Vec<f64>,
}

impl<B: Backend, const D: usize> MeshLoadSolver<B, D, LinearInterpolator> {
    /// Create a solver sampling images with linear interpolation.
    ///
    /// # Errors
    /// Returns [`RegistrationError::Configuration`] when the configuration is
    /// invalid.
    pub fn new(
        config: MeshSolverConfig,
        metric: Box<dyn LocalMetric<B> + Send + Sync>,
        radius: [usize; D],
    ) -> error::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metric,
            interpolator: LinearInterpolator::new(),
            radius,
            maximize: None,
            energy: None,
            energy_history: Vec::new(),
        })
    }
}

impl<B: Backend, const D: usize, I: Interpolator<B>> MeshLoadSolver<B, D, I> {
    /// Swap the image interpolator.
    pub fn with_interpolator<J: Interpolator<B>>(self, interpolator: J) -> MeshLoadSolver<B, D, J> {
        MeshLoadSolver {
            config: self.config,
            metric: self.metric,
            interpolator,
            radius: self.radius,
            maximize: self.maximize,
            energy: self.energy,
            energy_history: self.energy_history,
        }
    }

    /// Override the metric's maximize convention.
    pub fn with_maximize(mut self, maximize: bool) -> Self {
        self.maximize = Some(maximize);
        self
    }

    pub fn config(&self) -> &MeshSolverConfig {
        &self.config
    }

    /// Energies of the iterations of the last solve.
    pub fn energy_history(&self) -> &[f64] {
        &self.energy_history
    }
}

impl<B, const D: usize, I> SolverStrategy<B, D> for MeshLoadSolver<B, D, I>
where
    B: Backend,
    I: Interpolator<B>,
{
    fn name(&self) -> &'static str {
        "fem"
    }

    fn solve(
        &mut self,
        fixed: &Image<B, D>,
        moving: &Image<B, D>,
        initial: DeformationField<B, D>,
        iterations: usize,
        monitor: &SolveMonitor<'_>,
    ) -> error::Result<DeformationField<B, D>> {
        self.energy = None;
        self.energy_history.clear();
        if iterations == 0 {
            return Ok(initial);
        }
        validate_field_grid(&initial, fixed.grid(), "initial field")?;

        let config = &self.config;
        let device = fixed.device();
        let mesh = RegularMesh::new(fixed.grid(), config.element_size)?;
        let points = mesh.integration_points(config.integration_order)?;
        let element = mesh.element_stiffness(config.youngs_modulus, config.poisson_ratio)?;
        let shift = 1.0 / config.time_step;
        let diagonal = mesh.stiffness_diagonal(&element, shift);
        let extent = mesh.element_extent();
        let smallest_extent = (0..D).map(|axis| extent[axis]).fold(f64::INFINITY, f64::min);
        let cap = config.max_increment * smallest_extent;

        let maximize = self.maximize.unwrap_or_else(|| self.metric.maximize());
        let evaluator =
            MetricForceEvaluator::new(fixed, moving, &*self.metric, &self.interpolator, self.radius).with_maximize(maximize);
        let checker = config
            .energy_tolerance
            .map(|tolerance| ConvergenceChecker::new(tolerance, config.energy_patience).with_maximize(maximize));

        tracing::debug!(
            level = monitor.level(),
            nodes = mesh.num_nodes(),
            elements = mesh.num_elements(),
            integration_points = points.len(),
            "mesh built"
        );

        let count = points.len();
        let mut positions = Vec::with_capacity(count * D);
        for point in &points {
            positions.extend(point.position.to_f32_array());
        }
        let positions = Tensor::<B, 1>::from_data(TensorData::new(positions, Shape::new([count * D])), &device)
            .reshape([count, D]);
        let base: Vec<f32> = initial.sample(positions.clone()).into_data().iter::<f32>().collect();

        let mut nodal = DVector::<f64>::zeros(mesh.num_nodes() * D);
        let mut stiffness_times_nodal = DVector::<f64>::zeros(nodal.len());
        let mut load_scale: Option<f64> = None;

        for iteration in 1..=iterations {
            monitor.check_cancelled()?;

            let mut displacement = vec![0.0f32; count * D];
            displacement
                .par_chunks_mut(D)
                .zip(points.par_iter())
                .enumerate()
                .for_each(|(p, (out, point))| {
                    for i in 0..D {
                        let mut value = base[p * D + i] as f64;
                        for (node, weight) in point.nodes.iter().zip(&point.weights) {
                            value += weight * nodal[node * D + i];
                        }
                        out[i] = value as f32;
                    }
                });
            let displacement = Tensor::<B, 1>::from_data(TensorData::new(displacement, Shape::new([count * D])), &device)
                .reshape([count, D]);

            let batch = evaluator.evaluate_batch(positions.clone(), displacement);
            let forces: Vec<f32> = batch.forces.into_data().iter::<f32>().collect();
            let values: Vec<f32> = batch.values.into_data().iter::<f32>().collect();
            let energy: f64 = points
                .iter()
                .zip(&values)
                .map(|(point, &value)| point.volume_weight * value as f64)
                .sum();

            let loads = mesh.assemble_loads(&points, &forces);
            let strongest = largest_nodal_norm::<D>(loads.as_slice());
            if !strongest.is_finite() {
                return Err(RegistrationError::numerical_instability(format!(
                    "non-finite metric load at level {} iteration {}",
                    monitor.level(),
                    iteration
                )));
            }
            if load_scale.is_none() && strongest > 0.0 {
                let scale = config.gamma * smallest_extent * shift / strongest;
                tracing::debug!(level = monitor.level(), strongest, scale, "metric load scale fixed");
                load_scale = Some(scale);
            }
            mesh.apply_stiffness(&element, nodal.as_slice(), stiffness_times_nodal.as_mut_slice(), 0.0);
            let rhs = loads * load_scale.unwrap_or(0.0) - &stiffness_times_nodal;

            let solve = conjugate_gradient(
                |x, out| mesh.apply_stiffness(&element, x.as_slice(), out.as_mut_slice(), shift),
                &rhs,
                &diagonal,
                config.cg_tolerance,
                config.cg_max_iterations,
            );
            if !solve.converged {
                tracing::warn!(
                    level = monitor.level(),
                    iteration,
                    cg_iterations = solve.iterations,
                    residual = solve.relative_residual,
                    "linear solve stopped before reaching tolerance"
                );
            }

            let largest = largest_nodal_norm::<D>(solve.solution.as_slice());
            if !largest.is_finite() {
                return Err(RegistrationError::numerical_instability(format!(
                    "non-finite nodal increment at level {} iteration {}",
                    monitor.level(),
                    iteration
                )));
            }
            if largest > cap {
                return Err(RegistrationError::numerical_instability(format!(
                    "nodal increment {:.4} exceeds the cap {:.4} at level {} iteration {}",
                    largest,
                    cap,
                    monitor.level(),
                    iteration
                )));
            }
            nodal += solve.solution;

            self.energy = Some(energy);
            self.energy_history.push(energy);
            tracing::debug!(
                level = monitor.level(),
                iteration,
                energy,
                increment = largest,
                cg_iterations = solve.iterations,
                "fem iteration"
            );
            monitor.report(
                iteration,
                iterations,
                energy,
                &[("increment", largest), ("cg_iterations", solve.iterations as f64)],
            );

            if let Some(checker) = &checker {
                if checker.check_convergence(&self.energy_history) {
                    tracing::info!(level = monitor.level(), iteration, energy, "energy converged, stopping level early");
                    break;
                }
            }
        }

        let projected = mesh.project(nodal.as_slice());
        let n = fixed.grid().num_points();
        let projected = Tensor::<B, 1>::from_data(TensorData::new(projected, Shape::new([n * D])), &device)
            .reshape([n, D]);
        let vectors = initial.to_physical_vectors() + projected;
        let result = DeformationField::from_vectors(vectors, fixed.grid().clone(), FieldUnits::Physical)?;
        Ok(result.to_units(initial.units()))
    }

    fn current_energy(&self) -> Option<f64> {
        self.energy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MeanSquares;
    use warpgrid_core::spatial::{Direction, Spacing};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn blob(cx: f64) -> Image<TestBackend, 2> {
        scaled_blob(cx, 1.0)
    }

    fn scaled_blob(cx: f64, amplitude: f64) -> Image<TestBackend, 2> {
        let device = Default::default();
        let mut values = Vec::with_capacity(17 * 17);
        for y in 0..17 {
            for x in 0..17 {
                let dx = x as f64 - cx;
                let dy = y as f64 - 8.0;
                values.push((amplitude * (-(dx * dx + dy * dy) / 18.0).exp()) as f32);
            }
        }
        let data = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([17, 17]);
        Image::new(data, Point::origin(), Spacing::uniform(1.0), Direction::identity()).unwrap()
    }

    #[test]
    fn test_mesh_layout() {
        let grid = GridSpec::<2>::from_shape([10, 9]).unwrap();
        let mesh = RegularMesh::new(&grid, 4).unwrap();
        // x: 9 voxels -> 2 elements of 4; y: 10 voxels -> 3 elements of 3
        assert_eq!(mesh.nodes_per_axis(), [3, 4]);
        assert_eq!(mesh.num_nodes(), 12);
        assert_eq!(mesh.num_elements(), 6);
        assert_eq!(mesh.node_step(), [4.0, 3.0]);
        assert_eq!(mesh.node_position(11), Point::new([8.0, 9.0]));

        let flat = GridSpec::<2>::from_shape([1, 9]).unwrap();
        assert!(matches!(RegularMesh::new(&flat, 4), Err(RegistrationError::Configuration(_))));
        assert!(RegularMesh::new(&grid, 0).is_err());
    }

    #[test]
    fn test_integration_points_partition_volume() {
        let grid = GridSpec::new([9, 9], Point::origin(), Spacing::new([0.5, 2.0]), Direction::identity()).unwrap();
        let mesh = RegularMesh::new(&grid, 4).unwrap();
        for order in 1..=3 {
            let points = mesh.integration_points(order).unwrap();
            assert_eq!(points.len(), 4 * order * order);
            let volume: f64 = points.iter().map(|p| p.volume_weight).sum();
            assert!((volume - 4.0 * 16.0).abs() < 1e-9);
            for point in &points {
                assert_eq!(point.nodes.len(), 4);
                assert!((point.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
            }
        }
        assert!(mesh.integration_points(4).is_err());
    }

    #[test]
    fn test_gauss_legendre_is_exact() {
        // order n integrates x^(2n-1) exactly on [0, 1]
        for order in 1..=3 {
            let (x, w) = gauss_legendre(order).unwrap();
            let degree = 2 * order - 1;
            let integral: f64 = x.iter().zip(&w).map(|(x, w)| w * x.powi(degree as i32)).sum();
            assert!((integral - 1.0 / (degree + 1) as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rigid_translation_is_stress_free() {
        let grid = GridSpec::<3>::from_shape([7, 6, 9]).unwrap();
        let mesh = RegularMesh::new(&grid, 3).unwrap();
        let element = mesh.element_stiffness(2.0, 0.25).unwrap();
        assert_eq!(element.nrows(), 24);
        assert!((element.clone() - element.transpose()).abs().max() < 1e-10);

        let nodal: Vec<f64> = (0..mesh.num_nodes()).flat_map(|_| [0.3, -1.0, 2.0]).collect();
        let mut out = vec![0.0; nodal.len()];
        mesh.apply_stiffness(&element, &nodal, &mut out, 0.0);
        assert!(out.iter().all(|v| v.abs() < 1e-9));

        mesh.apply_stiffness(&element, &nodal, &mut out, 0.5);
        for (o, n) in out.iter().zip(&nodal) {
            assert!((o - 0.5 * n).abs() < 1e-9);
        }
    }

    #[test]
    fn test_stiffness_resists_stretch() {
        let grid = GridSpec::<2>::from_shape([9, 9]).unwrap();
        let mesh = RegularMesh::new(&grid, 4).unwrap();
        let element = mesh.element_stiffness(1.0, 0.3).unwrap();

        // u_x = x stretches the mesh: positive strain energy.
        let nodal: Vec<f64> = (0..mesh.num_nodes())
            .flat_map(|n| {
                let p = mesh.node_position(n);
                [p[0], 0.0]
            })
            .collect();
        let mut out = vec![0.0; nodal.len()];
        mesh.apply_stiffness(&element, &nodal, &mut out, 0.0);
        let energy: f64 = out.iter().zip(&nodal).map(|(a, b)| a * b).sum();
        assert!(energy > 0.0);

        let diagonal = mesh.stiffness_diagonal(&element, 1.0);
        assert!(diagonal.iter().all(|d| *d > 1.0));
    }

    #[test]
    fn test_interpolate_and_project_reproduce_linear_field() {
        let grid = GridSpec::<2>::from_shape([7, 10]).unwrap();
        let mesh = RegularMesh::new(&grid, 3).unwrap();
        let nodal: Vec<f64> = (0..mesh.num_nodes())
            .flat_map(|n| {
                let p = mesh.node_position(n);
                [0.5 * p[0] + 1.0, -0.25 * p[1]]
            })
            .collect();

        let value = mesh.interpolate(&nodal, &[4.5, 2.25]);
        assert!((value[0] - 3.25).abs() < 1e-12);
        assert!((value[1] + 0.5625).abs() < 1e-12);

        let voxels = mesh.project(&nodal);
        assert_eq!(voxels.len(), 70 * 2);
        // voxel (x = 9, y = 6)
        let last = &voxels[(6 * 10 + 9) * 2..];
        assert!((last[0] - 5.5).abs() < 1e-5);
        assert!((last[1] + 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_assemble_loads_conserves_total_force() {
        let grid = GridSpec::<2>::from_shape([9, 9]).unwrap();
        let mesh = RegularMesh::new(&grid, 4).unwrap();
        let points = mesh.integration_points(2).unwrap();
        let forces: Vec<f32> = points.iter().flat_map(|_| [1.0f32, -2.0]).collect();

        let loads = mesh.assemble_loads(&points, &forces);
        let total_x: f64 = loads.iter().step_by(2).sum();
        let total_y: f64 = loads.iter().skip(1).step_by(2).sum();
        // Total volume is 8 x 8.
        assert!((total_x - 64.0).abs() < 1e-9);
        assert!((total_y + 128.0).abs() < 1e-9);
    }

    #[test]
    fn test_conjugate_gradient_solves_spd_system() {
        let a = DMatrix::<f64>::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let rhs = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let diagonal = a.diagonal();
        let solve = conjugate_gradient(|x, out| out.copy_from(&(&a * x)), &rhs, &diagonal, 1e-12, 50);
        assert!(solve.converged);
        assert!((&a * &solve.solution - &rhs).norm() < 1e-9);

        let zero = conjugate_gradient(|x, out| out.copy_from(x), &DVector::zeros(3), &diagonal, 1e-12, 50);
        assert_eq!(zero.iterations, 0);
        assert_eq!(zero.solution, DVector::zeros(3));
    }

    #[test]
    fn test_config_validation() {
        assert!(MeshSolverConfig::new().validate().is_ok());
        assert!(MeshSolverConfig::new().with_integration_order(4).validate().is_err());
        assert!(MeshSolverConfig::new().with_poisson_ratio(0.5).validate().is_err());
        assert!(MeshSolverConfig::new().with_element_size(0).validate().is_err());
        assert!(MeshSolverConfig::new().with_time_step(0.0).validate().is_err());
    }

    #[test]
    fn test_solver_moves_toward_shift() {
        let device = Default::default();
        let fixed = blob(8.0);
        let moving = blob(9.0);
        let initial = DeformationField::zeros(fixed.grid().clone(), &device);

        let config = MeshSolverConfig::new().with_gamma(0.2);
        let mut solver =
            MeshLoadSolver::<TestBackend, 2>::new(config, Box::new(MeanSquares::new()), [0, 0]).unwrap();
        assert_eq!(solver.name(), "fem");

        let result = solver.run(&fixed, &moving, initial, 5).unwrap();
        assert_eq!(solver.energy_history().len(), 5);
        assert!(solver.current_energy().is_some());

        let centre = Tensor::<TestBackend, 2>::from_floats([[8.0, 8.0]], &device);
        let u: Vec<f32> = result.sample(centre).into_data().iter::<f32>().collect();
        assert!(u[0] > 0.02, "x displacement {}", u[0]);
        assert!(u[1].abs() < 0.05);
    }

    #[test]
    fn test_bright_images_converge_like_dim_ones() {
        let device = Default::default();
        let centre = Tensor::<TestBackend, 2>::from_floats([[8.0, 8.0]], &device);
        let mut shifts = Vec::new();
        for amplitude in [1.0, 255.0] {
            let fixed = scaled_blob(8.0, amplitude);
            let moving = scaled_blob(9.0, amplitude);
            let initial = DeformationField::zeros(fixed.grid().clone(), &device);
            let mut solver =
                MeshLoadSolver::<TestBackend, 2>::new(MeshSolverConfig::new(), Box::new(MeanSquares::new()), [0, 0])
                    .unwrap();
            let result = solver.run(&fixed, &moving, initial, 5).unwrap();
            let u: Vec<f32> = result.sample(centre.clone()).into_data().iter::<f32>().collect();
            assert!(u[0].is_finite() && u[0] > 0.02, "amplitude {}: x displacement {}", amplitude, u[0]);
            shifts.push(u[0]);
        }
        // Loads are rescaled per level, so the intensity range drops out.
        assert!((shifts[0] - shifts[1]).abs() < 1e-3, "{:?}", shifts);
    }

    #[test]
    fn test_points_outside_moving_image_are_skipped() {
        let device = Default::default();
        let fixed = scaled_blob(8.0, 100.0);
        let moving = scaled_blob(9.0, 100.0);
        let grid = fixed.grid().clone();

        // Everything left of x = 12 is pushed past the moving image.
        let mut x = Vec::with_capacity(17 * 17);
        for _y in 0..17 {
            for i in 0..17 {
                x.push(if i < 12 { 30.0f32 } else { 0.0 });
            }
        }
        let x = Tensor::<TestBackend, 1>::from_floats(x.as_slice(), &device).reshape([17, 17]);
        let initial =
            DeformationField::new(vec![x, Tensor::zeros([17, 17], &device)], grid.clone(), FieldUnits::Physical).unwrap();

        let mut solver =
            MeshLoadSolver::<TestBackend, 2>::new(MeshSolverConfig::new(), Box::new(MeanSquares::new()), [1, 1]).unwrap();
        let result = solver.run(&fixed, &moving, initial.clone(), 3).unwrap();
        assert_eq!(solver.energy_history().len(), 3);
        assert!(solver.energy_history().iter().all(|e| e.is_finite()));
        assert!(result.to_vec().iter().all(|v| v.is_finite()));

        // Nothing inside at all: the field is left alone.
        let far = DeformationField::constant(grid, Vector::new([100.0, 0.0]), FieldUnits::Physical, &device);
        let unchanged = solver.run(&fixed, &moving, far.clone(), 3).unwrap();
        assert!(unchanged.approx_eq(&far, 1e-6));
    }

    #[test]
    fn test_iterations_report_solver_metrics() {
        let device = Default::default();
        let fixed = blob(8.0);
        let moving = blob(9.0);
        let initial = DeformationField::zeros(fixed.grid().clone(), &device);
        let history = crate::progress::HistoryCallback::new();
        let mut tracker = crate::progress::ProgressTracker::new();
        tracker.add_callback(std::sync::Arc::new(history.clone()));

        let mut solver =
            MeshLoadSolver::<TestBackend, 2>::new(MeshSolverConfig::new(), Box::new(MeanSquares::new()), [0, 0]).unwrap();
        let monitor = SolveMonitor::new(0, None, Some(&tracker));
        solver.solve(&fixed, &moving, initial, 2, &monitor).unwrap();

        let recorded = history.get_history();
        assert_eq!(recorded.len(), 2);
        let names: Vec<&str> = recorded[0].metrics.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["increment", "cg_iterations"]);
        assert!(recorded[0].metrics[0].1 > 0.0);
    }

    #[test]
    fn test_divergence_is_fatal() {
        let device = Default::default();
        let fixed = blob(8.0);
        let moving = blob(9.0);
        let initial = DeformationField::zeros(fixed.grid().clone(), &device);

        let config = MeshSolverConfig::new().with_max_increment(1e-9);
        let mut solver =
            MeshLoadSolver::<TestBackend, 2>::new(config, Box::new(MeanSquares::new()), [0, 0]).unwrap();
        assert!(matches!(
            solver.run(&fixed, &moving, initial, 3),
            Err(RegistrationError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_zero_iterations_returns_initial() {
        let device = Default::default();
        let fixed = blob(8.0);
        let moving = blob(9.0);
        let initial = DeformationField::constant(fixed.grid().clone(), Vector::new([1.0, 2.0]), FieldUnits::Physical, &device);
        let mut solver =
            MeshLoadSolver::<TestBackend, 2>::new(MeshSolverConfig::new(), Box::new(MeanSquares::new()), [1, 1]).unwrap();
        let result = solver.run(&fixed, &moving, initial.clone(), 0).unwrap();
        assert!(result.approx_eq(&initial, 0.0));
    }

    #[test]
    fn test_energy_tolerance_stops_early() {
        let device = Default::default();
        let fixed = blob(8.0);
        let moving = blob(8.0);
        let initial = DeformationField::zeros(fixed.grid().clone(), &device);

        // Identical images: zero energy that never improves.
        let config = MeshSolverConfig::new().with_energy_tolerance(Some(1e-3)).with_energy_patience(2);
        let mut solver =
            MeshLoadSolver::<TestBackend, 2>::new(config, Box::new(MeanSquares::new()), [0, 0]).unwrap();
        solver.run(&fixed, &moving, initial, 20).unwrap();
        assert_eq!(solver.energy_history().len(), 3);
    }
}
