//! Metric-driven force evaluation.
//!
//! The evaluator turns a local metric into a force field: for each sample
//! point in fixed space and a candidate displacement it gathers the
//! neighbourhood, evaluates the metric and returns a vector that points
//! toward better similarity.

use burn::tensor::{ElementConversion, Tensor, TensorData, Shape};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use warpgrid_core::image::Image;
use warpgrid_core::interpolation::{inside_mask, sample_gradient, Interpolator};
use warpgrid_core::spatial::{Point, Vector};

use crate::metric::{LocalMetric, NeighborhoodSamples};

/// Points evaluated per tensor dispatch; larger batches are split.
const CHUNK_SIZE: usize = 32768;

/// Which image gradient drives the force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GradientSource {
    /// Gradient of the warped moving image.
    #[default]
    Moving,
    /// Mean of the fixed and warped moving gradients.
    Symmetric,
}

/// Whether a sample could be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    Inside,
    /// The point or its displaced position left the image domain; the
    /// value and force are zero.
    OutOfBounds,
}

/// Result of evaluating a single point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceSample<const D: usize> {
    /// Metric value over the neighbourhood.
    pub value: f64,
    /// Force toward better similarity, in physical units.
    pub force: Vector<D>,
    pub status: SampleStatus,
}

impl<const D: usize> ForceSample<D> {
    /// The zero sample reported for out-of-bounds points.
    pub fn out_of_bounds() -> Self {
        Self {
            value: 0.0,
            force: Vector::zeros(),
            status: SampleStatus::OutOfBounds,
        }
    }

    pub fn is_inside(&self) -> bool {
        self.status == SampleStatus::Inside
    }
}

/// Result of evaluating a batch of `N` points.
#[derive(Debug, Clone)]
pub struct ForceBatch<B: Backend> {
    /// Metric values `[N]`, zero where out of bounds.
    pub values: Tensor<B, 1>,
    /// Forces `[N, D]` in physical units, zero where out of bounds.
    pub forces: Tensor<B, 2>,
    /// `1.0` for evaluated points, `0.0` for out-of-bounds points `[N]`.
    pub inside: Tensor<B, 1>,
}

/// Evaluates metric forces at points of the fixed image.
///
/// Holds read-only references to the images, metric and interpolator for
/// the duration of a solve; it keeps no other state and can be shared by
/// concurrent callers.
pub struct MetricForceEvaluator<'a, B, M, I, const D: usize>
where
    B: Backend,
    M: LocalMetric<B> + ?Sized,
    I: Interpolator<B>,
{
    fixed: &'a Image<B, D>,
    moving: &'a Image<B, D>,
    metric: &'a M,
    interpolator: &'a I,
    radius: [usize; D],
    maximize: bool,
    gradient_source: GradientSource,
    offsets: Tensor<B, 2>,
}

impl<'a, B, M, I, const D: usize> MetricForceEvaluator<'a, B, M, I, D>
where
    B: Backend,
    M: LocalMetric<B> + ?Sized,
    I: Interpolator<B>,
{
    /// Create an evaluator.
    ///
    /// `radius` is the neighbourhood half-width in fixed-image voxels along
    /// each physical axis; zero evaluates the point alone.
    pub fn new(
        fixed: &'a Image<B, D>,
        moving: &'a Image<B, D>,
        metric: &'a M,
        interpolator: &'a I,
        radius: [usize; D],
    ) -> Self {
        let offsets = Self::neighborhood_offsets(fixed, radius);
        Self {
            fixed,
            moving,
            metric,
            interpolator,
            radius,
            maximize: metric.maximize(),
            gradient_source: GradientSource::Moving,
            offsets,
        }
    }

    /// Override the metric's maximize convention.
    pub fn with_maximize(mut self, maximize: bool) -> Self {
        self.maximize = maximize;
        self
    }

    /// Choose the gradient that drives the force.
    pub fn with_gradient_source(mut self, source: GradientSource) -> Self {
        self.gradient_source = source;
        self
    }

    pub fn radius(&self) -> [usize; D] {
        self.radius
    }

    /// Number of neighbours gathered per point.
    pub fn neighborhood_size(&self) -> usize {
        self.offsets.dims()[0]
    }

    pub fn maximize(&self) -> bool {
        self.maximize
    }

    /// Evaluate one point with one displacement estimate.
    ///
    /// Points whose displaced position falls outside the moving image (or
    /// that lie outside the fixed image) produce [`ForceSample::out_of_bounds`].
    pub fn evaluate(&self, point: &Point<D>, displacement: &Vector<D>) -> ForceSample<D> {
        let device = self.fixed.device();
        let points = Self::row(point.to_f32_array(), &device);
        let displacements = Self::row(displacement.to_f32_array(), &device);

        let batch = self.evaluate_batch(points, displacements);
        if batch.inside.into_scalar().elem::<f32>() < 0.5 {
            return ForceSample::out_of_bounds();
        }

        let force: Vec<f32> = batch.forces.into_data().iter::<f32>().collect();
        ForceSample {
            value: batch.values.into_scalar().elem::<f64>(),
            force: Vector::new(std::array::from_fn(|i| force[i] as f64)),
            status: SampleStatus::Inside,
        }
    }

    /// Evaluate a batch of physical points `[N, D]` with displacements `[N, D]`.
    pub fn evaluate_batch(&self, points: Tensor<B, 2>, displacements: Tensor<B, 2>) -> ForceBatch<B> {
        let [n, _] = points.dims();
        if n <= CHUNK_SIZE {
            return self.evaluate_chunk(points, displacements);
        }

        let mut values = Vec::new();
        let mut forces = Vec::new();
        let mut inside = Vec::new();
        let mut start = 0;
        while start < n {
            let len = CHUNK_SIZE.min(n - start);
            let chunk = self.evaluate_chunk(
                points.clone().narrow(0, start, len),
                displacements.clone().narrow(0, start, len),
            );
            values.push(chunk.values);
            forces.push(chunk.forces);
            inside.push(chunk.inside);
            start += len;
        }

        ForceBatch {
            values: Tensor::cat(values, 0),
            forces: Tensor::cat(forces, 0),
            inside: Tensor::cat(inside, 0),
        }
    }

    fn evaluate_chunk(&self, points: Tensor<B, 2>, displacements: Tensor<B, 2>) -> ForceBatch<B> {
        let [n, _] = points.dims();
        let k = self.neighborhood_size();
        let warped = points.clone() + displacements;

        // Bounds are decided at the centre point only.
        let fixed_centre = self.fixed.world_to_index_tensor(points.clone());
        let moving_centre = self.moving.world_to_index_tensor(warped.clone());
        let inside = inside_mask(self.fixed.shape(), fixed_centre)
            * inside_mask(self.moving.shape(), moving_centre);

        let offsets = self.offsets.clone().unsqueeze_dim::<3>(0); // [1, K, D]
        let fixed_points = (points.unsqueeze_dim::<3>(1) + offsets.clone()).reshape([n * k, D]);
        let moving_points = (warped.unsqueeze_dim::<3>(1) + offsets).reshape([n * k, D]);

        let fixed_indices = self.fixed.world_to_index_tensor(fixed_points);
        let moving_indices = self.moving.world_to_index_tensor(moving_points);

        let fixed_values = self.interpolator.interpolate(self.fixed.data(), fixed_indices.clone());
        let moving_values = self.interpolator.interpolate(self.moving.data(), moving_indices.clone());

        let mut gradient = sample_gradient(self.interpolator, self.moving, moving_indices);
        if self.gradient_source == GradientSource::Symmetric {
            gradient = (gradient + sample_gradient(self.interpolator, self.fixed, fixed_indices)) * 0.5;
        }

        let samples = NeighborhoodSamples {
            fixed: fixed_values.reshape([n, k]),
            moving: moving_values.reshape([n, k]),
            gradient: gradient.reshape([n, k, D]),
        };
        let (values, derivative) = self.metric.value_and_derivative(&samples);

        let forces = if self.maximize { derivative } else { derivative.neg() };

        ForceBatch {
            values: values * inside.clone(),
            forces: forces * inside.clone().unsqueeze_dim::<2>(1),
            inside,
        }
    }

    fn neighborhood_offsets(fixed: &Image<B, D>, radius: [usize; D]) -> Tensor<B, 2> {
        let device = fixed.device();
        let extents: [usize; D] = std::array::from_fn(|i| 2 * radius[i] + 1);
        let count: usize = extents.iter().product();

        let mut data = Vec::with_capacity(count * D);
        for flat in 0..count {
            let mut rem = flat;
            let mut step = Vector::<D>::zeros();
            for axis in 0..D {
                step[axis] = (rem % extents[axis]) as f64 - radius[axis] as f64;
                rem /= extents[axis];
            }
            let physical = fixed.grid().index_vector_to_physical(&step);
            data.extend(physical.to_f32_array());
        }

        Tensor::<B, 1>::from_data(TensorData::new(data, Shape::new([count * D])), &device)
            .reshape([count, D])
    }

    fn row(values: [f32; D], device: &B::Device) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_floats(values, device).reshape([1, D])
    }
}
