//! Voxel-grid PDE solver.
//!
//! Every iteration evaluates the metric force at each voxel of the fixed
//! grid against the same field snapshot, turns it into an increment with the
//! configured update rule, and regularises the accumulated field by blending
//! it with a Gaussian-smoothed copy.

use burn::config::Config;
use burn::tensor::{ElementConversion, Tensor};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use warpgrid_core::interpolation::{Interpolator, LinearInterpolator};
use warpgrid_core::{DeformationField, FieldUnits, Image};

use super::{smooth_vectors, SolverStrategy};
use crate::error;
use crate::force::{GradientSource, MetricForceEvaluator};
use crate::metric::LocalMetric;
use crate::monitor::SolveMonitor;
use crate::validation::{
    ensure_finite, validate_field_grid, validate_non_negative, validate_positive, validate_unit_interval,
};

/// Per-voxel increment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PdeUpdateRule {
    /// Thirion demons: the force normalised by its own magnitude and the
    /// metric value, giving steps of at most about one voxel.
    #[default]
    Demons,
    /// Demons normalisation driven by the mean of the fixed and warped moving
    /// gradients.
    SymmetricForces,
    /// The force scaled by the step size.
    GradientStep,
}

impl PdeUpdateRule {
    pub fn gradient_source(&self) -> GradientSource {
        match self {
            Self::SymmetricForces => GradientSource::Symmetric,
            Self::Demons | Self::GradientStep => GradientSource::Moving,
        }
    }

    /// Registry name of the solver using this rule.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Demons => "demons",
            Self::SymmetricForces => "symmetric-forces",
            Self::GradientStep => "gradient-step",
        }
    }
}

/// Configuration for [`VoxelPdeSolver`].
#[derive(Config, Debug, PartialEq)]
pub struct PdeSolverConfig {
    /// Update rule.
    #[config(default = "PdeUpdateRule::Demons")]
    pub update_rule: PdeUpdateRule,
    /// Sigma (voxels) of the smoothing applied to the accumulated field.
    #[config(default = "1.0")]
    pub field_smoothing_sigma: f64,
    /// Sigma (voxels) of the smoothing applied to each increment; 0 disables.
    #[config(default = "0.0")]
    pub update_smoothing_sigma: f64,
    /// Blend weight of the smoothed field: 1 replaces the field by its
    /// smoothed copy, 0 disables field regularisation.
    #[config(default = "1.0")]
    pub regularization_weight: f64,
    /// Longest increment per iteration in multiples of the smallest voxel
    /// spacing; 0 disables the limit.
    #[config(default = "2.0")]
    pub max_step_length: f64,
    /// Weight of the metric value in the demons denominator. Defaults to the
    /// mean squared spacing of the fixed level.
    pub intensity_normalizer: Option<f64>,
    /// Scale applied to every increment.
    #[config(default = "1.0")]
    pub step_size: f64,
}

impl PdeSolverConfig {
    /// Check all tunables.
    pub fn validate(&self) -> error::Result<()> {
        validate_non_negative("field_smoothing_sigma", self.field_smoothing_sigma)?;
        validate_non_negative("update_smoothing_sigma", self.update_smoothing_sigma)?;
        validate_unit_interval("regularization_weight", self.regularization_weight)?;
        validate_non_negative("max_step_length", self.max_step_length)?;
        validate_positive("step_size", self.step_size)?;
        if let Some(normalizer) = self.intensity_normalizer {
            validate_positive("intensity_normalizer", normalizer)?;
        }
        Ok(())
    }
}

// Demons denominators below this leave the voxel unchanged.
const DENOMINATOR_THRESHOLD: f64 = 1e-9;

/// Iterates a force + diffusion update on the voxels of the fixed grid.
pub struct VoxelPdeSolver<B: Backend, const D: usize, I = LinearInterpolator> {
    config: PdeSolverConfig,
    metric: Box<dyn LocalMetric<B> + Send + Sync>,
    interpolator: I,
    radius: [usize; D],
    maximize: Option<bool>,
    energy: Option<f64>,
}

impl<B: Backend, const D: usize> VoxelPdeSolver<B, D, LinearInterpolator> {
    /// Create a solver sampling images with linear interpolation.
    ///
    /// # Errors
    /// Returns [`RegistrationError::Configuration`](crate::RegistrationError::Configuration)
    /// when the configuration is invalid.
    pub fn new(
        config: PdeSolverConfig,
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
        })
    }
}

impl<B: Backend, const D: usize, I: Interpolator<B>> VoxelPdeSolver<B, D, I> {
    /// Swap the image interpolator.
    pub fn with_interpolator<J: Interpolator<B>>(self, interpolator: J) -> VoxelPdeSolver<B, D, J> {
        VoxelPdeSolver {
            config: self.config,
            metric: self.metric,
            interpolator,
            radius: self.radius,
            maximize: self.maximize,
            energy: self.energy,
        }
    }

    /// Override the metric's maximize convention.
    pub fn with_maximize(mut self, maximize: bool) -> Self {
        self.maximize = Some(maximize);
        self
    }

    pub fn config(&self) -> &PdeSolverConfig {
        &self.config
    }

    fn increment(&self, forces: Tensor<B, 2>, values: Tensor<B, 1>, normalizer: f64) -> Tensor<B, 2> {
        let step = match self.config.update_rule {
            PdeUpdateRule::GradientStep => forces,
            PdeUpdateRule::Demons | PdeUpdateRule::SymmetricForces => {
                // du = 2 |v| f / (|f|^2 + 4 v^2 / lambda)
                let v = values.abs().unsqueeze_dim::<2>(1);
                let force_sq = (forces.clone() * forces.clone()).sum_dim(1);
                let denominator = force_sq + v.clone() * v.clone() * (4.0 / normalizer);
                let valid = denominator.clone().greater_elem(DENOMINATOR_THRESHOLD).float();
                let safe = denominator * valid.clone() + (valid.clone().neg() + 1.0);
                forces * (v * 2.0) * safe.recip() * valid
            }
        };
        step * self.config.step_size
    }

    fn clamp_step(&self, step: Tensor<B, 2>, max_length: f64) -> Tensor<B, 2> {
        if max_length <= 0.0 {
            return step;
        }
        let length = (step.clone() * step.clone()).sum_dim(1).sqrt();
        let scale = (length.clamp_min(1e-12).recip() * max_length).clamp_max(1.0);
        step * scale
    }
}

impl<B, const D: usize, I> SolverStrategy<B, D> for VoxelPdeSolver<B, D, I>
where
    B: Backend,
    I: Interpolator<B>,
{
    fn name(&self) -> &'static str {
        self.config.update_rule.name()
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
        if iterations == 0 {
            return Ok(initial);
        }
        validate_field_grid(&initial, fixed.grid(), "initial field")?;

        let grid = fixed.grid().clone();
        let units = initial.units();
        let device = fixed.device();
        let normalizer = self
            .config
            .intensity_normalizer
            .unwrap_or_else(|| fixed.spacing().mean_squared());
        let max_length = self.config.max_step_length * fixed.spacing().min_spacing();
        let weight = self.config.regularization_weight;

        let evaluator = MetricForceEvaluator::new(fixed, moving, &*self.metric, &self.interpolator, self.radius)
            .with_maximize(self.maximize.unwrap_or_else(|| self.metric.maximize()))
            .with_gradient_source(self.config.update_rule.gradient_source());

        let points = grid.physical_points::<B>(&device);
        let mut field = initial.to_physical_vectors();

        for iteration in 1..=iterations {
            monitor.check_cancelled()?;

            // Every voxel reads the same snapshot; the update is a new tensor.
            let batch = evaluator.evaluate_batch(points.clone(), field.clone());
            let inside_count = batch.inside.clone().sum().into_scalar().elem::<f64>();
            let energy = batch.values.clone().sum().into_scalar().elem::<f64>() / inside_count.max(1.0);

            let mut step = self.increment(batch.forces, batch.values, normalizer);
            step = smooth_vectors(step, &grid, self.config.update_smoothing_sigma);
            step = self.clamp_step(step, max_length);
            ensure_finite(&step, "voxel update")?;

            let updated = field + step;
            field = if weight > 0.0 {
                let smoothed = smooth_vectors(updated.clone(), &grid, self.config.field_smoothing_sigma);
                updated * (1.0 - weight) + smoothed * weight
            } else {
                updated
            };

            self.energy = Some(energy);
            tracing::debug!(
                level = monitor.level(),
                iteration,
                energy,
                inside = inside_count,
                "{} iteration",
                self.name()
            );
            monitor.report(iteration, iterations, energy, &[("inside", inside_count)]);
        }

        let result = DeformationField::from_vectors(field, grid, FieldUnits::Physical)?;
        Ok(result.to_units(units))
    }

    fn current_energy(&self) -> Option<f64> {
        self.energy
    }
}
