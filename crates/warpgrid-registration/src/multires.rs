//! Coarse-to-fine scheduling.
//!
//! The scheduler owns the current deformation field for the whole run. It
//! solves each pyramid level in turn, coarsest first, and carries the result
//! to the next level's grid with a [`FieldResampler`].

use burn::config::Config;
use burn::tensor::backend::Backend;
use warpgrid_core::filter::{FieldResampler, ImagePyramid, MultiResolutionPyramid};
use warpgrid_core::{DeformationField, GridSpec, Image};

use crate::error::{self, RegistrationError};
use crate::metric::MetricKind;
use crate::monitor::{CancellationToken, LevelHandle, SolveMonitor};
use crate::progress::ProgressTracker;
use crate::registry::{SolverRegistry, SolverSettings};
use crate::solver::{MeshSolverConfig, PdeSolverConfig, SolverStrategy};
use crate::validation::{validate_field_grid, validate_schedule, GRID_TOLERANCE};

/// Configuration of a multi-resolution run.
#[derive(Config, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Iteration budget of each level, coarsest first.
    pub iterations_per_level: Vec<usize>,
    /// Metric neighbourhood radius in voxels: one value or one per axis.
    pub metric_radius: Vec<usize>,
    #[config(default = "3")]
    pub number_of_levels: usize,
    /// Registry name of the solver.
    #[config(default = "String::from(\"demons\")")]
    pub solver: String,
    #[config(default = "MetricKind::MeanSquares")]
    pub metric: MetricKind,
    /// Overrides the metric's maximize convention.
    pub maximize: Option<bool>,
    #[config(default = "PdeSolverConfig::new()")]
    pub pde: PdeSolverConfig,
    #[config(default = "MeshSolverConfig::new()")]
    pub mesh: MeshSolverConfig,
}

impl SchedulerConfig {
    /// Check the schedule and every solver tunable.
    pub fn validate(&self) -> error::Result<()> {
        validate_schedule(self.number_of_levels, &self.iterations_per_level)?;
        if self.metric_radius.is_empty() {
            return Err(RegistrationError::configuration("metric radius is required"));
        }
        self.pde.validate()?;
        self.mesh.validate()
    }

    /// Settings handed to the solver factory.
    pub fn solver_settings(&self) -> SolverSettings {
        SolverSettings {
            metric: self.metric,
            radius: self.metric_radius.clone(),
            maximize: self.maximize,
            pde: self.pde.clone(),
            mesh: self.mesh.clone(),
        }
    }
}

/// Callback run between levels with mutable access to the current field.
///
/// Receives the index of the level that just finished. The field's grid and
/// extent must be left unchanged.
pub type LevelHook<B, const D: usize> = Box<dyn FnMut(usize, &mut DeformationField<B, D>) -> error::Result<()>>;

/// Drives a [`SolverStrategy`] over a coarse-to-fine pyramid.
pub struct MultiResolutionScheduler<B: Backend, const D: usize> {
    solver: Box<dyn SolverStrategy<B, D>>,
    fixed_pyramid: Option<Box<dyn ImagePyramid<B, D>>>,
    moving_pyramid: Option<Box<dyn ImagePyramid<B, D>>>,
    resampler: FieldResampler,
    hooks: Vec<LevelHook<B, D>>,
    level: LevelHandle,
    cancel: CancellationToken,
    progress: ProgressTracker,
}

impl<B: Backend, const D: usize> MultiResolutionScheduler<B, D> {
    /// Create a scheduler around a solver.
    ///
    /// Pyramids are built from the input images with the default power-of-two
    /// schedule unless [`with_pyramids`](Self::with_pyramids) supplies them.
    pub fn new(solver: Box<dyn SolverStrategy<B, D>>) -> Self {
        Self {
            solver,
            fixed_pyramid: None,
            moving_pyramid: None,
            resampler: FieldResampler::new(),
            hooks: Vec::new(),
            level: LevelHandle::default(),
            cancel: CancellationToken::new(),
            progress: ProgressTracker::new(),
        }
    }

    /// Validate `config` and create its solver from `registry`.
    pub fn from_config(config: &SchedulerConfig, registry: &SolverRegistry<B, D>) -> error::Result<Self> {
        config.validate()?;
        let solver = registry.create(&config.solver, &config.solver_settings())?;
        Ok(Self::new(solver))
    }

    /// Use caller-built pyramids (level 0 coarsest).
    pub fn with_pyramids(
        mut self,
        fixed: Box<dyn ImagePyramid<B, D>>,
        moving: Box<dyn ImagePyramid<B, D>>,
    ) -> Self {
        self.fixed_pyramid = Some(fixed);
        self.moving_pyramid = Some(moving);
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    /// Share a cancellation token with the caller.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Add a callback run after every level except the last.
    pub fn add_hook<F>(&mut self, hook: F)
    where
        F: FnMut(usize, &mut DeformationField<B, D>) -> error::Result<()> + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Observable index of the level being processed.
    pub fn level_handle(&self) -> LevelHandle {
        self.level.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn solver(&self) -> &dyn SolverStrategy<B, D> {
        self.solver.as_ref()
    }

    /// Run with the schedule of `config`.
    pub fn execute(
        &mut self,
        fixed: &Image<B, D>,
        moving: &Image<B, D>,
        config: &SchedulerConfig,
        initial: Option<DeformationField<B, D>>,
    ) -> error::Result<DeformationField<B, D>> {
        config.validate()?;
        self.run(fixed, moving, config.number_of_levels, &config.iterations_per_level, initial)
    }

    /// Register `moving` onto `fixed`.
    ///
    /// `initial`, when given, must be defined on the fixed image's grid; it
    /// is resampled onto the coarsest level. Otherwise the run starts from a
    /// zero field. The result is defined on the fixed image's grid.
    ///
    /// # Errors
    /// * [`RegistrationError::Configuration`] for a malformed schedule or an
    ///   initial field on another grid, before any level executes
    /// * [`RegistrationError::ResourceUnavailable`] when a pyramid cannot
    ///   supply a level
    /// * [`RegistrationError::Cancelled`] when the cancellation token fires
    /// * any solver error, which aborts the run
    pub fn run(
        &mut self,
        fixed: &Image<B, D>,
        moving: &Image<B, D>,
        number_of_levels: usize,
        iterations_per_level: &[usize],
        initial: Option<DeformationField<B, D>>,
    ) -> error::Result<DeformationField<B, D>> {
        validate_schedule(number_of_levels, iterations_per_level)?;
        if let Some(field) = &initial {
            validate_field_grid(field, fixed.grid(), "initial field")?;
        }

        self.progress.start();
        let outcome = self.run_levels(fixed, moving, number_of_levels, iterations_per_level, initial);
        self.level.clear();

        match &outcome {
            Ok(_) => self.progress.complete(),
            Err(e) => self.progress.error(&e.to_string()),
        }
        outcome
    }

    fn run_levels(
        &mut self,
        fixed: &Image<B, D>,
        moving: &Image<B, D>,
        levels: usize,
        iterations_per_level: &[usize],
        initial: Option<DeformationField<B, D>>,
    ) -> error::Result<DeformationField<B, D>> {
        let built;
        let (fixed_pyramid, moving_pyramid): (&dyn ImagePyramid<B, D>, &dyn ImagePyramid<B, D>) =
            match (&self.fixed_pyramid, &self.moving_pyramid) {
                (Some(f), Some(m)) => (f.as_ref(), m.as_ref()),
                _ => {
                    built = (build_pyramid(fixed, levels)?, build_pyramid(moving, levels)?);
                    (&built.0, &built.1)
                }
            };

        // Every level must be available before any work starts.
        let mut images = Vec::with_capacity(levels);
        for level in 0..levels {
            match (fixed_pyramid.level(level), moving_pyramid.level(level)) {
                (Some(f), Some(m)) => images.push((f, m)),
                _ => {
                    return Err(RegistrationError::resource_unavailable(format!(
                        "pyramid cannot supply level {} of {} (fixed has {}, moving has {})",
                        level,
                        levels,
                        fixed_pyramid.levels(),
                        moving_pyramid.levels()
                    )))
                }
            }
        }

        let coarsest = images[0].0.grid();
        let mut field = match initial {
            Some(field) => self.resampler.expand(&field, coarsest)?,
            None => DeformationField::zeros(coarsest.clone(), &fixed.device()),
        };

        for (level, (fixed_level, moving_level)) in images.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(RegistrationError::Cancelled { level });
            }
            self.level.set(level);

            let iterations = iterations_per_level[level];
            self.progress.start_level(level, levels, &fixed_level.shape());
            tracing::info!(
                "Starting level {}/{} with solver={}, iters={}",
                level + 1,
                levels,
                self.solver.name(),
                iterations
            );
            tracing::info!("  Fixed size: {:?}", fixed_level.shape());
            tracing::info!("  Moving size: {:?}", moving_level.shape());

            let monitor = SolveMonitor::new(level, Some(&self.cancel), Some(&self.progress));
            field = self.solver.solve(fixed_level, moving_level, field, iterations, &monitor)?;

            if let Some(energy) = self.solver.current_energy() {
                tracing::info!("  Level {} finished with energy {:.6}", level + 1, energy);
            }

            if level + 1 < levels {
                for hook in self.hooks.iter_mut() {
                    hook(level, &mut field)?;
                }
                check_hook_output(&field, fixed_level.grid())?;
                field = self.resampler.expand(&field, images[level + 1].0.grid())?;
            }
        }

        if !field.grid().approx_eq(fixed.grid(), GRID_TOLERANCE) {
            field = self.resampler.expand(&field, fixed.grid())?;
        }
        Ok(field)
    }
}

fn build_pyramid<B: Backend, const D: usize>(
    image: &Image<B, D>,
    levels: usize,
) -> error::Result<MultiResolutionPyramid<B, D>> {
    MultiResolutionPyramid::with_levels(image, levels).map_err(|e| {
        RegistrationError::resource_unavailable(format!("could not build a {}-level pyramid: {}", levels, e))
    })
}

/// Hooks may edit the field's values but must leave it on the level's grid.
fn check_hook_output<B: Backend, const D: usize>(
    field: &DeformationField<B, D>,
    grid: &GridSpec<D>,
) -> error::Result<()> {
    let expected = grid.shape();
    let declared = field.grid().shape();
    if declared != expected {
        return Err(RegistrationError::shape_mismatch(&expected, &declared));
    }
    for component in field.components() {
        let actual = component.dims();
        if actual != expected {
            return Err(RegistrationError::shape_mismatch(&expected, &actual));
        }
    }
    validate_field_grid(field, grid, "field returned by a level hook")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{PdeUpdateRule, VoxelPdeSolver};
    use crate::metric::MeanSquares;
    use burn::tensor::Tensor;
    use warpgrid_core::spatial::{Direction, Point, Spacing};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp() -> Image<TestBackend, 2> {
        let device = Default::default();
        let values: Vec<f32> = (0..256).map(|i| (i % 16) as f32).collect();
        let data = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([16, 16]);
        Image::new(data, Point::origin(), Spacing::uniform(1.0), Direction::identity()).unwrap()
    }

    fn scheduler() -> MultiResolutionScheduler<TestBackend, 2> {
        let solver = VoxelPdeSolver::<TestBackend, 2>::new(
            PdeSolverConfig::new().with_update_rule(PdeUpdateRule::Demons),
            Box::new(MeanSquares::new()),
            [0, 0],
        )
        .unwrap();
        MultiResolutionScheduler::new(Box::new(solver))
    }

    /// Pyramid that only has `available` levels.
    struct ShortPyramid {
        images: Vec<Image<TestBackend, 2>>,
    }

    impl ImagePyramid<TestBackend, 2> for ShortPyramid {
        fn levels(&self) -> usize {
            self.images.len()
        }

        fn level(&self, level: usize) -> Option<&Image<TestBackend, 2>> {
            self.images.get(level)
        }
    }

    #[test]
    fn test_level_count_mismatch_is_configuration_error() {
        let image = ramp();
        let mut scheduler = scheduler();
        for levels in 1..4 {
            let budgets = vec![1; levels + 1];
            assert!(matches!(
                scheduler.run(&image, &image, levels, &budgets, None),
                Err(RegistrationError::Configuration(_))
            ));
        }
        assert!(matches!(
            scheduler.run(&image, &image, 0, &[], None),
            Err(RegistrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_result_on_fixed_grid() {
        let image = ramp();
        let mut scheduler = scheduler();
        let field = scheduler.run(&image, &image, 2, &[1, 1], None).unwrap();
        assert!(field.grid().approx_eq(image.grid(), 1e-9));
        assert!(field.max_magnitude() < 1e-4);
        assert_eq!(scheduler.level_handle().current(), None);
    }

    #[test]
    fn test_missing_pyramid_level_is_resource_unavailable() {
        let image = ramp();
        let pyramid = || Box::new(ShortPyramid { images: vec![image.clone()] }) as Box<dyn ImagePyramid<TestBackend, 2>>;
        let mut scheduler = scheduler().with_pyramids(pyramid(), pyramid());
        assert!(matches!(
            scheduler.run(&image, &image, 2, &[1, 1], None),
            Err(RegistrationError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn test_initial_field_on_other_grid_rejected() {
        let device = Default::default();
        let image = ramp();
        let initial = DeformationField::zeros(GridSpec::<2>::from_shape([8, 8]).unwrap(), &device);
        let mut scheduler = scheduler();
        assert!(matches!(
            scheduler.run(&image, &image, 2, &[1, 1], Some(initial)),
            Err(RegistrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_hook_sees_every_level_boundary() {
        use std::sync::{Arc, Mutex};

        let image = ramp();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = scheduler();
        let record = seen.clone();
        scheduler.add_hook(move |level, field| {
            record.lock().unwrap().push((level, field.grid().shape()));
            Ok(())
        });
        scheduler.run(&image, &image, 3, &[0, 0, 0], None).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(0, [4, 4]), (1, [8, 8])]);
    }

    #[test]
    fn test_hook_cannot_swap_the_field_grid() {
        let image = ramp();

        let mut resized = scheduler();
        resized.add_hook(|_, field| {
            *field = DeformationField::zeros(GridSpec::<2>::from_shape([3, 5]).unwrap(), &field.device());
            Ok(())
        });
        assert!(matches!(
            resized.run(&image, &image, 2, &[0, 0], None),
            Err(RegistrationError::ShapeMismatch { .. })
        ));

        // Same extent as level 0 but full-resolution spacing and origin.
        let mut moved = scheduler();
        moved.add_hook(|_, field| {
            *field = DeformationField::zeros(GridSpec::<2>::from_shape([8, 8]).unwrap(), &field.device());
            Ok(())
        });
        assert!(matches!(
            moved.run(&image, &image, 2, &[0, 0], None),
            Err(RegistrationError::Configuration(_))
        ));
        assert_eq!(moved.level_handle().current(), None);
    }

    #[test]
    fn test_hook_error_aborts_run() {
        let image = ramp();
        let mut scheduler = scheduler();
        scheduler.add_hook(|level, _| Err(RegistrationError::resource_unavailable(format!("hook at {}", level))));
        assert!(matches!(
            scheduler.run(&image, &image, 2, &[0, 0], None),
            Err(RegistrationError::ResourceUnavailable(_))
        ));
        assert_eq!(scheduler.level_handle().current(), None);
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = SchedulerConfig::new(vec![10, 10, 5], vec![1]);
        assert_eq!(config.number_of_levels, 3);
        assert_eq!(config.solver, "demons");
        assert!(config.validate().is_ok());

        assert!(SchedulerConfig::new(vec![10, 10], vec![1]).validate().is_err());
        assert!(SchedulerConfig::new(vec![10, 10, 5], vec![]).validate().is_err());

        let registry = SolverRegistry::<TestBackend, 2>::with_defaults();
        let unknown = SchedulerConfig::new(vec![1], vec![1]).with_number_of_levels(1).with_solver("bspline".into());
        assert!(matches!(
            MultiResolutionScheduler::from_config(&unknown, &registry),
            Err(RegistrationError::Configuration(_))
        ));
    }
}
