//! Coarse-to-fine deformable registration.
//!
//! A [`MultiResolutionScheduler`] walks an image pyramid from coarse to fine
//! and hands the deformation field to a [`SolverStrategy`] at every level.
//! Solvers turn local metric derivatives, produced by the
//! [`MetricForceEvaluator`], into field updates.

pub mod error;
pub mod metric;
pub mod force;
pub mod monitor;
pub mod progress;
pub mod validation;
pub mod solver;
pub mod registry;
pub mod multires;
pub mod export;

pub use error::{RegistrationError, Result};
pub use export::{export_field, SliceSelection};
pub use force::{ForceBatch, ForceSample, GradientSource, MetricForceEvaluator, SampleStatus};
pub use metric::{LocalMetric, MeanSquares, MetricKind, NormalizedCorrelation};
pub use monitor::{CancellationToken, LevelHandle, SolveMonitor};
pub use multires::{LevelHook, MultiResolutionScheduler, SchedulerConfig};
pub use progress::{ConsoleProgressCallback, HistoryCallback, ProgressCallback, ProgressInfo, ProgressTracker};
pub use registry::{SolverRegistry, SolverSettings};
pub use solver::{MeshLoadSolver, MeshSolverConfig, PdeSolverConfig, PdeUpdateRule, SolverStrategy, VoxelPdeSolver};
pub use validation::ConvergenceChecker;
