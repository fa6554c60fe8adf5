//! Validation utilities for registration runs.
//!
//! Configuration checks run eagerly, before any level executes, and report
//! [`RegistrationError::Configuration`]. Numerical checks report
//! [`RegistrationError::NumericalInstability`].

use burn::tensor::{ElementConversion, Tensor};
use burn::tensor::backend::Backend;
use warpgrid_core::{DeformationField, GridSpec};

use crate::error::{RegistrationError, Result};

/// Grid tolerance used when comparing a field's grid with a reference.
pub const GRID_TOLERANCE: f64 = 1e-6;

/// Check the scheduler's level count against the per-level budgets.
pub fn validate_schedule(number_of_levels: usize, iterations_per_level: &[usize]) -> Result<()> {
    if number_of_levels == 0 {
        return Err(RegistrationError::configuration("number of levels must be at least 1"));
    }
    if iterations_per_level.len() != number_of_levels {
        return Err(RegistrationError::configuration(format!(
            "{} iteration budgets given for {} levels",
            iterations_per_level.len(),
            number_of_levels
        )));
    }
    Ok(())
}

/// Check that a neighbourhood radius has one entry per axis.
pub fn validate_radius(radius: &[usize], dimension: usize) -> Result<()> {
    if radius.len() != dimension {
        return Err(RegistrationError::configuration(format!(
            "metric radius has {} entries for a {}-D image",
            radius.len(),
            dimension
        )));
    }
    Ok(())
}

/// Expand a radius given as one value or one value per axis.
pub fn radius_array<const D: usize>(radius: &[usize]) -> Result<[usize; D]> {
    match radius.len() {
        1 => Ok([radius[0]; D]),
        _ => {
            validate_radius(radius, D)?;
            Ok(std::array::from_fn(|i| radius[i]))
        }
    }
}

/// Require a finite value `> 0`.
pub fn validate_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(RegistrationError::configuration(format!(
            "{} must be positive, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Require a finite value `>= 0`.
pub fn validate_non_negative(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(RegistrationError::configuration(format!(
            "{} must be non-negative, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Require a value in `[0, 1]`.
pub fn validate_unit_interval(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(RegistrationError::configuration(format!(
            "{} must lie in [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

/// Check that a field is defined on `grid`.
pub fn validate_field_grid<B: Backend, const D: usize>(
    field: &DeformationField<B, D>,
    grid: &GridSpec<D>,
    what: &str,
) -> Result<()> {
    if !field.grid().approx_eq(grid, GRID_TOLERANCE) {
        return Err(RegistrationError::configuration(format!(
            "{} is defined on grid {:?} but the reference grid is {:?}",
            what,
            field.grid().shape(),
            grid.shape()
        )));
    }
    Ok(())
}

/// Fail with [`RegistrationError::NumericalInstability`] if `tensor` holds a
/// NaN or infinity.
pub fn ensure_finite<B: Backend, const D: usize>(tensor: &Tensor<B, D>, what: &str) -> Result<()> {
    // NaN propagates through the sum; infinities survive it.
    let total = tensor.clone().abs().sum().into_scalar().elem::<f64>();
    if !total.is_finite() {
        return Err(RegistrationError::numerical_instability(format!(
            "{} contains non-finite values",
            what
        )));
    }
    Ok(())
}

/// Energy-based convergence test over a sliding window.
///
/// Off unless a solver is configured with an energy tolerance.
#[derive(Debug, Clone)]
pub struct ConvergenceChecker {
    /// Minimum relative improvement that counts as progress.
    pub min_improvement: f64,
    /// Number of iterations to wait for progress.
    pub patience: usize,
    /// Whether larger energies are better.
    pub maximize: bool,
}

impl Default for ConvergenceChecker {
    fn default() -> Self {
        Self {
            min_improvement: 1e-6,
            patience: 3,
            maximize: false,
        }
    }
}

impl ConvergenceChecker {
    pub fn new(min_improvement: f64, patience: usize) -> Self {
        Self {
            min_improvement,
            patience: patience.max(1),
            maximize: false,
        }
    }

    pub fn with_maximize(mut self, maximize: bool) -> Self {
        self.maximize = maximize;
        self
    }

    /// True once the last `patience` energies failed to improve on the best
    /// energy seen before them by more than `min_improvement` (relative).
    pub fn check_convergence(&self, history: &[f64]) -> bool {
        if history.len() < self.patience + 1 {
            return false;
        }

        let split = history.len() - self.patience;
        let (earlier, recent) = history.split_at(split);
        let sign = if self.maximize { -1.0 } else { 1.0 };

        let best_before = earlier.iter().map(|e| sign * e).fold(f64::INFINITY, f64::min);
        let best_recent = recent.iter().map(|e| sign * e).fold(f64::INFINITY, f64::min);

        let relative_improvement = (best_before - best_recent) / (best_before.abs() + 1e-10);
        relative_improvement < self.min_improvement
    }
}
