//! Error types for registration operations.
//!
//! Out-of-bounds samples are not errors: the force evaluator reports them
//! through [`SampleStatus`](crate::force::SampleStatus) and contributes a
//! zero force.

use thiserror::Error;
use warpgrid_core::FieldError;

/// Main error type for registration operations.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Malformed setup, detected before any level executes.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A collaborator could not supply a required level or result.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The solver diverged (non-finite or excessive displacement).
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Grid or field layout error from the core crate.
    #[error(transparent)]
    Field(#[from] FieldError),

    /// The run was cancelled at a level or iteration boundary.
    #[error("Registration cancelled at level {level}")]
    Cancelled { level: usize },
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

impl RegistrationError {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a resource unavailable error.
    pub fn resource_unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    /// Create a numerical instability error.
    pub fn numerical_instability(msg: impl Into<String>) -> Self {
        Self::NumericalInstability(msg.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
