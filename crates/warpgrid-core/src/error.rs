//! Error types for grids, images and deformation fields.

use thiserror::Error;

/// Errors raised when grid geometry or field layout is inconsistent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    /// Grid metadata cannot describe a valid sampling lattice.
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    /// A tensor's extent does not match the grid it is attached to.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A vector field has the wrong number of components.
    #[error("Component count mismatch: expected {expected}, got {actual}")]
    ComponentCount { expected: usize, actual: usize },

    /// Two grids that must coincide do not.
    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    /// A filter or pyramid schedule is malformed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl FieldError {
    /// Create an invalid grid error.
    pub fn invalid_grid(msg: impl Into<String>) -> Self {
        Self::InvalidGrid(msg.into())
    }

    /// Create a shape mismatch error from two extents.
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a grid mismatch error.
    pub fn grid_mismatch(msg: impl Into<String>) -> Self {
        Self::GridMismatch(msg.into())
    }
}

/// Result alias for grid and field operations.
pub type Result<T> = std::result::Result<T, FieldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FieldError::shape_mismatch(&[4, 4], &[4, 5]);
        assert_eq!(err.to_string(), "Shape mismatch: expected [4, 4], got [4, 5]");

        let err = FieldError::ComponentCount { expected: 3, actual: 2 };
        assert_eq!(err.to_string(), "Component count mismatch: expected 3, got 2");

        let err = FieldError::invalid_grid("zero extent");
        assert!(err.to_string().contains("zero extent"));
    }
}
