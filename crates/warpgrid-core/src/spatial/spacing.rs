//! Spacing type for physical distances between adjacent voxels.

use super::Vector;

/// Spacing between adjacent voxels along each physical axis.
///
/// A type alias to [`Vector`] for semantic clarity.
pub type Spacing<const D: usize> = Vector<D>;

impl<const D: usize> Spacing<D> {
    /// Create uniform spacing (same value for all dimensions).
    pub fn uniform(value: f64) -> Self {
        Vector::repeat(value)
    }

    /// Check if spacing is uniform (all components equal).
    pub fn is_uniform(&self) -> bool {
        if D == 0 {
            return true;
        }
        let first = self[0];
        (1..D).all(|i| (self[i] - first).abs() < 1e-9)
    }

    /// True when every component is finite and strictly positive.
    pub fn is_valid_spacing(&self) -> bool {
        (0..D).all(|i| self[i].is_finite() && self[i] > 0.0)
    }

    /// Get the minimum spacing value.
    pub fn min_spacing(&self) -> f64 {
        (0..D).map(|i| self[i]).fold(f64::INFINITY, f64::min)
    }

    /// Get the maximum spacing value.
    pub fn max_spacing(&self) -> f64 {
        (0..D).map(|i| self[i]).fold(f64::NEG_INFINITY, f64::max)
    }

    /// Mean of the squared spacings.
    pub fn mean_squared(&self) -> f64 {
        if D == 0 {
            return 0.0;
        }
        (0..D).map(|i| self[i] * self[i]).sum::<f64>() / D as f64
    }
}
