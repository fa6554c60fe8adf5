//! Direction matrices describing image axis orientation.

use nalgebra::{DMatrix, SMatrix};
use serde::{Deserialize, Serialize};

use super::Vector;

/// Direction matrix representing image orientation.
///
/// Column `i` is the physical-space direction of grid axis `i`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Direction<const D: usize>(pub SMatrix<f64, D, D>);

impl<const D: usize> Direction<D> {
    /// Create an identity direction matrix (no rotation).
    pub fn identity() -> Self {
        Self(SMatrix::identity())
    }

    /// Create a zero matrix.
    pub fn zeros() -> Self {
        Self(SMatrix::zeros())
    }

    /// Check if direction matrix is orthogonal (rotation or reflection).
    pub fn is_orthogonal(&self) -> bool {
        let product = self.0 * self.0.transpose();
        (0..D).all(|i| {
            (0..D).all(|j| {
                let expected = if i == j { 1.0 } else { 0.0 };
                (product[(i, j)] - expected).abs() < 1e-6
            })
        })
    }

    /// Check if direction matrix is a proper rotation (det = 1).
    pub fn is_proper_rotation(&self) -> bool {
        self.is_orthogonal() && (self.determinant() - 1.0).abs() < 1e-6
    }

    /// Determinant of the direction matrix.
    ///
    /// Computed on a dynamic copy, which works for any `D`.
    pub fn determinant(&self) -> f64 {
        DMatrix::from_fn(D, D, |r, c| self.0[(r, c)]).determinant()
    }

    /// Try to compute the inverse of the direction matrix.
    pub fn try_inverse(&self) -> Option<Self> {
        self.0.try_inverse().map(Self)
    }

    /// Transposed matrix.
    pub fn transpose(&self) -> Self {
        Self(self.0.transpose())
    }

    /// Get the inner nalgebra matrix.
    pub fn inner(&self) -> &SMatrix<f64, D, D> {
        &self.0
    }

    /// Get mutable reference to inner nalgebra matrix.
    pub fn inner_mut(&mut self) -> &mut SMatrix<f64, D, D> {
        &mut self.0
    }
}

impl<const D: usize> Default for Direction<D> {
    fn default() -> Self {
        Self::identity()
    }
}

impl<const D: usize> std::ops::Index<(usize, usize)> for Direction<D> {
    type Output = f64;

    fn index(&self, index: (usize, usize)) -> &Self::Output {
        &self.0[index]
    }
}

impl<const D: usize> std::ops::IndexMut<(usize, usize)> for Direction<D> {
    fn index_mut(&mut self, index: (usize, usize)) -> &mut Self::Output {
        &mut self.0[index]
    }
}

impl<const D: usize> std::ops::Mul for Direction<D> {
    type Output = Self;

    fn mul(self, other: Self) -> Self::Output {
        Self(self.0 * other.0)
    }
}

impl<const D: usize> std::ops::Mul<Vector<D>> for Direction<D> {
    type Output = Vector<D>;

    fn mul(self, vector: Vector<D>) -> Self::Output {
        Vector(self.0 * vector.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Direction2 = Direction<2>;
    type Direction3 = Direction<3>;

    #[test]
    fn test_direction_identity() {
        let d = Direction3::identity();
        assert!(d.is_orthogonal());
        assert!(d.is_proper_rotation());
        assert_eq!(d * Vector::new([1.0, 2.0, 3.0]), Vector::new([1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_direction_rotation_inverse() {
        let mut rot = Direction2::zeros();
        rot[(0, 1)] = -1.0;
        rot[(1, 0)] = 1.0;
        assert!(rot.is_proper_rotation());

        let inv = rot.try_inverse().unwrap();
        assert_eq!(inv, rot.transpose());
    }

    #[test]
    fn test_direction_reflection() {
        let mut reflection = Direction3::identity();
        reflection[(0, 0)] = -1.0;
        assert!(reflection.is_orthogonal());
        assert!(!reflection.is_proper_rotation());
    }

    #[test]
    fn test_determinant_of_scaled_shear() {
        let mut m = Direction3::identity();
        m[(0, 0)] = 2.0;
        m[(0, 1)] = 5.0;
        m[(2, 2)] = -3.0;
        assert!((m.determinant() + 6.0).abs() < 1e-12);
        assert!((Direction::<1>::identity().determinant() - 1.0).abs() < 1e-12);
        assert!(Direction2::zeros().determinant().abs() < 1e-12);
    }

    #[test]
    fn test_singular_direction_has_no_inverse() {
        assert!(Direction2::zeros().try_inverse().is_none());
    }
}
