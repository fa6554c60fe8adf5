//! Transform types and operations.
//!
//! The [`Transform`] trait plus the dense [`DeformationField`] that the
//! registration solvers produce.

pub mod trait_;
pub mod deformation_field;

pub use trait_::{IdentityTransform, Transform};
pub use deformation_field::{DeformationField, FieldUnits};
