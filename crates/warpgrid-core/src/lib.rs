//! Images, grids, interpolation and deformation fields for deformable
//! registration.
//!
//! Tensors are ordered `[D, H, W]`; physical and index axis `i` (x first)
//! is tensor dimension `D - 1 - i`. See [`image::GridSpec`].

pub mod error;
pub mod image;
pub mod spatial;
pub mod transform;
pub mod interpolation;
pub mod filter;

pub use error::{FieldError, Result};
pub use image::{GridSpec, Image};
pub use spatial::{Direction, Point, Spacing, Vector};
pub use transform::{DeformationField, FieldUnits, Transform};
