//! Image types and operations.
//!
//! This module provides the Image type, the grid geometry shared by images
//! and deformation fields, and index-grid generation.

pub mod image;
pub mod grid_spec;
pub mod grid;

pub use image::Image;
pub use grid_spec::GridSpec;
pub use grid::{flat_offset, generate_grid, unflatten_offset};
