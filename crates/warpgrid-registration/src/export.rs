//! Field export for external renderers and writers.

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use warpgrid_core::image::unflatten_offset;
use warpgrid_core::spatial::{Point, Vector};
use warpgrid_core::{DeformationField, Image};

use crate::error::{RegistrationError, Result};

/// Keep only grid points whose index along `axis` equals `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSelection {
    /// Physical axis, x = 0.
    pub axis: usize,
    pub index: usize,
}

impl SliceSelection {
    pub fn new(axis: usize, index: usize) -> Self {
        Self { axis, index }
    }
}

/// Physical location and physical displacement of every selected grid point.
///
/// A point is selected when the mask (if any) is nonzero there and it lies
/// on the slice (if any). Points are returned in row-major grid order.
///
/// # Errors
/// * [`RegistrationError::Configuration`] when the slice axis or index is
///   outside the field's grid
/// * [`RegistrationError::ShapeMismatch`] when the mask extent differs from
///   the field extent
pub fn export_field<B: Backend, const D: usize>(
    field: &DeformationField<B, D>,
    mask: Option<&Image<B, D>>,
    slice: Option<SliceSelection>,
) -> Result<Vec<(Point<D>, Vector<D>)>> {
    let grid = field.grid();
    let shape = grid.shape();

    if let Some(slice) = slice {
        if slice.axis >= D {
            return Err(RegistrationError::configuration(format!(
                "slice axis {} is invalid for a {}-D field",
                slice.axis, D
            )));
        }
        if slice.index >= grid.size(slice.axis) {
            return Err(RegistrationError::configuration(format!(
                "slice index {} is outside axis {} of length {}",
                slice.index,
                slice.axis,
                grid.size(slice.axis)
            )));
        }
    }

    let mask_values = match mask {
        Some(mask) => {
            if mask.shape() != shape {
                return Err(RegistrationError::shape_mismatch(&shape, &mask.shape()));
            }
            Some(mask.to_vec())
        }
        None => None,
    };

    let vectors: Vec<f32> = field.to_physical_vectors().into_data().iter::<f32>().collect();
    let mut exported = Vec::new();
    for offset in 0..grid.num_points() {
        if let Some(values) = &mask_values {
            if values[offset] == 0.0 {
                continue;
            }
        }
        let index = unflatten_offset(&shape, offset);
        if let Some(slice) = slice {
            if index[slice.axis] != slice.index {
                continue;
            }
        }

        let point = grid.index_to_physical(&Point::new(std::array::from_fn(|axis| index[axis] as f64)));
        let vector = Vector::new(std::array::from_fn(|axis| vectors[offset * D + axis] as f64));
        exported.push((point, vector));
    }

    tracing::debug!(points = exported.len(), total = grid.num_points(), "exported field");
    Ok(exported)
}
