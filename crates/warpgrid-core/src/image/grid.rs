use burn::tensor::{Tensor, TensorData, Shape};
use burn::tensor::backend::Backend;

/// Generate a grid of continuous indices for the given tensor shape.
///
/// Returns a tensor of shape `[N, D]` where N is the total number of voxels
/// and D is the dimensionality. Rows follow the tensor's row-major layout and
/// column `i` holds the index along physical axis `i`, so column 0 (x) varies
/// fastest and corresponds to the last tensor dimension.
///
/// # Arguments
/// * `shape` - The tensor shape, e.g. `[D, H, W]` or `[H, W]`
/// * `device` - The device to create the tensor on
pub fn generate_grid<B, const D: usize>(
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, 2>
where
    B: Backend,
{
    let total: usize = shape.iter().product();

    let mut grid = Vec::with_capacity(total * D);
    for flat in 0..total {
        let mut rem = flat;
        for axis in 0..D {
            let len = shape[D - 1 - axis];
            grid.push((rem % len) as f32);
            rem /= len;
        }
    }

    Tensor::<B, 1>::from_data(TensorData::new(grid, Shape::new([total * D])), device)
        .reshape([total, D])
}

/// Row-major offset of a voxel given its index along each physical axis.
pub fn flat_offset<const D: usize>(shape: &[usize; D], index: &[usize; D]) -> usize {
    let mut offset = 0;
    let mut stride = 1;
    for axis in 0..D {
        offset += index[axis] * stride;
        stride *= shape[D - 1 - axis];
    }
    offset
}

/// Inverse of [`flat_offset`].
pub fn unflatten_offset<const D: usize>(shape: &[usize; D], offset: usize) -> [usize; D] {
    let mut rem = offset;
    std::array::from_fn(|axis| {
        let len = shape[D - 1 - axis];
        let idx = rem % len;
        rem /= len;
        idx
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_generate_grid_2d_order() {
        let device = Default::default();
        let grid = generate_grid::<TestBackend, 2>([2, 3], &device);
        assert_eq!(grid.dims(), [6, 2]);

        let data = grid.into_data();
        let values = data.as_slice::<f32>().unwrap();
        // (x, y) pairs with x fastest
        assert_eq!(values, &[0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_generate_grid_3d_last_row() {
        let device = Default::default();
        let grid = generate_grid::<TestBackend, 3>([2, 3, 4], &device);
        assert_eq!(grid.dims(), [24, 3]);

        let data = grid.into_data();
        let values = data.as_slice::<f32>().unwrap();
        assert_eq!(&values[69..72], &[3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_flat_offset_roundtrip() {
        let shape = [2, 3, 4];
        for offset in 0..24 {
            let index = unflatten_offset(&shape, offset);
            assert_eq!(flat_offset(&shape, &index), offset);
        }
        assert_eq!(flat_offset(&shape, &[1, 0, 0]), 1);
        assert_eq!(flat_offset(&shape, &[0, 1, 0]), 4);
        assert_eq!(flat_offset(&shape, &[0, 0, 1]), 12);
    }
}
