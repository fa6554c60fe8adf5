//! Mean squares metric.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use super::trait_::{LocalMetric, NeighborhoodSamples};

/// Mean Squares Metric.
///
/// Over the `K` neighbours of each point:
/// `value = (1/K) * sum((M - F)^2)` and
/// `d value / d u = (2/K) * sum((M - F) * grad M)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquares;

impl MeanSquares {
    /// Create a new mean squares metric.
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> LocalMetric<B> for MeanSquares {
    fn value_and_derivative(&self, samples: &NeighborhoodSamples<B>) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let [n, k] = samples.fixed.dims();
        let [_, _, d] = samples.gradient.dims();

        let diff = samples.moving.clone() - samples.fixed.clone();
        let value = (diff.clone() * diff.clone()).mean_dim(1).reshape([n]);

        let weighted = samples.gradient.clone() * diff.unsqueeze_dim::<3>(2);
        let derivative = weighted.sum_dim(1).reshape([n, d]) * (2.0 / k as f64);

        (value, derivative)
    }

    fn name(&self) -> &'static str {
        "MeanSquares"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_mean_squares_value_and_derivative() {
        let device = Default::default();
        let samples = NeighborhoodSamples::<TestBackend> {
            fixed: Tensor::from_floats([[1.0, 2.0], [0.0, 0.0]], &device),
            moving: Tensor::from_floats([[2.0, 2.0], [0.0, 0.0]], &device),
            gradient: Tensor::from_floats(
                [[[1.0, 0.5], [3.0, 3.0]], [[1.0, 1.0], [1.0, 1.0]]],
                &device,
            ),
        };

        let (value, derivative) = MeanSquares::new().value_and_derivative(&samples);
        let value: Vec<f32> = value.into_data().iter::<f32>().collect();
        let derivative: Vec<f32> = derivative.into_data().iter::<f32>().collect();

        assert_eq!(value, vec![0.5, 0.0]);
        // Only the first neighbour of the first point differs: (2/2) * 1 * (1, 0.5)
        assert_eq!(derivative, vec![1.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_mean_squares_is_minimized() {
        assert!(!LocalMetric::<TestBackend>::maximize(&MeanSquares::new()));
    }
}
