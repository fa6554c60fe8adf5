//! Local similarity metric contract.
//!
//! A local metric scores agreement between fixed and warped-moving samples
//! gathered over a neighbourhood around each evaluation point, and returns
//! the derivative of that score with respect to a displacement of the point.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

/// Samples gathered around a batch of `N` evaluation points.
///
/// Every point has the same `K` neighbours (the voxel offsets of the
/// metric radius), sampled from the fixed image at the point and from the
/// moving image at the displaced point.
#[derive(Debug, Clone)]
pub struct NeighborhoodSamples<B: Backend> {
    /// Fixed image values `[N, K]`.
    pub fixed: Tensor<B, 2>,
    /// Warped moving image values `[N, K]`.
    pub moving: Tensor<B, 2>,
    /// Physical gradient of the warped moving image `[N, K, D]`.
    pub gradient: Tensor<B, 3>,
}

impl<B: Backend> NeighborhoodSamples<B> {
    /// Number of evaluation points.
    pub fn len(&self) -> usize {
        self.fixed.dims()[0]
    }

    /// True when the batch holds no points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of neighbours per point.
    pub fn neighborhood_size(&self) -> usize {
        self.fixed.dims()[1]
    }
}

/// Neighbourhood similarity metric.
///
/// # Type Parameters
/// * `B` - The tensor backend
pub trait LocalMetric<B: Backend> {
    /// Metric value `[N]` and its derivative with respect to the displacement
    /// of each evaluation point `[N, D]`.
    fn value_and_derivative(&self, samples: &NeighborhoodSamples<B>) -> (Tensor<B, 1>, Tensor<B, 2>);

    /// Whether larger values mean better alignment.
    fn maximize(&self) -> bool {
        false
    }

    /// Get the name of this metric.
    fn name(&self) -> &'static str;
}

/// Metric selection for configuration files and the solver registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MetricKind {
    /// [`MeanSquares`](super::MeanSquares)
    #[default]
    MeanSquares,
    /// [`NormalizedCorrelation`](super::NormalizedCorrelation)
    NormalizedCorrelation,
}

impl MetricKind {
    /// Whether the metric is maximised by default.
    pub fn maximize(&self) -> bool {
        matches!(self, Self::NormalizedCorrelation)
    }

    /// Instantiate the metric with default settings.
    pub fn build<B: Backend>(&self) -> Box<dyn LocalMetric<B> + Send + Sync> {
        match self {
            Self::MeanSquares => Box::new(super::MeanSquares::new()),
            Self::NormalizedCorrelation => Box::new(super::NormalizedCorrelation::new()),
        }
    }
}
