//! Normalized correlation metric.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use super::trait_::{LocalMetric, NeighborhoodSamples};

/// Normalized Correlation Metric.
///
/// Zero-normalized cross correlation over the neighbourhood of each point:
/// `NCC = sum(f m) / sqrt(sum(f^2) * sum(m^2))` with `f = F - mean(F)` and
/// `m = M - mean(M)`. Larger is better, so the metric is maximised.
///
/// Neighbourhoods with no intensity variation score zero with a zero
/// derivative; a radius of at least one voxel is needed for a meaningful
/// value.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedCorrelation {
    epsilon: f64,
}

impl NormalizedCorrelation {
    /// Create a new normalized correlation metric.
    pub fn new() -> Self {
        Self { epsilon: 1e-10 }
    }

    /// Variance product below which a neighbourhood is treated as flat.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

impl Default for NormalizedCorrelation {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> LocalMetric<B> for NormalizedCorrelation {
    fn value_and_derivative(&self, samples: &NeighborhoodSamples<B>) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let [n, _] = samples.fixed.dims();
        let [_, _, d] = samples.gradient.dims();

        let f = samples.fixed.clone() - samples.fixed.clone().mean_dim(1);
        let m = samples.moving.clone() - samples.moving.clone().mean_dim(1);

        let sff = (f.clone() * f.clone()).sum_dim(1); // [N, 1]
        let smm = (m.clone() * m.clone()).sum_dim(1);
        let sfm = (f.clone() * m.clone()).sum_dim(1);

        let denom_sq = sff * smm.clone();
        let valid = denom_sq.clone().greater_elem(self.epsilon).float();
        let safe_denom_sq = denom_sq * valid.clone() + (valid.clone().neg() + 1.0);
        let safe_smm = smm * valid.clone() + (valid.clone().neg() + 1.0);

        let inv_denom = safe_denom_sq.sqrt().recip() * valid.clone();
        let ncc = sfm * inv_denom.clone(); // [N, 1]

        // dNCC/dm_k = f_k / sqrt(Sff Smm) - NCC m_k / Smm
        let weights = f * inv_denom - m * (ncc.clone() / safe_smm) * valid;
        let derivative = (samples.gradient.clone() * weights.unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .reshape([n, d]);

        (ncc.reshape([n]), derivative)
    }

    fn maximize(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "NormalizedCorrelation"
    }
}
