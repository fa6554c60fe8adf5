//! Local similarity metrics.
//!
//! Metrics see neighbourhood samples gathered by the
//! [`MetricForceEvaluator`](crate::force::MetricForceEvaluator) and return a
//! value plus a derivative with respect to displacement.

pub mod trait_;
pub mod mse;
pub mod ncc;

pub use trait_::{LocalMetric, MetricKind, NeighborhoodSamples};
pub use mse::MeanSquares;
pub use ncc::NormalizedCorrelation;
