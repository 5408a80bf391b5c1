//! Sample-count-weighted federated averaging.

use ndarray::ArrayD;
use thiserror::Error;

use crate::model::ModelParameters;

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to the aggregation of client updates.
pub enum AggregationError {
    #[error("there are no updates to aggregate")]
    NoUpdates,

    #[error("the total sample count of the aggregated updates is zero")]
    ZeroSampleCount,

    #[error("the layout of the update does not match the aggregated layout")]
    ShapeMismatch,
}

#[derive(Debug, Default)]
/// Accumulates client updates and computes their sample-count-weighted
/// average.
///
/// For every parameter position the aggregate is
/// `sum_i(sample_count_i * params_i) / sum_i(sample_count_i)`, so a client
/// that trained on more examples pulls the global model further towards
/// its update.
pub struct Aggregation {
    weighted_sum: Option<Vec<ArrayD<f32>>>,
    total_samples: u64,
}

impl Aggregation {
    pub fn new() -> Self {
        Default::default()
    }

    /// Gets the number of training examples accumulated so far.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Adds one client update, weighted by its sample count.
    ///
    /// # Errors
    /// Fails if the layout of `params` differs from the updates added
    /// before.
    pub fn add(
        &mut self,
        params: ModelParameters,
        sample_count: u64,
    ) -> Result<(), AggregationError> {
        let weight = sample_count as f32;
        match &mut self.weighted_sum {
            None => {
                self.weighted_sum = Some(params.into_iter().map(|t| t.mapv(|v| v * weight)).collect());
            }
            Some(sum) => {
                let matches = sum.len() == params.len()
                    && sum
                        .iter()
                        .zip(params.iter())
                        .all(|(a, b)| a.shape() == b.shape());
                if !matches {
                    return Err(AggregationError::ShapeMismatch);
                }
                for (acc, tensor) in sum.iter_mut().zip(params.iter()) {
                    acc.scaled_add(weight, tensor);
                }
            }
        }
        self.total_samples += sample_count;
        Ok(())
    }

    /// Consumes the accumulator and yields the weighted average.
    ///
    /// # Errors
    /// Fails if no update was added or if the total sample count is zero.
    /// A zero total would otherwise silently turn the global model into
    /// NaNs.
    pub fn aggregate(self) -> Result<ModelParameters, AggregationError> {
        let sum = self.weighted_sum.ok_or(AggregationError::NoUpdates)?;
        if self.total_samples == 0 {
            return Err(AggregationError::ZeroSampleCount);
        }
        let scale = 1.0 / self.total_samples as f32;
        Ok(sum.into_iter().map(|t| t.mapv(|v| v * scale)).collect())
    }
}

/// The weighted mean of scalar values, e.g. evaluation losses weighted by
/// evaluation sample counts.
///
/// # Errors
/// Fails like [`Aggregation::aggregate`]: no values, or a zero total
/// weight.
pub fn weighted_mean(values: &[(f64, u64)]) -> Result<f64, AggregationError> {
    if values.is_empty() {
        return Err(AggregationError::NoUpdates);
    }
    let total: u64 = values.iter().map(|(_, count)| count).sum();
    if total == 0 {
        return Err(AggregationError::ZeroSampleCount);
    }
    let sum: f64 = values
        .iter()
        .map(|(value, count)| value * *count as f64)
        .sum();
    Ok(sum / total as f64)
}
