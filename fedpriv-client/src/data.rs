//! The synthetic local data shard.
//!
//! Every client draws its own shard: two Gaussian blobs in
//! [`INPUT_DIM`]-dimensional space whose means sit at `+0.6` and `-0.6`
//! per feature, standardized per feature and split into a training and a
//! held-out part. Different seeds yield disjoint-looking shards, which is
//! what makes the averaging across clients meaningful in the demo.

use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, StandardNormal};

use fedpriv_core::model::INPUT_DIM;

/// How far each blob's mean sits from the origin, per feature.
const CLASS_SEPARATION: f32 = 0.6;

#[derive(Debug, Clone)]
/// A local data shard with a train and a held-out split.
pub struct Dataset {
    pub train_x: Array2<f32>,
    pub train_y: Vec<usize>,
    pub test_x: Array2<f32>,
    pub test_y: Vec<usize>,
}

impl Dataset {
    /// Draws a fresh shard of `samples` labeled examples and splits off
    /// the last `test_fraction` of them as the held-out set. Both splits
    /// always hold at least one example.
    pub fn synthetic(samples: usize, test_fraction: f64, seed: u64) -> Self {
        let samples = samples.max(2);
        let mut rng = ChaCha20Rng::seed_from_u64(seed);

        let mut x = Array2::<f32>::zeros((samples, INPUT_DIM));
        let mut y = Vec::with_capacity(samples);
        for mut row in x.rows_mut() {
            let label = rng.gen_bool(0.5) as usize;
            let mean = if label == 1 {
                CLASS_SEPARATION
            } else {
                -CLASS_SEPARATION
            };
            for value in row.iter_mut() {
                let noise: f32 = StandardNormal.sample(&mut rng);
                *value = mean + noise;
            }
            y.push(label);
        }

        // standardize per feature, like the tabular pipelines this mimics
        for mut column in x.columns_mut() {
            let mean = column.mean().unwrap_or(0.0);
            let std = column.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0).sqrt();
            let std = if std > 0.0 { std } else { 1.0 };
            column.mapv_inplace(|v| (v - mean) / std);
        }

        let test_count = ((samples as f64 * test_fraction).round() as usize)
            .max(1)
            .min(samples - 1);
        let train_count = samples - test_count;

        let train_x = x.slice_axis(Axis(0), (0..train_count).into()).to_owned();
        let test_x = x.slice_axis(Axis(0), (train_count..samples).into()).to_owned();
        let test_y = y.split_off(train_count);

        Dataset {
            train_x,
            train_y: y,
            test_x,
            test_y,
        }
    }

    pub fn num_train(&self) -> usize {
        self.train_y.len()
    }

    pub fn num_test(&self) -> usize {
        self.test_y.len()
    }
}
