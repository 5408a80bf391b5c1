//! Differentially private local training.
//!
//! One epoch shuffles the shard, walks it in batches and takes one noisy
//! gradient step per batch. A step computes the gradient of every example
//! in the batch separately, clips each per-example gradient to
//! `max_grad_norm` in L2, averages the clipped gradients and perturbs the
//! average with Gaussian noise of standard deviation
//! `noise_multiplier * max_grad_norm / batch_size`. Clipping bounds any
//! single example's influence on the step, which is what the noise scale
//! is calibrated against.

use ndarray::Array2;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::Normal;
use thiserror::Error;

use crate::{
    accountant::RdpAccountant,
    model::{Classifier, Gradients},
};

#[derive(Debug, Error, PartialEq)]
/// An error related to the privacy or training configuration.
pub enum TrainerError {
    #[error("invalid privacy configuration: {0}")]
    InvalidPrivacyConfig(&'static str),

    #[error("invalid training configuration: {0}")]
    InvalidTrainingConfig(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// The differential privacy parameters of the local training.
pub struct PrivacyConfig {
    /// The ratio of the noise standard deviation to the clipping norm.
    pub noise_multiplier: f64,
    /// The L2 norm each per-example gradient is clipped to.
    pub max_grad_norm: f64,
    /// The delta of the `(epsilon, delta)` guarantee.
    pub delta: f64,
}

#[derive(Debug)]
/// Runs noisy gradient descent epochs and accounts for their privacy
/// cost.
pub struct DpTrainer {
    privacy: PrivacyConfig,
    learning_rate: f32,
    batch_size: usize,
    noise: Normal<f32>,
    accountant: RdpAccountant,
    rng: ChaCha20Rng,
}

impl DpTrainer {
    /// Creates a trainer for a shard of `num_examples` training examples.
    ///
    /// # Errors
    /// Fails on any parameter that would void the privacy guarantee or
    /// make training meaningless: a non-positive noise multiplier,
    /// clipping norm, delta or learning rate, a delta of one or more, or
    /// a zero batch size.
    pub fn new(
        privacy: PrivacyConfig,
        learning_rate: f32,
        batch_size: usize,
        num_examples: usize,
        seed: u64,
    ) -> Result<Self, TrainerError> {
        if !(privacy.noise_multiplier > 0.0) {
            return Err(TrainerError::InvalidPrivacyConfig(
                "the noise multiplier must be positive",
            ));
        }
        if !(privacy.max_grad_norm > 0.0) {
            return Err(TrainerError::InvalidPrivacyConfig(
                "the clipping norm must be positive",
            ));
        }
        if !(privacy.delta > 0.0 && privacy.delta < 1.0) {
            return Err(TrainerError::InvalidPrivacyConfig(
                "delta must lie strictly between zero and one",
            ));
        }
        if !(learning_rate > 0.0) {
            return Err(TrainerError::InvalidTrainingConfig(
                "the learning rate must be positive",
            ));
        }
        if batch_size == 0 {
            return Err(TrainerError::InvalidTrainingConfig(
                "the batch size must be positive",
            ));
        }
        if num_examples == 0 {
            return Err(TrainerError::InvalidTrainingConfig(
                "the training shard is empty",
            ));
        }

        let std = (privacy.noise_multiplier * privacy.max_grad_norm) as f32 / batch_size as f32;
        let noise = Normal::new(0.0, std)
            .map_err(|_| TrainerError::InvalidPrivacyConfig("the noise scale is not finite"))?;
        let sampling_rate = (batch_size as f64 / num_examples as f64).min(1.0);
        Ok(Self {
            privacy,
            learning_rate,
            batch_size,
            noise,
            accountant: RdpAccountant::new(privacy.noise_multiplier, sampling_rate),
            rng: ChaCha20Rng::seed_from_u64(seed),
        })
    }

    /// Trains for one epoch over the shard and returns the mean batch
    /// loss. Every batch is recorded with the accountant.
    pub fn train_epoch(&mut self, model: &mut Classifier, x: &Array2<f32>, y: &[usize]) -> f64 {
        let mut indices: Vec<usize> = (0..y.len()).collect();
        indices.shuffle(&mut self.rng);

        let mut epoch_loss = 0.0;
        let mut batches = 0u64;
        for batch in indices.chunks(self.batch_size) {
            let mut batch_grads = Gradients::zeros();
            let mut batch_loss = 0.0f64;
            for &i in batch {
                let (loss, mut grads) = model.grad(x.row(i), y[i]);
                batch_loss += loss as f64;

                let norm = grads.l2_norm();
                let clip = self.privacy.max_grad_norm as f32;
                if norm > clip {
                    grads.scale(clip / norm);
                }
                batch_grads.add(&grads);
            }
            batch_grads.scale(1.0 / batch.len() as f32);
            batch_grads.add_noise(&mut self.rng, &self.noise);
            model.apply_step(&batch_grads, self.learning_rate);

            epoch_loss += batch_loss / batch.len() as f64;
            batches += 1;
        }
        self.accountant.record_steps(batches);
        epoch_loss / batches as f64
    }

    /// The privacy budget spent so far at the configured delta.
    pub fn epsilon(&self) -> f64 {
        self.accountant.epsilon(self.privacy.delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use fedpriv_core::model::init_parameters;

    fn privacy() -> PrivacyConfig {
        PrivacyConfig {
            noise_multiplier: 1.0,
            max_grad_norm: 1.0,
            delta: 1e-5,
        }
    }

    #[test]
    fn bad_configurations_are_rejected() {
        let cases = [
            PrivacyConfig {
                noise_multiplier: 0.0,
                ..privacy()
            },
            PrivacyConfig {
                noise_multiplier: -1.0,
                ..privacy()
            },
            PrivacyConfig {
                max_grad_norm: 0.0,
                ..privacy()
            },
            PrivacyConfig {
                delta: 0.0,
                ..privacy()
            },
            PrivacyConfig {
                delta: 1.0,
                ..privacy()
            },
        ];
        for case in cases {
            assert!(matches!(
                DpTrainer::new(case, 0.01, 32, 100, 0),
                Err(TrainerError::InvalidPrivacyConfig(_))
            ));
        }
        assert!(matches!(
            DpTrainer::new(privacy(), 0.0, 32, 100, 0),
            Err(TrainerError::InvalidTrainingConfig(_))
        ));
        assert!(matches!(
            DpTrainer::new(privacy(), 0.01, 0, 100, 0),
            Err(TrainerError::InvalidTrainingConfig(_))
        ));
        assert!(matches!(
            DpTrainer::new(privacy(), 0.01, 32, 0, 0),
            Err(TrainerError::InvalidTrainingConfig(_))
        ));
    }

    #[test]
    fn epsilon_grows_with_every_epoch() {
        let data = Dataset::synthetic(100, 0.2, 0);
        let mut model = Classifier::from_parameters(init_parameters(0)).unwrap();
        let mut trainer = DpTrainer::new(privacy(), 0.01, 32, data.num_train(), 0).unwrap();

        assert_eq!(trainer.epsilon(), 0.0);
        let mut last = 0.0;
        for _ in 0..3 {
            trainer.train_epoch(&mut model, &data.train_x, &data.train_y);
            let epsilon = trainer.epsilon();
            assert!(epsilon > last);
            last = epsilon;
        }
    }

    #[test]
    fn training_with_little_noise_learns_the_blobs() {
        let data = Dataset::synthetic(400, 0.2, 1);
        let mut model = Classifier::from_parameters(init_parameters(1)).unwrap();
        let gentle = PrivacyConfig {
            noise_multiplier: 0.01,
            max_grad_norm: 10.0,
            delta: 1e-5,
        };
        let mut trainer = DpTrainer::new(gentle, 0.1, 32, data.num_train(), 1).unwrap();

        let first = trainer.train_epoch(&mut model, &data.train_x, &data.train_y);
        let mut last = first;
        for _ in 0..9 {
            last = trainer.train_epoch(&mut model, &data.train_x, &data.train_y);
        }
        assert!(last < first, "loss went from {} to {}", first, last);

        let correct = data
            .test_x
            .rows()
            .into_iter()
            .zip(&data.test_y)
            .filter(|(row, &label)| model.predict(row.view()) == label)
            .count();
        let accuracy = correct as f64 / data.num_test() as f64;
        assert!(accuracy > 0.7, "held-out accuracy {}", accuracy);
    }
}
