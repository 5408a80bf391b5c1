//! The client-side protocol logic.
//!
//! A [`Participant`] owns the local model, the shard and the trainer, and
//! answers the two requests the coordinator makes each round: `fit` (train
//! locally and hand back the updated parameters) and `evaluate` (score the
//! aggregated model on the held-out split). [`run`] wraps a participant
//! into the polling loop that drives it against a live coordinator.

use std::{collections::HashMap, time::Duration};

use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    api::{ClientError, CoordinatorClient},
    data::Dataset,
    model::{Classifier, LayoutError},
    trainer::DpTrainer,
};
use fedpriv_core::{
    message::{ClientUpdate, EvaluationReport, Phase, RoundParameters},
    metrics::{MetricRecord, MetricStore, StoreError},
    model::ModelParameters,
};

#[derive(Debug, Error)]
/// An error related to handling a coordinator request locally.
pub enum ParticipantError {
    #[error("received global parameters with the wrong layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("failed to persist metrics: {0}")]
    Store(#[from] StoreError),
}

/// A single federated learning participant.
pub struct Participant<S> {
    model: Classifier,
    trainer: DpTrainer,
    dataset: Dataset,
    metrics: S,
    round: u64,
}

impl<S: MetricStore> Participant<S> {
    /// Creates a participant. Its local round counter starts at 1.
    pub fn new(model: Classifier, trainer: DpTrainer, dataset: Dataset, metrics: S) -> Self {
        Self {
            model,
            trainer,
            dataset,
            metrics,
            round: 1,
        }
    }

    /// The local round counter: how many fit requests have been served,
    /// plus one.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Extracts the current local parameters.
    pub fn get_parameters(&self) -> ModelParameters {
        self.model.get_parameters()
    }

    /// Replaces the local parameters with the received global ones.
    pub fn set_parameters(&mut self, params: ModelParameters) -> Result<(), ParticipantError> {
        self.model.set_parameters(params)?;
        Ok(())
    }

    /// Serves a fit request: adopts the global parameters, trains one
    /// noisy epoch on the local shard, logs one metric record and hands
    /// back the updated parameters with the training sample count.
    ///
    /// Exactly one record is appended per call, carrying the training
    /// loss, the held-out accuracy and the total privacy budget spent so
    /// far. The local round counter advances afterwards.
    pub fn fit(
        &mut self,
        params: ModelParameters,
    ) -> Result<(ModelParameters, u64, HashMap<String, f64>), ParticipantError> {
        self.model.set_parameters(params)?;
        let loss = self
            .trainer
            .train_epoch(&mut self.model, &self.dataset.train_x, &self.dataset.train_y);
        let (_, accuracy) = self.heldout_metrics();
        let epsilon = self.trainer.epsilon();

        info!(
            round = self.round,
            loss, accuracy, epsilon, "local training round done"
        );
        self.metrics.append(MetricRecord {
            round: self.round,
            loss,
            accuracy,
            epsilon,
        })?;
        self.round += 1;

        Ok((
            self.model.get_parameters(),
            self.dataset.num_train() as u64,
            HashMap::new(),
        ))
    }

    /// Serves an evaluate request: adopts the global parameters and
    /// scores them on the held-out split.
    pub fn evaluate(
        &mut self,
        params: ModelParameters,
    ) -> Result<(f64, u64, HashMap<String, f64>), ParticipantError> {
        self.model.set_parameters(params)?;
        let (loss, accuracy) = self.heldout_metrics();
        let mut metrics = HashMap::new();
        metrics.insert("accuracy".to_string(), accuracy);
        Ok((loss, self.dataset.num_test() as u64, metrics))
    }

    fn heldout_metrics(&self) -> (f64, f64) {
        let mut loss = 0.0f64;
        let mut correct = 0usize;
        for (row, &label) in self
            .dataset
            .test_x
            .rows()
            .into_iter()
            .zip(&self.dataset.test_y)
        {
            loss += self.model.loss(row, label) as f64;
            if self.model.predict(row) == label {
                correct += 1;
            }
        }
        let count = self.dataset.num_test() as f64;
        (loss / count, correct as f64 / count)
    }
}

#[derive(Debug, Error)]
/// An error that aborts the client's polling loop.
pub enum RunError {
    #[error(transparent)]
    Api(#[from] ClientError),

    #[error(transparent)]
    Participant(#[from] ParticipantError),
}

/// Polls the coordinator until training completes.
///
/// Each poll fetches the current round parameters and serves them once:
/// one fit per round, one evaluation per round, shutdown on
/// [`Phase::Complete`]. A rejected submission is logged and dropped; the
/// next poll resynchronizes with the coordinator's current round.
///
/// # Errors
/// Fails on transport errors, on global parameters with the wrong layout
/// and on metric log failures.
pub async fn run<S: MetricStore>(
    mut participant: Participant<S>,
    client: CoordinatorClient,
    poll_interval: Duration,
) -> Result<(), RunError> {
    let mut last_fit = None;
    let mut last_eval = None;
    loop {
        match client.get_round().await? {
            None => {}
            Some(RoundParameters {
                round_id,
                phase: Phase::Fit,
                model,
            }) if last_fit != Some(round_id) => {
                let (params, sample_count, metrics) = participant.fit(model)?;
                let update = ClientUpdate {
                    round_id,
                    params,
                    sample_count,
                    metrics,
                };
                match client.send_update(&update).await {
                    Ok(()) => last_fit = Some(round_id),
                    Err(ClientError::Rejected) => {
                        warn!(round_id, "update rejected, resynchronizing")
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Some(RoundParameters {
                round_id,
                phase: Phase::Evaluate,
                model,
            }) if last_eval != Some(round_id) => {
                let (loss, sample_count, metrics) = participant.evaluate(model)?;
                let report = EvaluationReport {
                    round_id,
                    loss,
                    sample_count,
                    metrics,
                };
                match client.send_evaluation(&report).await {
                    Ok(()) => last_eval = Some(round_id),
                    Err(ClientError::Rejected) => {
                        warn!(round_id, "evaluation rejected, resynchronizing")
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Some(RoundParameters {
                phase: Phase::Complete,
                model,
                ..
            }) => {
                participant.set_parameters(model)?;
                info!("training complete, shutting down");
                return Ok(());
            }
            // this phase was already served, keep polling
            Some(_) => {}
        }
        sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::PrivacyConfig;
    use fedpriv_core::{metrics::JsonFileStore, model::init_parameters};

    fn participant(store: JsonFileStore) -> Participant<JsonFileStore> {
        let dataset = Dataset::synthetic(64, 0.25, 0);
        let model = Classifier::from_parameters(init_parameters(0)).unwrap();
        let privacy = PrivacyConfig {
            noise_multiplier: 1.0,
            max_grad_norm: 1.0,
            delta: 1e-5,
        };
        let trainer = DpTrainer::new(privacy, 0.01, 16, dataset.num_train(), 0).unwrap();
        Participant::new(model, trainer, dataset, store)
    }

    #[test]
    fn each_fit_appends_exactly_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("metrics.json"));
        let mut participant = participant(store.clone());

        for expected_round in 1..=3u64 {
            assert_eq!(participant.round(), expected_round);
            participant.fit(init_parameters(0)).unwrap();
        }

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 3);
        let rounds: Vec<u64> = records.iter().map(|r| r.round).collect();
        assert_eq!(rounds, vec![1, 2, 3]);
        // the budget only ever grows
        assert!(records[0].epsilon > 0.0);
        assert!(records[1].epsilon > records[0].epsilon);
        assert!(records[2].epsilon > records[1].epsilon);
    }

    #[test]
    fn fit_reports_the_training_sample_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("metrics.json"));
        let mut participant = participant(store);

        let (params, sample_count, metrics) = participant.fit(init_parameters(0)).unwrap();
        assert_eq!(sample_count, 48);
        assert!(metrics.is_empty());
        // training must have moved the parameters
        assert_ne!(params, init_parameters(0));
    }

    #[test]
    fn evaluate_reports_the_heldout_split() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("metrics.json"));
        let mut participant = participant(store.clone());

        let (loss, sample_count, metrics) = participant.evaluate(init_parameters(0)).unwrap();
        assert_eq!(sample_count, 16);
        assert!(loss.is_finite());
        let accuracy = metrics["accuracy"];
        assert!((0.0..=1.0).contains(&accuracy));
        // evaluation must not log a metric record
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn parameters_round_trip_through_the_participant() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("metrics.json"));
        let mut participant = participant(store);

        let params = init_parameters(99);
        participant.set_parameters(params.clone()).unwrap();
        assert_eq!(participant.get_parameters(), params);
    }
}
