//! The state machine that executes the federated averaging protocol.
//!
//! # Overview
//!
//! The coordinator runs a fixed number of rounds. Each round consists of
//! two collection steps:
//!
//! - **Fit**: the current global model is published with [`Phase::Fit`];
//!   every expected client trains locally and posts a [`ClientUpdate`].
//!   Once all updates have arrived, the global model is replaced by their
//!   sample-count-weighted average.
//! - **Evaluate**: the new global model is published with
//!   [`Phase::Evaluate`]; every expected client posts an
//!   [`EvaluationReport`] for it. The reported losses and accuracies are
//!   averaged, weighted by the evaluation sample counts.
//!
//! After the last round the final model is published with
//! [`Phase::Complete`], which tells the clients to shut down.
//!
//! Requests that refer to any round other than the one currently being
//! collected are rejected with [`RequestError::StaleRound`], so retried
//! or reordered messages cannot corrupt a round. A collection step
//! optionally fails after `round_timeout_secs` instead of stalling
//! forever on a hung client.

pub mod events;
pub mod requests;

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use self::{
    events::{EventPublisher, EventSubscriber},
    requests::{RequestError, RequestReceiver, RequestSender, StateMachineRequest},
};
use crate::settings::ProtocolSettings;
use fedpriv_core::{
    aggregation::{weighted_mean, Aggregation, AggregationError},
    message::{ClientUpdate, EvaluationReport, Phase, RoundParameters},
    model::ModelParameters,
};

#[derive(Debug, Error)]
/// An error that aborts the protocol run.
pub enum RoundError {
    #[error("timed out waiting for client responses after {0} seconds")]
    Timeout(u64),

    #[error("the request channel closed while collecting client responses")]
    ChannelClosed,

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
}

/// The coordinator's round-driven state machine.
pub struct StateMachine {
    settings: ProtocolSettings,
    global_model: ModelParameters,
    events: EventPublisher,
    requests: RequestReceiver,
}

impl StateMachine {
    /// Creates a new state machine along with the handles the REST layer
    /// needs: a [`RequestSender`] for client requests and an
    /// [`EventSubscriber`] for the published round parameters.
    pub fn new(
        settings: ProtocolSettings,
        global_model: ModelParameters,
    ) -> (Self, RequestSender, EventSubscriber) {
        let (events, event_subscriber) = EventPublisher::init();
        let (requests, request_tx) = RequestReceiver::new();
        let state_machine = Self {
            settings,
            global_model,
            events,
            requests,
        };
        (state_machine, request_tx, event_subscriber)
    }

    /// Runs all configured rounds to completion.
    ///
    /// # Errors
    /// Fails if a collection step times out, the request channel closes,
    /// or aggregation fails. The protocol has no retry semantics: a
    /// failed round aborts the run and must be restarted externally.
    pub async fn run(mut self) -> Result<(), RoundError> {
        if self.settings.warmup_secs > 0 {
            info!(
                "waiting {} seconds for clients to connect",
                self.settings.warmup_secs
            );
            sleep(Duration::from_secs(self.settings.warmup_secs)).await;
        }

        for round_id in 1..=self.settings.rounds {
            self.run_round(round_id).await?;
        }

        self.events.broadcast_params(RoundParameters {
            round_id: self.settings.rounds,
            phase: Phase::Complete,
            model: self.global_model.clone(),
        });
        info!("training complete after {} rounds", self.settings.rounds);
        // leave the final phase up long enough for the clients to see it
        sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    async fn run_round(&mut self, round_id: u64) -> Result<(), RoundError> {
        info!(round_id, "starting round");
        self.events.broadcast_params(RoundParameters {
            round_id,
            phase: Phase::Fit,
            model: self.global_model.clone(),
        });

        let updates = self.collect(round_id, Step::Fit).await?;
        let update_count = updates.len();
        let mut aggregation = Aggregation::new();
        for update in updates {
            match update {
                Collected::Update(update) => aggregation.add(update.params, update.sample_count)?,
                Collected::Evaluation(_) => unreachable!("fit step only collects updates"),
            }
        }
        self.global_model = aggregation.aggregate()?;
        info!(round_id, "aggregated {} client updates", update_count);

        self.events.broadcast_params(RoundParameters {
            round_id,
            phase: Phase::Evaluate,
            model: self.global_model.clone(),
        });

        let reports: Vec<EvaluationReport> = self
            .collect(round_id, Step::Evaluate)
            .await?
            .into_iter()
            .map(|collected| match collected {
                Collected::Evaluation(report) => report,
                Collected::Update(_) => unreachable!("evaluate step only collects reports"),
            })
            .collect();

        let losses: Vec<(f64, u64)> = reports
            .iter()
            .map(|report| (report.loss, report.sample_count))
            .collect();
        let accuracies: Vec<(f64, u64)> = reports
            .iter()
            .filter_map(|report| {
                report
                    .metrics
                    .get("accuracy")
                    .map(|accuracy| (*accuracy, report.sample_count))
            })
            .collect();
        let loss = weighted_mean(&losses)?;
        match weighted_mean(&accuracies) {
            Ok(accuracy) => info!(round_id, loss, accuracy, "round evaluated"),
            Err(_) => info!(round_id, loss, "round evaluated (no accuracy reported)"),
        }
        Ok(())
    }

    /// Collects `expected_clients` responses for the given round and
    /// step, rejecting everything else.
    async fn collect(&mut self, round_id: u64, step: Step) -> Result<Vec<Collected>, RoundError> {
        let expected = self.settings.expected_clients;
        let requests = &mut self.requests;
        let fut = Self::collect_inner(requests, round_id, step, expected);
        match self.settings.round_timeout_secs {
            Some(secs) => timeout(Duration::from_secs(secs), fut)
                .await
                .map_err(|_| RoundError::Timeout(secs))?,
            None => fut.await,
        }
    }

    async fn collect_inner(
        requests: &mut RequestReceiver,
        round_id: u64,
        step: Step,
        expected: usize,
    ) -> Result<Vec<Collected>, RoundError> {
        let mut collected = Vec::with_capacity(expected);
        while collected.len() < expected {
            let (request, resp_tx) = requests.recv().await.ok_or(RoundError::ChannelClosed)?;
            let verdict = match (step, request) {
                (Step::Fit, StateMachineRequest::Update(update)) => {
                    if update.round_id == round_id {
                        collected.push(Collected::Update(update));
                        Ok(())
                    } else {
                        Err(RequestError::StaleRound {
                            expected: round_id,
                            got: update.round_id,
                        })
                    }
                }
                (Step::Evaluate, StateMachineRequest::Evaluation(report)) => {
                    if report.round_id == round_id {
                        collected.push(Collected::Evaluation(report));
                        Ok(())
                    } else {
                        Err(RequestError::StaleRound {
                            expected: round_id,
                            got: report.round_id,
                        })
                    }
                }
                (_, _) => Err(RequestError::WrongPhase),
            };
            if let Err(err) = &verdict {
                warn!(round_id, "rejecting client request: {}", err);
            } else {
                debug!(
                    round_id,
                    "collected {} of {} client responses",
                    collected.len(),
                    expected
                );
            }
            // the client may have hung up already
            let _ = resp_tx.send(verdict);
        }
        Ok(collected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Fit,
    Evaluate,
}

#[derive(Debug)]
enum Collected {
    Update(ClientUpdate),
    Evaluation(EvaluationReport),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn scalar_params(value: f32) -> ModelParameters {
        ModelParameters::from(vec![ArrayD::from_elem(IxDyn(&[1]), value)])
    }

    fn settings(rounds: u64, expected_clients: usize) -> ProtocolSettings {
        ProtocolSettings {
            rounds,
            expected_clients,
            warmup_secs: 0,
            round_timeout_secs: None,
        }
    }

    async fn wait_for_phase(subscriber: &EventSubscriber, phase: Phase) -> RoundParameters {
        loop {
            if let Some(params) = subscriber.params() {
                if params.phase == phase {
                    return (*params).clone();
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn one_round_with_two_clients() {
        let (state_machine, request_tx, subscriber) =
            StateMachine::new(settings(1, 2), scalar_params(0.0));
        let handle = tokio::spawn(state_machine.run());

        let params = wait_for_phase(&subscriber, Phase::Fit).await;
        assert_eq!(params.round_id, 1);

        // a stale update must be rejected without being counted
        let stale = ClientUpdate {
            round_id: 99,
            params: scalar_params(5.0),
            sample_count: 1,
            metrics: HashMap::new(),
        };
        assert_eq!(
            request_tx.request(stale.into()).await,
            Err(RequestError::StaleRound {
                expected: 1,
                got: 99
            })
        );

        for value in [0.0f32, 2.0] {
            let update = ClientUpdate {
                round_id: 1,
                params: scalar_params(value),
                sample_count: 1,
                metrics: HashMap::new(),
            };
            request_tx.request(update.into()).await.unwrap();
        }

        let params = wait_for_phase(&subscriber, Phase::Evaluate).await;
        assert_eq!(params.model, scalar_params(1.0));

        for loss in [0.4f64, 0.6] {
            let mut metrics = HashMap::new();
            metrics.insert("accuracy".to_string(), 0.9);
            let report = EvaluationReport {
                round_id: 1,
                loss,
                sample_count: 10,
                metrics,
            };
            request_tx.request(report.into()).await.unwrap();
        }

        let params = wait_for_phase(&subscriber, Phase::Complete).await;
        assert_eq!(params.model, scalar_params(1.0));
        handle.abort();
    }

    #[tokio::test]
    async fn evaluation_during_fit_is_rejected() {
        let (state_machine, request_tx, subscriber) =
            StateMachine::new(settings(1, 1), scalar_params(0.0));
        let handle = tokio::spawn(state_machine.run());
        wait_for_phase(&subscriber, Phase::Fit).await;

        let report = EvaluationReport {
            round_id: 1,
            loss: 0.1,
            sample_count: 1,
            metrics: HashMap::new(),
        };
        assert_eq!(
            request_tx.request(report.into()).await,
            Err(RequestError::WrongPhase)
        );
        handle.abort();
    }

    #[tokio::test]
    async fn silent_clients_time_the_round_out() {
        let settings = ProtocolSettings {
            round_timeout_secs: Some(0),
            ..settings(1, 1)
        };
        let (state_machine, _request_tx, _subscriber) =
            StateMachine::new(settings, scalar_params(0.0));
        match state_machine.run().await {
            Err(RoundError::Timeout(0)) => {}
            other => panic!("expected a timeout, got {:?}", other.map(|_| ())),
        }
    }
}
