//! Wire types exchanged between the coordinator and the clients.
//!
//! Every message carries the round id explicitly so that neither side has
//! to infer the round from call order. A client that replies late or whose
//! message gets retried cannot silently drift away from the coordinator's
//! round counter: stale messages are detected and rejected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::ModelParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The phase the coordinator is currently in.
pub enum Phase {
    /// Clients should train on the published global model and report an
    /// update.
    Fit,
    /// Clients should evaluate the published global model on their
    /// held-out data and report the result.
    Evaluate,
    /// All rounds are done; clients may shut down.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The parameters of the current round, published by the coordinator.
pub struct RoundParameters {
    /// The id of the current round, starting at 1.
    pub round_id: u64,
    /// The phase of the current round.
    pub phase: Phase,
    /// The current global model.
    pub model: ModelParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The result of one local training pass, sent by a client.
///
/// Produced once per client per round and consumed exactly once by the
/// coordinator's aggregation step; it is never persisted.
pub struct ClientUpdate {
    /// The round this update belongs to.
    pub round_id: u64,
    /// The locally trained parameters.
    pub params: ModelParameters,
    /// The number of training examples the update was computed on. Used
    /// as the aggregation weight.
    pub sample_count: u64,
    /// Auxiliary metrics. Currently always empty for fit responses.
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The result of one local evaluation pass, sent by a client.
pub struct EvaluationReport {
    /// The round this report belongs to.
    pub round_id: u64,
    /// The mean loss over the client's held-out set.
    pub loss: f64,
    /// The number of evaluation examples.
    pub sample_count: u64,
    /// Named metrics, at least `"accuracy"`.
    pub metrics: HashMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::init_parameters;

    #[test]
    fn round_parameters_survive_the_wire() {
        let params = RoundParameters {
            round_id: 3,
            phase: Phase::Fit,
            model: init_parameters(42),
        };
        let bytes = bincode::serialize(&params).unwrap();
        let decoded: RoundParameters = bincode::deserialize(&bytes).unwrap();
        assert_eq!(params, decoded);
    }
}
