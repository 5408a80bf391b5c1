//! Shared building blocks for the fedpriv federated learning demo.
//!
//! The demo trains a small binary classifier across multiple client
//! processes and aggregates their updates on a coordinator. This crate
//! holds everything both sides need to agree on:
//!
//! - [`model`]: the numerical representation of the model parameters and
//!   the fixed architecture of the demo classifier,
//! - [`aggregation`]: sample-count-weighted federated averaging,
//! - [`message`]: the round-scoped types exchanged between the coordinator
//!   and the clients,
//! - [`metrics`]: the append-only, file-backed metrics log consumed by the
//!   dashboard.

pub mod aggregation;
pub mod message;
pub mod metrics;
pub mod model;

pub use self::{
    aggregation::{weighted_mean, Aggregation, AggregationError},
    message::{ClientUpdate, EvaluationReport, Phase, RoundParameters},
    metrics::{JsonFileStore, MetricRecord, MetricStore, StoreError},
    model::ModelParameters,
};
