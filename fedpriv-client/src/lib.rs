//! A client of the fedpriv federated learning demo.
//!
//! Each client process owns a local data shard that never leaves the
//! process. In every round it pulls the current global model from the
//! coordinator, trains it locally with differentially private SGD
//! ([`trainer`]), reports the updated parameters together with its sample
//! count, and later evaluates the aggregated model on its held-out split.
//! After every local training round the client appends one record with
//! loss, accuracy and the privacy budget spent so far to the shared
//! metrics log.

pub mod accountant;
pub mod api;
pub mod data;
pub mod model;
pub mod participant;
pub mod settings;
pub mod trainer;
