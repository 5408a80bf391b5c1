//! The coordinator of the fedpriv federated learning demo.
//!
//! The coordinator holds no training data. It drives a fixed number of
//! federated averaging rounds: each round it publishes the current global
//! model, waits for every expected client to report a locally trained
//! update, replaces the global model with the sample-count-weighted
//! average of the updates, and then collects one evaluation report per
//! client for the new model.
//!
//! Clients talk to the coordinator over a small HTTP API ([`rest`]): they
//! poll `GET /round` for the current [round parameters] and post their
//! updates and evaluation reports. The round logic itself lives in
//! [`state_machine`].
//!
//! [round parameters]: fedpriv_core::message::RoundParameters

pub mod rest;
pub mod settings;
pub mod state_machine;
