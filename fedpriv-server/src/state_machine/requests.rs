//! The request channel between the REST layer and the state machine.
//!
//! Request handlers send [`StateMachineRequest`]s through a
//! [`RequestSender`] and await the state machine's verdict on a oneshot
//! channel; the state machine consumes them through the matching
//! [`RequestReceiver`].

use derive_more::From;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use fedpriv_core::message::{ClientUpdate, EvaluationReport};

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors which can occur while the state machine handles a request.
pub enum RequestError {
    #[error("the request refers to round {got} but the coordinator is collecting round {expected}")]
    StaleRound { expected: u64, got: u64 },

    #[error("the coordinator is not collecting this kind of request right now")]
    WrongPhase,

    #[error("the coordinator has shut down")]
    Closed,
}

#[derive(Debug, From)]
/// A request for the state machine.
pub enum StateMachineRequest {
    Update(ClientUpdate),
    Evaluation(EvaluationReport),
}

type ResponseSender = oneshot::Sender<Result<(), RequestError>>;

#[derive(Debug, Clone, From)]
/// A handle to send requests to the state machine.
pub struct RequestSender(mpsc::UnboundedSender<(StateMachineRequest, ResponseSender)>);

impl RequestSender {
    /// Sends a request to the state machine and waits for it to be
    /// accepted or rejected.
    ///
    /// # Errors
    /// Fails if the state machine rejects the request or has already shut
    /// down.
    pub async fn request(&self, req: StateMachineRequest) -> Result<(), RequestError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.0
            .send((req, resp_tx))
            .map_err(|_| RequestError::Closed)?;
        resp_rx.await.map_err(|_| RequestError::Closed)?
    }
}

#[derive(Debug)]
/// The receiving half of the request channel, owned by the state machine.
pub struct RequestReceiver(mpsc::UnboundedReceiver<(StateMachineRequest, ResponseSender)>);

impl RequestReceiver {
    /// Creates a new request channel.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestReceiver(rx), RequestSender(tx))
    }

    /// Receives the next request, or `None` once all senders are gone.
    pub async fn recv(&mut self) -> Option<(StateMachineRequest, ResponseSender)> {
        self.0.recv().await
    }
}
