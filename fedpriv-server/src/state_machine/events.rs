//! Publishing of round state to the request handlers.
//!
//! The state machine owns the [`EventPublisher`] half; the REST layer
//! holds cloned [`EventSubscriber`]s and serves whatever round parameters
//! were published last. `None` means no round has started yet.

use std::sync::Arc;

use tokio::sync::watch;

use fedpriv_core::message::RoundParameters;

#[derive(Debug)]
/// The sending half: publishes the parameters of the current round.
pub struct EventPublisher {
    params_tx: watch::Sender<Option<Arc<RoundParameters>>>,
}

#[derive(Debug, Clone)]
/// The receiving half: hands out the most recently published round
/// parameters.
pub struct EventSubscriber {
    params_rx: watch::Receiver<Option<Arc<RoundParameters>>>,
}

impl EventPublisher {
    /// Initializes a new event publisher/subscriber pair. No round
    /// parameters are published yet.
    pub fn init() -> (Self, EventSubscriber) {
        let (params_tx, params_rx) = watch::channel(None);
        (
            EventPublisher { params_tx },
            EventSubscriber { params_rx },
        )
    }

    /// Publishes new round parameters, replacing the previous ones.
    pub fn broadcast_params(&mut self, params: RoundParameters) {
        // an error means there are no subscribers left, which is fine
        let _ = self.params_tx.send(Some(Arc::new(params)));
    }
}

impl EventSubscriber {
    /// Gets the most recently published round parameters, if any.
    pub fn params(&self) -> Option<Arc<RoundParameters>> {
        self.params_rx.borrow().clone()
    }
}
