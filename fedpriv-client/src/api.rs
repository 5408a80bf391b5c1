//! The HTTP client for the coordinator's API.

use reqwest::{Client, ClientBuilder, Response, StatusCode};
use thiserror::Error;

use fedpriv_core::message::{ClientUpdate, EvaluationReport, RoundParameters};

#[derive(Debug, Error)]
/// An error related to talking to the coordinator.
pub enum ClientError {
    #[error("the HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode or decode a payload: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("the coordinator rejected the request")]
    Rejected,

    #[error("the coordinator answered with an unexpected status: {0}")]
    UnexpectedResponse(StatusCode),
}

#[derive(Debug, Clone)]
/// Talks to the coordinator's REST API.
pub struct CoordinatorClient {
    client: Client,
    address: String,
}

impl CoordinatorClient {
    /// Creates a client for the coordinator at `address`, e.g.
    /// `http://127.0.0.1:8080`.
    ///
    /// # Errors
    /// Fails if the underlying HTTP client cannot be initialized.
    pub fn new(address: impl Into<String>) -> Result<Self, ClientError> {
        let client = ClientBuilder::new().build()?;
        Ok(Self {
            client,
            address: address.into(),
        })
    }

    /// Fetches the current round parameters, or `None` while the
    /// coordinator has not started a round yet.
    pub async fn get_round(&self) -> Result<Option<RoundParameters>, ClientError> {
        let url = format!("{}/round", self.address);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let body = response.bytes().await?;
                Ok(Some(bincode::deserialize(&body)?))
            }
            status => Err(ClientError::UnexpectedResponse(status)),
        }
    }

    /// Sends a locally trained update for the current round.
    pub async fn send_update(&self, update: &ClientUpdate) -> Result<(), ClientError> {
        let url = format!("{}/update", self.address);
        self.post(&url, bincode::serialize(update)?).await
    }

    /// Sends an evaluation report for the current round.
    pub async fn send_evaluation(&self, report: &EvaluationReport) -> Result<(), ClientError> {
        let url = format!("{}/evaluation", self.address);
        self.post(&url, bincode::serialize(report)?).await
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<(), ClientError> {
        let response: Response = self
            .client
            .post(url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(ClientError::Rejected),
            status => Err(ClientError::UnexpectedResponse(status)),
        }
    }
}
