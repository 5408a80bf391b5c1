//! The HTTP API the clients poll and post to.
//!
//! The exact wire protocol is deliberately thin: round parameters and
//! client payloads travel as bincode over `application/octet-stream`, and
//! the round id inside every payload ties it to the round it belongs to.

use std::convert::Infallible;

use bytes::Bytes;
use tracing::warn;
use warp::{
    http::{Response, StatusCode},
    Filter,
};

use crate::{
    settings::ApiSettings,
    state_machine::{
        events::EventSubscriber,
        requests::{RequestSender, StateMachineRequest},
    },
};
use fedpriv_core::{
    message::{ClientUpdate, EvaluationReport},
    metrics::{JsonFileStore, MetricStore},
};

/// Starts the coordinator's HTTP server at the configured address.
///
/// * `api_settings`: the address to bind to.
/// * `subscriber`: hands out the current round parameters.
/// * `requests`: forwards client updates and evaluation reports to the
///   state machine.
pub async fn serve(api_settings: ApiSettings, subscriber: EventSubscriber, requests: RequestSender) {
    let round = warp::path!("round")
        .and(warp::get())
        .and(with_subscriber(subscriber))
        .and_then(handle_round);

    let update = warp::path!("update")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_requests(requests.clone()))
        .and_then(handle_update);

    let evaluation = warp::path!("evaluation")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_requests(requests))
        .and_then(handle_evaluation);

    let routes = round.or(update).or(evaluation).with(warp::log("http"));

    warp::serve(routes).run(api_settings.bind_address).await
}

/// The read-only query interface for the dashboard: serves the metrics
/// log as a JSON array, `[]` when no data exists yet, with permissive
/// cross-origin access.
pub fn metrics_routes(
    store: JsonFileStore,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let cors = warp::cors().allow_any_origin().allow_method("GET");
    warp::path!("metrics")
        .and(warp::get())
        .map(move || warp::reply::json(&store.read_or_default()))
        .with(cors)
}

/// Handles and responds to a request for the current round parameters.
async fn handle_round(subscriber: EventSubscriber) -> Result<impl warp::Reply, Infallible> {
    Ok(match subscriber.params() {
        Some(params) => Response::builder()
            .header("Content-Type", "application/octet-stream")
            .status(StatusCode::OK)
            .body(bincode::serialize(params.as_ref()).unwrap())
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Vec::new())
            .unwrap(),
    })
}

/// Handles and responds to a client update.
async fn handle_update(body: Bytes, requests: RequestSender) -> Result<impl warp::Reply, Infallible> {
    let update: ClientUpdate = match bincode::deserialize(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("malformed client update: {:?}", e);
            return Ok(StatusCode::BAD_REQUEST);
        }
    };
    Ok(
        match requests.request(StateMachineRequest::Update(update)).await {
            Ok(()) => StatusCode::OK,
            Err(e) => {
                warn!("client update rejected: {}", e);
                StatusCode::CONFLICT
            }
        },
    )
}

/// Handles and responds to an evaluation report.
async fn handle_evaluation(
    body: Bytes,
    requests: RequestSender,
) -> Result<impl warp::Reply, Infallible> {
    let report: EvaluationReport = match bincode::deserialize(&body) {
        Ok(report) => report,
        Err(e) => {
            warn!("malformed evaluation report: {:?}", e);
            return Ok(StatusCode::BAD_REQUEST);
        }
    };
    Ok(
        match requests
            .request(StateMachineRequest::Evaluation(report))
            .await
        {
            Ok(()) => StatusCode::OK,
            Err(e) => {
                warn!("evaluation report rejected: {}", e);
                StatusCode::CONFLICT
            }
        },
    )
}

/// Converts an event subscriber into a `warp` filter.
fn with_subscriber(
    subscriber: EventSubscriber,
) -> impl Filter<Extract = (EventSubscriber,), Error = Infallible> + Clone {
    warp::any().map(move || subscriber.clone())
}

/// Converts a request sender into a `warp` filter.
fn with_requests(
    requests: RequestSender,
) -> impl Filter<Extract = (RequestSender,), Error = Infallible> + Clone {
    warp::any().map(move || requests.clone())
}

#[cfg(test)]
mod tests {
    use fedpriv_core::metrics::MetricRecord;

    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_serves_empty_array_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("metrics.json"));
        let routes = metrics_routes(store);

        let resp = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "[]");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("metrics.json"));
        store
            .append(MetricRecord {
                round: 1,
                loss: 0.5,
                accuracy: 0.9,
                epsilon: 1.2,
            })
            .unwrap();
        let routes = metrics_routes(store);

        let resp = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let records: Vec<MetricRecord> = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].round, 1);
    }
}
