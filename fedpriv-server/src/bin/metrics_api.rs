//! A standalone read-only HTTP server for the metrics log.
//!
//! Serves `GET /metrics` as a JSON array so a dashboard can poll the
//! training progress while the coordinator and clients are running. It
//! shares the metrics file with the clients through the store's advisory
//! locking, so it can run concurrently with them.

use std::{net::SocketAddr, path::PathBuf};

use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::{fmt::Subscriber, EnvFilter};

use fedpriv_core::metrics::JsonFileStore;
use fedpriv_server::rest;

#[derive(Debug, StructOpt)]
#[structopt(name = "metrics-api", about = "Serves the fedpriv metrics log.")]
struct Opt {
    /// Path to the metrics file.
    #[structopt(long, default_value = "metrics.json", parse(from_os_str))]
    metrics_file: PathBuf,

    /// The address to bind to.
    #[structopt(long, default_value = "127.0.0.1:8000")]
    bind_address: SocketAddr,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .init();

    info!(
        "serving {} on http://{}/metrics",
        opt.metrics_file.display(),
        opt.bind_address
    );
    let store = JsonFileStore::new(opt.metrics_file);
    warp::serve(rest::metrics_routes(store))
        .run(opt.bind_address)
        .await
}
