#[macro_use]
extern crate tracing;

use std::{path::PathBuf, process, time::Duration};

use structopt::StructOpt;
use tracing_subscriber::fmt::Subscriber;

use fedpriv_client::{
    api::CoordinatorClient,
    data::Dataset,
    model::Classifier,
    participant::{self, Participant},
    settings::Settings,
    trainer::DpTrainer,
};
use fedpriv_core::{metrics::JsonFileStore, model::init_parameters};

#[derive(Debug, StructOpt)]
#[structopt(name = "client", about = "A fedpriv client.")]
struct Opt {
    /// Path to the configuration file.
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        privacy: privacy_settings,
        training: training_settings,
        data: data_settings,
        metrics: metrics_settings,
        log: log_settings,
    } = settings;

    Subscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let dataset = Dataset::synthetic(
        data_settings.samples,
        data_settings.test_fraction,
        data_settings.seed,
    );
    info!(
        "drew a shard of {} training and {} held-out examples",
        dataset.num_train(),
        dataset.num_test()
    );

    let model = match Classifier::from_parameters(init_parameters(training_settings.init_seed)) {
        Ok(model) => model,
        Err(err) => {
            error!("failed to initialize the model: {}", err);
            process::exit(1);
        }
    };
    let trainer = match DpTrainer::new(
        privacy_settings.into(),
        training_settings.learning_rate,
        training_settings.batch_size,
        dataset.num_train(),
        training_settings.seed,
    ) {
        Ok(trainer) => trainer,
        Err(err) => {
            error!("refusing to train: {}", err);
            process::exit(1);
        }
    };
    let store = JsonFileStore::new(metrics_settings.file);
    let participant = Participant::new(model, trainer, dataset, store);

    let client = match CoordinatorClient::new(api_settings.coordinator_url) {
        Ok(client) => client,
        Err(err) => {
            error!("failed to initialize the HTTP client: {}", err);
            process::exit(1);
        }
    };
    let poll_interval = Duration::from_secs(api_settings.poll_interval_secs);
    if let Err(err) = participant::run(participant, client, poll_interval).await {
        error!("shutting down: {}", err);
        process::exit(1);
    }
}
