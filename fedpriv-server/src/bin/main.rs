#[macro_use]
extern crate tracing;

use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::fmt::Subscriber;

use fedpriv_core::model::init_parameters;
use fedpriv_server::{
    rest,
    settings::Settings,
    state_machine::StateMachine,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "coordinator", about = "The fedpriv coordinator.")]
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
        protocol: protocol_settings,
        model: model_settings,
        log: log_settings,
    } = settings;

    Subscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let global_model = init_parameters(model_settings.init_seed);
    let (state_machine, request_tx, event_subscriber) =
        StateMachine::new(protocol_settings, global_model);

    tokio::select! {
        result = state_machine.run() => {
            match result {
                Ok(()) => info!("shutting down: all rounds finished"),
                Err(err) => error!("shutting down: {}", err),
            }
        }
        _ = rest::serve(api_settings, event_subscriber, request_tx) => {
            warn!("shutting down: REST server terminated")
        }
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("shutting down: Ctrl-C received"),
                Err(err) => error!("shutting down: {}", err),
            }
        }
    }
}
