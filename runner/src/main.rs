mod config;
mod database;
mod driver;
mod modeling;
mod simulation;

use crate::{config::RunnerConfig, database::sqlite::SharedConnection, driver::Driver};
use clap::{crate_name, crate_version, Parser};
use std::{path::PathBuf, process::exit};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct CLI {
    #[arg(
        value_name = "STORE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the experiment store"
    )]
    store: PathBuf,
}

fn setup_global_subscriber() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .with(
            fmt::layer()
                // required for good rayon debugging
                .with_thread_ids(true)
                .with_thread_names(false)
                .compact(),
        )
        .init()
}

fn main() {
    // parse the args with clap
    let args = CLI::parse();
    setup_global_subscriber();

    info!("{} {}", crate_name!(), crate_version!());
    debug!("Args: {args:?}");

    let config = match RunnerConfig::load() {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Failed to load the runner config: {error}");

            exit(1)
        }
    };

    if config.preflight_checks() {
        error!("Config contains one or more errors, see previous error messages");

        exit(1);
    }

    debug!("Config: {config:?}");

    let mut connection = match SharedConnection::load(&args.store) {
        Ok(connection) => connection,
        Err(error) => {
            error!(error = ?error, "Failed to open the experiment store: {error}");

            exit(1)
        }
    };

    if let Err(error) = connection.init() {
        error!(error = ?error, "Failed to initialize the experiment store: {error}");

        exit(1)
    };

    Driver::load(connection, &config).run()
}
