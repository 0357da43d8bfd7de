#![recursion_limit = "256"]

mod backend;
mod checkpoint;
mod cli;
mod config;
mod corpus;
mod data_helpers;
mod logging;
mod model;
mod monitor;
mod train;

use std::process;

use anyhow::Result;
use log::{error, info};

use crate::{backend::TrainBackend, cli::Args};

fn main() -> Result<()> {
    let args = Args::from_env();

    logging::init_logger(&args.log)?;

    let config = config::load(&args.config)?;
    info!("Loaded configuration from {}", args.config.display());

    if !config.training.multi_gpu() {
        error!("Please set num_gpu larger than 1 in config file!");
        process::exit(1);
    }
    let device_ids = config.training.device_ids()?;
    let devices = backend::devices(&device_ids, config.training.use_gpu);
    info!("Training on the {} backend", backend::NAME);

    train::train::<TrainBackend>(&config, args.load_model.as_deref(), devices)?;

    info!("Training complete.");
    Ok(())
}
