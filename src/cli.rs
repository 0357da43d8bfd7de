use std::path::PathBuf;

use clap::Parser;

/// Trains a sequence-to-sequence Transformer on one or more devices.
#[derive(Parser, Debug)]
#[command(name = "burn-seq2seq", version)]
pub struct Args {
    /// YAML training configuration
    #[arg(long)]
    pub config: PathBuf,

    /// Checkpoint to restore the model from instead of building a fresh one
    #[arg(long = "load_model")]
    pub load_model: Option<PathBuf>,

    /// Log file, written alongside the terminal output
    #[arg(long, default_value = "./exp/train.log")]
    pub log: PathBuf,
}

const SINGLE_DASH_FLAGS: [&str; 3] = ["-config", "-load_model", "-log"];

/// Rewrites `-config`, `-load_model` and `-log` (optionally with `=value`)
/// into their `--` spelling so clap accepts both.
pub fn normalize_flags(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            let flag = arg.split_once('=').map_or(arg.as_str(), |(flag, _)| flag);
            if SINGLE_DASH_FLAGS.contains(&flag) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

impl Args {
    pub fn from_env() -> Self {
        Self::parse_from(normalize_flags(std::env::args()))
    }
}
