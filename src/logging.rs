use std::{
    fs::{File, create_dir_all},
    path::Path,
};

use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, TermLogger, TerminalMode,
    WriteLogger,
};

// Backend crates are chatty at INFO; the learner logs every iteration and
// dumps the model on each fit.
fn log_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .add_filter_ignore_str("wgpu")
        .add_filter_ignore_str("naga")
        .add_filter_ignore_str("cubecl")
        .add_filter_ignore_str("burn_train")
        .build()
}

/// Logs INFO and above to the terminal and to `path`, truncating the file.
pub fn init_logger(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)
            .with_context(|| format!("Could not create log directory {}", parent.display()))?;
    }

    let file =
        File::create(path).with_context(|| format!("Could not create log {}", path.display()))?;

    let config = log_config();

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, config, file),
    ])
    .context("Could not install logger")?;

    Ok(())
}
