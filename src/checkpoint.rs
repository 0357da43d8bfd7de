use std::{fs, path::Path};

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder},
};

use crate::model::{Transformer, TransformerConfig, TransformerRecord};

#[derive(Record)]
pub struct CheckpointRecord<B: Backend> {
    /// Model settings as JSON, enough to rebuild the model before loading weights.
    pub settings: String,
    pub multi_gpu: bool,
    pub model: TransformerRecord<B>,
    pub epoch: usize,
    pub global_step: usize,
}

pub struct LoadedCheckpoint<B: Backend> {
    pub model: Transformer<B>,
    pub settings: TransformerConfig,
    pub multi_gpu: bool,
    pub epoch: usize,
    pub global_step: usize,
}

fn recorder() -> NamedMpkBytesRecorder<FullPrecisionSettings> {
    NamedMpkBytesRecorder::new()
}

pub fn epoch_path(prefix: &str, epoch: usize) -> String {
    format!("{prefix}.epoch{epoch}.chkpt")
}

pub fn save<B: Backend>(
    path: impl AsRef<Path>,
    model: &Transformer<B>,
    settings: &TransformerConfig,
    epoch: usize,
    global_step: usize,
) -> Result<()> {
    let path = path.as_ref();
    let record = CheckpointRecord {
        settings: serde_json::to_string(settings)?,
        multi_gpu: true,
        model: model.clone().into_record(),
        epoch,
        global_step,
    };

    let bytes = recorder()
        .record(record, ())
        .with_context(|| format!("Could not serialize checkpoint for epoch {epoch}"))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("Could not write {}", path.display()))?;

    Ok(())
}

pub fn load<B: Backend>(path: impl AsRef<Path>, device: &B::Device) -> Result<LoadedCheckpoint<B>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;

    let record: CheckpointRecord<B> = recorder()
        .load(bytes, device)
        .with_context(|| format!("{} is not a checkpoint", path.display()))?;

    let settings: TransformerConfig = serde_json::from_str(&record.settings)
        .with_context(|| format!("Bad model settings in {}", path.display()))?;
    let model = settings.init::<B>(device).load_record(record.model);

    Ok(LoadedCheckpoint {
        model,
        settings,
        multi_gpu: record.multi_gpu,
        epoch: record.epoch,
        global_step: record.global_step,
    })
}
