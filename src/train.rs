use std::{
    fs::{create_dir_all, remove_dir_all},
    path::Path,
};

use anyhow::{Result, anyhow, ensure};
use burn::{
    lr_scheduler::noam::{NoamLrScheduler, NoamLrSchedulerConfig},
    module::AutodiffModule,
    optim::AdamConfig,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::AutodiffBackend,
    train::{
        ClassificationOutput, LearnerBuilder, TrainOutput, TrainStep, ValidStep,
        metric::{AccuracyMetric, LearningRateMetric, LossMetric},
    },
};
use log::info;

use crate::{
    checkpoint,
    config::{OptimizerConfig, TrainConfig},
    data_helpers::{
        Seq2SeqBatch, SpecialTokens, Split, build_data_loader, empty_data_loader, load_tokenizer,
    },
    model::{Transformer, TransformerConfig},
    monitor::{self, LogRenderer, Progress, ScalarWriter},
};

impl<B: AutodiffBackend> TrainStep<Seq2SeqBatch<B>, ClassificationOutput<B>> for Transformer<B> {
    fn step(&self, batch: Seq2SeqBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch);

        let grads = item.loss.backward();

        TrainOutput::new(self, grads, item)
    }
}

impl<B: Backend> ValidStep<Seq2SeqBatch<B>, ClassificationOutput<B>> for Transformer<B> {
    fn step(&self, batch: Seq2SeqBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    remove_dir_all(artifact_dir).ok();
    create_dir_all(artifact_dir)?;

    Ok(())
}

/// `lr_factor * d_model^-0.5 * min(step^-0.5, step * warmup^-1.5)`, with `step`
/// counting weight updates.
///
/// The learner advances the scheduler once per batch and updates the weights
/// once per `batches_per_step` batches; stretching the warmup and scaling the
/// factor by that ratio keeps the rate at each update equal to the per-update
/// schedule.
pub fn lr_scheduler(
    optimizer: &OptimizerConfig,
    d_model: usize,
    batches_per_step: usize,
) -> Result<NoamLrScheduler> {
    let k = batches_per_step.max(1);

    NoamLrSchedulerConfig::new(optimizer.lr_factor * (k as f64).sqrt())
        .with_warmup_steps(optimizer.n_warmup_steps * k)
        .with_model_size(d_model)
        .init()
        .map_err(|e| anyhow!(e))
}

pub fn adam(optimizer: &OptimizerConfig) -> AdamConfig {
    AdamConfig::new()
        .with_beta_1(optimizer.beta_1)
        .with_beta_2(optimizer.beta_2)
        .with_epsilon(optimizer.epsilon)
}

/// The fresh model, or the one restored from `load_model` together with the
/// settings it was built from.
fn build_model<B: Backend>(
    config: &TrainConfig,
    load_model: Option<&Path>,
    device: &B::Device,
) -> Result<(Transformer<B>, TransformerConfig)> {
    let Some(path) = load_model else {
        return Ok((config.model.init(device), config.model.clone()));
    };

    let loaded = checkpoint::load::<B>(path, device)?;
    let kind = if loaded.multi_gpu { "multi-device" } else { "single-device" };
    info!(
        "Loaded model from {} ({kind} weights, epoch {}, global step {})",
        path.display(),
        loaded.epoch,
        loaded.global_step
    );

    Ok((loaded.model, loaded.settings))
}

fn check_lengths(config: &TrainConfig, settings: &TransformerConfig) -> Result<()> {
    ensure!(
        config.data.max_src_len < settings.max_len,
        "data.max_src_len ({}) needs a position slot below model.max_len ({})",
        config.data.max_src_len,
        settings.max_len
    );
    ensure!(
        config.data.max_tgt_len + 1 < settings.max_len,
        "data.max_tgt_len + 1 ({}) needs a position slot below model.max_len ({})",
        config.data.max_tgt_len + 1,
        settings.max_len
    );

    Ok(())
}

fn check_tokens(tokens: &SpecialTokens, vocab_size: usize, settings: &TransformerConfig) -> Result<()> {
    ensure!(
        tokens.pad as usize == settings.pad_id,
        "Tokenizer pad id {} differs from model.pad_id {}",
        tokens.pad,
        settings.pad_id
    );
    ensure!(
        vocab_size <= settings.src_vocab_size && vocab_size <= settings.tgt_vocab_size,
        "Tokenizer has {vocab_size} tokens, more than the model vocabularies ({} / {})",
        settings.src_vocab_size,
        settings.tgt_vocab_size
    );

    Ok(())
}

pub fn train<B: AutodiffBackend>(
    config: &TrainConfig,
    load_model: Option<&Path>,
    devices: Vec<B::Device>,
) -> Result<Transformer<B>> {
    let exp_dir = Path::new(&config.training.exp_dir);
    create_dir_all(exp_dir)?;
    config.save(exp_dir.join("config.json"))?;

    B::seed(config.training.seed);
    info!("Set random seed: {}", config.training.seed);

    let device = devices
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("No device to train on"))?;

    //========= Build DataLoader =========//
    let tokenizer = load_tokenizer(&config.data.tokenizer)?;
    let tokens = SpecialTokens::from_tokenizer(&tokenizer, &config.data)?;

    let dataloader_train = build_data_loader::<B>(config, Split::Train, &tokenizer, &device)?;
    let dataloader_valid = if config.training.dev_on_training {
        build_data_loader::<B::InnerBackend>(config, Split::Dev, &tokenizer, &device)?
    } else {
        empty_data_loader::<B::InnerBackend>(tokens, &device)
    };

    //========= Build A Model Or Load Pre-trained Model =========//
    let (mut model, settings) = build_model::<B>(config, load_model, &device)?;
    check_lengths(config, &settings)?;
    check_tokens(&tokens, tokenizer.get_vocab_size(true), &settings)?;

    let (n_params, enc, dec) = model.count_parameters();
    info!("# the number of parameters in encoder: {enc}");
    info!("# the number of parameters in decoder: {dec}");
    info!("# the number of parameters in the whole model: {n_params}");
    info!("Upload the model to devices: {devices:?}");

    let batches_per_step = devices.len() * config.training.grad_accum_steps;
    let optim_config = adam(&config.optimizer);
    // Checked once up front; every epoch rebuilds it from the same settings.
    lr_scheduler(&config.optimizer, settings.d_model, batches_per_step)?;
    info!("Created a multi-device Adam optimizer with a Noam learning rate schedule.");
    info!("Created cross entropy loss function");

    let scalars = if config.training.visualization {
        let writer = ScalarWriter::create(exp_dir.join("scalars.jsonl"))?;
        info!("Created a visualizer.");
        Some(writer)
    } else {
        None
    };
    let progress = Progress::new(config.training.show_interval, batches_per_step, scalars).shared();

    let learner_dir = exp_dir.join("learner");
    create_artifact_dir(&learner_dir)?;
    let learner_dir = learner_dir.display().to_string();

    for epoch in 0..config.training.epochs {
        monitor::lock(&progress).begin_epoch(epoch);

        // The learner numbers epochs from 1 and resumes optimizer and
        // scheduler state from the previous epoch's checkpoint.
        let mut builder = LearnerBuilder::new(&learner_dir)
            .metric_train_numeric(AccuracyMetric::new().with_pad_token(settings.pad_id))
            .metric_valid_numeric(AccuracyMetric::new().with_pad_token(settings.pad_id))
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .metric_train_numeric(LearningRateMetric::new())
            .with_file_checkpointer(NamedMpkFileRecorder::<FullPrecisionSettings>::new())
            .with_application_logger(None)
            .renderer(LogRenderer::new(progress.clone()))
            .devices(devices.clone())
            .num_epochs(epoch + 1);

        if epoch > 0 {
            builder = builder.checkpoint(epoch);
        }
        if config.training.grad_accum_steps > 1 {
            builder = builder.grads_accumulation(config.training.grad_accum_steps);
        }

        let learner = builder.build(
            model,
            optim_config.init(),
            lr_scheduler(&config.optimizer, settings.d_model, batches_per_step)?,
        );

        model = learner.fit(dataloader_train.clone(), dataloader_valid.clone());

        let mut state = monitor::lock(&progress);
        if config.training.dev_on_training {
            if let Some(line) = state.validation_summary() {
                info!("{line}");
            }
        }
        state.end_epoch();
        let global_step = state.global_step();
        drop(state);

        let model_name = checkpoint::epoch_path(&config.training.save_model, epoch);
        checkpoint::save(&model_name, &model.valid(), &settings, epoch, global_step)?;
        info!("Saved checkpoint {model_name}");
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_helpers::tests::TOKENIZER_JSON,
        model::tests::{tiny_batch, tiny_config},
    };
    use burn::{
        backend::{Autodiff, NdArray},
        lr_scheduler::LrScheduler,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    fn optimizer() -> OptimizerConfig {
        OptimizerConfig {
            n_warmup_steps: 100,
            ..Default::default()
        }
    }

    #[test]
    fn noam_schedule_warms_up_then_decays() {
        let mut scheduler = lr_scheduler(&optimizer(), 64, 1).unwrap();
        let lrs: Vec<f64> = (0..300).map(|_| scheduler.step()).collect();

        let expected_first = 64f64.powf(-0.5) * 100f64.powf(-1.5);
        assert!((lrs[0] - expected_first).abs() < 1e-12);
        assert!(lrs[50] > lrs[0]);
        assert!(lrs[299] < lrs[99]);
    }

    #[test]
    fn schedule_follows_weight_updates_when_batches_are_grouped() {
        let mut per_update = lr_scheduler(&optimizer(), 64, 1).unwrap();
        let mut per_batch = lr_scheduler(&optimizer(), 64, 4).unwrap();

        for _ in 0..300 {
            let expected = per_update.step();
            let mut lr = 0.0;
            for _ in 0..4 {
                lr = per_batch.step();
            }
            assert!((lr - expected).abs() <= expected * 1e-9, "{lr} != {expected}");
        }
    }

    #[test]
    fn train_step_produces_gradients_and_a_finite_loss() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);

        let output = TrainStep::step(&model, tiny_batch(&device));

        assert!(output.item.loss.into_scalar().is_finite());
    }

    #[test]
    fn valid_step_matches_forward_classification() {
        let device = Default::default();
        let model = tiny_config().init::<NdArray<f32>>(&device);

        let output = ValidStep::step(&model, tiny_batch(&device));

        assert_eq!(output.output.dims(), [8, 10]);
        assert_eq!(output.targets.dims(), [8]);
    }

    #[test]
    fn load_model_takes_settings_from_the_checkpoint() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.epoch0.chkpt");
        let stored = tiny_config().with_d_ff(24);
        let model = stored.init::<NdArray<f32>>(&device);
        checkpoint::save(&path, &model, &stored, 0, 7).unwrap();

        let yaml = r#"
data: {tokenizer: t.json, train: a.tsv, dev: b.tsv}
model: {src_vocab_size: 50, tgt_vocab_size: 50}
optimizer: {}
training: {num_gpu: 1, gpu_ids: "0"}
"#;
        let config = TrainConfig::from_yaml_str(yaml).unwrap();

        let (_, settings) = build_model::<TestBackend>(&config, Some(&path), &device).unwrap();
        assert_eq!(settings.d_ff, 24);
        assert_eq!(settings.src_vocab_size, 12);

        let (_, fresh) = build_model::<TestBackend>(&config, None, &device).unwrap();
        assert_eq!(fresh.src_vocab_size, 50);
    }

    #[test]
    fn sequence_lengths_must_fit_positions() {
        let yaml = r#"
data: {tokenizer: t.json, train: a.tsv, dev: b.tsv, max_src_len: 15, max_tgt_len: 15}
model: {src_vocab_size: 50, tgt_vocab_size: 50}
optimizer: {}
training: {num_gpu: 1, gpu_ids: "0"}
"#;
        let config = TrainConfig::from_yaml_str(yaml).unwrap();

        assert!(check_lengths(&config, &tiny_config()).is_err());
        assert!(check_lengths(&config, &tiny_config().with_max_len(17)).is_ok());
    }

    #[test]
    fn tokenizer_must_agree_with_the_model() {
        let tokens = SpecialTokens { pad: 0, sos: 1, eos: 2 };

        assert!(check_tokens(&tokens, 9, &tiny_config()).is_ok());
        assert!(check_tokens(&tokens, 11, &tiny_config()).is_err());
        assert!(check_tokens(&SpecialTokens { pad: 3, ..tokens }, 9, &tiny_config()).is_err());
    }

    #[test]
    fn two_epochs_write_checkpoints_and_resume_the_learner() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
        std::fs::write(
            root.join("train.tsv"),
            "hello world\tbonjour monde\nbye\tbonjour\nhello\tmonde\nworld bye\tbonjour monde\n",
        )
        .unwrap();
        std::fs::write(root.join("dev.tsv"), "hello\tbonjour\nbye world\tmonde\n").unwrap();

        let yaml = format!(
            r#"
data:
  tokenizer: {tokenizer:?}
  train: {train:?}
  dev: {dev:?}
  max_src_len: 8
  max_tgt_len: 8
  batch_size: 2
  num_workers: 1
model: {{src_vocab_size: 12, tgt_vocab_size: 10, max_len: 16, d_model: 16, n_heads: 2, d_ff: 32, num_enc_blocks: 1, num_dec_blocks: 1, dropout: 0.0}}
optimizer: {{n_warmup_steps: 4}}
training:
  epochs: 2
  num_gpu: 1
  gpu_ids: "0"
  show_interval: 1
  visualization: true
  save_model: {save_model:?}
  exp_dir: {exp_dir:?}
"#,
            tokenizer = root.join("tokenizer.json").display().to_string(),
            train = root.join("train.tsv").display().to_string(),
            dev = root.join("dev.tsv").display().to_string(),
            save_model = root.join("ckpt/model").display().to_string(),
            exp_dir = root.join("exp").display().to_string(),
        );
        let config = TrainConfig::from_yaml_str(&yaml).unwrap();

        train::<TestBackend>(&config, None, vec![Default::default()]).unwrap();

        assert!(root.join("exp/config.json").is_file());
        let load = |name: &str| {
            checkpoint::load::<NdArray<f32>>(root.join("ckpt").join(name), &Default::default())
                .unwrap()
        };
        let first = load("model.epoch0.chkpt");
        let last = load("model.epoch1.chkpt");
        assert_eq!((first.epoch, first.global_step), (0, 2));
        assert_eq!((last.epoch, last.global_step), (1, 4));
        assert_eq!(last.settings.d_model, 16);

        let scalars = std::fs::read_to_string(root.join("exp/scalars.jsonl")).unwrap();
        let tags: Vec<String> = scalars
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["tag"].to_string())
            .collect();
        let count = |tag: &str| tags.iter().filter(|t| t.contains(tag)).count();
        assert_eq!(count("train_loss"), 4);
        assert_eq!(count("validation_loss"), 2);
    }
}
