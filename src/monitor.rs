use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use burn::train::renderer::{MetricState, MetricsRenderer, TrainingProgress};
use log::{info, warn};
use serde::Serialize;

#[derive(Serialize)]
struct Scalar<'a> {
    tag: &'a str,
    step: usize,
    value: f64,
}

/// Appends `{"tag", "step", "value"}` JSON lines, one per scalar.
pub struct ScalarWriter {
    out: BufWriter<File>,
}

impl ScalarWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Could not create scalar log {}", path.display()))?;

        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        let res = serde_json::to_writer(&mut self.out, &Scalar { tag, step, value })
            .map_err(std::io::Error::from)
            .and_then(|_| self.out.write_all(b"\n"));

        if let Err(e) = res {
            warn!("Could not write scalar {tag}: {e}");
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("Could not flush scalar log: {e}");
        }
    }
}

/// Progress bookkeeping shared between the trainer and the renderer the
/// learner drives.
///
/// The learner renders every batch it feeds to a device but updates the
/// weights once per `batches_per_step` batches; the global step counts
/// those updates.
pub struct Progress {
    show_interval: usize,
    batches_per_step: usize,
    epoch: usize,
    epoch_batches: usize,
    global_step: usize,
    train_loss: Option<f64>,
    window_loss_sum: f64,
    window_batches: usize,
    learning_rate: Option<f64>,
    valid_loss: Option<f64>,
    valid_batches: usize,
    valid_loss_sum: f64,
    dev_step: usize,
    scalars: Option<ScalarWriter>,
}

pub type SharedProgress = Arc<Mutex<Progress>>;

impl Progress {
    pub fn new(show_interval: usize, batches_per_step: usize, scalars: Option<ScalarWriter>) -> Self {
        Self {
            show_interval: show_interval.max(1),
            batches_per_step: batches_per_step.max(1),
            epoch: 0,
            epoch_batches: 0,
            global_step: 0,
            train_loss: None,
            window_loss_sum: 0.0,
            window_batches: 0,
            learning_rate: None,
            valid_loss: None,
            valid_batches: 0,
            valid_loss_sum: 0.0,
            dev_step: 0,
            scalars,
        }
    }

    pub fn shared(self) -> SharedProgress {
        Arc::new(Mutex::new(self))
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// The learner restarts gradient accumulation every epoch, so a partial
    /// window left from the previous epoch never turns into a step.
    pub fn begin_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_batches = 0;
        self.window_loss_sum = 0.0;
        self.window_batches = 0;
        self.valid_batches = 0;
        self.valid_loss_sum = 0.0;
    }

    /// Average validation loss over the batches of the current epoch.
    pub fn validation_average(&self) -> Option<f64> {
        (self.valid_batches > 0).then(|| self.valid_loss_sum / self.valid_batches as f64)
    }

    pub fn validation_summary(&self) -> Option<String> {
        self.validation_average().map(|avg| {
            format!(
                "-Validation-Epoch:{:4}, AverageCrossEntropyLoss:{avg:.5}",
                self.epoch
            )
        })
    }

    pub fn end_epoch(&mut self) {
        if let Some(scalars) = self.scalars.as_mut() {
            scalars.flush();
        }
    }

    fn update_train(&mut self, state: &MetricState) {
        if let Some((name, value)) = numeric(state) {
            match MetricKind::of(name) {
                Some(MetricKind::Loss) => self.train_loss = Some(value),
                Some(MetricKind::LearningRate) => self.learning_rate = Some(value),
                None => {}
            }
        }
    }

    fn update_valid(&mut self, state: &MetricState) {
        if let Some((name, value)) = numeric(state) {
            if let Some(MetricKind::Loss) = MetricKind::of(name) {
                self.valid_loss = Some(value);
            }
        }
    }

    /// Closes one training batch; returns the log line when one is due.
    fn finish_train_step(&mut self) -> Option<String> {
        self.epoch_batches += 1;
        if let Some(loss) = self.train_loss.take() {
            self.window_loss_sum += loss;
            self.window_batches += 1;
        }
        if self.epoch_batches % self.batches_per_step != 0 {
            return None;
        }

        self.global_step += 1;
        let step = self.global_step;
        let window_batches = std::mem::take(&mut self.window_batches);
        let window_loss_sum = std::mem::take(&mut self.window_loss_sum);
        if window_batches == 0 {
            return None;
        }
        let loss = window_loss_sum / window_batches as f64;
        let lr = self.learning_rate.unwrap_or(0.0);

        if let Some(scalars) = self.scalars.as_mut() {
            scalars.add_scalar("model/train_loss", loss, step);
            scalars.add_scalar("model/learning_rate", lr, step);
        }

        (step % self.show_interval == 0).then(|| {
            format!(
                "-Training-Epoch:{}, Global Step:{}, Learning Rate:{:.6}, CrossEntropyLoss:{:.5}",
                self.epoch, step, lr, loss
            )
        })
    }

    fn finish_valid_step(&mut self) -> Option<String> {
        let loss = self.valid_loss.take()?;
        let step = self.valid_batches;
        self.valid_batches += 1;
        self.valid_loss_sum += loss;
        self.dev_step += 1;

        if let Some(scalars) = self.scalars.as_mut() {
            scalars.add_scalar("model/validation_loss", loss, self.dev_step);
        }

        (step % self.show_interval == 0)
            .then(|| format!("-Validation-Step:{step:4}, CrossEntropyLoss:{loss:.5}"))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum MetricKind {
    Loss,
    LearningRate,
}

impl MetricKind {
    fn of(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.contains("loss") {
            Some(Self::Loss)
        } else if name.contains("learning rate") || name == "lr" {
            Some(Self::LearningRate)
        } else {
            None
        }
    }
}

fn numeric(state: &MetricState) -> Option<(&str, f64)> {
    match state {
        MetricState::Numeric(entry, value) => Some((entry.name.as_str(), *value)),
        MetricState::Generic(_) => None,
    }
}

pub fn lock(progress: &SharedProgress) -> MutexGuard<'_, Progress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Renders learner progress as log lines.
pub struct LogRenderer {
    progress: SharedProgress,
}

impl LogRenderer {
    pub fn new(progress: SharedProgress) -> Self {
        Self { progress }
    }
}

impl MetricsRenderer for LogRenderer {
    fn update_train(&mut self, state: MetricState) {
        lock(&self.progress).update_train(&state);
    }

    fn update_valid(&mut self, state: MetricState) {
        lock(&self.progress).update_valid(&state);
    }

    fn render_train(&mut self, _item: TrainingProgress) {
        if let Some(line) = lock(&self.progress).finish_train_step() {
            info!("{line}");
        }
    }

    fn render_valid(&mut self, _item: TrainingProgress) {
        if let Some(line) = lock(&self.progress).finish_valid_step() {
            info!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::train::metric::MetricEntry;

    fn train_step(progress: &mut Progress, loss: f64, lr: f64) -> Option<String> {
        progress.train_loss = Some(loss);
        progress.learning_rate = Some(lr);
        progress.finish_train_step()
    }

    fn valid_step(progress: &mut Progress, loss: f64) -> Option<String> {
        progress.valid_loss = Some(loss);
        progress.finish_valid_step()
    }

    #[test]
    fn training_lines_follow_show_interval() {
        let mut progress = Progress::new(2, 1, None);
        progress.begin_epoch(3);

        assert_eq!(train_step(&mut progress, 4.0, 1e-4), None);
        assert_eq!(
            train_step(&mut progress, 3.5, 2e-4).as_deref(),
            Some(
                "-Training-Epoch:3, Global Step:2, Learning Rate:0.000200, CrossEntropyLoss:3.50000"
            )
        );
        assert_eq!(train_step(&mut progress, 3.0, 3e-4), None);
        assert_eq!(progress.global_step(), 3);
    }

    #[test]
    fn validation_average_resets_per_epoch() {
        let mut progress = Progress::new(100, 1, None);
        progress.begin_epoch(0);
        assert_eq!(progress.validation_average(), None);

        assert_eq!(
            valid_step(&mut progress, 2.0).as_deref(),
            Some("-Validation-Step:   0, CrossEntropyLoss:2.00000")
        );
        assert_eq!(valid_step(&mut progress, 4.0), None);
        assert_eq!(progress.validation_average(), Some(3.0));
        assert_eq!(
            progress.validation_summary().as_deref(),
            Some("-Validation-Epoch:   0, AverageCrossEntropyLoss:3.00000")
        );

        progress.begin_epoch(1);
        assert_eq!(progress.validation_average(), None);
    }

    #[test]
    fn steps_without_a_loss_are_counted_but_silent() {
        let mut progress = Progress::new(1, 1, None);

        assert_eq!(progress.finish_train_step(), None);
        assert_eq!(progress.global_step(), 1);
        assert_eq!(progress.finish_valid_step(), None);
        assert_eq!(progress.validation_average(), None);
    }

    #[test]
    fn metric_names_are_classified() {
        assert_eq!(MetricKind::of("Loss"), Some(MetricKind::Loss));
        assert_eq!(MetricKind::of("Learning Rate"), Some(MetricKind::LearningRate));
        assert_eq!(MetricKind::of("Accuracy"), None);
    }

    #[test]
    fn numeric_states_carry_their_value() {
        let entry = MetricEntry::new("Loss".into(), "2.5".into(), "2.5,16".into());
        let mut progress = Progress::new(1, 1, None);

        progress.update_train(&MetricState::Numeric(entry.clone(), 2.25));
        assert_eq!(progress.train_loss, Some(2.25));

        progress.update_train(&MetricState::Generic(entry));
        assert_eq!(progress.train_loss, Some(2.25));
    }

    #[test]
    fn global_step_counts_weight_updates() {
        // Two devices, two accumulation steps.
        let mut progress = Progress::new(1, 4, None);
        progress.begin_epoch(0);

        for loss in [1.0, 2.0, 3.0] {
            assert_eq!(train_step(&mut progress, loss, 1e-3), None);
        }
        assert_eq!(progress.global_step(), 0);
        assert_eq!(
            train_step(&mut progress, 4.0, 1e-3).as_deref(),
            Some("-Training-Epoch:0, Global Step:1, Learning Rate:0.001000, CrossEntropyLoss:2.50000")
        );

        // A partial window is dropped at the epoch boundary.
        train_step(&mut progress, 9.0, 1e-3);
        progress.begin_epoch(1);
        for _ in 0..3 {
            train_step(&mut progress, 1.0, 1e-3);
        }
        assert_eq!(progress.global_step(), 1);
        assert!(train_step(&mut progress, 1.0, 1e-3).is_some());
        assert_eq!(progress.global_step(), 2);
    }

    #[test]
    fn scalars_are_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalars.jsonl");
        let mut progress = Progress::new(1, 1, Some(ScalarWriter::create(&path).unwrap()));

        train_step(&mut progress, 1.5, 0.25);
        valid_step(&mut progress, 2.5);
        progress.end_epoch();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["tag"], "model/train_loss");
        assert_eq!(lines[1]["value"], 0.25);
        assert_eq!(lines[2]["tag"], "model/validation_loss");
        assert_eq!(lines[2]["step"], 1);
    }
}
