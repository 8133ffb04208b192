use std::path::{Path, PathBuf};

use serde_json::json;

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, TrainingError};
use crate::training::metrics::Metrics;

/// What a callback may see and change on the running trainer.
pub trait TrainerHandle {
    /// First epoch of this run (non-zero after a resume).
    fn start_epoch(&self) -> usize;

    fn should_stop(&self) -> bool;

    /// Ask the trainer to stop at the next epoch boundary.
    fn request_stop(&mut self);

    /// Snapshot of the current game and optimizer, stamped with `epoch`.
    fn checkpoint(&self, epoch: usize) -> Result<Checkpoint, CheckpointError>;
}

/// Training lifecycle hooks. Invoked synchronously in registration order; an
/// error aborts training.
pub trait Callback {
    fn on_train_begin(&mut self, _trainer: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _trainer: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &mut dyn TrainerHandle,
        _loss: f64,
        _metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_test_begin(&mut self, _trainer: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_test_end(
        &mut self,
        _trainer: &mut dyn TrainerHandle,
        _loss: f64,
        _metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_train_end(&mut self, _trainer: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Prints test (and optionally train) results to stdout after each epoch.
#[derive(Debug, Clone, Default)]
pub struct ConsoleLogger {
    pub print_train_loss: bool,
    pub as_json: bool,
    epoch: usize,
}

impl ConsoleLogger {
    pub fn new(print_train_loss: bool, as_json: bool) -> Self {
        ConsoleLogger {
            print_train_loss,
            as_json,
            epoch: 0,
        }
    }

    /// One output line. Epochs are reported 1-based.
    pub fn format_line(&self, mode: &str, loss: f64, metrics: &Metrics) -> String {
        if self.as_json {
            let mut dump = json!({ "mode": mode, "epoch": self.epoch, "loss": loss });
            if let Some(map) = dump.as_object_mut() {
                for (k, v) in metrics.iter() {
                    map.insert(k.to_string(), json!(v));
                }
            }
            dump.to_string()
        } else {
            let rest = serde_json::to_string(metrics).unwrap_or_default();
            format!("{}: epoch {}, loss {:.4}, {}", mode, self.epoch, loss, rest)
        }
    }
}

impl Callback for ConsoleLogger {
    fn on_train_begin(&mut self, trainer: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
        self.epoch = trainer.start_epoch();
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &mut dyn TrainerHandle,
        loss: f64,
        metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        self.epoch += 1;
        if self.print_train_loss {
            println!("{}", self.format_line("train", loss, metrics));
        }
        Ok(())
    }

    fn on_test_end(
        &mut self,
        _trainer: &mut dyn TrainerHandle,
        loss: f64,
        metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        println!("{}", self.format_line("test", loss, metrics));
        Ok(())
    }
}

/// Persists `{epoch}.tar` every `freq` epochs and `final.tar` when training ends.
///
/// The stored epoch is the number of completed epochs, so a resumed run starts
/// with the next one.
#[derive(Debug, Clone)]
pub struct CheckpointSaver {
    dir: PathBuf,
    freq: usize,
    epoch: usize,
}

impl CheckpointSaver {
    pub fn new(dir: impl Into<PathBuf>, freq: usize) -> Self {
        CheckpointSaver {
            dir: dir.into(),
            freq,
            epoch: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn save(&self, trainer: &dyn TrainerHandle, name: &str, epoch: usize) -> Result<(), TrainingError> {
        let path = self.dir.join(format!("{}.tar", name));
        trainer.checkpoint(epoch)?.save(&path)?;
        tracing::debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }
}

impl Callback for CheckpointSaver {
    fn on_train_begin(&mut self, trainer: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
        self.epoch = trainer.start_epoch();
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        trainer: &mut dyn TrainerHandle,
        _loss: f64,
        _metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        if self.freq > 0 && self.epoch % self.freq == 0 {
            self.save(trainer, &self.epoch.to_string(), self.epoch + 1)?;
        }
        self.epoch += 1;
        Ok(())
    }

    fn on_train_end(&mut self, trainer: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
        self.save(trainer, "final", self.epoch)
    }
}

/// Loss and metrics seen so far, from training or from validation.
#[derive(Debug, Clone, Default)]
struct StatsHistory {
    validation: bool,
    train: Vec<(f64, Metrics)>,
    test: Vec<(f64, Metrics)>,
}

impl StatsHistory {
    fn new(validation: bool) -> Self {
        StatsHistory {
            validation,
            ..Default::default()
        }
    }

    fn watched(&self) -> &[(f64, Metrics)] {
        if self.validation {
            &self.test
        } else {
            &self.train
        }
    }
}

/// Stops once `field` in the watched stats reaches `threshold`.
#[derive(Debug, Clone)]
pub struct EarlyStopperAccuracy {
    pub threshold: f64,
    pub field: String,
    history: StatsHistory,
}

impl EarlyStopperAccuracy {
    /// Watches validation stats when `validation` is set, training stats otherwise.
    pub fn new(threshold: f64, validation: bool) -> Self {
        EarlyStopperAccuracy {
            threshold,
            field: "acc".to_string(),
            history: StatsHistory::new(validation),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    fn check(&self, trainer: &mut dyn TrainerHandle) {
        let reached = self
            .history
            .watched()
            .last()
            .and_then(|(_, m)| m.get(&self.field))
            .is_some_and(|v| v >= self.threshold);
        if reached {
            tracing::info!(field = %self.field, threshold = self.threshold, "early stopping");
            trainer.request_stop();
        }
    }
}

impl Callback for EarlyStopperAccuracy {
    fn on_epoch_end(
        &mut self,
        trainer: &mut dyn TrainerHandle,
        loss: f64,
        metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        self.history.train.push((loss, metrics.clone()));
        if !self.history.validation {
            self.check(trainer);
        }
        Ok(())
    }

    fn on_test_end(
        &mut self,
        trainer: &mut dyn TrainerHandle,
        loss: f64,
        metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        if self.history.validation {
            self.history.test.push((loss, metrics.clone()));
            self.check(trainer);
        }
        Ok(())
    }
}

/// Stops when the watched loss has not improved on its best value by more
/// than `delta` for `patience` consecutive observations.
#[derive(Debug, Clone)]
pub struct EarlyStopperLoss {
    pub delta: f64,
    pub patience: usize,
    history: StatsHistory,
}

impl EarlyStopperLoss {
    pub fn new(delta: f64, patience: usize, validation: bool) -> Self {
        EarlyStopperLoss {
            delta,
            patience,
            history: StatsHistory::new(validation),
        }
    }

    fn stale_observations(&self) -> usize {
        let mut best = f64::INFINITY;
        let mut stale = 0;
        for (loss, _) in self.history.watched() {
            if *loss < best - self.delta {
                best = *loss;
                stale = 0;
            } else {
                stale += 1;
            }
        }
        stale
    }

    fn check(&self, trainer: &mut dyn TrainerHandle) {
        if self.patience > 0 && self.stale_observations() >= self.patience {
            tracing::info!(patience = self.patience, "loss plateaued; early stopping");
            trainer.request_stop();
        }
    }
}

impl Callback for EarlyStopperLoss {
    fn on_epoch_end(
        &mut self,
        trainer: &mut dyn TrainerHandle,
        loss: f64,
        metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        self.history.train.push((loss, metrics.clone()));
        if !self.history.validation {
            self.check(trainer);
        }
        Ok(())
    }

    fn on_test_end(
        &mut self,
        trainer: &mut dyn TrainerHandle,
        loss: f64,
        metrics: &Metrics,
    ) -> Result<(), TrainingError> {
        if self.history.validation {
            self.history.test.push((loss, metrics.clone()));
            self.check(trainer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ModelState, OptimizerState, StateDict, STATE_SCHEMA_VERSION};
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockTrainer {
        start_epoch: usize,
        stop: bool,
    }

    impl TrainerHandle for MockTrainer {
        fn start_epoch(&self) -> usize {
            self.start_epoch
        }

        fn should_stop(&self) -> bool {
            self.stop
        }

        fn request_stop(&mut self) {
            self.stop = true;
        }

        fn checkpoint(&self, epoch: usize) -> Result<Checkpoint, CheckpointError> {
            Ok(Checkpoint {
                version: STATE_SCHEMA_VERSION,
                epoch,
                model: ModelState::Game(StateDict::default()),
                optimizer: OptimizerState::default(),
            })
        }
    }

    #[test]
    fn test_console_logger_plain_line() {
        let mut logger = ConsoleLogger::new(true, false);
        let mut trainer = MockTrainer::default();
        logger.on_train_begin(&mut trainer).unwrap();
        logger.epoch = 1;
        let line = logger.format_line("test", 0.5, &Metrics::new().with("acc", 1.0));
        assert_eq!(line, r#"test: epoch 1, loss 0.5000, {"acc":1.0}"#);
    }

    #[test]
    fn test_console_logger_json_line() {
        let logger = ConsoleLogger::new(false, true);
        let line = logger.format_line("train", 0.25, &Metrics::new().with("acc", 0.5));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["mode"], "train");
        assert_eq!(value["epoch"], 0);
        assert_eq!(value["loss"], 0.25);
        assert_eq!(value["acc"], 0.5);
    }

    #[test]
    fn test_checkpoint_saver_frequency() {
        let dir = tempdir().unwrap();
        let mut saver = CheckpointSaver::new(dir.path(), 2);
        let mut trainer = MockTrainer::default();
        saver.on_train_begin(&mut trainer).unwrap();
        for _ in 0..5 {
            saver
                .on_epoch_end(&mut trainer, 0.0, &Metrics::new())
                .unwrap();
        }
        saver.on_train_end(&mut trainer).unwrap();

        for name in ["0.tar", "2.tar", "4.tar", "final.tar"] {
            assert!(dir.path().join(name).exists(), "missing {}", name);
        }
        assert!(!dir.path().join("1.tar").exists());
        assert_eq!(Checkpoint::load(&dir.path().join("2.tar")).unwrap().epoch, 3);
        assert_eq!(Checkpoint::load(&dir.path().join("final.tar")).unwrap().epoch, 5);
    }

    #[test]
    fn test_checkpoint_saver_zero_freq_only_final() {
        let dir = tempdir().unwrap();
        let mut saver = CheckpointSaver::new(dir.path(), 0);
        let mut trainer = MockTrainer {
            start_epoch: 3,
            ..Default::default()
        };
        saver.on_train_begin(&mut trainer).unwrap();
        saver.on_epoch_end(&mut trainer, 0.0, &Metrics::new()).unwrap();
        saver.on_train_end(&mut trainer).unwrap();
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(Checkpoint::load(&dir.path().join("final.tar")).unwrap().epoch, 4);
    }

    #[test]
    fn test_early_stopper_accuracy_on_validation() {
        let mut stopper = EarlyStopperAccuracy::new(0.9, true);
        let mut trainer = MockTrainer::default();
        // Training accuracy is ignored when watching validation.
        stopper
            .on_epoch_end(&mut trainer, 0.1, &Metrics::new().with("acc", 1.0))
            .unwrap();
        assert!(!trainer.should_stop());
        stopper
            .on_test_end(&mut trainer, 0.1, &Metrics::new().with("acc", 0.5))
            .unwrap();
        assert!(!trainer.should_stop());
        stopper
            .on_test_end(&mut trainer, 0.1, &Metrics::new().with("acc", 0.95))
            .unwrap();
        assert!(trainer.should_stop());
    }

    #[test]
    fn test_early_stopper_accuracy_on_train_custom_field() {
        let mut stopper = EarlyStopperAccuracy::new(0.8, false).with_field("recall");
        let mut trainer = MockTrainer::default();
        stopper
            .on_epoch_end(&mut trainer, 0.1, &Metrics::new().with("acc", 1.0))
            .unwrap();
        assert!(!trainer.should_stop());
        stopper
            .on_epoch_end(&mut trainer, 0.1, &Metrics::new().with("recall", 0.8))
            .unwrap();
        assert!(trainer.should_stop());
    }

    #[test]
    fn test_early_stopper_loss_patience() {
        let mut stopper = EarlyStopperLoss::new(0.01, 2, false);
        let mut trainer = MockTrainer::default();
        for loss in [1.0, 0.5, 0.499] {
            stopper
                .on_epoch_end(&mut trainer, loss, &Metrics::new())
                .unwrap();
        }
        assert!(!trainer.should_stop());
        stopper
            .on_epoch_end(&mut trainer, 0.6, &Metrics::new())
            .unwrap();
        assert!(trainer.should_stop());
    }

    #[test]
    fn test_early_stopper_loss_zero_patience_never_stops() {
        let mut stopper = EarlyStopperLoss::new(0.0, 0, true);
        let mut trainer = MockTrainer::default();
        for loss in [0.5, 0.6, 0.7, 0.8] {
            stopper
                .on_epoch_end(&mut trainer, loss, &Metrics::new())
                .unwrap();
            stopper
                .on_test_end(&mut trainer, loss, &Metrics::new())
                .unwrap();
        }
        assert!(!trainer.should_stop());
    }
}
