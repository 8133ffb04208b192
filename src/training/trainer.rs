use std::path::{Path, PathBuf};

use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;

use crate::checkpoint::{latest_checkpoint, preemptive_dir, Checkpoint, KeyMap};
use crate::error::{CheckpointError, TrainingError};
use crate::game::{DataSource, DeviceBatch, Game, Mode};
use crate::training::callbacks::{Callback, CheckpointSaver, ConsoleLogger, TrainerHandle};
use crate::training::gradients::{ArchiveMode, ArchiveSink, BatchCaptures};
use crate::training::metrics::{Metrics, RunningMean};
use crate::training::optimizer::GameOptimizer;

/// Trainer configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub n_epochs: usize,
    /// Evaluate every this many epochs; 0 disables validation.
    pub validation_freq: usize,
    pub checkpoint_dir: Option<PathBuf>,
    /// Save `{epoch}.tar` every this many epochs; 0 saves only `final.tar`.
    pub checkpoint_freq: usize,
    /// Resume from and checkpoint into a per-job directory under `checkpoint_dir`.
    pub preemptable: bool,
    pub load_from_checkpoint: Option<PathBuf>,
    /// Translation from stored receiver keys to the live receiver's names.
    pub receiver_key_map: KeyMap,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            n_epochs: 10,
            validation_freq: 1,
            checkpoint_dir: None,
            checkpoint_freq: 0,
            preemptable: false,
            load_from_checkpoint: None,
            receiver_key_map: KeyMap::Identity,
        }
    }
}

/// What one batch step produced.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub loss: f64,
    pub metrics: Metrics,
    pub captures: BatchCaptures,
}

/// Per-batch information handed to a [`BatchStrategy`].
pub struct StepContext<'a, B: Backend> {
    pub device: &'a B::Device,
    pub epoch: usize,
    pub batch_index: usize,
    pub checkpoint_path: Option<&'a Path>,
    pub receiver_map: &'a KeyMap,
}

/// Construction-time information handed to a [`BatchStrategy`].
pub struct AttachContext<'a, B: Backend> {
    pub device: &'a B::Device,
    pub checkpoint_path: Option<&'a Path>,
    pub receiver_map: &'a KeyMap,
}

/// How the trainer processes one training batch.
pub trait BatchStrategy<B, G, O>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    fn name(&self) -> &'static str;

    /// Strategies that restore their own state skip checkpoint resumption.
    fn replays(&self) -> bool {
        false
    }

    /// File stem and mode of the gradient archive this strategy fills, if any.
    fn archive(&self) -> Option<(&'static str, ArchiveMode)> {
        None
    }

    /// Called once at the end of trainer construction.
    fn attach(&mut self, game: G, _optimizer: &mut O, _ctx: &AttachContext<'_, B>) -> Result<G, TrainingError> {
        Ok(game)
    }

    fn step(
        &mut self,
        game: G,
        optimizer: &mut O,
        batch: &G::Batch,
        ctx: &StepContext<'_, B>,
    ) -> Result<(G, StepOutcome), TrainingError>;
}

/// Read a one-element tensor back to the host.
pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// Forward in training mode, backward, optimizer step.
pub fn standard_step<B, G, O>(
    game: G,
    optimizer: &mut O,
    batch: &G::Batch,
) -> Result<(G, StepOutcome), TrainingError>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    let output = game.forward(batch, Mode::Train);
    let grads = GradientsParams::from_grads(output.loss.backward(), &game);
    let loss = scalar(output.loss);
    let game = optimizer.step(game, grads);
    Ok((
        game,
        StepOutcome {
            loss,
            metrics: output.metrics,
            captures: Vec::new(),
        },
    ))
}

/// Plain gradient descent on every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardStep;

impl<B, G, O> BatchStrategy<B, G, O> for StandardStep
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    fn name(&self) -> &'static str {
        "standard"
    }

    fn step(
        &mut self,
        game: G,
        optimizer: &mut O,
        batch: &G::Batch,
        _ctx: &StepContext<'_, B>,
    ) -> Result<(G, StepOutcome), TrainingError> {
        standard_step(game, optimizer, batch)
    }
}

/// Drives epochs over a game, notifying callbacks and checkpointing.
pub struct Trainer<B, G, O>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    game: G,
    optimizer: O,
    train_data: Box<dyn DataSource<G::Batch>>,
    validation_data: Option<Box<dyn DataSource<G::Batch>>>,
    device: B::Device,
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    strategy: Box<dyn BatchStrategy<B, G, O>>,
    checkpoint_path: Option<PathBuf>,
    archive: Option<ArchiveSink>,
    start_epoch: usize,
    epoch: usize,
    should_stop: bool,
}

/// Collects the optional parts of a [`Trainer`] before construction.
pub struct TrainerBuilder<B, G, O>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    game: G,
    optimizer: O,
    train_data: Box<dyn DataSource<G::Batch>>,
    validation_data: Option<Box<dyn DataSource<G::Batch>>>,
    device: Option<B::Device>,
    config: TrainerConfig,
    callbacks: Option<Vec<Box<dyn Callback>>>,
    strategy: Box<dyn BatchStrategy<B, G, O>>,
}

impl<B, G, O> TrainerBuilder<B, G, O>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    pub fn validation_data(mut self, data: impl DataSource<G::Batch> + 'static) -> Self {
        self.validation_data = Some(Box::new(data));
        self
    }

    pub fn device(mut self, device: B::Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Replace the default console logger with these callbacks.
    pub fn callbacks(mut self, callbacks: Vec<Box<dyn Callback>>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn strategy(mut self, strategy: impl BatchStrategy<B, G, O> + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn build(self) -> Result<Trainer<B, G, O>, TrainingError> {
        let device = self.device.unwrap_or_default();
        let game = self.game.fork(&device);
        let mut optimizer = self.optimizer;
        optimizer.to_device(&device)?;

        let callbacks = self
            .callbacks
            .unwrap_or_else(|| vec![Box::new(ConsoleLogger::new(false, false))]);

        let mut trainer = Trainer {
            game,
            optimizer,
            train_data: self.train_data,
            validation_data: self.validation_data,
            device,
            config: self.config,
            callbacks,
            strategy: self.strategy,
            checkpoint_path: None,
            archive: None,
            start_epoch: 0,
            epoch: 0,
            should_stop: false,
        };

        if trainer.strategy.replays() {
            let root = trainer
                .config
                .checkpoint_dir
                .clone()
                .ok_or(TrainingError::MissingCheckpointDir)?;
            trainer.checkpoint_path = Some(preemptive_dir(&root)?);
        } else {
            if let Some(path) = trainer.config.load_from_checkpoint.clone() {
                trainer.load_from_checkpoint(&path)?;
            }
            if trainer.config.preemptable {
                let root = trainer
                    .config
                    .checkpoint_dir
                    .clone()
                    .ok_or(TrainingError::MissingCheckpointDir)?;
                let dir = preemptive_dir(&root)?;
                trainer.load_from_latest(&dir)?;
                trainer.checkpoint_path = Some(dir);
            } else {
                trainer.checkpoint_path = trainer.config.checkpoint_dir.clone();
            }
        }

        if let Some(dir) = &trainer.checkpoint_path {
            trainer.callbacks.push(Box::new(CheckpointSaver::new(
                dir.clone(),
                trainer.config.checkpoint_freq,
            )));
        }

        let ctx = AttachContext {
            device: &trainer.device,
            checkpoint_path: trainer.checkpoint_path.as_deref(),
            receiver_map: &trainer.config.receiver_key_map,
        };
        trainer.game = trainer
            .strategy
            .attach(trainer.game.clone(), &mut trainer.optimizer, &ctx)?;

        if let Some((stem, mode)) = trainer.strategy.archive() {
            let dir = trainer
                .checkpoint_path
                .as_deref()
                .ok_or(TrainingError::MissingCheckpointDir)?;
            trainer.archive = Some(ArchiveSink::open(dir, stem, mode)?);
        }

        tracing::info!(
            strategy = trainer.strategy.name(),
            start_epoch = trainer.start_epoch,
            checkpoint_path = ?trainer.checkpoint_path,
            "trainer ready"
        );
        Ok(trainer)
    }
}

impl<B, G, O> Trainer<B, G, O>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    pub fn builder(
        game: G,
        optimizer: O,
        train_data: impl DataSource<G::Batch> + 'static,
        config: TrainerConfig,
    ) -> TrainerBuilder<B, G, O> {
        TrainerBuilder {
            game,
            optimizer,
            train_data: Box::new(train_data),
            validation_data: None,
            device: None,
            config,
            callbacks: None,
            strategy: Box::new(StandardStep),
        }
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn into_parts(self) -> (G, O) {
        (self.game, self.optimizer)
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Epoch currently (or most recently) being trained.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint_path.as_deref()
    }

    /// Mean loss and metrics over one pass of the validation data, with
    /// gradients disabled. Leaves the game and optimizer untouched.
    pub fn eval(&self) -> Result<(f64, Metrics), TrainingError> {
        let data = self
            .validation_data
            .as_ref()
            .ok_or(TrainingError::NoValidationData)?;
        let game = self.game.clone().no_grad();
        let mut mean = RunningMean::new();
        for batch in data.batches() {
            let batch = batch.to_device(&self.device);
            let output = game.forward(&batch, Mode::Eval);
            mean.push(scalar(output.loss), &output.metrics);
        }
        Ok(mean.finish())
    }

    /// One pass over the training data through the batch strategy.
    pub fn train_epoch(&mut self) -> Result<(f64, Metrics), TrainingError> {
        let mut mean = RunningMean::new();
        for (batch_index, batch) in self.train_data.batches().enumerate() {
            let batch = batch.to_device(&self.device);
            let ctx = StepContext {
                device: &self.device,
                epoch: self.epoch,
                batch_index,
                checkpoint_path: self.checkpoint_path.as_deref(),
                receiver_map: &self.config.receiver_key_map,
            };
            let (game, outcome) =
                self.strategy
                    .step(self.game.clone(), &mut self.optimizer, &batch, &ctx)?;
            self.game = game;
            tracing::debug!(epoch = self.epoch, batch = batch_index, loss = outcome.loss, "batch");
            mean.push(outcome.loss, &outcome.metrics);
            if let Some(sink) = self.archive.as_mut() {
                sink.record(self.epoch, batch_index, outcome.captures)?;
            }
        }
        Ok(mean.finish())
    }

    /// Train from `start_epoch` up to (excluding) `n_epochs`.
    pub fn train(&mut self, n_epochs: usize) -> Result<(), TrainingError> {
        self.notify(|cb, t| cb.on_train_begin(t))?;

        for epoch in self.start_epoch..n_epochs {
            self.epoch = epoch;
            self.notify(|cb, t| cb.on_epoch_begin(t))?;

            let (loss, metrics) = self.train_epoch()?;
            tracing::info!(epoch, loss, "epoch finished");
            self.notify(|cb, t| cb.on_epoch_end(t, loss, &metrics))?;

            let validate = self.config.validation_freq > 0
                && epoch % self.config.validation_freq == 0;
            if self.validation_data.is_some() && validate {
                self.notify(|cb, t| cb.on_test_begin(t))?;
                let (loss, metrics) = self.eval()?;
                self.notify(|cb, t| cb.on_test_end(t, loss, &metrics))?;
            }

            if self.should_stop {
                tracing::info!(epoch, "stop requested");
                break;
            }
        }

        if let Some(sink) = self.archive.take() {
            sink.finish()?;
        }
        self.notify(|cb, t| cb.on_train_end(t))
    }

    /// Restore game, optimizer and starting epoch.
    pub fn load(&mut self, checkpoint: &Checkpoint) -> Result<(), TrainingError> {
        self.load_state(checkpoint)?;
        self.start_epoch = checkpoint.epoch;
        Ok(())
    }

    /// Restore game and optimizer, leaving the epoch counter alone.
    pub fn load_state(&mut self, checkpoint: &Checkpoint) -> Result<(), TrainingError> {
        self.game = checkpoint.restore(
            self.game.clone(),
            &mut self.optimizer,
            &self.config.receiver_key_map,
            &self.device,
        )?;
        Ok(())
    }

    pub fn load_from_checkpoint(&mut self, path: &Path) -> Result<(), TrainingError> {
        tracing::info!(path = %path.display(), "loading trainer state");
        let checkpoint = Checkpoint::load(path)?;
        self.load(&checkpoint)
    }

    /// Resume from the newest checkpoint in `dir`. Returns whether one was found.
    pub fn load_from_latest(&mut self, dir: &Path) -> Result<bool, TrainingError> {
        match latest_checkpoint(dir)? {
            Some(path) => {
                self.load_from_checkpoint(&path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn notify<F>(&mut self, mut f: F) -> Result<(), TrainingError>
    where
        F: FnMut(&mut dyn Callback, &mut dyn TrainerHandle) -> Result<(), TrainingError>,
    {
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let result = callbacks
            .iter_mut()
            .try_for_each(|cb| f(cb.as_mut(), &mut *self));
        self.callbacks = callbacks;
        result
    }
}

impl<B, G, O> TrainerHandle for Trainer<B, G, O>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    fn should_stop(&self) -> bool {
        self.should_stop
    }

    fn request_stop(&mut self) {
        self.should_stop = true;
    }

    fn checkpoint(&self, epoch: usize) -> Result<Checkpoint, CheckpointError> {
        Checkpoint::of_game(epoch, &self.game, &self.optimizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use burn::backend::{Autodiff, NdArray};
    use burn::optim::Adam;
    use tempfile::tempdir;

    use crate::agents::{gs_game, GsGame, SymbolBatch, SymbolDataset};
    use crate::checkpoint::StateDict;
    use crate::config::{DataConfig, GameConfig};
    use crate::training::optimizer::{adam, AdaptorOptimizer};

    type TestBackend = Autodiff<NdArray>;
    type TestGame = GsGame<TestBackend>;
    type TestOptimizer = AdaptorOptimizer<Adam, TestGame, TestBackend>;

    #[derive(Default)]
    struct Log {
        events: Vec<String>,
        next_epoch: usize,
        current: usize,
    }

    /// Records every hook as "<hook> <epoch>"; optionally requests a stop.
    #[derive(Clone, Default)]
    struct Recorder {
        log: Rc<RefCell<Log>>,
        stop_after: Option<usize>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.log.borrow().events.clone()
        }

        fn count(&self, hook: &str) -> usize {
            self.events()
                .iter()
                .filter(|e| e.split(' ').next() == Some(hook))
                .count()
        }

        fn epochs_of(&self, hook: &str) -> Vec<usize> {
            self.events()
                .iter()
                .filter_map(|e| e.strip_prefix(hook)?.trim().parse().ok())
                .collect()
        }

        fn push(&self, hook: &str) {
            let mut log = self.log.borrow_mut();
            let line = format!("{} {}", hook, log.current);
            log.events.push(line);
        }
    }

    impl Callback for Recorder {
        fn on_train_begin(&mut self, t: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
            self.log.borrow_mut().next_epoch = t.start_epoch();
            self.log.borrow_mut().events.push("train_begin".into());
            Ok(())
        }

        fn on_epoch_begin(&mut self, _t: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
            {
                let mut log = self.log.borrow_mut();
                log.current = log.next_epoch;
                log.next_epoch += 1;
            }
            self.push("epoch_begin");
            Ok(())
        }

        fn on_epoch_end(
            &mut self,
            t: &mut dyn TrainerHandle,
            loss: f64,
            _metrics: &Metrics,
        ) -> Result<(), TrainingError> {
            assert!(loss.is_finite());
            self.push("epoch_end");
            if self.stop_after == Some(self.log.borrow().current) {
                t.request_stop();
            }
            Ok(())
        }

        fn on_test_begin(&mut self, _t: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
            self.push("test_begin");
            Ok(())
        }

        fn on_test_end(
            &mut self,
            _t: &mut dyn TrainerHandle,
            _loss: f64,
            metrics: &Metrics,
        ) -> Result<(), TrainingError> {
            assert!(metrics.get("acc").is_some());
            self.push("test_end");
            Ok(())
        }

        fn on_train_end(&mut self, _t: &mut dyn TrainerHandle) -> Result<(), TrainingError> {
            self.log.borrow_mut().events.push("train_end".into());
            Ok(())
        }
    }

    fn data() -> Vec<SymbolBatch<TestBackend>> {
        let config = DataConfig {
            batches_per_epoch: 2,
            ..DataConfig::default()
        };
        SymbolDataset::new(&config).batches(&Default::default())
    }

    fn builder(config: TrainerConfig) -> TrainerBuilder<TestBackend, TestGame, TestOptimizer> {
        let device = Default::default();
        let game = gs_game::<TestBackend>(&GameConfig::default(), DataConfig::default().n_objects, &device);
        Trainer::builder(game, adam(0.01), data(), config)
    }

    fn with_recorder(
        config: TrainerConfig,
        recorder: &Recorder,
    ) -> Trainer<TestBackend, TestGame, TestOptimizer> {
        builder(config)
            .validation_data(data())
            .callbacks(vec![Box::new(recorder.clone())])
            .build()
            .unwrap()
    }

    #[test]
    fn test_no_epochs_when_start_equals_n() {
        let recorder = Recorder::default();
        let mut trainer = with_recorder(TrainerConfig::default(), &recorder);
        trainer.start_epoch = 3;
        trainer.train(3).unwrap();
        assert_eq!(recorder.events(), vec!["train_begin", "train_end"]);
    }

    #[test]
    fn test_stop_request_halts_after_current_epoch() {
        let recorder = Recorder {
            stop_after: Some(2),
            ..Recorder::default()
        };
        let mut trainer = with_recorder(TrainerConfig::default(), &recorder);
        trainer.train(10).unwrap();

        assert_eq!(recorder.epochs_of("epoch_end"), vec![0, 1, 2]);
        // Validation of the stopping epoch still runs.
        assert_eq!(recorder.epochs_of("test_end"), vec![0, 1, 2]);
        assert_eq!(recorder.count("train_end"), 1);
        assert!(trainer.should_stop());
        assert_eq!(trainer.epoch(), 2);
    }

    #[test]
    fn test_validation_frequency() {
        let cases = [
            (1, (0..10).collect::<Vec<usize>>()),
            (2, vec![0, 2, 4, 6, 8]),
            (5, vec![0, 5]),
        ];
        for (freq, expected) in cases {
            let recorder = Recorder::default();
            let config = TrainerConfig {
                validation_freq: freq,
                ..TrainerConfig::default()
            };
            let mut trainer = with_recorder(config, &recorder);
            trainer.train(10).unwrap();

            assert_eq!(recorder.epochs_of("test_end"), expected, "validation_freq = {}", freq);
            assert_eq!(recorder.count("test_begin"), expected.len());
            assert_eq!(recorder.count("epoch_end"), 10);
        }
    }

    #[test]
    fn test_zero_validation_freq_never_validates() {
        let recorder = Recorder::default();
        let config = TrainerConfig {
            validation_freq: 0,
            ..TrainerConfig::default()
        };
        let mut trainer = with_recorder(config, &recorder);
        trainer.train(3).unwrap();
        assert_eq!(recorder.count("test_end"), 0);
        assert_eq!(recorder.count("epoch_end"), 3);
    }

    #[test]
    fn test_callback_error_aborts_training() {
        struct Failing;
        impl Callback for Failing {
            fn on_epoch_end(
                &mut self,
                _t: &mut dyn TrainerHandle,
                _loss: f64,
                _metrics: &Metrics,
            ) -> Result<(), TrainingError> {
                Err(TrainingError::MissingLoaderPath)
            }
        }
        let recorder = Recorder::default();
        let mut trainer = builder(TrainerConfig::default())
            .callbacks(vec![Box::new(Failing), Box::new(recorder.clone())])
            .build()
            .unwrap();
        assert!(trainer.train(5).is_err());
        assert_eq!(recorder.count("epoch_end"), 0);
        assert_eq!(recorder.count("train_end"), 0);
    }

    #[test]
    fn test_eval_without_validation_data() {
        let trainer = builder(TrainerConfig::default())
            .callbacks(Vec::new())
            .build()
            .unwrap();
        assert!(matches!(trainer.eval(), Err(TrainingError::NoValidationData)));
    }

    #[test]
    fn test_eval_leaves_state_untouched() {
        let trainer = builder(TrainerConfig::default())
            .validation_data(data())
            .callbacks(Vec::new())
            .build()
            .unwrap();
        let before = StateDict::of(trainer.game()).unwrap();
        let (loss, metrics) = trainer.eval().unwrap();
        assert!(loss.is_finite());
        let acc = metrics.get("acc").unwrap();
        assert!((0.0..=1.0).contains(&acc));
        assert_eq!(StateDict::of(trainer.game()).unwrap(), before);
    }

    #[test]
    fn test_train_epoch_updates_parameters() {
        let mut trainer = builder(TrainerConfig::default())
            .callbacks(Vec::new())
            .build()
            .unwrap();
        let before = StateDict::of(trainer.game()).unwrap();
        let (loss, _) = trainer.train_epoch().unwrap();
        assert!(loss.is_finite());
        assert_ne!(StateDict::of(trainer.game()).unwrap(), before);
    }

    #[test]
    fn test_preemptable_requires_checkpoint_dir() {
        let config = TrainerConfig {
            preemptable: true,
            ..TrainerConfig::default()
        };
        let result = builder(config).callbacks(Vec::new()).build();
        assert!(matches!(result, Err(TrainingError::MissingCheckpointDir)));
    }

    #[test]
    fn test_checkpoint_dir_registers_saver_and_resume_sets_start_epoch() {
        let dir = tempdir().unwrap();
        let config = TrainerConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            checkpoint_freq: 1,
            ..TrainerConfig::default()
        };
        let mut trainer = builder(config).callbacks(Vec::new()).build().unwrap();
        trainer.train(3).unwrap();
        for name in ["0.tar", "1.tar", "2.tar", "final.tar"] {
            assert!(dir.path().join(name).exists(), "missing {}", name);
        }
        let trained = StateDict::of(trainer.game()).unwrap();

        let config = TrainerConfig {
            load_from_checkpoint: Some(dir.path().join("final.tar")),
            ..TrainerConfig::default()
        };
        let recorder = Recorder::default();
        let mut resumed = builder(config)
            .callbacks(vec![Box::new(recorder.clone())])
            .build()
            .unwrap();
        assert_eq!(resumed.start_epoch(), 3);
        assert_eq!(StateDict::of(resumed.game()).unwrap(), trained);

        resumed.train(3).unwrap();
        assert_eq!(recorder.count("epoch_begin"), 0);
    }

    #[test]
    fn test_load_state_keeps_start_epoch() {
        let mut trainer = builder(TrainerConfig::default())
            .callbacks(Vec::new())
            .build()
            .unwrap();
        let checkpoint = trainer.checkpoint(5).unwrap();
        trainer.load_state(&checkpoint).unwrap();
        assert_eq!(trainer.start_epoch(), 0);
        trainer.load(&checkpoint).unwrap();
        assert_eq!(trainer.start_epoch(), 5);
    }

    #[test]
    fn test_preemptable_resumes_from_newest_checkpoint() {
        let root = tempdir().unwrap();
        std::env::set_var("SLURM_JOB_ID", "42");
        std::env::set_var("SLURM_PROCID", "0");
        let config = TrainerConfig {
            checkpoint_dir: Some(root.path().to_path_buf()),
            preemptable: true,
            ..TrainerConfig::default()
        };
        let mut first = builder(config.clone()).callbacks(Vec::new()).build().unwrap();
        let job_dir = root.path().join("42_0");
        assert_eq!(first.checkpoint_path(), Some(job_dir.as_path()));
        first.train(2).unwrap();
        assert!(job_dir.join("final.tar").exists());

        let second = builder(config).callbacks(Vec::new()).build().unwrap();
        assert_eq!(second.start_epoch(), 2);
        assert_eq!(
            StateDict::of(second.game()).unwrap(),
            StateDict::of(first.game()).unwrap()
        );
    }
}
