//! Batch strategies that record sender gradients for bias/variance analysis.
//!
//! * [`SaverStep`] samples N gradients per batch, applies one more, and
//!   persists the post-step agents as `epoch{E}_batch{B}.tar`.
//! * [`LoaderStep`] replays a saver run: before each batch it restores the
//!   matching checkpoint and samples N gradients without stepping.
//! * [`SaverLoaderStep`] does both in one run, mirroring the primary game into
//!   a shadow game that uses another gradient estimator.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, KeyMap};
use crate::error::TrainingError;
use crate::game::{Game, Mode};
use crate::training::gradients::{capture_sender_gradients, ArchiveMode, Condition, GradientSnapshot, Samples};
use crate::training::metrics::Metrics;
use crate::training::optimizer::GameOptimizer;
use crate::training::trainer::{scalar, AttachContext, BatchStrategy, StepContext, StepOutcome};

/// Checkpoint of the agents before any update.
pub const INITIAL_CHECKPOINT: &str = "initial.tar";

/// File name of the post-step checkpoint for a batch.
pub fn batch_checkpoint_name(epoch: usize, batch: usize) -> String {
    format!("epoch{}_batch{}.tar", epoch, batch)
}

/// Gradient-capture settings shared by the capturing trainers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Independent gradient samples per batch.
    pub n_samples: usize,
    /// Checkpoint directory of the saver run a loader replays.
    pub loader_path: Option<PathBuf>,
    pub archive: ArchiveMode,
    /// Receiver key translation from the primary game into the shadow game.
    pub shadow_key_map: KeyMap,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            n_samples: 10,
            loader_path: None,
            archive: ArchiveMode::Buffered,
            shadow_key_map: KeyMap::Identity,
        }
    }
}

/// Forward in training mode and backward, without touching the parameters.
fn forward_backward<B, G>(game: &G, batch: &G::Batch) -> (f64, Metrics, B::Gradients)
where
    B: AutodiffBackend,
    G: Game<B>,
{
    let output = game.forward(batch, Mode::Train);
    let grads = output.loss.backward();
    (scalar(output.loss), output.metrics, grads)
}

/// `n` independent sender-gradient samples from the current state, plus the
/// loss and metrics of the last one.
fn sample_sender_gradients<B, G>(
    game: &G,
    batch: &G::Batch,
    n: usize,
) -> Result<(Vec<GradientSnapshot>, f64, Metrics), TrainingError>
where
    B: AutodiffBackend,
    G: Game<B>,
{
    let mut samples = Vec::with_capacity(n);
    let mut last = (f64::NAN, Metrics::new());
    for _ in 0..n {
        let (loss, metrics, grads) = forward_backward(game, batch);
        samples.push(capture_sender_gradients(game, &grads)?);
        last = (loss, metrics);
    }
    Ok((samples, last.0, last.1))
}

/// A fresh pass whose gradient is captured and then applied.
fn capture_and_step<B, G, O>(
    game: G,
    optimizer: &mut O,
    batch: &G::Batch,
) -> Result<(G, GradientSnapshot, f64, Metrics), TrainingError>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    let (loss, metrics, grads) = forward_backward(&game, batch);
    let snapshot = capture_sender_gradients(&game, &grads)?;
    let grads = GradientsParams::from_grads(grads, &game);
    let game = optimizer.step(game, grads);
    Ok((game, snapshot, loss, metrics))
}

fn require_dir<'a>(path: Option<&'a Path>) -> Result<&'a Path, TrainingError> {
    path.ok_or(TrainingError::MissingCheckpointDir)
}

/// Records N sender-gradient samples and the applied gradient for every
/// batch, checkpointing the agents after each update.
#[derive(Debug, Clone)]
pub struct SaverStep {
    n_samples: usize,
    archive: ArchiveMode,
}

impl SaverStep {
    pub fn new(config: &CaptureConfig) -> Self {
        SaverStep {
            n_samples: config.n_samples,
            archive: config.archive,
        }
    }
}

impl<B, G, O> BatchStrategy<B, G, O> for SaverStep
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    fn name(&self) -> &'static str {
        "saver"
    }

    fn archive(&self) -> Option<(&'static str, ArchiveMode)> {
        Some(("saver_gradient", self.archive))
    }

    fn attach(&mut self, game: G, optimizer: &mut O, ctx: &AttachContext<'_, B>) -> Result<G, TrainingError> {
        let dir = require_dir(ctx.checkpoint_path)?;
        Checkpoint::of_agents(0, &game, optimizer)?.save(&dir.join(INITIAL_CHECKPOINT))?;
        Ok(game)
    }

    fn step(
        &mut self,
        game: G,
        optimizer: &mut O,
        batch: &G::Batch,
        ctx: &StepContext<'_, B>,
    ) -> Result<(G, StepOutcome), TrainingError> {
        let dir = require_dir(ctx.checkpoint_path)?;
        let (samples, _, _) = sample_sender_gradients(&game, batch, self.n_samples)?;
        let (game, applied, loss, metrics) = capture_and_step(game, optimizer, batch)?;

        let path = dir.join(batch_checkpoint_name(ctx.epoch, ctx.batch_index));
        Checkpoint::of_agents(ctx.epoch, &game, optimizer)?.save(&path)?;

        Ok((
            game,
            StepOutcome {
                loss,
                metrics,
                captures: vec![
                    (Condition::NSamples, Samples::Many(samples)),
                    (Condition::OneSample, Samples::One(applied)),
                ],
            },
        ))
    }
}

/// Replays a saver run's trajectory and records N sender-gradient samples
/// per batch. Never steps the optimizer.
#[derive(Debug, Clone)]
pub struct LoaderStep {
    n_samples: usize,
    loader_path: Option<PathBuf>,
    archive: ArchiveMode,
}

impl LoaderStep {
    pub fn new(config: &CaptureConfig) -> Self {
        LoaderStep {
            n_samples: config.n_samples,
            loader_path: config.loader_path.clone(),
            archive: config.archive,
        }
    }

    fn source(&self) -> Result<&Path, TrainingError> {
        self.loader_path.as_deref().ok_or_else(|| {
            tracing::error!("loader trainer has no loader path to replay from");
            TrainingError::MissingLoaderPath
        })
    }
}

impl<B, G, O> BatchStrategy<B, G, O> for LoaderStep
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
{
    fn name(&self) -> &'static str {
        "loader"
    }

    fn replays(&self) -> bool {
        true
    }

    fn archive(&self) -> Option<(&'static str, ArchiveMode)> {
        Some(("loader_gradient", self.archive))
    }

    fn attach(&mut self, game: G, optimizer: &mut O, ctx: &AttachContext<'_, B>) -> Result<G, TrainingError> {
        let path = self.source()?.join(INITIAL_CHECKPOINT);
        tracing::info!(path = %path.display(), "loading initial agents");
        let checkpoint = Checkpoint::load(&path)?;
        Ok(checkpoint.restore(game, optimizer, ctx.receiver_map, ctx.device)?)
    }

    fn step(
        &mut self,
        game: G,
        optimizer: &mut O,
        batch: &G::Batch,
        ctx: &StepContext<'_, B>,
    ) -> Result<(G, StepOutcome), TrainingError> {
        let path = self
            .source()?
            .join(batch_checkpoint_name(ctx.epoch, ctx.batch_index));
        let checkpoint = Checkpoint::load(&path)?;
        let game = checkpoint.restore(game, optimizer, ctx.receiver_map, ctx.device)?;

        let (samples, loss, metrics) = sample_sender_gradients(&game, batch, self.n_samples)?;
        Ok((
            game,
            StepOutcome {
                loss,
                metrics,
                captures: vec![(Condition::NSamples, Samples::Many(samples))],
            },
        ))
    }
}

/// Trains the primary game like [`SaverStep`] while sampling a shadow game,
/// synchronized from the primary before every batch.
pub struct SaverLoaderStep<B, G2, O2> {
    shadow: G2,
    shadow_optimizer: O2,
    shadow_map: KeyMap,
    n_samples: usize,
    archive: ArchiveMode,
    _backend: PhantomData<B>,
}

impl<B, G2, O2> SaverLoaderStep<B, G2, O2>
where
    B: AutodiffBackend,
    G2: Game<B>,
    O2: GameOptimizer<B, G2>,
{
    pub fn new(shadow: G2, shadow_optimizer: O2, config: &CaptureConfig) -> Self {
        SaverLoaderStep {
            shadow,
            shadow_optimizer,
            shadow_map: config.shadow_key_map.clone(),
            n_samples: config.n_samples,
            archive: config.archive,
            _backend: PhantomData,
        }
    }

    pub fn shadow(&self) -> &G2 {
        &self.shadow
    }

    #[cfg(test)]
    fn shadow_optimizer(&self) -> &O2 {
        &self.shadow_optimizer
    }

    /// Copy the primary's agents and optimizer state into the shadow. The
    /// primary is only read.
    pub fn sync_from<G, O>(
        &mut self,
        game: &G,
        optimizer: &O,
        device: &B::Device,
    ) -> Result<(), TrainingError>
    where
        G: Game<B>,
        O: GameOptimizer<B, G>,
    {
        let checkpoint = Checkpoint::of_agents(0, game, optimizer)?;
        self.shadow = checkpoint.restore(
            self.shadow.clone(),
            &mut self.shadow_optimizer,
            &self.shadow_map,
            device,
        )?;
        Ok(())
    }
}

impl<B, G, O, G2, O2> BatchStrategy<B, G, O> for SaverLoaderStep<B, G2, O2>
where
    B: AutodiffBackend,
    G: Game<B>,
    O: GameOptimizer<B, G>,
    G2: Game<B, Batch = G::Batch>,
    O2: GameOptimizer<B, G2>,
{
    fn name(&self) -> &'static str {
        "saver-loader"
    }

    fn archive(&self) -> Option<(&'static str, ArchiveMode)> {
        Some(("gradients", self.archive))
    }

    fn attach(&mut self, game: G, _optimizer: &mut O, ctx: &AttachContext<'_, B>) -> Result<G, TrainingError> {
        require_dir(ctx.checkpoint_path)?;
        self.shadow = self.shadow.clone().fork(ctx.device);
        self.shadow_optimizer.to_device(ctx.device)?;
        Ok(game)
    }

    fn step(
        &mut self,
        game: G,
        optimizer: &mut O,
        batch: &G::Batch,
        ctx: &StepContext<'_, B>,
    ) -> Result<(G, StepOutcome), TrainingError> {
        let (samples, _, _) = sample_sender_gradients(&game, batch, self.n_samples)?;

        self.sync_from(&game, optimizer, ctx.device)?;
        let (shadow_samples, _, _) = sample_sender_gradients(&self.shadow, batch, self.n_samples)?;

        let (game, applied, loss, metrics) = capture_and_step(game, optimizer, batch)?;
        Ok((
            game,
            StepOutcome {
                loss,
                metrics,
                captures: vec![
                    (Condition::ShadowNSamples, Samples::Many(shadow_samples)),
                    (Condition::NSamples, Samples::Many(samples)),
                    (Condition::OneSample, Samples::One(applied)),
                ],
            },
        ))
    }
}
