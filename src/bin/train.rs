#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::backend::{Autodiff, NdArray};
use burn::optim::Adam;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use egg_trainer::agents::{gs_game, rf_game, DataConfig, GsGame, RfGame, SymbolBatch, SymbolDataset};
use egg_trainer::checkpoint::KeyMap;
use egg_trainer::config::AppConfig;
use egg_trainer::game::Game;
use egg_trainer::training::callbacks::{Callback, ConsoleLogger, EarlyStopperAccuracy, EarlyStopperLoss};
use egg_trainer::training::capture::{LoaderStep, SaverLoaderStep, SaverStep};
use egg_trainer::training::optimizer::{adam, AdaptorOptimizer};
use egg_trainer::training::trainer::{BatchStrategy, StandardStep, Trainer};

type Backend = Autodiff<NdArray>;
type Opt<G> = AdaptorOptimizer<Adam, G, Backend>;

/// Train a sender/receiver reference game, optionally capturing sender gradients.
#[derive(Parser)]
#[command(name = "train", about = "Train an emergent-communication reference game")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Batch strategy: standard, saver, loader or saver-loader
    #[arg(long, default_value = "standard")]
    trainer: String,

    /// Game: gs (Gumbel-Softmax) or rf (REINFORCE)
    #[arg(long, default_value = "gs")]
    mode: String,

    /// Override number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override checkpoint directory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint directory of the saver run to replay (loader only)
    #[arg(long)]
    loader_path: Option<PathBuf>,

    /// Override gradient samples per batch
    #[arg(long)]
    samples: Option<usize>,

    /// Prefix stored receiver keys with this name when loading checkpoints
    #[arg(long)]
    receiver_prefix: Option<String>,

    /// Stop once validation accuracy reaches this value
    #[arg(long, default_value_t = 0.99)]
    early_stop_acc: f64,

    /// Minimum validation loss improvement that resets early-stopping patience
    #[arg(long, default_value_t = 0.0)]
    early_stopping_delta: f64,

    /// Epochs without validation loss improvement before stopping (0 disables)
    #[arg(long, default_value_t = 0)]
    early_stopping_patience: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.trainer.as_str() {
        "standard" | "saver" | "loader" | "saver-loader" => {}
        other => bail!(
            "unknown trainer '{}' (expected 'standard', 'saver', 'loader' or 'saver-loader')",
            other
        ),
    }

    let mut app = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    if let Some(epochs) = cli.epochs {
        app.trainer.n_epochs = epochs;
    }
    if let Some(dir) = cli.checkpoint_dir.clone() {
        app.trainer.checkpoint_dir = Some(dir);
    }
    if let Some(path) = cli.loader_path.clone() {
        app.capture.loader_path = Some(path);
    }
    if let Some(samples) = cli.samples {
        app.capture.n_samples = samples;
    }
    if let Some(prefix) = cli.receiver_prefix.clone() {
        app.trainer.receiver_key_map = KeyMap::AddPrefix(prefix);
    }
    app.validate().context("validating configuration")?;

    let device = Default::default();
    let n_objects = app.data.n_objects;

    match (cli.mode.as_str(), cli.trainer.as_str()) {
        ("gs", "saver-loader") => {
            let game = gs_game::<Backend>(&app.game, n_objects, &device);
            let shadow = rf_game::<Backend>(&app.game, n_objects, &device);
            let mut capture = app.capture.clone();
            if capture.shadow_key_map == KeyMap::Identity {
                capture.shadow_key_map = KeyMap::AddPrefix("agent".into());
            }
            let shadow_optimizer: Opt<RfGame<Backend>> = adam(app.optimizer.learning_rate);
            let strategy = SaverLoaderStep::new(shadow, shadow_optimizer, &capture);
            run(game, strategy, &app, &cli)
        }
        ("rf", "saver-loader") => {
            let game = rf_game::<Backend>(&app.game, n_objects, &device);
            let shadow = gs_game::<Backend>(&app.game, n_objects, &device);
            let mut capture = app.capture.clone();
            if capture.shadow_key_map == KeyMap::Identity {
                capture.shadow_key_map = KeyMap::StripPrefix("agent".into());
            }
            let shadow_optimizer: Opt<GsGame<Backend>> = adam(app.optimizer.learning_rate);
            let strategy = SaverLoaderStep::new(shadow, shadow_optimizer, &capture);
            run(game, strategy, &app, &cli)
        }
        ("gs", trainer) => {
            let game = gs_game::<Backend>(&app.game, n_objects, &device);
            run_simple(game, trainer, &app, &cli)
        }
        ("rf", trainer) => {
            let game = rf_game::<Backend>(&app.game, n_objects, &device);
            run_simple(game, trainer, &app, &cli)
        }
        (other, _) => bail!("unknown mode '{}' (expected 'gs' or 'rf')", other),
    }
}

/// Dispatch the strategies that need nothing beyond the capture settings.
fn run_simple<G>(game: G, trainer: &str, app: &AppConfig, cli: &Cli) -> Result<()>
where
    G: Game<Backend, Batch = SymbolBatch<Backend>> + 'static,
{
    match trainer {
        "saver" => run(game, SaverStep::new(&app.capture), app, cli),
        "loader" => run(game, LoaderStep::new(&app.capture), app, cli),
        _ => run(game, StandardStep, app, cli),
    }
}

fn run<G, S>(game: G, strategy: S, app: &AppConfig, cli: &Cli) -> Result<()>
where
    G: Game<Backend, Batch = SymbolBatch<Backend>> + 'static,
    S: BatchStrategy<Backend, G, Opt<G>> + 'static,
{
    let device = Default::default();
    let train_data = SymbolDataset::new(&app.data).batches::<Backend>(&device);
    let validation_data = SymbolDataset::new(&DataConfig {
        seed: app.data.seed.wrapping_add(1),
        ..app.data.clone()
    })
    .batches::<Backend>(&device);

    let callbacks: Vec<Box<dyn Callback>> = vec![
        Box::new(ConsoleLogger::new(true, true)),
        Box::new(EarlyStopperAccuracy::new(cli.early_stop_acc, true)),
        Box::new(EarlyStopperLoss::new(
            cli.early_stopping_delta,
            cli.early_stopping_patience,
            true,
        )),
    ];

    let optimizer: Opt<G> = adam(app.optimizer.learning_rate);
    let mut trainer = Trainer::builder(game, optimizer, train_data, app.trainer.clone())
        .validation_data(validation_data)
        .device(device)
        .callbacks(callbacks)
        .strategy(strategy)
        .build()
        .context("building trainer")?;

    tracing::info!(
        mode = %cli.mode,
        trainer = %cli.trainer,
        start_epoch = trainer.start_epoch(),
        n_epochs = app.trainer.n_epochs,
        "starting training"
    );
    trainer
        .train(app.trainer.n_epochs)
        .context("training failed")?;
    tracing::info!(epoch = trainer.epoch(), "training finished");
    Ok(())
}
