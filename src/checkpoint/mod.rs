pub mod manager;
pub mod state;

use std::collections::BTreeMap;
use std::path::Path;

use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::game::params::join;
use crate::game::{Game, ParamNames, RECEIVER_SCOPE, SENDER_SCOPE};
use crate::training::optimizer::GameOptimizer;

pub use manager::{latest_checkpoint, preemptive_dir, preemptive_dir_for};
pub use state::{KeyMap, StateDict, TensorRecord};

/// Version of the on-disk checkpoint layout.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Serialized optimizer entries keyed by full parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState(BTreeMap<String, Vec<u8>>);

impl OptimizerState {
    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.0.insert(name.into(), bytes);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply `map` to the part of every key below `scope`; other keys pass through.
    pub fn remap_scope(self, scope: &str, map: &KeyMap) -> Result<Self, CheckpointError> {
        self.0
            .into_iter()
            .map(|(k, v)| Ok((remap_scoped_key(&k, scope, map)?, v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(OptimizerState)
    }
}

/// Model parameters stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelState {
    /// The whole game, under game-level names.
    Game(StateDict),
    /// Sender and receiver separately, each under its own local names.
    Agents { sender: StateDict, receiver: StateDict },
}

/// A persisted snapshot of training state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub epoch: usize,
    pub model: ModelState,
    pub optimizer: OptimizerState,
}

fn remap_scoped_key(key: &str, scope: &str, map: &KeyMap) -> Result<String, CheckpointError> {
    match key
        .strip_prefix(scope)
        .and_then(|rest| rest.strip_prefix('.'))
    {
        Some(rest) => Ok(join(scope, &map.apply(rest)?)),
        None => Ok(key.to_string()),
    }
}

impl Checkpoint {
    /// Snapshot the whole game and its optimizer.
    pub fn of_game<B, G, O>(epoch: usize, game: &G, optimizer: &O) -> Result<Self, CheckpointError>
    where
        B: AutodiffBackend,
        G: Game<B>,
        O: GameOptimizer<B, G>,
    {
        Ok(Checkpoint {
            version: STATE_SCHEMA_VERSION,
            epoch,
            model: ModelState::Game(StateDict::of(game)?),
            optimizer: optimizer.state(&ParamNames::of(game))?,
        })
    }

    /// Snapshot sender and receiver separately, as the gradient-capturing
    /// trainers persist them.
    pub fn of_agents<B, G, O>(epoch: usize, game: &G, optimizer: &O) -> Result<Self, CheckpointError>
    where
        B: AutodiffBackend,
        G: Game<B>,
        O: GameOptimizer<B, G>,
    {
        let state = StateDict::of(game)?;
        Ok(Checkpoint {
            version: STATE_SCHEMA_VERSION,
            epoch,
            model: ModelState::Agents {
                sender: state.scope(SENDER_SCOPE),
                receiver: state.scope(RECEIVER_SCOPE),
            },
            optimizer: optimizer.state(&ParamNames::of(game))?,
        })
    }

    /// Game-level parameters and optimizer state, with `receiver_map` applied to
    /// every receiver key.
    pub fn resolve(&self, receiver_map: &KeyMap) -> Result<(StateDict, OptimizerState), CheckpointError> {
        let model = match &self.model {
            ModelState::Game(state) => state.clone().remap_scope(RECEIVER_SCOPE, receiver_map)?,
            ModelState::Agents { sender, receiver } => sender
                .clone()
                .prefixed(SENDER_SCOPE)
                .merge(receiver.clone().remap(receiver_map)?.prefixed(RECEIVER_SCOPE)),
        };
        let optimizer = self
            .optimizer
            .clone()
            .remap_scope(RECEIVER_SCOPE, receiver_map)?;
        Ok((model, optimizer))
    }

    /// Load parameters into `game` and state into `optimizer`.
    pub fn restore<B, G, O>(
        &self,
        game: G,
        optimizer: &mut O,
        receiver_map: &KeyMap,
        device: &B::Device,
    ) -> Result<G, CheckpointError>
    where
        B: AutodiffBackend,
        G: Game<B>,
        O: GameOptimizer<B, G>,
    {
        let (model, opt_state) = self.resolve(receiver_map)?;
        let game = model.load_into(game)?;
        optimizer.load_state(&opt_state, &ParamNames::of(&game), device)?;
        Ok(game)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::serialize(self).map_err(|e| CheckpointError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8], origin: &Path) -> Result<Self, CheckpointError> {
        let checkpoint: Checkpoint =
            bincode::deserialize(bytes).map_err(|e| CheckpointError::Decode {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        if checkpoint.version != STATE_SCHEMA_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                expected: STATE_SCHEMA_VERSION,
            });
        }
        Ok(checkpoint)
    }

    /// Write to `path` through a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        manager::write_atomic(path, &self.to_bytes()?)
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = std::fs::read(path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_bytes(&bytes, path)
    }
}

impl StateDict {
    /// Apply `map` to the part of every key below `scope`; other keys pass through.
    pub fn remap_scope(self, scope: &str, map: &KeyMap) -> Result<Self, CheckpointError> {
        let mut out = StateDict::default();
        for (k, v) in self.iter() {
            out.insert(remap_scoped_key(k, scope, map)?, v.clone());
        }
        Ok(out)
    }
}
