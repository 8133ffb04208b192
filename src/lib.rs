//! # EGG Trainer
//!
//! Training core for emergent-communication games: an epoch loop with
//! callbacks, resumable checkpoints, and trainers that capture per-batch
//! sender gradients for later analysis. Built on the Burn ML framework.
//!
//! ## Modules
//!
//! - [`game`]: the `Game` trait, batches, data sources, named parameters
//! - [`checkpoint`]: checkpoint model, state dicts, directory helpers
//! - [`training`]: trainer, callbacks, optimizers, gradient capture
//! - [`agents`]: reference agents and games
//! - [`config`]: TOML configuration loading and validation
//! - [`error`]: structured error types

#![recursion_limit = "256"]

pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod game;
pub mod training;
