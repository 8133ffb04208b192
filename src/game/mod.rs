pub mod params;

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::training::metrics::Metrics;

pub use params::{NamedParams, ParamMapper, ParamNames, ParamVisitor};

/// Scope under which the sender's parameters are named.
pub const SENDER_SCOPE: &str = "sender";
/// Scope under which the receiver's parameters are named.
pub const RECEIVER_SCOPE: &str = "receiver";

/// Whether the game is run for training or evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Result of one forward pass over a batch.
#[derive(Debug, Clone)]
pub struct GameOutput<B: Backend> {
    /// Single-element loss tensor.
    pub loss: Tensor<B, 1>,
    pub metrics: Metrics,
}

/// A sender/receiver game that produces a differentiable loss for a batch.
///
/// Parameters are exposed through [`NamedParams`] and must be rooted at
/// [`SENDER_SCOPE`] and [`RECEIVER_SCOPE`]; checkpoints and gradient capture
/// locate the two agents by those prefixes.
pub trait Game<B: AutodiffBackend>: AutodiffModule<B> + NamedParams<B> {
    type Batch: DeviceBatch<B> + 'static;

    fn forward(&self, batch: &Self::Batch, mode: Mode) -> GameOutput<B>;
}

/// A batch that can be moved onto a compute device.
pub trait DeviceBatch<B: Backend> {
    fn to_device(self, device: &B::Device) -> Self;
}

/// A finite, re-iterable source of batches. Each call to `batches` is one pass.
pub trait DataSource<T> {
    fn batches(&self) -> Box<dyn Iterator<Item = T> + '_>;
}

impl<T: Clone> DataSource<T> for Vec<T> {
    fn batches(&self) -> Box<dyn Iterator<Item = T> + '_> {
        Box::new(self.iter().cloned())
    }
}
