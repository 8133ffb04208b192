use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer, SimpleOptimizer};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;

use crate::checkpoint::OptimizerState;
use crate::error::CheckpointError;
use crate::game::ParamNames;

/// The optimizer engine as seen by the trainer.
///
/// Persisted state is keyed by parameter name so it can be restored into a
/// freshly built game whose burn parameter ids differ.
pub trait GameOptimizer<B: AutodiffBackend, G: AutodiffModule<B>> {
    /// Apply one update and return the updated game.
    fn step(&mut self, game: G, grads: GradientsParams) -> G;

    fn state(&self, names: &ParamNames) -> Result<OptimizerState, CheckpointError>;

    /// Replace the internal state. Parameters absent from `state` start fresh.
    fn load_state(
        &mut self,
        state: &OptimizerState,
        names: &ParamNames,
        device: &B::Device,
    ) -> Result<(), CheckpointError>;

    /// Move every state tensor onto `device`.
    fn to_device(&mut self, device: &B::Device) -> Result<(), CheckpointError>;
}

type AdaptorState<O, G, B> = <OptimizerAdaptor<O, G, B> as Optimizer<G, B>>::Record;

/// A burn [`OptimizerAdaptor`] driven at a fixed learning rate.
#[derive(Clone)]
pub struct AdaptorOptimizer<O, G, B>
where
    O: SimpleOptimizer<B::InnerBackend>,
    G: AutodiffModule<B>,
    B: AutodiffBackend,
{
    inner: OptimizerAdaptor<O, G, B>,
    learning_rate: f64,
}

impl<O, G, B> AdaptorOptimizer<O, G, B>
where
    O: SimpleOptimizer<B::InnerBackend>,
    G: AutodiffModule<B>,
    B: AutodiffBackend,
{
    pub fn new(inner: OptimizerAdaptor<O, G, B>, learning_rate: f64) -> Self {
        AdaptorOptimizer {
            inner,
            learning_rate,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn recorder() -> BinBytesRecorder<FullPrecisionSettings> {
        BinBytesRecorder::<FullPrecisionSettings>::default()
    }
}

/// Adam with default betas, as used by the reference games.
pub fn adam<G, B>(learning_rate: f64) -> AdaptorOptimizer<Adam, G, B>
where
    G: AutodiffModule<B>,
    B: AutodiffBackend,
{
    AdaptorOptimizer::new(AdamConfig::new().init(), learning_rate)
}

impl<O, G, B> GameOptimizer<B, G> for AdaptorOptimizer<O, G, B>
where
    O: SimpleOptimizer<B::InnerBackend>,
    G: AutodiffModule<B>,
    B: AutodiffBackend,
{
    fn step(&mut self, game: G, grads: GradientsParams) -> G {
        self.inner.step(self.learning_rate, game, grads)
    }

    fn state(&self, names: &ParamNames) -> Result<OptimizerState, CheckpointError> {
        let recorder = Self::recorder();
        let mut state = OptimizerState::default();
        for (id, entry) in self.inner.to_record() {
            let name = names
                .name(&id)
                .ok_or_else(|| CheckpointError::UnknownParameter(format!("{:?}", id)))?;
            let bytes = Recorder::<B>::record(&recorder, entry, ())
                .map_err(|e| CheckpointError::Recorder(format!("{:?}", e)))?;
            state.insert(name, bytes);
        }
        Ok(state)
    }

    fn load_state(
        &mut self,
        state: &OptimizerState,
        names: &ParamNames,
        device: &B::Device,
    ) -> Result<(), CheckpointError> {
        let recorder = Self::recorder();
        let mut record = AdaptorState::<O, G, B>::default();
        for (name, bytes) in state.iter() {
            let id = names
                .id(name)
                .ok_or_else(|| CheckpointError::UnknownParameter(name.to_string()))?;
            let entry = Recorder::<B>::load(&recorder, bytes.to_vec(), device)
                .map_err(|e| CheckpointError::Recorder(format!("{:?}", e)))?;
            record.insert(id, entry);
        }
        self.inner = self.inner.clone().load_record(record);
        Ok(())
    }

    fn to_device(&mut self, device: &B::Device) -> Result<(), CheckpointError> {
        let recorder = Self::recorder();
        let mut moved = AdaptorState::<O, G, B>::default();
        for (id, entry) in self.inner.to_record() {
            let bytes = Recorder::<B>::record(&recorder, entry, ())
                .map_err(|e| CheckpointError::Recorder(format!("{:?}", e)))?;
            let entry = Recorder::<B>::load(&recorder, bytes, device)
                .map_err(|e| CheckpointError::Recorder(format!("{:?}", e)))?;
            moved.insert(id, entry);
        }
        self.inner = self.inner.clone().load_record(moved);
        Ok(())
    }
}
