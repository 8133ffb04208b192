use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Distribution, ElementConversion};
use rand::Rng;

use crate::agents::data::{one_hot, SymbolBatch};
use crate::agents::networks::{Receiver, ReceiverConfig, ReceiverWrapper, Sender, SenderConfig};
use crate::game::params::{join, NamedParams, ParamMapper, ParamVisitor};
use crate::game::{Game, GameOutput, Mode, RECEIVER_SCOPE, SENDER_SCOPE};
use crate::training::metrics::Metrics;

/// Reference game configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub vocab_size: usize,
    pub receiver_hidden: usize,
    /// Gumbel-Softmax temperature.
    pub temperature: f64,
    /// Weight of the sender entropy bonus in the REINFORCE loss.
    pub sender_entropy_coeff: f64,
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            vocab_size: 8,
            receiver_hidden: 16,
            temperature: 1.0,
            sender_entropy_coeff: 0.01,
        }
    }
}

fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .expect("f32 tensor data extraction")
}

fn argmax_rows<B: Backend>(scores: Tensor<B, 2>) -> Vec<usize> {
    let [_, width] = scores.dims();
    host_values(scores)
        .chunks(width)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}

/// Draw one index per row from row-wise probabilities.
fn sample_rows<B: Backend>(probs: Tensor<B, 2>) -> Vec<usize> {
    let [_, width] = probs.dims();
    let mut rng = rand::rng();
    host_values(probs)
        .chunks(width)
        .map(|row| {
            let u: f32 = rng.random_range(0.0..1.0);
            let mut cumulative = 0.0;
            row.iter()
                .position(|&p| {
                    cumulative += p;
                    u < cumulative
                })
                .unwrap_or(width - 1)
        })
        .collect()
}

/// Per-example cross-entropy of `logits` against one-hot `targets`, [batch].
fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    (log_softmax(logits, 1) * targets)
        .sum_dim(1)
        .squeeze::<1>(1)
        .neg()
}

fn accuracy<B: Backend>(logits: Tensor<B, 2>, labels: &[usize]) -> f64 {
    let predicted = argmax_rows(logits);
    let correct = predicted.iter().zip(labels).filter(|(p, l)| p == l).count();
    correct as f64 / labels.len() as f64
}

fn mean_scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.mean().into_scalar().elem::<f64>()
}

/// Sender and receiver trained end to end through a Gumbel-Softmax relaxed
/// message. Evaluation sends the hard argmax symbol.
#[derive(Module, Debug)]
pub struct GsGame<B: Backend> {
    pub sender: Sender<B>,
    pub receiver: Receiver<B>,
    temperature: f64,
}

pub fn gs_game<B: Backend>(config: &GameConfig, n_objects: usize, device: &B::Device) -> GsGame<B> {
    GsGame {
        sender: SenderConfig::new(n_objects, config.vocab_size).init(device),
        receiver: ReceiverConfig::new(config.vocab_size, config.receiver_hidden, n_objects).init(device),
        temperature: config.temperature,
    }
}

impl<B: Backend> GsGame<B> {
    fn gumbel_softmax(&self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        let noise = Tensor::<B, 2>::random(
            logits.shape(),
            Distribution::Uniform(1e-6, 1.0 - 1e-6),
            &logits.device(),
        );
        let gumbel = noise.log().neg().log().neg();
        softmax((logits + gumbel).div_scalar(self.temperature), 1)
    }
}

impl<B: Backend> NamedParams<B> for GsGame<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.sender.visit_named(&join(prefix, SENDER_SCOPE), visitor);
        self.receiver.visit_named(&join(prefix, RECEIVER_SCOPE), visitor);
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.sender = self.sender.map_named(&join(prefix, SENDER_SCOPE), mapper);
        self.receiver = self.receiver.map_named(&join(prefix, RECEIVER_SCOPE), mapper);
        self
    }
}

impl<B: AutodiffBackend> Game<B> for GsGame<B> {
    type Batch = SymbolBatch<B>;

    fn forward(&self, batch: &SymbolBatch<B>, mode: Mode) -> GameOutput<B> {
        let logits = self.sender.forward(batch.sender_input.clone());
        let message = match mode {
            Mode::Train => self.gumbel_softmax(logits),
            Mode::Eval => {
                let [_, vocab] = logits.dims();
                let device = logits.device();
                one_hot(&argmax_rows(logits), vocab, &device)
            }
        };
        let receiver_logits = self.receiver.forward(message);
        let acc = accuracy(receiver_logits.clone(), &batch.labels);
        let loss = cross_entropy(receiver_logits, batch.targets.clone()).mean();
        GameOutput {
            loss,
            metrics: Metrics::new().with("acc", acc),
        }
    }
}

/// Sender sampled as a discrete policy and trained with REINFORCE (batch-mean
/// baseline, entropy bonus); the receiver is trained on its own loss.
#[derive(Module, Debug)]
pub struct RfGame<B: Backend> {
    pub sender: Sender<B>,
    pub receiver: ReceiverWrapper<B>,
    sender_entropy_coeff: f64,
}

pub fn rf_game<B: Backend>(config: &GameConfig, n_objects: usize, device: &B::Device) -> RfGame<B> {
    RfGame {
        sender: SenderConfig::new(n_objects, config.vocab_size).init(device),
        receiver: ReceiverWrapper::new(
            ReceiverConfig::new(config.vocab_size, config.receiver_hidden, n_objects).init(device),
        ),
        sender_entropy_coeff: config.sender_entropy_coeff,
    }
}

impl<B: Backend> NamedParams<B> for RfGame<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.sender.visit_named(&join(prefix, SENDER_SCOPE), visitor);
        self.receiver.visit_named(&join(prefix, RECEIVER_SCOPE), visitor);
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.sender = self.sender.map_named(&join(prefix, SENDER_SCOPE), mapper);
        self.receiver = self.receiver.map_named(&join(prefix, RECEIVER_SCOPE), mapper);
        self
    }
}

impl<B: AutodiffBackend> Game<B> for RfGame<B> {
    type Batch = SymbolBatch<B>;

    fn forward(&self, batch: &SymbolBatch<B>, mode: Mode) -> GameOutput<B> {
        let logits = self.sender.forward(batch.sender_input.clone());
        let [_, vocab] = logits.dims();
        let device = logits.device();
        let log_probs = log_softmax(logits, 1);
        let probs = log_probs.clone().exp();

        let symbols = match mode {
            Mode::Train => sample_rows(probs.clone()),
            Mode::Eval => argmax_rows(probs.clone()),
        };
        let message = one_hot::<B>(&symbols, vocab, &device);

        let log_prob = (log_probs.clone() * message.clone())
            .sum_dim(1)
            .squeeze::<1>(1);
        let entropy = (probs * log_probs).sum_dim(1).squeeze::<1>(1).neg();

        let receiver_logits = self.receiver.forward(message);
        let acc = accuracy(receiver_logits.clone(), &batch.labels);
        let loss = cross_entropy(receiver_logits, batch.targets.clone());

        let baseline = mean_scalar(loss.clone().detach());
        let advantage = loss.clone().detach().sub_scalar(baseline);
        let policy_loss = (advantage * log_prob).mean();
        let mean_entropy = entropy.mean();
        let sender_entropy = mean_entropy.clone().into_scalar().elem::<f64>();

        let optimized = loss.mean() + policy_loss - mean_entropy.mul_scalar(self.sender_entropy_coeff);
        GameOutput {
            loss: optimized,
            metrics: Metrics::new()
                .with("acc", acc)
                .with("sender_entropy", sender_entropy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    use crate::agents::data::{DataConfig, SymbolDataset};
    use crate::game::ParamNames;

    type TestBackend = Autodiff<NdArray>;

    fn batch() -> SymbolBatch<TestBackend> {
        SymbolDataset::new(&DataConfig::default())
            .batches(&Default::default())
            .remove(0)
    }

    #[test]
    fn test_argmax_rows() {
        let device = Default::default();
        let t = Tensor::<NdArray, 2>::from_data(
            TensorData::new(vec![0.1f32, 0.7, 0.2, 0.9, 0.0, 0.1], [2, 3]),
            &device,
        );
        assert_eq!(argmax_rows(t), vec![1, 0]);
    }

    #[test]
    fn test_sample_rows_respects_degenerate_distribution() {
        let device = Default::default();
        let t = Tensor::<NdArray, 2>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 0.0, 0.0, 0.0, 1.0], [2, 3]),
            &device,
        );
        for _ in 0..10 {
            assert_eq!(sample_rows(t.clone()), vec![1, 2]);
        }
    }

    #[test]
    fn test_cross_entropy_of_uniform_logits() {
        let device = Default::default();
        let logits = Tensor::<NdArray, 2>::zeros([2, 4], &device);
        let targets = one_hot::<NdArray>(&[0, 3], 4, &device);
        let values = host_values(cross_entropy(logits, targets));
        for v in values {
            assert!((v as f64 - 4f64.ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gs_game_names_and_forward() {
        let device = Default::default();
        let game = gs_game::<TestBackend>(&GameConfig::default(), 8, &device);
        let names = ParamNames::of(&game);
        assert_eq!(
            names.names(),
            vec![
                "receiver.fc1.bias",
                "receiver.fc1.weight",
                "receiver.fc2.bias",
                "receiver.fc2.weight",
                "sender.fc.bias",
                "sender.fc.weight",
            ]
        );
        for mode in [Mode::Train, Mode::Eval] {
            let out = game.forward(&batch(), mode);
            assert_eq!(out.loss.dims(), [1]);
            let acc = out.metrics.get("acc").unwrap();
            assert!((0.0..=1.0).contains(&acc));
        }
    }

    #[test]
    fn test_rf_game_wraps_receiver() {
        let device = Default::default();
        let game = rf_game::<TestBackend>(&GameConfig::default(), 8, &device);
        let names = ParamNames::of(&game);
        assert!(names.id("receiver.agent.fc1.weight").is_some());
        assert!(names.id("sender.fc.weight").is_some());

        let out = game.forward(&batch(), Mode::Train);
        assert!(out.metrics.get("sender_entropy").unwrap() > 0.0);
    }

    #[test]
    fn test_rf_sender_receives_gradient() {
        let device = Default::default();
        let game = rf_game::<TestBackend>(&GameConfig::default(), 8, &device);
        let out = game.forward(&batch(), Mode::Train);
        let grads = out.loss.backward();
        let snapshot = crate::training::gradients::capture_sender_gradients(&game, &grads).unwrap();
        let names: Vec<&str> = snapshot.names().collect();
        assert_eq!(names, vec!["fc.bias", "fc.weight"]);
    }
}
