use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;

use crate::game::params::{join, NamedParams, ParamMapper, ParamVisitor};

/// Maps a one-hot object to vocabulary logits.
///
/// ```text
/// Input:  [batch, n_objects]
/// FC:     n_objects -> vocab_size  (logits over symbols)
/// ```
#[derive(Module, Debug)]
pub struct Sender<B: Backend> {
    fc: Linear<B>,
}

#[derive(Config, Debug)]
pub struct SenderConfig {
    pub n_objects: usize,
    pub vocab_size: usize,
}

impl SenderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Sender<B> {
        Sender {
            fc: LinearConfig::new(self.n_objects, self.vocab_size).init(device),
        }
    }
}

impl<B: Backend> Sender<B> {
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc.forward(input)
    }
}

impl<B: Backend> NamedParams<B> for Sender<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.fc.visit_named(&join(prefix, "fc"), visitor);
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.fc = self.fc.map_named(&join(prefix, "fc"), mapper);
        self
    }
}

/// Reads a (possibly relaxed) one-hot message and scores every object.
///
/// ```text
/// Input:  [batch, vocab_size]
/// FC1:    vocab_size -> hidden, ReLU
/// FC2:    hidden -> n_objects  (logits)
/// ```
#[derive(Module, Debug)]
pub struct Receiver<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    relu: Relu,
}

#[derive(Config, Debug)]
pub struct ReceiverConfig {
    pub vocab_size: usize,
    pub hidden: usize,
    pub n_objects: usize,
}

impl ReceiverConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Receiver<B> {
        Receiver {
            fc1: LinearConfig::new(self.vocab_size, self.hidden).init(device),
            fc2: LinearConfig::new(self.hidden, self.n_objects).init(device),
            relu: Relu::new(),
        }
    }
}

impl<B: Backend> Receiver<B> {
    pub fn forward(&self, message: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.fc1.forward(message));
        self.fc2.forward(x)
    }
}

impl<B: Backend> NamedParams<B> for Receiver<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.fc1.visit_named(&join(prefix, "fc1"), visitor);
        self.fc2.visit_named(&join(prefix, "fc2"), visitor);
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.fc1 = self.fc1.map_named(&join(prefix, "fc1"), mapper);
        self.fc2 = self.fc2.map_named(&join(prefix, "fc2"), mapper);
        self
    }
}

/// A receiver nested one level down, so its parameters are named
/// `agent.fc1.weight` and so on. Score-function games wrap their receiver this way.
#[derive(Module, Debug)]
pub struct ReceiverWrapper<B: Backend> {
    agent: Receiver<B>,
}

impl<B: Backend> ReceiverWrapper<B> {
    pub fn new(agent: Receiver<B>) -> Self {
        ReceiverWrapper { agent }
    }

    pub fn forward(&self, message: Tensor<B, 2>) -> Tensor<B, 2> {
        self.agent.forward(message)
    }
}

impl<B: Backend> NamedParams<B> for ReceiverWrapper<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.agent.visit_named(&join(prefix, "agent"), visitor);
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.agent = self.agent.map_named(&join(prefix, "agent"), mapper);
        self
    }
}
