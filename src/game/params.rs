//! Dotted-name traversal over a module's float parameters.

use std::collections::HashMap;

use burn::module::{Param, ParamId};
use burn::nn::Linear;
use burn::prelude::*;

/// Read-only visit of named parameters.
pub trait ParamVisitor<B: Backend> {
    fn visit<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>);
}

/// Owning rewrite of named parameters.
pub trait ParamMapper<B: Backend> {
    fn map<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>)
        -> Param<Tensor<B, D>>;
}

/// A module whose float parameters can be enumerated under stable dotted names
/// (`sender.fc.weight`, `receiver.agent.fc1.bias`).
pub trait NamedParams<B: Backend>: Sized {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V);

    fn map_named<M: ParamMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self;
}

/// Join a scope prefix and a local name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

impl<B: Backend> NamedParams<B> for Linear<B> {
    fn visit_named<V: ParamVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            visitor.visit(&join(prefix, "bias"), bias);
        }
    }

    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.weight = mapper.map(&join(prefix, "weight"), self.weight);
        self.bias = self.bias.map(|bias| mapper.map(&join(prefix, "bias"), bias));
        self
    }
}

/// Bidirectional lookup between burn parameter ids and dotted names.
#[derive(Debug, Clone, Default)]
pub struct ParamNames {
    by_id: HashMap<ParamId, String>,
    by_name: HashMap<String, ParamId>,
}

impl ParamNames {
    pub fn of<B: Backend, M: NamedParams<B>>(module: &M) -> Self {
        let mut names = ParamNames::default();
        module.visit_named("", &mut names);
        names
    }

    pub fn name(&self, id: &ParamId) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    pub fn id(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<B: Backend> ParamVisitor<B> for ParamNames {
    fn visit<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>) {
        self.by_id.insert(param.id, name.to_string());
        self.by_name.insert(name.to_string(), param.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::LinearConfig;

    type TestBackend = NdArray;

    #[test]
    fn test_join() {
        assert_eq!(join("", "weight"), "weight");
        assert_eq!(join("sender.fc", "weight"), "sender.fc.weight");
    }

    #[test]
    fn test_linear_names() {
        let device = Default::default();
        let linear = LinearConfig::new(3, 2).init::<TestBackend>(&device);
        let names = ParamNames::of::<TestBackend, _>(&linear);
        assert_eq!(names.names(), vec!["bias", "weight"]);
        assert_eq!(names.id("weight"), Some(linear.weight.id));
        assert_eq!(names.name(&linear.weight.id), Some("weight"));
    }

    #[test]
    fn test_linear_without_bias() {
        let device = Default::default();
        let linear = LinearConfig::new(3, 2)
            .with_bias(false)
            .init::<TestBackend>(&device);
        let names = ParamNames::of::<TestBackend, _>(&linear);
        assert_eq!(names.names(), vec!["weight"]);
    }
}
