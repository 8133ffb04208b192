use std::collections::{BTreeMap, BTreeSet};

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::game::params::{join, NamedParams, ParamMapper, ParamVisitor};

/// A host-side copy of one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorRecord {
    pub fn from_tensor<B: Backend, const D: usize>(
        tensor: Tensor<B, D>,
    ) -> Result<Self, CheckpointError> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| CheckpointError::Tensor(format!("{:?}", e)))?;
        Ok(TensorRecord { shape, values })
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }
}

/// Translation applied to checkpoint keys before they are matched against the
/// live parameter names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMap {
    #[default]
    Identity,
    /// `fc.weight` becomes `{prefix}.fc.weight`.
    AddPrefix(String),
    /// `{prefix}.fc.weight` becomes `fc.weight`.
    StripPrefix(String),
}

impl KeyMap {
    pub fn apply(&self, key: &str) -> Result<String, CheckpointError> {
        match self {
            KeyMap::Identity => Ok(key.to_string()),
            KeyMap::AddPrefix(prefix) => Ok(join(prefix, key)),
            KeyMap::StripPrefix(prefix) => key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .map(str::to_string)
                .ok_or_else(|| CheckpointError::UnmappedKey {
                    key: key.to_string(),
                    prefix: prefix.clone(),
                }),
        }
    }
}

/// Parameter name to tensor contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict(BTreeMap<String, TensorRecord>);

impl StateDict {
    /// Snapshot every named parameter of `module`.
    pub fn of<B: Backend, M: NamedParams<B>>(module: &M) -> Result<Self, CheckpointError> {
        let mut collector = StateCollector::default();
        module.visit_named("", &mut collector);
        match collector.error {
            Some(e) => Err(e),
            None => Ok(StateDict(collector.entries)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, record: TensorRecord) {
        self.0.insert(name.into(), record);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorRecord)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries under `scope`, with the scope prefix removed.
    pub fn scope(&self, scope: &str) -> StateDict {
        let prefix = format!("{}.", scope);
        StateDict(
            self.0
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
                .collect(),
        )
    }

    /// Every key moved under `scope`.
    pub fn prefixed(self, scope: &str) -> StateDict {
        StateDict(self.0.into_iter().map(|(k, v)| (join(scope, &k), v)).collect())
    }

    pub fn merge(mut self, other: StateDict) -> StateDict {
        self.0.extend(other.0);
        self
    }

    pub fn remap(self, map: &KeyMap) -> Result<StateDict, CheckpointError> {
        if *map == KeyMap::Identity {
            return Ok(self);
        }
        self.0
            .into_iter()
            .map(|(k, v)| Ok((map.apply(&k)?, v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(StateDict)
    }

    /// Overwrite the parameters of `module` with this state.
    ///
    /// Strict: every live parameter must be present with the same shape and no
    /// entry may be left over. Parameter ids are preserved so optimizer state
    /// keyed by id stays attached.
    pub fn load_into<B: Backend, M: NamedParams<B>>(&self, module: M) -> Result<M, CheckpointError> {
        let mut loader = StateLoader {
            state: self,
            seen: BTreeSet::new(),
            error: None,
        };
        let module = module.map_named("", &mut loader);
        if let Some(e) = loader.error {
            return Err(e);
        }
        let unexpected: Vec<String> = self
            .0
            .keys()
            .filter(|k| !loader.seen.contains(k.as_str()))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(CheckpointError::UnexpectedKeys(unexpected));
        }
        Ok(module)
    }
}

#[derive(Default)]
struct StateCollector {
    entries: BTreeMap<String, TensorRecord>,
    error: Option<CheckpointError>,
}

impl<B: Backend> ParamVisitor<B> for StateCollector {
    fn visit<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>) {
        if self.error.is_some() {
            return;
        }
        match TensorRecord::from_tensor(param.val()) {
            Ok(record) => {
                self.entries.insert(name.to_string(), record);
            }
            Err(e) => self.error = Some(e),
        }
    }
}

struct StateLoader<'a> {
    state: &'a StateDict,
    seen: BTreeSet<String>,
    error: Option<CheckpointError>,
}

impl<B: Backend> ParamMapper<B> for StateLoader<'_> {
    fn map<const D: usize>(
        &mut self,
        name: &str,
        param: Param<Tensor<B, D>>,
    ) -> Param<Tensor<B, D>> {
        if self.error.is_some() {
            return param;
        }
        let Some(record) = self.state.get(name) else {
            self.error = Some(CheckpointError::MissingKey(name.to_string()));
            return param;
        };
        let expected = param.dims().to_vec();
        if record.shape != expected {
            self.error = Some(CheckpointError::ShapeMismatch {
                name: name.to_string(),
                stored: record.shape.clone(),
                expected,
            });
            return param;
        }
        self.seen.insert(name.to_string());
        let data = TensorData::new(record.values.clone(), record.shape.clone());
        param.map(|tensor| {
            let device = tensor.device();
            let require_grad = tensor.is_require_grad();
            Tensor::from_data(data, &device).set_require_grad(require_grad)
        })
    }
}
