use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Named scalar metrics reported by a game for one batch.
///
/// Forms a monoid under key-wise addition with the empty map as identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Divide every value by `n`.
    pub fn scaled(mut self, n: f64) -> Self {
        for value in self.0.values_mut() {
            *value /= n;
        }
        self
    }
}

impl AddAssign<&Metrics> for Metrics {
    fn add_assign(&mut self, other: &Metrics) {
        for (k, v) in &other.0 {
            *self.0.entry(k.clone()).or_insert(0.0) += v;
        }
    }
}

impl Add for Metrics {
    type Output = Metrics;

    fn add(mut self, other: Metrics) -> Metrics {
        self += &other;
        self
    }
}

impl FromIterator<(String, f64)> for Metrics {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Metrics(iter.into_iter().collect())
    }
}

/// Loss and metrics summed over batches, averaged by batch count.
///
/// A key missing from some batches contributes zero for those batches; the
/// divisor is always the total number of batches.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    loss: f64,
    metrics: Metrics,
    n_batches: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loss: f64, metrics: &Metrics) {
        self.loss += loss;
        self.metrics += metrics;
        self.n_batches += 1;
    }

    pub fn n_batches(&self) -> usize {
        self.n_batches
    }

    /// Mean loss and mean metrics. An empty accumulator yields NaN loss.
    pub fn finish(self) -> (f64, Metrics) {
        let n = self.n_batches as f64;
        (self.loss / n, self.metrics.scaled(n))
    }
}
