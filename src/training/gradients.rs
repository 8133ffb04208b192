//! Sender-gradient snapshots and the archive they are written to.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::checkpoint::TensorRecord;
use crate::error::{CheckpointError, TrainingError};
use crate::game::params::{NamedParams, ParamVisitor};
use crate::game::SENDER_SCOPE;

/// Sender parameter name (relative to the sender) to gradient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradientSnapshot(BTreeMap<String, TensorRecord>);

impl GradientSnapshot {
    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Read the sender gradients out of `grads` onto the host.
///
/// Parameters that received no gradient are skipped.
pub fn capture_sender_gradients<B, M>(
    module: &M,
    grads: &B::Gradients,
) -> Result<GradientSnapshot, TrainingError>
where
    B: AutodiffBackend,
    M: NamedParams<B>,
{
    let mut collector = GradCollector::<B> {
        grads,
        prefix: format!("{}.", SENDER_SCOPE),
        entries: BTreeMap::new(),
        error: None,
    };
    module.visit_named("", &mut collector);
    match collector.error {
        Some(e) => Err(e.into()),
        None => Ok(GradientSnapshot(collector.entries)),
    }
}

struct GradCollector<'a, B: AutodiffBackend> {
    grads: &'a B::Gradients,
    prefix: String,
    entries: BTreeMap<String, TensorRecord>,
    error: Option<CheckpointError>,
}

impl<B: AutodiffBackend> ParamVisitor<B> for GradCollector<'_, B> {
    fn visit<const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>) {
        if self.error.is_some() {
            return;
        }
        let Some(local) = name.strip_prefix(self.prefix.as_str()) else {
            return;
        };
        let Some(grad) = param.val().grad(self.grads) else {
            return;
        };
        match TensorRecord::from_tensor(grad) {
            Ok(record) => {
                self.entries.insert(local.to_string(), record);
            }
            Err(e) => self.error = Some(e),
        }
    }
}

/// Sampling condition a batch of gradients was taken under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Condition {
    /// N independent passes from the same pre-step state.
    #[serde(rename = "Nsamples")]
    NSamples,
    /// The single pass whose gradient is applied.
    #[serde(rename = "1sample")]
    OneSample,
    /// N passes of the shadow game in the saver-loader trainer.
    #[serde(rename = "RFNsamples")]
    ShadowNSamples,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Samples {
    Many(Vec<GradientSnapshot>),
    One(GradientSnapshot),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::Many(v) => v.len(),
            Samples::One(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Captures produced while processing one batch.
pub type BatchCaptures = Vec<(Condition, Samples)>;

/// epoch -> condition -> batch index -> samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradientArchive(BTreeMap<usize, BTreeMap<Condition, BTreeMap<usize, Samples>>>);

impl GradientArchive {
    pub fn insert(&mut self, epoch: usize, condition: Condition, batch: usize, samples: Samples) {
        self.0
            .entry(epoch)
            .or_default()
            .entry(condition)
            .or_default()
            .insert(batch, samples);
    }

    pub fn get(&self, epoch: usize, condition: Condition, batch: usize) -> Option<&Samples> {
        self.0.get(&epoch)?.get(&condition)?.get(&batch)
    }

    pub fn epochs(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.keys().copied()
    }

    pub fn conditions(&self, epoch: usize) -> Vec<Condition> {
        self.0
            .get(&epoch)
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn n_batches(&self, epoch: usize, condition: Condition) -> usize {
        self.0
            .get(&epoch)
            .and_then(|c| c.get(&condition))
            .map_or(0, BTreeMap::len)
    }
}

/// How gradient captures reach disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMode {
    /// Keep the whole archive in memory and write one JSON document at the end.
    #[default]
    Buffered,
    /// Append one JSON line per batch and condition as training proceeds.
    Streaming,
}

#[derive(Serialize)]
struct StreamRecord<'a> {
    epoch: usize,
    batch: usize,
    condition: Condition,
    samples: &'a Samples,
}

enum SinkState {
    Buffered(GradientArchive),
    Streaming(BufWriter<File>),
}

/// Destination for gradient captures.
pub struct ArchiveSink {
    path: PathBuf,
    state: SinkState,
}

impl ArchiveSink {
    /// Open `{dir}/{stem}.json` (buffered) or `{dir}/{stem}.jsonl` (streaming).
    pub fn open(dir: &Path, stem: &str, mode: ArchiveMode) -> Result<Self, TrainingError> {
        std::fs::create_dir_all(dir)?;
        let (path, state) = match mode {
            ArchiveMode::Buffered => (
                dir.join(format!("{}.json", stem)),
                SinkState::Buffered(GradientArchive::default()),
            ),
            ArchiveMode::Streaming => {
                let path = dir.join(format!("{}.jsonl", stem));
                let file = File::create(&path)?;
                (path, SinkState::Streaming(BufWriter::new(file)))
            }
        };
        Ok(ArchiveSink { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &mut self,
        epoch: usize,
        batch: usize,
        captures: BatchCaptures,
    ) -> Result<(), TrainingError> {
        match &mut self.state {
            SinkState::Buffered(archive) => {
                for (condition, samples) in captures {
                    archive.insert(epoch, condition, batch, samples);
                }
            }
            SinkState::Streaming(writer) => {
                for (condition, samples) in &captures {
                    let line = StreamRecord {
                        epoch,
                        batch,
                        condition: *condition,
                        samples,
                    };
                    serde_json::to_writer(&mut *writer, &line)?;
                    writer.write_all(b"\n")?;
                }
            }
        }
        Ok(())
    }

    /// Flush everything to disk and return the archive path.
    pub fn finish(self) -> Result<PathBuf, TrainingError> {
        match self.state {
            SinkState::Buffered(archive) => {
                let file = File::create(&self.path)?;
                let mut writer = BufWriter::new(file);
                serde_json::to_writer(&mut writer, &archive)?;
                writer.flush()?;
            }
            SinkState::Streaming(mut writer) => writer.flush()?,
        }
        tracing::info!(path = %self.path.display(), "gradient archive written");
        Ok(self.path)
    }
}

/// Read a buffered archive back.
pub fn load_archive(path: &Path) -> Result<GradientArchive, TrainingError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}
