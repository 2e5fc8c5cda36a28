//! Experiment checkpoint: histories, best-model state and resume state.
//!
//! One `.safetensors` file per experiment. Tensors are stored under four
//! prefixes (`best_model.`, `best_optimizer.`, `last_model.`,
//! `last_optimizer.`); the scalar record travels as JSON in the file's
//! metadata under [`RECORD_KEY`].
//!
//! State transitions ([`Checkpoint::advance`], [`Checkpoint::finish`]) are
//! pure: they consume a checkpoint and return the next one. Only
//! [`CheckpointStore`] touches the filesystem.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use lintail_common::{FinalEvalPolicy, HarnessError};

/// Parameter or optimiser state keyed by name.
pub type StateDict = BTreeMap<String, Tensor>;

pub const RECORD_KEY: &str = "record";
pub const FORMAT_VERSION: u32 = 1;

const BEST_MODEL: &str = "best_model.";
const BEST_OPTIMIZER: &str = "best_optimizer.";
const LAST_MODEL: &str = "last_model.";
const LAST_OPTIMIZER: &str = "last_optimizer.";

// ── History ─────────────────────────────────────────────────────────────────

/// Running metrics. Every list only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub running_loss: Vec<f64>,
    pub running_test_acc: Vec<f64>,
    pub running_train_acc: Vec<f64>,
}

impl History {
    /// `self` with the given values appended.
    pub fn extended(mut self, losses: &[f64], test_acc: Option<f64>, train_acc: Option<f64>) -> Self {
        self.running_loss.extend_from_slice(losses);
        self.running_test_acc.extend(test_acc);
        self.running_train_acc.extend(train_acc);
        self
    }
}

// ── Transition inputs ───────────────────────────────────────────────────────

/// Model + optimiser state at one instant.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub model: StateDict,
    pub optimizer: StateDict,
}

/// Everything one epoch contributes to the checkpoint.
#[derive(Debug, Clone)]
pub struct EpochResult {
    /// 0-based epoch index.
    pub epoch: usize,
    /// Accuracy of the model as it was before this epoch's updates.
    pub test_acc: f64,
    pub train_acc: Option<f64>,
    pub losses: Vec<f64>,
    /// Pre-update state. Required whenever `test_acc` beats the stored best.
    pub best_candidate: Option<Snapshot>,
    /// State after this epoch's updates, for resuming.
    pub last_state: Snapshot,
}

/// Accuracies measured after the last epoch.
#[derive(Debug, Clone)]
pub struct FinalEvaluation {
    pub test_acc: f64,
    pub train_acc: Option<f64>,
    /// Only consulted under [`FinalEvalPolicy::RecordAndTrackBest`].
    pub snapshot: Option<Snapshot>,
}

// ── Checkpoint ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub history: History,
    pub best_model_test_acc: f64,
    /// 1-based; `-1` until a best model exists.
    pub best_model_epoch: i64,
    pub model_state_dict: StateDict,
    pub optimizer_state_dict: StateDict,
    pub epochs_completed: usize,
    pub finished: bool,
    pub last_model_state_dict: StateDict,
    pub last_optimizer_state_dict: StateDict,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            history: History::default(),
            best_model_test_acc: -1.0,
            best_model_epoch: -1,
            model_state_dict: StateDict::new(),
            optimizer_state_dict: StateDict::new(),
            epochs_completed: 0,
            finished: false,
            last_model_state_dict: StateDict::new(),
            last_optimizer_state_dict: StateDict::new(),
        }
    }
}

impl Checkpoint {
    /// Strict gate: ties keep the earlier best.
    pub fn improves_on_best(&self, test_acc: f64) -> bool {
        test_acc > self.best_model_test_acc
    }

    pub fn has_resume_state(&self) -> bool {
        self.epochs_completed > 0 && !self.last_model_state_dict.is_empty()
    }

    /// Fold one epoch into the checkpoint.
    pub fn advance(self, result: EpochResult) -> Self {
        let improved = self.improves_on_best(result.test_acc);
        let mut next = Self {
            history: self
                .history
                .extended(&result.losses, Some(result.test_acc), result.train_acc),
            epochs_completed: result.epoch + 1,
            last_model_state_dict: result.last_state.model,
            last_optimizer_state_dict: result.last_state.optimizer,
            ..self
        };
        if improved {
            next = next.with_best(result.test_acc, result.epoch as i64 + 1, result.best_candidate);
        }
        next
    }

    /// Apply the post-loop evaluation under `policy` and mark the run done.
    pub fn finish(self, evaluation: FinalEvaluation, policy: FinalEvalPolicy) -> Self {
        let mut next = match policy {
            FinalEvalPolicy::MeasureOnly => self,
            FinalEvalPolicy::RecordHistory | FinalEvalPolicy::RecordAndTrackBest => Self {
                history: self
                    .history
                    .extended(&[], Some(evaluation.test_acc), evaluation.train_acc),
                ..self
            },
        };
        if policy == FinalEvalPolicy::RecordAndTrackBest
            && next.improves_on_best(evaluation.test_acc)
        {
            // The final measurement sits one slot after the last epoch.
            let epoch = next.epochs_completed as i64 + 1;
            next = next.with_best(evaluation.test_acc, epoch, evaluation.snapshot);
        }
        next.finished = true;
        next
    }

    fn with_best(mut self, test_acc: f64, epoch: i64, snapshot: Option<Snapshot>) -> Self {
        match snapshot {
            Some(s) => {
                self.best_model_test_acc = test_acc;
                self.best_model_epoch = epoch;
                self.model_state_dict = s.model;
                self.optimizer_state_dict = s.optimizer;
            }
            None => tracing::warn!(
                test_acc,
                epoch,
                "Accuracy improved but no state was captured; best model unchanged"
            ),
        }
        self
    }

    pub fn record(&self) -> CheckpointRecord {
        CheckpointRecord {
            format_version: FORMAT_VERSION,
            history: self.history.clone(),
            best_model_test_acc: self.best_model_test_acc,
            best_model_epoch: self.best_model_epoch,
            epochs_completed: self.epochs_completed,
            finished: self.finished,
        }
    }
}

/// Scalar part of a checkpoint, stored as JSON metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub format_version: u32,
    #[serde(flatten)]
    pub history: History,
    pub best_model_test_acc: f64,
    pub best_model_epoch: i64,
    pub epochs_completed: usize,
    pub finished: bool,
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Reads and writes one checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write `initial` unless a checkpoint already exists. Returns whether a
    /// file was written.
    pub fn init(&self, initial: &Checkpoint) -> anyhow::Result<bool> {
        if self.exists() {
            tracing::info!(path = %self.path.display(), "Found existing checkpoint");
            return Ok(false);
        }
        self.save(initial)?;
        tracing::info!(path = %self.path.display(), "Initialised checkpoint");
        Ok(true)
    }

    pub fn load(&self, device: &Device) -> Result<Checkpoint, HarnessError> {
        let bytes = fs::read(&self.path).map_err(|e| {
            HarnessError::resource(format!(
                "cannot read checkpoint {}: {e}",
                self.path.display()
            ))
        })?;
        decode(&bytes, device).map_err(|e| {
            HarnessError::resource(format!(
                "checkpoint {} is unreadable: {e}",
                self.path.display()
            ))
        })
    }

    /// Replace the checkpoint atomically: write a sibling temp file, sync it,
    /// rename it over the target.
    pub fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = encode(checkpoint)?;
        let tmp = self.path.with_extension("safetensors.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move checkpoint into {}", self.path.display()))?;
        tracing::debug!(
            path = %self.path.display(),
            epochs_completed = checkpoint.epochs_completed,
            "Saved checkpoint"
        );
        Ok(())
    }
}

fn encode(checkpoint: &Checkpoint) -> anyhow::Result<Vec<u8>> {
    let mut tensors: Vec<(String, Tensor)> = Vec::new();
    for (prefix, state) in [
        (BEST_MODEL, &checkpoint.model_state_dict),
        (BEST_OPTIMIZER, &checkpoint.optimizer_state_dict),
        (LAST_MODEL, &checkpoint.last_model_state_dict),
        (LAST_OPTIMIZER, &checkpoint.last_optimizer_state_dict),
    ] {
        for (name, t) in state {
            tensors.push((format!("{prefix}{name}"), t.clone()));
        }
    }
    let record = serde_json::to_string(&checkpoint.record())?;
    let metadata = HashMap::from([(RECORD_KEY.to_string(), record)]);
    let bytes = safetensors::serialize(tensors, &Some(metadata))?;
    Ok(bytes)
}

fn decode(bytes: &[u8], device: &Device) -> anyhow::Result<Checkpoint> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let record_json = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(RECORD_KEY))
        .ok_or_else(|| anyhow::anyhow!("missing '{RECORD_KEY}' metadata"))?;
    let record: CheckpointRecord = serde_json::from_str(record_json)?;
    if record.format_version != FORMAT_VERSION {
        anyhow::bail!(
            "unsupported checkpoint format version {} (expected {FORMAT_VERSION})",
            record.format_version
        );
    }

    let mut best_model = StateDict::new();
    let mut best_optimizer = StateDict::new();
    let mut last_model = StateDict::new();
    let mut last_optimizer = StateDict::new();
    for (name, t) in candle_core::safetensors::load_buffer(bytes, device)? {
        let slot = [
            (BEST_MODEL, &mut best_model),
            (BEST_OPTIMIZER, &mut best_optimizer),
            (LAST_MODEL, &mut last_model),
            (LAST_OPTIMIZER, &mut last_optimizer),
        ]
        .into_iter()
        .find_map(|(prefix, dict)| name.strip_prefix(prefix).map(|rest| (rest.to_string(), dict)));
        match slot {
            Some((key, dict)) => {
                dict.insert(key, t);
            }
            None => tracing::warn!(tensor = %name, "Ignoring unknown checkpoint tensor"),
        }
    }

    Ok(Checkpoint {
        history: record.history,
        best_model_test_acc: record.best_model_test_acc,
        best_model_epoch: record.best_model_epoch,
        model_state_dict: best_model,
        optimizer_state_dict: best_optimizer,
        epochs_completed: record.epochs_completed,
        finished: record.finished,
        last_model_state_dict: last_model,
        last_optimizer_state_dict: last_optimizer,
    })
}

/// Model weights from `path`: either a plain weight file or a checkpoint, in
/// which case its best-model state is used.
pub fn read_model_weights(path: &Path, device: &Device) -> Result<StateDict, HarnessError> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        HarnessError::resource(format!("cannot read weights {}: {e}", path.display()))
    })?;
    let is_checkpoint = tensors.keys().any(|k| k.starts_with(BEST_MODEL));
    let weights: StateDict = if is_checkpoint {
        tensors
            .into_iter()
            .filter_map(|(k, t)| k.strip_prefix(BEST_MODEL).map(|rest| (rest.to_string(), t)))
            .collect()
    } else {
        tensors.into_iter().collect()
    };
    if weights.is_empty() {
        return Err(HarnessError::resource(format!(
            "{} holds no model weights",
            path.display()
        )));
    }
    Ok(weights)
}

/// Write a plain weight file.
pub fn save_model_weights(weights: &StateDict, path: &Path) -> anyhow::Result<()> {
    let map: HashMap<String, Tensor> = weights.iter().map(|(k, t)| (k.clone(), t.clone())).collect();
    candle_core::safetensors::save(&map, path)
        .with_context(|| format!("Failed to save weights to {}", path.display()))?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
