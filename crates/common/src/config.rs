//! Model and experiment configuration.
//!
//! Serialised as JSON. Every experiment field has a default matching the
//! reference workflow, so a minimal `{}` config file reproduces it exactly.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

// ── Model ───────────────────────────────────────────────────────────────────

/// Layer widths of the classifier: `input_dim -> hidden_dims... -> num_classes`.
///
/// Every entry produces one dense layer, so `num_layers() == hidden_dims.len() + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub num_classes: usize,
}

/// Architecture file contents: only the hidden widths, since input width and
/// class count come from the dataset.
#[derive(Debug, Deserialize)]
struct ArchFile {
    hidden_dims: Vec<usize>,
}

/// Built-in architecture presets, keyed by arch id.
pub fn arch_hidden_dims(arch_id: &str) -> Option<Vec<usize>> {
    match arch_id {
        "mlp3" => Some(vec![256, 128]),
        "mlp5" => Some(vec![512, 256, 128, 64]),
        "mlp10" => Some(vec![512, 512, 256, 256, 128, 128, 64, 64, 32]),
        _ => None,
    }
}

impl ModelConfig {
    pub fn new(input_dim: usize, hidden_dims: Vec<usize>, num_classes: usize) -> Self {
        Self {
            input_dim,
            hidden_dims,
            num_classes,
        }
    }

    /// Resolve an arch id to a config. The id is either a preset name or the
    /// path of a JSON file with a `hidden_dims` array.
    pub fn for_arch(
        arch_id: &str,
        input_dim: usize,
        num_classes: usize,
    ) -> Result<Self, HarnessError> {
        if input_dim == 0 || num_classes == 0 {
            return Err(HarnessError::config(format!(
                "arch {arch_id}: input_dim ({input_dim}) and num_classes ({num_classes}) must be non-zero"
            )));
        }
        if let Some(hidden_dims) = arch_hidden_dims(arch_id) {
            return Ok(Self::new(input_dim, hidden_dims, num_classes));
        }
        let path = Path::new(arch_id);
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            let json = std::fs::read_to_string(path).map_err(|e| {
                HarnessError::resource(format!("read arch file {}: {e}", path.display()))
            })?;
            let arch: ArchFile = serde_json::from_str(&json).map_err(|e| {
                HarnessError::config(format!("parse arch file {}: {e}", path.display()))
            })?;
            return Ok(Self::new(input_dim, arch.hidden_dims, num_classes));
        }
        Err(HarnessError::config(format!(
            "unknown arch id '{arch_id}' (expected mlp3, mlp5, mlp10 or a .json file)"
        )))
    }

    /// Number of dense layers.
    pub fn num_layers(&self) -> usize {
        self.hidden_dims.len() + 1
    }

    /// `(in, out)` widths for every layer, in order.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut widths = Vec::with_capacity(self.hidden_dims.len() + 2);
        widths.push(self.input_dim);
        widths.extend_from_slice(&self.hidden_dims);
        widths.push(self.num_classes);
        widths.windows(2).map(|w| (w[0], w[1])).collect()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ── Workflow selection ──────────────────────────────────────────────────────

/// The two supported workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowMode {
    Pretrain,
    TrainUserData,
}

impl WorkflowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pretrain => "pretrain",
            Self::TrainUserData => "train-user-data",
        }
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretrain" => Ok(Self::Pretrain),
            "train-user-data" => Ok(Self::TrainUserData),
            other => Err(HarnessError::config(format!(
                "unsupported mode '{other}' (expected 'pretrain' or 'train-user-data')"
            ))),
        }
    }
}

/// What the post-loop evaluation is allowed to write into the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalEvalPolicy {
    /// Log the final accuracies; leave the checkpoint record untouched.
    MeasureOnly,
    /// Append the final accuracies to the running histories only.
    #[default]
    RecordHistory,
    /// Append to the histories and apply the strict best-model gate.
    RecordAndTrackBest,
}

// ── Experiment ──────────────────────────────────────────────────────────────

/// Pretrain workflow knobs (Adam over the whole model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainConfig {
    pub epochs: usize,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Fine-tune workflow knobs (SGD with momentum over the tail only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneConfig {
    pub epochs: usize,
    pub lr: f64,
    pub momentum: f64,
    /// Epoch indices at which the learning rate is multiplied by `gamma`.
    pub milestones: Vec<usize>,
    pub gamma: f64,
    /// Training labels are multiplied by this before the loss.
    pub label_scale: f64,
    pub mse_weight: f64,
    pub l2_weight: f64,
    /// Precompute extractor outputs once and train the tail on them.
    pub activation_variant: bool,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            lr: 0.05,
            momentum: 0.9,
            milestones: vec![24, 39],
            gamma: 0.1,
            label_scale: 5.0,
            mse_weight: 1.0,
            l2_weight: 1e-5,
            activation_variant: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub batch_size: usize,
    /// Seed of the core/user partition. Fixed so partitions are reproducible.
    pub split_seed: u64,
    pub shuffle: bool,
    /// Base seed of the per-epoch shuffle order.
    pub shuffle_seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            split_seed: 13,
            shuffle: true,
            shuffle_seed: 0,
        }
    }
}

/// Progress line cadence, in batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub test_every: usize,
    pub train_every: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            test_every: 25,
            train_every: 100,
        }
    }
}

/// Full experiment configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub pretrain: PretrainConfig,
    #[serde(default)]
    pub finetune: FineTuneConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub final_eval: FinalEvalPolicy,
}

impl ExperimentConfig {
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.pretrain.epochs == 0 || self.finetune.epochs == 0 {
            return Err(HarnessError::config("epoch budgets must be non-zero"));
        }
        if self.data.batch_size == 0 {
            return Err(HarnessError::config("batch_size must be non-zero"));
        }
        if !(self.pretrain.lr > 0.0 && self.finetune.lr > 0.0) {
            return Err(HarnessError::config("learning rates must be positive"));
        }
        if !(0.0..1.0).contains(&self.finetune.momentum) {
            return Err(HarnessError::config(format!(
                "momentum must be in [0, 1), got {}",
                self.finetune.momentum
            )));
        }
        if self.finetune.milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(HarnessError::config(format!(
                "milestones must be strictly increasing, got {:?}",
                self.finetune.milestones
            )));
        }
        if self.report.test_every == 0 || self.report.train_every == 0 {
            return Err(HarnessError::config("report cadences must be non-zero"));
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_reference_workflow() {
        let config: ExperimentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pretrain.epochs, 20);
        assert_eq!(config.finetune.epochs, 50);
        assert_eq!(config.finetune.milestones, vec![24, 39]);
        assert_eq!(config.finetune.label_scale, 5.0);
        assert_eq!(config.finetune.l2_weight, 1e-5);
        assert_eq!(config.data.batch_size, 64);
        assert_eq!(config.data.split_seed, 13);
        assert_eq!(config.final_eval, FinalEvalPolicy::RecordHistory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let json = r#"{ "finetune": { "epochs": 3 }, "final_eval": "record-and-track-best" }"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.finetune.epochs, 3);
        assert_eq!(config.finetune.momentum, 0.9);
        assert_eq!(config.final_eval, FinalEvalPolicy::RecordAndTrackBest);
    }

    #[test]
    fn validate_rejects_unsorted_milestones() {
        let mut config = ExperimentConfig::default();
        config.finetune.milestones = vec![39, 24];
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("pretrain".parse::<WorkflowMode>().unwrap(), WorkflowMode::Pretrain);
        assert_eq!(
            "train-user-data".parse::<WorkflowMode>().unwrap(),
            WorkflowMode::TrainUserData
        );
        let err = "finetune".parse::<WorkflowMode>().unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(WorkflowMode::TrainUserData.to_string(), "train-user-data");
    }

    #[test]
    fn arch_presets() {
        let c = ModelConfig::for_arch("mlp10", 784, 10).unwrap();
        assert_eq!(c.num_layers(), 10);
        let dims = c.layer_dims();
        assert_eq!(dims.first(), Some(&(784, 512)));
        assert_eq!(dims.last(), Some(&(32, 10)));

        let err = ModelConfig::for_arch("resnet18", 784, 10).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn arch_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.json");
        std::fs::write(&path, r#"{ "hidden_dims": [8, 4] }"#).unwrap();
        let c = ModelConfig::for_arch(path.to_str().unwrap(), 6, 3).unwrap();
        assert_eq!(c.layer_dims(), vec![(6, 8), (8, 4), (4, 3)]);
    }
}
