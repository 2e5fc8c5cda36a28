//! Workflow selection: validate a run request, assemble data and model for
//! the chosen mode and hand the workflow to the epoch driver.
//!
//! Everything that can be checked without touching the filesystem is
//! checked before any file is read or written.

use std::path::{Path, PathBuf};

use candle_core::Device;

use lintail_common::{
    core_user_loaders, load_core_user, user_loaders, ExperimentConfig, HarnessError, ModelConfig,
    WorkflowMode,
};
use lintail_core::Classifier;

use crate::checkpoint::{read_model_weights, save_model_weights, CheckpointStore};
use crate::driver::{self, RunSummary};
use crate::experiment::ExperimentPath;
use crate::finetune::FineTuneWorkflow;
use crate::pretrain::{build_classifier, load_varmap_state, PretrainWorkflow};

/// Everything a caller chooses per run (as opposed to [`ExperimentConfig`]).
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: WorkflowMode,
    pub dataset_id: String,
    pub arch_id: String,
    pub n_components: Option<usize>,
    pub split_rate: Option<f64>,
    pub pretrained_model_path: Option<PathBuf>,
    /// Fine-tune a freshly initialised backbone when no pretrained weights
    /// are given.
    pub use_default: bool,
    pub data_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub shuffle: bool,
}

impl RunRequest {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.dataset_id.is_empty() || self.arch_id.is_empty() {
            return Err(HarnessError::config("dataset and architecture ids are required"));
        }
        if let Some(rate) = self.split_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(HarnessError::config(format!(
                    "split rate must be in [0, 1], got {rate}"
                )));
            }
        }
        match self.mode {
            WorkflowMode::Pretrain => {
                if self.split_rate.is_none() {
                    return Err(HarnessError::config("pretrain requires a split rate"));
                }
                if self.n_components.is_some() {
                    tracing::warn!("number of linearized components is ignored when pretraining");
                }
                if self.pretrained_model_path.is_some() {
                    tracing::warn!("pretrained model path is ignored when pretraining");
                }
            }
            WorkflowMode::TrainUserData => {
                match self.n_components {
                    None => {
                        return Err(HarnessError::config(
                            "train-user-data requires the number of linearized components",
                        ))
                    }
                    Some(0) => {
                        return Err(HarnessError::config(
                            "number of linearized components must be at least 1",
                        ))
                    }
                    Some(_) => {}
                }
                match (&self.pretrained_model_path, self.use_default) {
                    (Some(_), _) if self.split_rate.is_none() => {
                        return Err(HarnessError::config(
                            "a pretrained model path needs the split rate it was pretrained with",
                        ))
                    }
                    (Some(_), true) => {
                        tracing::warn!("both a pretrained model path and use-default were given; using the path")
                    }
                    (None, false) => {
                        return Err(HarnessError::config(
                            "train-user-data needs a pretrained model path or use-default",
                        ))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Validate `request` and `config`, then run the selected workflow.
pub fn run_workflow(
    request: &RunRequest,
    config: &ExperimentConfig,
    device: &Device,
) -> anyhow::Result<RunSummary> {
    request.validate()?;
    config.validate()?;
    tracing::info!(
        mode = %request.mode,
        dataset = %request.dataset_id,
        arch = %request.arch_id,
        ?device,
        "Starting workflow"
    );
    match request.mode {
        WorkflowMode::Pretrain => run_pretrain(request, config, device),
        WorkflowMode::TrainUserData => run_train_user_data(request, config, device),
    }
}

fn run_pretrain(
    request: &RunRequest,
    config: &ExperimentConfig,
    device: &Device,
) -> anyhow::Result<RunSummary> {
    let split_rate = request
        .split_rate
        .ok_or_else(|| HarnessError::config("pretrain requires a split rate"))?;
    let split = load_core_user(
        &request.data_dir,
        &request.dataset_id,
        split_rate,
        config.data.split_seed,
        device,
    )?;
    let model_config = ModelConfig::for_arch(
        &request.arch_id,
        split.core.input_dim(),
        split.core.num_classes(),
    )?;

    let exp = ExperimentPath::pretrain(&request.runs_dir, &request.arch_id, &request.dataset_id, split_rate);
    exp.create()?;
    let store = CheckpointStore::new(exp.checkpoint_file());
    record_run_config(&exp, &store, config, &model_config)?;

    let loaders = core_user_loaders(split, &config.data, request.shuffle);
    let (model, varmap) = build_classifier(&model_config, device)?;
    let mut workflow =
        PretrainWorkflow::new(model, varmap, config, loaders.core, loaders.user_test)?;
    let summary = driver::run(&mut workflow, &store, config.final_eval, device)?;

    let checkpoint = store.load(device)?;
    if checkpoint.model_state_dict.is_empty() {
        tracing::warn!("No best model recorded; skipping model export");
    } else {
        save_model_weights(&checkpoint.model_state_dict, &exp.model_file())?;
        tracing::info!(path = %exp.model_file().display(), "Exported best pretrained model");
    }
    Ok(summary)
}

fn run_train_user_data(
    request: &RunRequest,
    config: &ExperimentConfig,
    device: &Device,
) -> anyhow::Result<RunSummary> {
    let n_components = request.n_components.ok_or_else(|| {
        HarnessError::config("train-user-data requires the number of linearized components")
    })?;

    // A pretrained model was trained on a core split, so fine-tune on the
    // user side of that same split; otherwise use the standalone user files.
    let (user_train, user_test) = match (&request.pretrained_model_path, request.split_rate) {
        (Some(_), Some(rate)) => {
            let split = load_core_user(
                &request.data_dir,
                &request.dataset_id,
                rate,
                config.data.split_seed,
                device,
            )?;
            let loaders = core_user_loaders(split, &config.data, request.shuffle);
            (loaders.user_train, loaders.user_test)
        }
        _ => user_loaders(
            &request.data_dir,
            &request.dataset_id,
            &config.data,
            request.shuffle,
            device,
        )?,
    };
    let model_config = ModelConfig::for_arch(
        &request.arch_id,
        user_train.dataset().input_dim(),
        user_train.dataset().num_classes(),
    )?;
    let pretrained = load_pretrained(&model_config, request.pretrained_model_path.as_deref(), device)?;

    let exp = ExperimentPath::train_user_data(
        &request.runs_dir,
        &request.arch_id,
        &request.dataset_id,
        n_components,
    );
    exp.create()?;
    let store = CheckpointStore::new(exp.checkpoint_file());
    record_run_config(&exp, &store, config, &model_config)?;

    let mut workflow =
        FineTuneWorkflow::new(&pretrained, n_components, config, user_train, user_test)?;
    driver::run(&mut workflow, &store, config.final_eval, device)
}

/// Write `config.json` and `model_config.json` for a fresh experiment. An
/// existing checkpoint keeps the configuration it was started with; a
/// differing one only gets a warning.
fn record_run_config(
    exp: &ExperimentPath,
    store: &CheckpointStore,
    config: &ExperimentConfig,
    model_config: &ModelConfig,
) -> anyhow::Result<()> {
    if !store.exists() {
        config.save(&exp.config_file())?;
        model_config.save(&exp.model_config_file())?;
        return Ok(());
    }
    match ExperimentConfig::load(&exp.config_file()) {
        Ok(recorded) if recorded == *config => {}
        Ok(_) => tracing::warn!(
            path = %exp.config_file().display(),
            "Resuming with a configuration that differs from the recorded one"
        ),
        Err(e) => tracing::warn!(
            path = %exp.config_file().display(),
            error = %e,
            "Recorded configuration is unreadable"
        ),
    }
    Ok(())
}

/// Build the backbone for fine-tuning: weights from `path` (a weight file or
/// a pretrain checkpoint), or the default initialisation.
pub fn load_pretrained(
    config: &ModelConfig,
    path: Option<&Path>,
    device: &Device,
) -> anyhow::Result<Classifier> {
    let (model, varmap) = build_classifier(config, device)?;
    match path {
        Some(path) => {
            let weights = read_model_weights(path, device)?;
            load_varmap_state(&varmap, &weights)?;
            tracing::info!(path = %path.display(), "Loaded pretrained weights");
        }
        None => tracing::info!("Using default-initialised backbone"),
    }
    Ok(model)
}

// ── Tests ───────────────────────────────────────────────────────────────────
