//! On-disk layout of one experiment.
//!
//! ```text
//! <runs_dir>/<mode>/<arch>/<dataset>/<tag>/
//!     checkpoint.safetensors
//!     config.json          experiment config used for the run
//!     model_config.json    architecture, so weights can be rebuilt
//!     model.safetensors    best pretrained weights (pretrain only)
//! ```
//!
//! `tag` is `split{rate}` for pretraining and `last{n}` for fine-tuning.

use std::path::{Path, PathBuf};

use lintail_common::WorkflowMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentPath {
    dir: PathBuf,
}

impl ExperimentPath {
    pub fn new(runs_dir: &Path, mode: WorkflowMode, arch_id: &str, dataset_id: &str, tag: &str) -> Self {
        Self {
            dir: runs_dir
                .join(mode.as_str())
                .join(path_component(arch_id))
                .join(path_component(dataset_id))
                .join(tag),
        }
    }

    pub fn pretrain(runs_dir: &Path, arch_id: &str, dataset_id: &str, split_rate: f64) -> Self {
        Self::new(
            runs_dir,
            WorkflowMode::Pretrain,
            arch_id,
            dataset_id,
            &format!("split{split_rate}"),
        )
    }

    pub fn train_user_data(runs_dir: &Path, arch_id: &str, dataset_id: &str, n_components: usize) -> Self {
        Self::new(
            runs_dir,
            WorkflowMode::TrainUserData,
            arch_id,
            dataset_id,
            &format!("last{n_components}"),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.dir.join("checkpoint.safetensors")
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn model_config_file(&self) -> PathBuf {
        self.dir.join("model_config.json")
    }

    pub fn model_file(&self) -> PathBuf {
        self.dir.join("model.safetensors")
    }

    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }
}

/// Architecture ids may be paths to JSON files; keep only the stem.
fn path_component(id: &str) -> String {
    let path = Path::new(id);
    let stem = if path.extension().is_some_and(|e| e == "json") {
        path.file_stem().and_then(|s| s.to_str()).unwrap_or(id)
    } else {
        id
    };
    stem.replace(['/', '\\'], "_")
}
