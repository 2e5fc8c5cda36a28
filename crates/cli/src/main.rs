use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lintail_common::{ExperimentConfig, WorkflowMode};
use lintail_train::{run_workflow, RunRequest};

#[derive(Parser, Debug)]
#[command(
    name = "lintail",
    about = "Pretrain a classifier, or fine-tune only its last N layers on user data"
)]
struct Args {
    /// `pretrain` or `train-user-data`.
    #[arg(long)]
    mode: WorkflowMode,
    #[arg(long)]
    dataset_id: String,
    /// `mlp3`, `mlp5`, `mlp10`, or a JSON file with `hidden_dims`.
    #[arg(long)]
    arch_id: String,
    /// Number of trailing layers to train (train-user-data only).
    #[arg(long)]
    number_of_linearized_components: Option<usize>,
    #[arg(long, default_value = "0")]
    device_id: usize,
    /// Fraction of the training set used as core (pretraining) data.
    #[arg(long)]
    split_rate: Option<f64>,
    /// Pretrained weights or a pretrain checkpoint (train-user-data only).
    #[arg(long)]
    pretrained_model_path: Option<PathBuf>,
    /// Fine-tune a freshly initialised backbone instead of pretrained weights.
    #[arg(long)]
    use_default: bool,
    /// Experiment config JSON; written with defaults if missing.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "runs")]
    runs_dir: PathBuf,
    #[arg(long)]
    no_shuffle: bool,
    /// Train the tail on cached extractor activations.
    #[arg(long)]
    activation_variant: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lintail=info")),
        )
        .init();

    let args = Args::parse();

    let mut request = RunRequest {
        mode: args.mode,
        dataset_id: args.dataset_id,
        arch_id: args.arch_id,
        n_components: args.number_of_linearized_components,
        split_rate: args.split_rate,
        pretrained_model_path: args.pretrained_model_path,
        use_default: args.use_default,
        data_dir: args.data_dir,
        runs_dir: args.runs_dir,
        shuffle: !args.no_shuffle,
    };
    // Fail on bad flags before touching the device or the filesystem.
    request.validate()?;

    let mut config = match &args.config {
        Some(path) if path.exists() => ExperimentConfig::load(path)?,
        Some(path) => {
            let default = ExperimentConfig::default();
            default.save(path)?;
            tracing::info!(path = %path.display(), "Created default experiment config");
            default
        }
        None => ExperimentConfig::default(),
    };
    if args.activation_variant {
        config.finetune.activation_variant = true;
    }

    request.shuffle &= config.data.shuffle;

    let device = Device::cuda_if_available(args.device_id)?;
    let summary = run_workflow(&request, &config, &device)?;

    tracing::info!(
        epochs_run = summary.epochs_run,
        resumed_from = summary.resumed_from,
        best_model_test_acc = summary.best_model_test_acc,
        best_model_epoch = summary.best_model_epoch,
        "Done"
    );
    Ok(())
}
