//! # lintail-train: Optimisers, Checkpoints, Workflows
//!
//! * **[`driver::run`]**: the resumable epoch loop (evaluate, snapshot the
//!   best pre-update state, train, checkpoint).
//! * **[`PretrainWorkflow`]**: whole model, Adam + cross-entropy.
//! * **[`FineTuneWorkflow`]**: last N layers, SGD + momentum, multi-step
//!   schedule, scaled-label MSE + L2.
//! * **[`CheckpointStore`]**: one safetensors file per experiment, written
//!   atomically.
//! * **[`run_workflow`]**: validates a [`RunRequest`] and dispatches on
//!   its mode.

pub mod checkpoint;
pub mod driver;
pub mod experiment;
pub mod finetune;
pub mod metrics;
pub mod optim;
pub mod pretrain;
pub mod scheduler;
pub mod workflow;

pub use checkpoint::{
    read_model_weights, save_model_weights, Checkpoint, CheckpointRecord, CheckpointStore,
    EpochResult, FinalEvaluation, History, Snapshot, StateDict,
};
pub use driver::{EpochWorkflow, RunSummary};
pub use experiment::ExperimentPath;
pub use finetune::FineTuneWorkflow;
pub use metrics::{count_correct, evaluate_accuracy, scale_labels, should_report, LabelKind};
pub use optim::{Adam, Optimizer, ParamsAdam, SgdMomentum};
pub use pretrain::{build_classifier, PretrainWorkflow};
pub use scheduler::MultiStepLr;
pub use workflow::{load_pretrained, run_workflow, RunRequest};
