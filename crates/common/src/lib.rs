//! # lintail-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ExperimentConfig`]** / **[`ModelConfig`]**: run and architecture settings (JSON).
//! * **[`WorkflowMode`]** / **[`FinalEvalPolicy`]**: workflow selection.
//! * **[`HarnessError`]**: configuration vs resource error taxonomy.
//! * **[`Dataset`]** / **[`DataLoader`]** / **[`split_core_user`]**: data loading & batching.

pub mod config;
pub mod data;
pub mod error;

pub use config::{
    arch_hidden_dims, DataConfig, ExperimentConfig, FinalEvalPolicy, FineTuneConfig,
    ModelConfig, PretrainConfig, ReportConfig, WorkflowMode,
};
pub use data::{
    core_user_loaders, load_core_user, load_user, one_hot, split_core_user, user_loaders, Batch,
    CoreUserLoaders, CoreUserSplit, DataLoader, Dataset, Labels,
};
pub use error::HarnessError;
