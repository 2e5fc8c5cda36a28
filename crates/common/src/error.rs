//! Error taxonomy shared by every crate in the workspace.
//!
//! * **Configuration** errors are raised before any training side effect.
//! * **Resource** errors (missing or corrupt files) are fatal and surfaced as-is.
//! * Numerical errors from Candle propagate unchanged.

/// Typed harness error. The training layer wraps it in `anyhow::Error`; callers
/// that need the category use `downcast_ref::<HarnessError>()`.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl HarnessError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Resource(_))
    }
}
