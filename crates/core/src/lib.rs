//! # lintail-core: Model, Split, Tail, Loss
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | `Classifier`, `Layer` (dense + ReLU stack) |
//! | [`split`] | `split`, `FeatureExtractor` (frozen), `TailParams` (trainable copies) |
//! | [`tail`] | `MixedLinear`, `TailEvaluator`, activation caching |
//! | [`loss`] | `LossTerm`, `Mse`, `CrossEntropy`, `L2Regularization`, `LossAggregator` |
//!
//! Everything goes through `candle-core`/`candle-nn`, so the same code runs
//! on CPU and CUDA.

pub mod loss;
pub mod model;
pub mod split;
pub mod tail;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use loss::{
    CrossEntropy, L2Regularization, LossAggregator, LossTerm, Mse, ParameterLoss,
    PredictionLoss,
};
pub use model::{param_name, Classifier, Layer};
pub use split::{split, FeatureExtractor, TailParams};
pub use tail::{cache_activations, cache_dataset, mixed_linear_forward, MixedLinear, TailEvaluator};
