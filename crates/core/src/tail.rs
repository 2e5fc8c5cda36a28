//! Mixed linear tail and the two ways of evaluating it.
//!
//! * [`TailEvaluator::FullForward`]: raw input → frozen extractor → tail.
//! * [`TailEvaluator::CachedActivation`]: the input already is extractor
//!   output (see [`cache_activations`]), so only the tail runs. The frozen
//!   prefix is then paid once per sample instead of once per step.
//!
//! Both give the same scores for the same underlying sample.

use candle_core::{Result, Tensor};

use lintail_common::Dataset;

use crate::model::{forward_layers, Layer};
use crate::split::{FeatureExtractor, TailParams};

/// Samples per extractor call when caching activations.
const CACHE_CHUNK: usize = 512;

// ── MixedLinear ─────────────────────────────────────────────────────────────

/// The trainable last-N-layer block. Owns the only handles through which the
/// tail parameters are updated.
#[derive(Debug, Clone)]
pub struct MixedLinear {
    layers: Vec<Layer>,
    params: TailParams,
}

impl MixedLinear {
    pub(crate) fn new(layers: Vec<Layer>, params: TailParams) -> Self {
        Self { layers, params }
    }

    /// Class scores from extractor features.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        forward_layers(&self.layers, features)
    }

    pub fn params(&self) -> &TailParams {
        &self.params
    }

    /// Parameter tensors, as read by parameter loss terms.
    pub fn parameters(&self) -> Vec<Tensor> {
        self.params.tensors()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

// ── TailEvaluator ───────────────────────────────────────────────────────────

/// How batches reach the tail. Chosen once when a workflow is set up.
#[derive(Debug, Clone)]
pub enum TailEvaluator {
    FullForward(FeatureExtractor),
    CachedActivation,
}

impl TailEvaluator {
    pub fn forward(&self, tail: &MixedLinear, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::FullForward(extractor) => tail.forward(&extractor.forward(input)?),
            Self::CachedActivation => tail.forward(input),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::CachedActivation)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FullForward(_) => "full-forward",
            Self::CachedActivation => "cached-activation",
        }
    }
}

/// `forward(feature_extractor_or_none, tail, input)`: with an extractor the
/// input is raw, without one it is precomputed features.
pub fn mixed_linear_forward(
    extractor: Option<&FeatureExtractor>,
    tail: &MixedLinear,
    input: &Tensor,
) -> Result<Tensor> {
    match extractor {
        Some(e) => tail.forward(&e.forward(input)?),
        None => tail.forward(input),
    }
}

// ── Activation cache ────────────────────────────────────────────────────────

/// Run every sample of `inputs` (`[N, D]`) through the extractor once.
pub fn cache_activations(extractor: &FeatureExtractor, inputs: &Tensor) -> Result<Tensor> {
    let n = inputs.dim(0)?;
    if n == 0 {
        return extractor.forward(inputs);
    }
    let mut chunks = Vec::with_capacity(n.div_ceil(CACHE_CHUNK));
    let mut start = 0;
    while start < n {
        let len = CACHE_CHUNK.min(n - start);
        chunks.push(extractor.forward(&inputs.narrow(0, start, len)?)?);
        start += len;
    }
    Tensor::cat(&chunks, 0)
}

/// Dataset whose inputs are replaced by extractor activations.
pub fn cache_dataset(extractor: &FeatureExtractor, dataset: &Dataset) -> Result<Dataset> {
    let features = cache_activations(extractor, dataset.inputs())?;
    tracing::debug!(
        samples = dataset.len(),
        feature_dim = features.dims().get(1).copied().unwrap_or(0),
        "Cached extractor activations"
    );
    dataset.with_inputs(features)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classifier;
    use crate::split::split;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use lintail_common::{Labels, ModelConfig};

    fn model() -> (Classifier, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Classifier::new(vb, &ModelConfig::new(8, vec![16, 12, 10], 4)).unwrap();
        (model, varmap)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn full_and_cached_modes_agree() {
        let (model, _varmap) = model();
        let (extractor, tail, _params) = split(&model, 2).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1030, 8), &Device::Cpu).unwrap();

        let full = TailEvaluator::FullForward(extractor.clone())
            .forward(&tail, &x)
            .unwrap();
        let features = cache_activations(&extractor, &x).unwrap();
        assert_eq!(features.dims(), &[1030, 12]);
        let cached = TailEvaluator::CachedActivation
            .forward(&tail, &features)
            .unwrap();

        assert!(max_abs_diff(&full, &cached) < 1e-5);
    }

    #[test]
    fn full_mode_matches_unsplit_model() {
        let (model, _varmap) = model();
        let (extractor, tail, _params) = split(&model, 3).unwrap();
        let x = Tensor::randn(0f32, 1.0, (7, 8), &Device::Cpu).unwrap();
        let reference = model.forward(&x).unwrap();
        let scores = mixed_linear_forward(Some(&extractor), &tail, &x).unwrap();
        assert!(max_abs_diff(&reference, &scores) < 1e-5);
    }

    #[test]
    fn cache_dataset_keeps_labels() {
        let (model, _varmap) = model();
        let (extractor, _tail, _params) = split(&model, 1).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 8), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 3, 1], &Device::Cpu).unwrap();
        let ds = Dataset::new(x, Labels::Indices(labels), 4).unwrap();

        let cached = cache_dataset(&extractor, &ds).unwrap();
        assert_eq!(cached.input_dim(), 10);
        assert_eq!(
            cached.labels().tensor().to_vec1::<u32>().unwrap(),
            vec![0, 3, 1]
        );
    }
}
