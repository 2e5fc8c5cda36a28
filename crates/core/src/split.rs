//! Model splitter: frozen feature extractor + trainable tail.
//!
//! The last `n_components` layers are copied into fresh variables
//! ([`TailParams`]); everything before them becomes a [`FeatureExtractor`]
//! whose parameters are detached, so no gradient is ever computed for them.
//! The pretrained model itself is left untouched.

use std::collections::BTreeMap;

use candle_core::{Result, Tensor, Var};

use lintail_common::HarnessError;

use crate::model::{forward_layers, Classifier, Layer};
use crate::tail::MixedLinear;

// ── FeatureExtractor ────────────────────────────────────────────────────────

/// Frozen prefix of a pretrained model.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    layers: Vec<Layer>,
}

impl FeatureExtractor {
    /// Features for `x`. With zero layers this is the identity.
    /// The output is detached: the tail's gradients stop here.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(forward_layers(&self.layers, x)?.detach())
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

// ── TailParams ──────────────────────────────────────────────────────────────

/// Trainable parameters of the tail, keyed by their original model names.
///
/// Cloning shares the underlying variables.
#[derive(Debug, Clone, Default)]
pub struct TailParams {
    vars: BTreeMap<String, Var>,
}

impl TailParams {
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.vars.get(name)
    }

    /// `(name, var)` pairs in name order, for optimisers.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.vars
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect()
    }

    /// Current values as graph-tracked tensors (for parameter loss terms).
    pub fn tensors(&self) -> Vec<Tensor> {
        self.vars.values().map(|v| v.as_tensor().clone()).collect()
    }

    /// Deep copy of the current values.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Tensor>> {
        self.vars
            .iter()
            .map(|(n, v)| Ok((n.clone(), v.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite every parameter from `state`. All names must be present.
    pub fn load(&self, state: &BTreeMap<String, Tensor>) -> std::result::Result<(), HarnessError> {
        for (name, var) in &self.vars {
            let value = state.get(name).ok_or_else(|| {
                HarnessError::resource(format!("state has no tail parameter '{name}'"))
            })?;
            var.set(&value.to_device(var.device())?)?;
        }
        Ok(())
    }

    fn insert(&mut self, name: String, value: &Tensor) -> Result<Var> {
        // `copy` first: `Var::from_tensor` reuses the storage of a tensor that
        // already is a variable.
        let var = Var::from_tensor(&value.copy()?)?;
        self.vars.insert(name, var.clone());
        Ok(var)
    }
}

// ── split ───────────────────────────────────────────────────────────────────

/// Partition `model` into a frozen extractor and a trainable tail of the last
/// `n_components` layers.
///
/// Returns `(extractor, tail_module, tail_params)`; `tail_params` shares its
/// variables with `tail_module`.
pub fn split(
    model: &Classifier,
    n_components: usize,
) -> std::result::Result<(FeatureExtractor, MixedLinear, TailParams), HarnessError> {
    let total = model.num_layers();
    if n_components == 0 || n_components > total {
        return Err(HarnessError::config(format!(
            "number of linearized components must be in 1..={total}, got {n_components}"
        )));
    }
    let boundary = total - n_components;
    let (prefix, suffix) = model.layers().split_at(boundary);

    let extractor = FeatureExtractor {
        layers: prefix.iter().map(Layer::frozen).collect(),
    };

    let mut params = TailParams::default();
    let mut tail_layers = Vec::with_capacity(suffix.len());
    for layer in suffix {
        let w = params.insert(layer.weight_name(), layer.weight())?;
        let b = match layer.bias() {
            Some(b) => Some(params.insert(layer.bias_name(), b)?),
            None => None,
        };
        tail_layers.push(Layer::from_parts(
            layer.index(),
            w.as_tensor().clone(),
            b.map(|b| b.as_tensor().clone()),
            layer.has_relu(),
        ));
    }

    tracing::info!(
        frozen_layers = extractor.num_layers(),
        tail_layers = tail_layers.len(),
        tail_params = params.len(),
        "Split model"
    );
    let tail = MixedLinear::new(tail_layers, params.clone());
    Ok((extractor, tail, params))
}

// ── Tests ───────────────────────────────────────────────────────────────────
