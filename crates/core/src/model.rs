//! Dense classifier: an ordered stack of linear layers.
//!
//! Layer `i` stores `layers.{i}.weight` `[out, in]` and `layers.{i}.bias` `[out]`.
//! Every layer but the last is followed by ReLU.

use candle_core::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

use lintail_common::ModelConfig;

// ── Layer ───────────────────────────────────────────────────────────────────

/// One dense layer with an optional ReLU.
#[derive(Debug, Clone)]
pub struct Layer {
    index: usize,
    linear: Linear,
    relu: bool,
}

impl Layer {
    pub fn new(
        index: usize,
        in_dim: usize,
        out_dim: usize,
        relu: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = linear(in_dim, out_dim, vb.pp(format!("layers.{index}")))?;
        Ok(Self {
            index,
            linear,
            relu,
        })
    }

    /// Build a layer around existing tensors (frozen copies or tail variables).
    pub fn from_parts(index: usize, weight: Tensor, bias: Option<Tensor>, relu: bool) -> Self {
        Self {
            index,
            linear: Linear::new(weight, bias),
            relu,
        }
    }

    /// Position of this layer in the original model (0-based).
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn has_relu(&self) -> bool {
        self.relu
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.linear.bias()
    }

    pub fn weight_name(&self) -> String {
        param_name(self.index, "weight")
    }

    pub fn bias_name(&self) -> String {
        param_name(self.index, "bias")
    }

    /// `(name, tensor)` for every parameter of this layer.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut out = vec![(self.weight_name(), self.weight().clone())];
        if let Some(b) = self.bias() {
            out.push((self.bias_name(), b.clone()));
        }
        out
    }

    /// A copy of this layer whose parameters are cut from the autograd graph.
    pub fn frozen(&self) -> Self {
        Self::from_parts(
            self.index,
            self.weight().detach(),
            self.bias().map(|b| b.detach()),
            self.relu,
        )
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.linear.forward(x)?;
        if self.relu {
            y.relu()
        } else {
            Ok(y)
        }
    }
}

/// Parameter name of `kind` (`"weight"` / `"bias"`) in layer `index`.
pub fn param_name(index: usize, kind: &str) -> String {
    format!("layers.{index}.{kind}")
}

/// Run `x` through `layers` in order.
pub fn forward_layers(layers: &[Layer], x: &Tensor) -> Result<Tensor> {
    let mut x = x.clone();
    for layer in layers {
        x = layer.forward(&x)?;
    }
    Ok(x)
}

// ── Classifier ──────────────────────────────────────────────────────────────

/// Dense classifier producing unnormalised class scores `[B, num_classes]`.
#[derive(Debug, Clone)]
pub struct Classifier {
    layers: Vec<Layer>,
    config: ModelConfig,
}

impl Classifier {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let dims = config.layer_dims();
        let last = dims.len().saturating_sub(1);
        let mut layers = Vec::with_capacity(dims.len());
        for (i, (in_dim, out_dim)) in dims.into_iter().enumerate() {
            layers.push(Layer::new(i, in_dim, out_dim, i != last, vb.clone())?);
        }
        Ok(Self {
            layers,
            config: config.clone(),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        forward_layers(&self.layers, x)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Parameter names in layer order.
    pub fn parameter_names(&self) -> Vec<String> {
        self.layers
            .iter()
            .flat_map(|l| l.named_parameters().into_iter().map(|(n, _)| n))
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn forward_shape_and_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ModelConfig::new(6, vec![8, 4], 3);
        let model = Classifier::new(vb, &config).unwrap();

        assert_eq!(model.num_layers(), 3);
        assert!(model.layers()[0].has_relu());
        assert!(!model.layers()[2].has_relu());
        assert_eq!(
            model.parameter_names(),
            vec![
                "layers.0.weight",
                "layers.0.bias",
                "layers.1.weight",
                "layers.1.bias",
                "layers.2.weight",
                "layers.2.bias",
            ]
        );
        assert_eq!(varmap.all_vars().len(), 6);

        let x = Tensor::ones((5, 6), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&x).unwrap().dims(), &[5, 3]);
    }

    #[test]
    fn frozen_layer_matches_original() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = Layer::new(0, 4, 2, true, vb).unwrap();
        let x = Tensor::new(&[[0.5f32, -1.0, 2.0, 0.25]], &Device::Cpu).unwrap();
        let a = layer.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let b = layer.frozen().forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
