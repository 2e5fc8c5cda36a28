//! Weighted loss aggregation.
//!
//! A loss term either reads `(predictions, labels)` or only the trainable
//! parameters; [`LossTerm`] keeps the two signatures apart so the training
//! loop can pass the same arguments to every term.

use candle_core::{Result, Tensor};
use candle_nn::loss;

use lintail_common::HarnessError;

// ── Term traits ─────────────────────────────────────────────────────────────

/// Loss over model outputs and labels.
pub trait PredictionLoss: Send + Sync {
    fn name(&self) -> &str;
    fn compute(&self, predictions: &Tensor, labels: &Tensor) -> Result<Tensor>;
}

/// Loss over the trainable parameters only (regularisers).
pub trait ParameterLoss: Send + Sync {
    fn name(&self) -> &str;
    fn compute(&self, parameters: &[Tensor]) -> Result<Tensor>;
}

/// One entry of a composite objective.
pub enum LossTerm {
    Prediction(Box<dyn PredictionLoss>),
    Parameter(Box<dyn ParameterLoss>),
}

impl LossTerm {
    pub fn prediction(term: impl PredictionLoss + 'static) -> Self {
        Self::Prediction(Box::new(term))
    }

    pub fn parameter(term: impl ParameterLoss + 'static) -> Self {
        Self::Parameter(Box::new(term))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Prediction(t) => t.name(),
            Self::Parameter(t) => t.name(),
        }
    }

    pub fn evaluate(
        &self,
        predictions: &Tensor,
        labels: &Tensor,
        parameters: &[Tensor],
    ) -> Result<Tensor> {
        match self {
            Self::Prediction(t) => t.compute(predictions, labels),
            Self::Parameter(t) => t.compute(parameters),
        }
    }
}

impl std::fmt::Debug for LossTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prediction(t) => write!(f, "Prediction({})", t.name()),
            Self::Parameter(t) => write!(f, "Parameter({})", t.name()),
        }
    }
}

// ── Built-in terms ──────────────────────────────────────────────────────────

/// Mean squared error against dense (e.g. scaled one-hot) targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mse;

impl PredictionLoss for Mse {
    fn name(&self) -> &str {
        "mse"
    }

    fn compute(&self, predictions: &Tensor, labels: &Tensor) -> Result<Tensor> {
        loss::mse(predictions, labels)
    }
}

/// Softmax cross-entropy against `u32` class indices, averaged over the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl PredictionLoss for CrossEntropy {
    fn name(&self) -> &str {
        "cross-entropy"
    }

    fn compute(&self, predictions: &Tensor, labels: &Tensor) -> Result<Tensor> {
        loss::cross_entropy(predictions, labels)
    }
}

/// Sum of squares of every parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Regularization;

impl ParameterLoss for L2Regularization {
    fn name(&self) -> &str {
        "l2"
    }

    fn compute(&self, parameters: &[Tensor]) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for p in parameters {
            let sq = p.sqr()?.sum_all()?;
            total = Some(match total {
                None => sq,
                Some(prev) => (prev + sq)?,
            });
        }
        match total {
            Some(t) => Ok(t),
            None => candle_core::bail!("l2 regularization needs at least one parameter"),
        }
    }
}

// ── Aggregation ─────────────────────────────────────────────────────────────

/// `sum_i weights[i] * terms[i]`. Fails with a configuration error when the
/// two sequences differ in length or are empty.
pub fn compute(
    predictions: &Tensor,
    labels: &Tensor,
    parameters: &[Tensor],
    terms: &[LossTerm],
    weights: &[f64],
) -> std::result::Result<Tensor, HarnessError> {
    check_lengths(terms.len(), weights.len())?;
    Ok(weighted_sum(predictions, labels, parameters, terms, weights)?)
}

fn check_lengths(terms: usize, weights: usize) -> std::result::Result<(), HarnessError> {
    if terms != weights {
        return Err(HarnessError::config(format!(
            "{terms} loss terms but {weights} weights"
        )));
    }
    if terms == 0 {
        return Err(HarnessError::config("at least one loss term is required"));
    }
    Ok(())
}

fn weighted_sum(
    predictions: &Tensor,
    labels: &Tensor,
    parameters: &[Tensor],
    terms: &[LossTerm],
    weights: &[f64],
) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (term, &w) in terms.iter().zip(weights) {
        let value = term.evaluate(predictions, labels, parameters)?.affine(w, 0.0)?;
        total = Some(match total {
            None => value,
            Some(prev) => (prev + value)?,
        });
    }
    match total {
        Some(t) => Ok(t),
        None => candle_core::bail!("empty loss"),
    }
}

/// A validated weighted objective.
#[derive(Debug)]
pub struct LossAggregator {
    terms: Vec<LossTerm>,
    weights: Vec<f64>,
}

impl LossAggregator {
    pub fn new(terms: Vec<LossTerm>, weights: Vec<f64>) -> std::result::Result<Self, HarnessError> {
        check_lengths(terms.len(), weights.len())?;
        Ok(Self { terms, weights })
    }

    /// A single term with weight 1.
    pub fn single(term: LossTerm) -> Self {
        Self {
            terms: vec![term],
            weights: vec![1.0],
        }
    }

    pub fn compute(
        &self,
        predictions: &Tensor,
        labels: &Tensor,
        parameters: &[Tensor],
    ) -> Result<Tensor> {
        weighted_sum(predictions, labels, parameters, &self.terms, &self.weights)
    }

    pub fn terms(&self) -> &[LossTerm] {
        &self.terms
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
