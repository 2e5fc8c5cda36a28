//! Pretraining: the whole classifier on the core split, Adam +
//! cross-entropy, evaluated on the user test split.

use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};

use lintail_common::{DataLoader, ExperimentConfig, HarnessError, ModelConfig, ReportConfig, WorkflowMode};
use lintail_core::{Classifier, CrossEntropy, LossAggregator, LossTerm};

use crate::checkpoint::{Snapshot, StateDict};
use crate::driver::EpochWorkflow;
use crate::metrics::{evaluate_accuracy, should_report, LabelKind};
use crate::optim::{Adam, Optimizer, ParamsAdam};

// ── VarMap state ────────────────────────────────────────────────────────────

/// `(name, var)` pairs of a var map, sorted by name.
pub fn named_vars(varmap: &VarMap) -> anyhow::Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Deep copy of every variable.
pub fn varmap_state(varmap: &VarMap) -> anyhow::Result<StateDict> {
    named_vars(varmap)?
        .into_iter()
        .map(|(n, v)| Ok((n, v.as_tensor().copy()?)))
        .collect()
}

/// Overwrite every variable from `state`; all names must be present.
pub fn load_varmap_state(varmap: &VarMap, state: &StateDict) -> anyhow::Result<()> {
    for (name, var) in named_vars(varmap)? {
        let value = state
            .get(&name)
            .ok_or_else(|| HarnessError::resource(format!("weights have no parameter '{name}'")))?;
        if value.dims() != var.dims() {
            return Err(HarnessError::resource(format!(
                "parameter '{name}' has shape {:?}, expected {:?}",
                value.dims(),
                var.dims()
            ))
            .into());
        }
        var.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// A freshly initialised classifier and its variables.
pub fn build_classifier(config: &ModelConfig, device: &Device) -> anyhow::Result<(Classifier, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Classifier::new(vb, config)?;
    Ok((model, varmap))
}

// ── Workflow ────────────────────────────────────────────────────────────────

pub struct PretrainWorkflow {
    model: Classifier,
    varmap: VarMap,
    optimizer: Adam,
    criterion: LossAggregator,
    core_train: DataLoader,
    user_test: DataLoader,
    epochs: usize,
    report: ReportConfig,
}

impl PretrainWorkflow {
    pub fn new(
        model: Classifier,
        varmap: VarMap,
        config: &ExperimentConfig,
        core_train: DataLoader,
        user_test: DataLoader,
    ) -> anyhow::Result<Self> {
        let params = ParamsAdam {
            lr: config.pretrain.lr,
            beta1: config.pretrain.beta1,
            beta2: config.pretrain.beta2,
            eps: config.pretrain.eps,
        };
        let optimizer = Adam::new(named_vars(&varmap)?, params);
        tracing::info!(
            layers = model.num_layers(),
            params = model.parameter_names().len(),
            core_samples = core_train.dataset().len(),
            test_samples = user_test.dataset().len(),
            lr = params.lr,
            "Pretrain workflow ready"
        );
        Ok(Self {
            model,
            varmap,
            optimizer,
            criterion: LossAggregator::single(LossTerm::prediction(CrossEntropy)),
            core_train,
            user_test,
            epochs: config.pretrain.epochs,
            report: config.report.clone(),
        })
    }

    pub fn model(&self) -> &Classifier {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl EpochWorkflow for PretrainWorkflow {
    fn mode(&self) -> WorkflowMode {
        WorkflowMode::Pretrain
    }

    fn epochs(&self) -> usize {
        self.epochs
    }

    fn evaluate_test(&mut self, epoch: usize) -> anyhow::Result<f64> {
        let model = &self.model;
        Ok(evaluate_accuracy(
            &self.user_test,
            epoch,
            LabelKind::Indices,
            self.report.test_every,
            "test",
            |x| model.forward(x),
        )?)
    }

    fn evaluate_train(&mut self, _epoch: usize) -> anyhow::Result<Option<f64>> {
        Ok(None)
    }

    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<Vec<f64>> {
        let total = self.core_train.num_batches();
        let mut losses = Vec::with_capacity(total);
        for (iter, batch) in self.core_train.batches(epoch).enumerate() {
            let batch = batch?;
            let preds = self.model.forward(&batch.inputs)?;
            let loss = self.criterion.compute(&preds, &batch.labels, &[])?;
            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;

            let loss_val = loss.to_scalar::<f32>()? as f64;
            losses.push(loss_val);
            if should_report(iter, total, self.report.train_every) {
                tracing::info!(
                    "epoch: {}/{}, iter: {}/{}, lr: {}, loss: {:.5}",
                    epoch + 1,
                    self.epochs,
                    iter + 1,
                    total,
                    self.optimizer.learning_rate(),
                    loss_val
                );
            }
        }
        Ok(losses)
    }

    fn snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(Snapshot {
            model: varmap_state(&self.varmap)?,
            optimizer: self.optimizer.state_dict()?,
        })
    }

    fn restore(&mut self, snapshot: &Snapshot, _epochs_completed: usize) -> anyhow::Result<()> {
        load_varmap_state(&self.varmap, &snapshot.model)?;
        self.optimizer.load_state_dict(&snapshot.optimizer)?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use lintail_common::{Dataset, Labels};

    /// Two well-separated blobs in 4-d.
    fn blobs(n: usize) -> Dataset {
        let mut inputs = Vec::with_capacity(n * 4);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = (i % 2) as u32;
            let centre = if class == 0 { -2.0f32 } else { 2.0 };
            let jitter = (i as f32 * 0.37).sin() * 0.3;
            inputs.extend([centre + jitter, centre - jitter, centre, -centre]);
            labels.push(class);
        }
        let inputs = Tensor::from_vec(inputs, (n, 4), &Device::Cpu).unwrap();
        let labels = Tensor::from_vec(labels, n, &Device::Cpu).unwrap();
        Dataset::new(inputs, Labels::Indices(labels), 2).unwrap()
    }

    fn workflow() -> PretrainWorkflow {
        let (model, varmap) =
            build_classifier(&ModelConfig::new(4, vec![8], 2), &Device::Cpu).unwrap();
        let mut config = ExperimentConfig::default();
        config.pretrain.lr = 1e-2;
        PretrainWorkflow::new(
            model,
            varmap,
            &config,
            DataLoader::new(blobs(64), 16, true, 0),
            DataLoader::new(blobs(20), 16, false, 0),
        )
        .unwrap()
    }

    #[test]
    fn training_reduces_loss_and_fits_blobs() {
        let mut wf = workflow();
        let first = wf.train_epoch(0).unwrap();
        assert_eq!(first.len(), 4);
        let mut last = first.clone();
        for epoch in 1..15 {
            last = wf.train_epoch(epoch).unwrap();
        }
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        assert!(mean(&last) < mean(&first));
        assert!(wf.evaluate_test(15).unwrap() > 0.9);
        assert_eq!(wf.evaluate_train(15).unwrap(), None);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut wf = workflow();
        wf.train_epoch(0).unwrap();
        let snap = wf.snapshot().unwrap();
        let acc = wf.evaluate_test(1).unwrap();
        assert!(snap.optimizer.contains_key("step"));

        wf.train_epoch(1).unwrap();
        wf.restore(&snap, 1).unwrap();
        assert_eq!(wf.evaluate_test(1).unwrap(), acc);
        assert_eq!(
            varmap_state(wf.varmap()).unwrap()["layers.1.bias"]
                .to_vec1::<f32>()
                .unwrap(),
            snap.model["layers.1.bias"].to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn loading_rejects_missing_or_misshapen_weights() {
        let (_model, varmap) =
            build_classifier(&ModelConfig::new(4, vec![8], 2), &Device::Cpu).unwrap();
        let err = load_varmap_state(&varmap, &StateDict::new()).unwrap_err();
        assert!(err.downcast_ref::<HarnessError>().is_some_and(|e| e.is_resource()));

        let mut state = varmap_state(&varmap).unwrap();
        state.insert(
            "layers.0.weight".to_string(),
            Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(load_varmap_state(&varmap, &state).is_err());
    }
}
