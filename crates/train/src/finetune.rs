//! Fine-tuning: only the last N layers of a pretrained classifier are
//! trained on user data, with SGD + momentum, a multi-step schedule and
//! `mse_weight · MSE(scores, label_scale · one_hot) + l2_weight · Σθ²`.
//!
//! With `activation_variant` set, both user splits are pushed through the
//! frozen extractor once up front and the tail trains on the cached
//! features; otherwise every batch goes through the full model.

use candle_core::Tensor;

use lintail_common::{Batch, DataLoader, ExperimentConfig, ReportConfig, WorkflowMode};
use lintail_core::{
    cache_dataset, split, Classifier, L2Regularization, LossAggregator, LossTerm, MixedLinear, Mse,
    TailEvaluator,
};

use crate::checkpoint::Snapshot;
use crate::driver::EpochWorkflow;
use crate::metrics::{evaluate_accuracy, scale_labels, should_report, LabelKind};
use crate::optim::{Optimizer, SgdMomentum};
use crate::scheduler::MultiStepLr;

pub struct FineTuneWorkflow {
    evaluator: TailEvaluator,
    tail: MixedLinear,
    optimizer: SgdMomentum,
    scheduler: MultiStepLr,
    criterion: LossAggregator,
    user_train: DataLoader,
    user_test: DataLoader,
    label_scale: f64,
    epochs: usize,
    report: ReportConfig,
}

impl FineTuneWorkflow {
    /// `user_train` carries one-hot labels, `user_test` class indices.
    pub fn new(
        pretrained: &Classifier,
        n_components: usize,
        config: &ExperimentConfig,
        user_train: DataLoader,
        user_test: DataLoader,
    ) -> anyhow::Result<Self> {
        let ft = &config.finetune;
        let (extractor, tail, params) = split(pretrained, n_components)?;

        let (evaluator, user_train, user_test) = if ft.activation_variant {
            let train = user_train.with_dataset(cache_dataset(&extractor, user_train.dataset())?);
            let test = user_test.with_dataset(cache_dataset(&extractor, user_test.dataset())?);
            (TailEvaluator::CachedActivation, train, test)
        } else {
            (TailEvaluator::FullForward(extractor), user_train, user_test)
        };

        let criterion = LossAggregator::new(
            vec![LossTerm::prediction(Mse), LossTerm::parameter(L2Regularization)],
            vec![ft.mse_weight, ft.l2_weight],
        )?;

        tracing::info!(
            n_components,
            evaluator = evaluator.name(),
            trainable = ?params.names(),
            train_samples = user_train.dataset().len(),
            test_samples = user_test.dataset().len(),
            "Fine-tune workflow ready"
        );

        Ok(Self {
            evaluator,
            optimizer: SgdMomentum::new(params.named_vars(), ft.lr, ft.momentum),
            scheduler: MultiStepLr::new(ft.lr, ft.milestones.clone(), ft.gamma),
            tail,
            criterion,
            user_train,
            user_test,
            label_scale: ft.label_scale,
            epochs: ft.epochs,
            report: config.report.clone(),
        })
    }

    /// Replace the objective.
    pub fn with_criterion(mut self, criterion: LossAggregator) -> Self {
        self.criterion = criterion;
        self
    }

    pub fn tail(&self) -> &MixedLinear {
        &self.tail
    }

    pub fn evaluator(&self) -> &TailEvaluator {
        &self.evaluator
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        self.evaluator.forward(&self.tail, input)
    }

    /// One optimiser step; returns the loss.
    pub fn train_step(&mut self, batch: &Batch) -> anyhow::Result<f64> {
        let preds = self.forward(&batch.inputs)?;
        let targets = scale_labels(&batch.labels, self.label_scale)?;
        let loss = self
            .criterion
            .compute(&preds, &targets, &self.tail.parameters())?;
        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        Ok(loss.to_scalar::<f32>()? as f64)
    }
}

impl EpochWorkflow for FineTuneWorkflow {
    fn mode(&self) -> WorkflowMode {
        WorkflowMode::TrainUserData
    }

    fn epochs(&self) -> usize {
        self.epochs
    }

    fn evaluate_test(&mut self, epoch: usize) -> anyhow::Result<f64> {
        let this = &*self;
        Ok(evaluate_accuracy(
            &this.user_test,
            epoch,
            LabelKind::Indices,
            this.report.test_every,
            "test",
            |x| this.forward(x),
        )?)
    }

    fn evaluate_train(&mut self, epoch: usize) -> anyhow::Result<Option<f64>> {
        let this = &*self;
        let acc = evaluate_accuracy(
            &this.user_train,
            epoch,
            LabelKind::OneHot,
            this.report.train_every,
            "train",
            |x| this.forward(x),
        )?;
        Ok(Some(acc))
    }

    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<Vec<f64>> {
        let loader = self.user_train.clone();
        let total = loader.num_batches();
        let mut losses = Vec::with_capacity(total);
        for (iter, batch) in loader.batches(epoch).enumerate() {
            let loss = self.train_step(&batch?)?;
            losses.push(loss);
            if should_report(iter, total, self.report.train_every) {
                tracing::info!(
                    "epoch: {}/{}, iter: {}/{}, lr: {}, loss: {:.5}",
                    epoch + 1,
                    self.epochs,
                    iter + 1,
                    total,
                    self.optimizer.learning_rate(),
                    loss
                );
            }
        }
        self.scheduler.advance();
        self.optimizer.set_learning_rate(self.scheduler.current_lr());
        Ok(losses)
    }

    fn snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(Snapshot {
            model: self.tail.params().snapshot()?,
            optimizer: self.optimizer.state_dict()?,
        })
    }

    fn restore(&mut self, snapshot: &Snapshot, epochs_completed: usize) -> anyhow::Result<()> {
        self.tail.params().load(&snapshot.model)?;
        self.optimizer.load_state_dict(&snapshot.optimizer)?;
        self.scheduler.set_epoch(epochs_completed);
        self.optimizer.set_learning_rate(self.scheduler.current_lr());
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
