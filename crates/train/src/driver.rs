//! The resumable epoch loop shared by both workflows.
//!
//! Per epoch, in this order:
//! 1. read the checkpoint;
//! 2. measure test accuracy (and train accuracy, if the workflow has one)
//!    on the model as it stands *before* the epoch's updates;
//! 3. if the test accuracy strictly beats the stored best, snapshot the
//!    pre-update model and optimiser state;
//! 4. train one epoch;
//! 5. fold everything into the checkpoint and write it.
//!
//! After the loop a final evaluation is applied under a
//! [`FinalEvalPolicy`], and the checkpoint is marked finished. Re-running a
//! finished experiment does nothing; an interrupted one resumes after the
//! last completed epoch.

use candle_core::Device;

use lintail_common::{FinalEvalPolicy, WorkflowMode};

use crate::checkpoint::{Checkpoint, CheckpointStore, EpochResult, FinalEvaluation, Snapshot};

/// One training workflow as seen by [`run`].
pub trait EpochWorkflow {
    fn mode(&self) -> WorkflowMode;
    fn epochs(&self) -> usize;
    fn evaluate_test(&mut self, epoch: usize) -> anyhow::Result<f64>;
    /// `None` for workflows that do not track train accuracy.
    fn evaluate_train(&mut self, epoch: usize) -> anyhow::Result<Option<f64>>;
    /// Train one epoch and return the per-batch losses.
    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<Vec<f64>>;
    fn snapshot(&self) -> anyhow::Result<Snapshot>;
    /// Restore trainable and optimiser state; `epochs_completed` lets
    /// schedules fast-forward.
    fn restore(&mut self, snapshot: &Snapshot, epochs_completed: usize) -> anyhow::Result<()>;
}

/// Outcome of [`run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Epochs trained by this invocation.
    pub epochs_run: usize,
    pub resumed_from: usize,
    pub final_test_acc: Option<f64>,
    pub final_train_acc: Option<f64>,
    pub best_model_test_acc: f64,
    pub best_model_epoch: i64,
}

pub fn run<W: EpochWorkflow>(
    workflow: &mut W,
    store: &CheckpointStore,
    policy: FinalEvalPolicy,
    device: &Device,
) -> anyhow::Result<RunSummary> {
    let mode = workflow.mode();
    let epochs = workflow.epochs();
    store.init(&Checkpoint::default())?;

    let checkpoint = store.load(device)?;
    if checkpoint.finished {
        tracing::info!(
            %mode,
            path = %store.path().display(),
            best_model_test_acc = checkpoint.best_model_test_acc,
            best_model_epoch = checkpoint.best_model_epoch,
            "Experiment already finished; nothing to do"
        );
        return Ok(summary(&checkpoint, 0, checkpoint.epochs_completed, None, None));
    }

    let resumed_from = checkpoint.epochs_completed.min(epochs);
    if checkpoint.has_resume_state() {
        workflow.restore(
            &Snapshot {
                model: checkpoint.last_model_state_dict.clone(),
                optimizer: checkpoint.last_optimizer_state_dict.clone(),
            },
            checkpoint.epochs_completed,
        )?;
        tracing::info!(%mode, epochs_completed = checkpoint.epochs_completed, "Resuming experiment");
    }
    drop(checkpoint);

    for epoch in resumed_from..epochs {
        let checkpoint = store.load(device)?;

        let test_acc = workflow.evaluate_test(epoch)?;
        let train_acc = workflow.evaluate_train(epoch)?;
        tracing::info!(
            "epoch: {}/{}, test accuracy: {:.4}{}",
            epoch + 1,
            epochs,
            test_acc,
            train_acc.map(|a| format!(", train accuracy: {a:.4}")).unwrap_or_default()
        );

        let best_candidate = if checkpoint.improves_on_best(test_acc) {
            tracing::info!(
                previous = checkpoint.best_model_test_acc,
                current = test_acc,
                "New best model"
            );
            Some(workflow.snapshot()?)
        } else {
            None
        };

        let losses = workflow.train_epoch(epoch)?;
        let last_state = workflow.snapshot()?;

        let next = checkpoint.advance(EpochResult {
            epoch,
            test_acc,
            train_acc,
            losses,
            best_candidate,
            last_state,
        });
        store.save(&next)?;
    }

    let checkpoint = store.load(device)?;
    let test_acc = workflow.evaluate_test(epochs)?;
    let train_acc = workflow.evaluate_train(epochs)?;
    tracing::info!(
        "final test accuracy: {:.4}{}",
        test_acc,
        train_acc.map(|a| format!(", final train accuracy: {a:.4}")).unwrap_or_default()
    );
    let snapshot = if policy == FinalEvalPolicy::RecordAndTrackBest
        && checkpoint.improves_on_best(test_acc)
    {
        Some(workflow.snapshot()?)
    } else {
        None
    };
    let finished = checkpoint.finish(
        FinalEvaluation {
            test_acc,
            train_acc,
            snapshot,
        },
        policy,
    );
    store.save(&finished)?;
    tracing::info!(
        %mode,
        best_model_test_acc = finished.best_model_test_acc,
        best_model_epoch = finished.best_model_epoch,
        "Experiment finished"
    );

    Ok(summary(
        &finished,
        epochs - resumed_from,
        resumed_from,
        Some(test_acc),
        train_acc,
    ))
}

fn summary(
    checkpoint: &Checkpoint,
    epochs_run: usize,
    resumed_from: usize,
    final_test_acc: Option<f64>,
    final_train_acc: Option<f64>,
) -> RunSummary {
    RunSummary {
        epochs_run,
        resumed_from,
        final_test_acc,
        final_train_acc,
        best_model_test_acc: checkpoint.best_model_test_acc,
        best_model_epoch: checkpoint.best_model_epoch,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    use crate::checkpoint::StateDict;

    /// A scripted workflow whose single "weight" is the number of epochs it
    /// has trained. Test accuracy is read from `accs[weight]`.
    struct Scripted {
        accs: Vec<f64>,
        epochs: usize,
        weight: usize,
        fail_at: Option<usize>,
        calls: Vec<String>,
    }

    impl Scripted {
        fn new(accs: &[f64], epochs: usize) -> Self {
            Self {
                accs: accs.to_vec(),
                epochs,
                weight: 0,
                fail_at: None,
                calls: Vec::new(),
            }
        }

        fn state(&self) -> StateDict {
            StateDict::from([(
                "w".to_string(),
                Tensor::new(&[self.weight as f32], &Device::Cpu).unwrap(),
            )])
        }
    }

    impl EpochWorkflow for Scripted {
        fn mode(&self) -> WorkflowMode {
            WorkflowMode::TrainUserData
        }

        fn epochs(&self) -> usize {
            self.epochs
        }

        fn evaluate_test(&mut self, epoch: usize) -> anyhow::Result<f64> {
            self.calls.push(format!("test{epoch}"));
            Ok(self.accs[self.weight])
        }

        fn evaluate_train(&mut self, epoch: usize) -> anyhow::Result<Option<f64>> {
            self.calls.push(format!("train_acc{epoch}"));
            Ok(Some(self.accs[self.weight] / 2.0))
        }

        fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<Vec<f64>> {
            if self.fail_at == Some(epoch) {
                anyhow::bail!("interrupted");
            }
            self.calls.push(format!("train{epoch}"));
            self.weight += 1;
            Ok(vec![1.0, 0.5])
        }

        fn snapshot(&self) -> anyhow::Result<Snapshot> {
            Ok(Snapshot {
                model: self.state(),
                optimizer: StateDict::new(),
            })
        }

        fn restore(&mut self, snapshot: &Snapshot, _epochs_completed: usize) -> anyhow::Result<()> {
            self.weight = snapshot.model["w"].to_vec1::<f32>()?[0] as usize;
            self.calls.push(format!("restore{}", self.weight));
            Ok(())
        }
    }

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.safetensors"));
        (dir, store)
    }

    fn stored_weight(dict: &StateDict) -> f32 {
        dict["w"].to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn evaluates_before_training() {
        let (_dir, store) = store();
        let mut wf = Scripted::new(&[0.1, 0.2, 0.3, 0.4], 3);
        run(&mut wf, &store, FinalEvalPolicy::RecordHistory, &Device::Cpu).unwrap();

        assert_eq!(
            wf.calls,
            vec![
                "test0", "train_acc0", "train0", "test1", "train_acc1", "train1", "test2",
                "train_acc2", "train2", "test3", "train_acc3"
            ]
        );
        let ckpt = store.load(&Device::Cpu).unwrap();
        // The accuracy recorded for epoch e is that of the model after e epochs.
        assert_eq!(ckpt.history.running_test_acc, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(ckpt.history.running_loss.len(), 6);
        assert!(ckpt.finished);
    }

    #[test]
    fn best_state_is_pre_update() {
        let (_dir, store) = store();
        let mut wf = Scripted::new(&[0.5, 0.8, 0.8, 0.7, 0.9], 4);
        let summary = run(&mut wf, &store, FinalEvalPolicy::RecordHistory, &Device::Cpu).unwrap();

        let ckpt = store.load(&Device::Cpu).unwrap();
        assert_eq!(ckpt.best_model_test_acc, 0.8);
        assert_eq!(ckpt.best_model_epoch, 2);
        // Captured after one epoch of training, before the second.
        assert_eq!(stored_weight(&ckpt.model_state_dict), 1.0);
        assert_eq!(stored_weight(&ckpt.last_model_state_dict), 4.0);
        // RecordHistory leaves the best alone even though the final eval is higher.
        assert_eq!(summary.final_test_acc, Some(0.9));
        assert_eq!(summary.best_model_test_acc, 0.8);
    }

    #[test]
    fn record_and_track_best_applies_the_gate() {
        let (_dir, store) = store();
        let mut wf = Scripted::new(&[0.5, 0.8, 0.8, 0.7, 0.9], 4);
        run(&mut wf, &store, FinalEvalPolicy::RecordAndTrackBest, &Device::Cpu).unwrap();
        let ckpt = store.load(&Device::Cpu).unwrap();
        assert_eq!(ckpt.best_model_test_acc, 0.9);
        assert_eq!(ckpt.best_model_epoch, 5);
        assert_eq!(stored_weight(&ckpt.model_state_dict), 4.0);
    }

    #[test]
    fn measure_only_leaves_history_alone() {
        let (_dir, store) = store();
        let mut wf = Scripted::new(&[0.5, 0.6, 0.7], 2);
        run(&mut wf, &store, FinalEvalPolicy::MeasureOnly, &Device::Cpu).unwrap();
        let ckpt = store.load(&Device::Cpu).unwrap();
        assert_eq!(ckpt.history.running_test_acc, vec![0.5, 0.6]);
    }

    #[test]
    fn resumes_after_interruption() {
        let (_dir, crashed_store) = store();
        let accs = [0.1, 0.3, 0.2, 0.6, 0.5, 0.4];
        let mut crashed = Scripted::new(&accs, 5);
        crashed.fail_at = Some(2);
        assert!(run(&mut crashed, &crashed_store, FinalEvalPolicy::RecordHistory, &Device::Cpu).is_err());
        assert_eq!(crashed_store.load(&Device::Cpu).unwrap().epochs_completed, 2);

        let mut resumed = Scripted::new(&accs, 5);
        let summary = run(&mut resumed, &crashed_store, FinalEvalPolicy::RecordHistory, &Device::Cpu).unwrap();
        assert_eq!(summary.resumed_from, 2);
        assert_eq!(summary.epochs_run, 3);
        assert_eq!(resumed.calls[0], "restore2");
        assert_eq!(resumed.calls[1], "test2");

        // Same record as an uninterrupted run.
        let (_dir2, clean_store) = store();
        let mut clean = Scripted::new(&accs, 5);
        run(&mut clean, &clean_store, FinalEvalPolicy::RecordHistory, &Device::Cpu).unwrap();
        let a = crashed_store.load(&Device::Cpu).unwrap();
        let b = clean_store.load(&Device::Cpu).unwrap();
        assert_eq!(a.history.running_test_acc, b.history.running_test_acc);
        assert_eq!(a.best_model_epoch, b.best_model_epoch);
        assert_eq!(a.best_model_epoch, 4);
        assert_eq!(stored_weight(&a.model_state_dict), 3.0);
    }

    #[test]
    fn finished_experiment_is_a_no_op() {
        let (_dir, store) = store();
        let mut wf = Scripted::new(&[0.1, 0.2, 0.3], 2);
        run(&mut wf, &store, FinalEvalPolicy::RecordHistory, &Device::Cpu).unwrap();
        let before = store.load(&Device::Cpu).unwrap().record();

        let mut again = Scripted::new(&[0.1, 0.2, 0.3], 2);
        let summary = run(&mut again, &store, FinalEvalPolicy::RecordHistory, &Device::Cpu).unwrap();
        assert!(again.calls.is_empty());
        assert_eq!(summary.epochs_run, 0);
        assert_eq!(store.load(&Device::Cpu).unwrap().record(), before);
    }
}
