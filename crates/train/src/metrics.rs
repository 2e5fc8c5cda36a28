//! Accuracy and progress reporting helpers.

use candle_core::{DType, Result, Tensor};

use lintail_common::DataLoader;

/// Progress is reported on the first batch, every `every`-th batch (batches
/// `every`, `2·every`, ... counted from 1) and the last batch. `iter` is
/// 0-based.
pub fn should_report(iter: usize, total: usize, every: usize) -> bool {
    iter == 0 || iter + 1 == total || (every > 0 && (iter + 1) % every == 0)
}

/// How labels are encoded in a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Indices,
    OneHot,
}

/// Number of rows whose arg-max score matches the label.
pub fn count_correct(scores: &Tensor, labels: &Tensor, kind: LabelKind) -> Result<usize> {
    let predicted = scores.argmax(1)?;
    let target = match kind {
        LabelKind::Indices => labels.to_dtype(DType::U32)?,
        LabelKind::OneHot => labels.argmax(1)?,
    };
    let correct = predicted
        .eq(&target)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(correct as usize)
}

/// Accuracy of `forward` over one pass of `loader`, logging progress lines
/// tagged with `phase`. An empty loader scores 0.
pub fn evaluate_accuracy<F>(
    loader: &DataLoader,
    epoch: usize,
    kind: LabelKind,
    report_every: usize,
    phase: &str,
    forward: F,
) -> Result<f64>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let total = loader.num_batches();
    let mut correct = 0usize;
    let mut seen = 0usize;
    for (iter, batch) in loader.batches(epoch).enumerate() {
        let batch = batch?;
        if should_report(iter, total, report_every) {
            tracing::info!("{phase} iter - processing: {}/{}", iter + 1, total);
        }
        let scores = forward(&batch.inputs)?;
        correct += count_correct(&scores, &batch.labels, kind)?;
        seen += batch.inputs.dim(0)?;
    }
    Ok(if seen == 0 {
        0.0
    } else {
        correct as f64 / seen as f64
    })
}

/// Multiply training targets by `factor` (applied to the training loss only).
pub fn scale_labels(labels: &Tensor, factor: f64) -> Result<Tensor> {
    labels.affine(factor, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use lintail_common::{Dataset, Labels};

    #[test]
    fn report_cadence() {
        let hits: Vec<usize> = (0..60).filter(|&i| should_report(i, 60, 25)).collect();
        assert_eq!(hits, vec![0, 24, 49, 59]);
        let hits: Vec<usize> = (0..250).filter(|&i| should_report(i, 250, 100)).collect();
        assert_eq!(hits, vec![0, 99, 199, 249]);
        assert!(should_report(0, 1, 100));
        assert!(!should_report(25, 60, 25));
    }

    #[test]
    fn correct_counts_for_both_encodings() {
        let scores = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &Device::Cpu).unwrap();
        let idx = Tensor::new(&[1u32, 1, 1], &Device::Cpu).unwrap();
        assert_eq!(count_correct(&scores, &idx, LabelKind::Indices).unwrap(), 2);

        let hot = Tensor::new(&[[0f32, 5.0], [5.0, 0.0], [5.0, 0.0]], &Device::Cpu).unwrap();
        assert_eq!(count_correct(&scores, &hot, LabelKind::OneHot).unwrap(), 2);
    }

    #[test]
    fn accuracy_over_loader() {
        let inputs = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0], [1.0, 0.0]], &Device::Cpu)
            .unwrap();
        let labels = Tensor::new(&[0u32, 1, 0, 0, 1], &Device::Cpu).unwrap();
        let ds = Dataset::new(inputs, Labels::Indices(labels), 2).unwrap();
        let loader = DataLoader::new(ds, 2, true, 4);
        let acc = evaluate_accuracy(&loader, 0, LabelKind::Indices, 25, "test", |x| Ok(x.clone()))
            .unwrap();
        assert!((acc - 0.6).abs() < 1e-12);
    }

    #[test]
    fn labels_scale() {
        let hot = Tensor::new(&[[1f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let scaled = scale_labels(&hot, 5.0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(scaled, vec![vec![5.0, 0.0, 0.0]]);
    }
}
