//! Data pipeline: dataset files, the core/user split, and batching.
//!
//! A dataset file is a safetensors file with two tensors:
//!
//! * `inputs`: any float dtype, shape `[N, ...]`, flattened to `[N, D]` on load.
//! * `labels`: integer class indices, shape `[N]`.
//!
//! * **[`Dataset`]**: inputs plus [`Labels`] (class indices or one-hot rows).
//! * **[`split_core_user`]**: seeded, reproducible core/user partition.
//! * **[`DataLoader`]**: fixed-size batches with optional per-epoch shuffle.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::DataConfig;
use crate::error::HarnessError;

pub const INPUTS_KEY: &str = "inputs";
pub const LABELS_KEY: &str = "labels";

// ── Labels ──────────────────────────────────────────────────────────────────

/// Label encoding of a dataset.
#[derive(Debug, Clone)]
pub enum Labels {
    /// `u32` class indices, shape `[N]`.
    Indices(Tensor),
    /// `f32` one-hot rows, shape `[N, C]`.
    OneHot(Tensor),
}

impl Labels {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Indices(t) | Self::OneHot(t) => t,
        }
    }

    pub fn is_one_hot(&self) -> bool {
        matches!(self, Self::OneHot(_))
    }

    fn select(&self, idx: &Tensor) -> Result<Self> {
        Ok(match self {
            Self::Indices(t) => Self::Indices(t.index_select(idx, 0)?),
            Self::OneHot(t) => Self::OneHot(t.index_select(idx, 0)?),
        })
    }
}

/// Encode `u32` class indices as `f32` one-hot rows.
pub fn one_hot(indices: &Tensor, num_classes: usize) -> Result<Tensor> {
    let idx = indices.to_vec1::<u32>()?;
    let mut rows = vec![0f32; idx.len() * num_classes];
    for (row, &class) in idx.iter().enumerate() {
        let class = class as usize;
        if class >= num_classes {
            candle_core::bail!("label {class} out of range for {num_classes} classes");
        }
        rows[row * num_classes + class] = 1.0;
    }
    Tensor::from_vec(rows, (idx.len(), num_classes), indices.device())
}

// ── Dataset ─────────────────────────────────────────────────────────────────

/// In-memory classification dataset on a single device.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Tensor,
    labels: Labels,
    num_classes: usize,
}

impl Dataset {
    pub fn new(inputs: Tensor, labels: Labels, num_classes: usize) -> Result<Self> {
        let n = inputs.dim(0)?;
        let n_labels = labels.tensor().dim(0)?;
        if n != n_labels {
            candle_core::bail!("{n} inputs but {n_labels} labels");
        }
        Ok(Self {
            inputs,
            labels,
            num_classes,
        })
    }

    /// Load a dataset file with class-index labels. `num_classes` is
    /// `max(label) + 1`; callers combining files use [`Dataset::with_num_classes`].
    pub fn load(path: &Path, device: &Device) -> std::result::Result<Self, HarnessError> {
        if !path.is_file() {
            return Err(HarnessError::resource(format!(
                "dataset file {} not found",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, device).map_err(|e| {
            HarnessError::resource(format!("read dataset {}: {e}", path.display()))
        })?;
        let missing = |key: &str| {
            HarnessError::resource(format!("dataset {} has no '{key}' tensor", path.display()))
        };
        let inputs = tensors.remove(INPUTS_KEY).ok_or_else(|| missing(INPUTS_KEY))?;
        let labels = tensors.remove(LABELS_KEY).ok_or_else(|| missing(LABELS_KEY))?;

        if inputs.rank() < 2 {
            return Err(HarnessError::resource(format!(
                "dataset {}: inputs must be [N, ...], got {:?}",
                path.display(),
                inputs.dims()
            )));
        }
        let inputs = inputs.to_dtype(DType::F32)?.flatten_from(1)?;
        let labels = labels.flatten_all()?.to_dtype(DType::U32)?;
        let num_classes = if labels.dim(0)? == 0 {
            0
        } else {
            labels.max(0)?.to_scalar::<u32>()? as usize + 1
        };
        tracing::debug!(
            path = %path.display(),
            samples = inputs.dim(0)?,
            input_dim = inputs.dim(1)?,
            num_classes,
            "Loaded dataset"
        );
        Ok(Self::new(inputs, Labels::Indices(labels), num_classes)?)
    }

    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn input_dim(&self) -> usize {
        self.inputs.dims().get(1).copied().unwrap_or(0)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn device(&self) -> &Device {
        self.inputs.device()
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Replace the inputs (e.g. with precomputed extractor activations),
    /// keeping labels and sample order.
    pub fn with_inputs(&self, inputs: Tensor) -> Result<Self> {
        Self::new(inputs, self.labels.clone(), self.num_classes)
    }

    /// Convert class-index labels to one-hot rows. No-op if already one-hot.
    pub fn into_one_hot(self) -> Result<Self> {
        match self.labels {
            Labels::OneHot(_) => Ok(self),
            Labels::Indices(ref idx) => {
                let rows = one_hot(idx, self.num_classes)?;
                Ok(Self {
                    labels: Labels::OneHot(rows),
                    ..self
                })
            }
        }
    }

    /// Subset in the given order.
    pub fn select(&self, indices: &[u32]) -> Result<Self> {
        let idx = Tensor::from_slice(indices, indices.len(), self.device())?;
        Ok(Self {
            inputs: self.inputs.index_select(&idx, 0)?,
            labels: self.labels.select(&idx)?,
            num_classes: self.num_classes,
        })
    }
}

// ── Core / user split ───────────────────────────────────────────────────────

/// The three datasets of a core/user experiment.
#[derive(Debug, Clone)]
pub struct CoreUserSplit {
    /// Pretraining data (class indices).
    pub core: Dataset,
    /// Fine-tuning data (one-hot labels).
    pub user_train: Dataset,
    /// Evaluation data (class indices).
    pub user_test: Dataset,
}

/// Partition `train` into core and user-train with a seeded shuffle.
///
/// The first `floor(split_rate * N)` shuffled samples are core, the rest are
/// user-train. The same `(N, split_rate, seed)` always yields the same split.
pub fn split_core_user(
    train: &Dataset,
    test: Dataset,
    split_rate: f64,
    seed: u64,
) -> std::result::Result<CoreUserSplit, HarnessError> {
    if !(0.0..=1.0).contains(&split_rate) {
        return Err(HarnessError::config(format!(
            "split rate must be in [0, 1], got {split_rate}"
        )));
    }
    let n = train.len();
    let mut order: Vec<u32> = (0..n as u32).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_core = (split_rate * n as f64).floor() as usize;
    let (core_idx, user_idx) = order.split_at(n_core);

    let num_classes = train.num_classes().max(test.num_classes());
    let core = train.select(core_idx)?.with_num_classes(num_classes);
    let user_train = train
        .select(user_idx)?
        .with_num_classes(num_classes)
        .into_one_hot()?;
    let user_test = test.with_num_classes(num_classes);

    tracing::info!(
        core = core.len(),
        user_train = user_train.len(),
        user_test = user_test.len(),
        split_rate,
        seed,
        "Core/user split"
    );
    Ok(CoreUserSplit {
        core,
        user_train,
        user_test,
    })
}

/// Load `<data_dir>/<dataset_id>/{train,test}.safetensors` and split them.
pub fn load_core_user(
    data_dir: &Path,
    dataset_id: &str,
    split_rate: f64,
    seed: u64,
    device: &Device,
) -> std::result::Result<CoreUserSplit, HarnessError> {
    let root = data_dir.join(dataset_id);
    let train = Dataset::load(&root.join("train.safetensors"), device)?;
    let test = Dataset::load(&root.join("test.safetensors"), device)?;
    split_core_user(&train, test, split_rate, seed)
}

/// Load the pure user split `<data_dir>/<dataset_id>/{user_train,user_test}.safetensors`.
///
/// Returns `(user_train, user_test)`; user-train labels are one-hot.
pub fn load_user(
    data_dir: &Path,
    dataset_id: &str,
    device: &Device,
) -> std::result::Result<(Dataset, Dataset), HarnessError> {
    let root = data_dir.join(dataset_id);
    let train = Dataset::load(&root.join("user_train.safetensors"), device)?;
    let test = Dataset::load(&root.join("user_test.safetensors"), device)?;
    let num_classes = train.num_classes().max(test.num_classes());
    let train = train.with_num_classes(num_classes).into_one_hot()?;
    let test = test.with_num_classes(num_classes);
    Ok((train, test))
}

/// Loaders of a core/user experiment. Only the training loaders shuffle.
#[derive(Debug, Clone)]
pub struct CoreUserLoaders {
    pub core: DataLoader,
    pub user_train: DataLoader,
    pub user_test: DataLoader,
}

pub fn core_user_loaders(split: CoreUserSplit, config: &DataConfig, shuffle: bool) -> CoreUserLoaders {
    CoreUserLoaders {
        core: DataLoader::from_config(split.core, config, shuffle),
        user_train: DataLoader::from_config(split.user_train, config, shuffle),
        user_test: DataLoader::from_config(split.user_test, config, false),
    }
}

/// `(user_train, user_test)` loaders over the pure user split.
pub fn user_loaders(
    data_dir: &Path,
    dataset_id: &str,
    config: &DataConfig,
    shuffle: bool,
    device: &Device,
) -> std::result::Result<(DataLoader, DataLoader), HarnessError> {
    let (train, test) = load_user(data_dir, dataset_id, device)?;
    Ok((
        DataLoader::from_config(train, config, shuffle),
        DataLoader::from_config(test, config, false),
    ))
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// One batch: `inputs` `[B, D]` and the matching slice of labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

/// Fixed-size batches over a [`Dataset`]. The last batch may be short.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    pub fn new(dataset: Dataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
        }
    }

    pub fn from_config(dataset: Dataset, config: &DataConfig, shuffle: bool) -> Self {
        Self::new(dataset, config.batch_size, shuffle, config.shuffle_seed)
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Same batching and shuffle settings over another dataset.
    pub fn with_dataset(&self, dataset: Dataset) -> Self {
        Self {
            dataset,
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            seed: self.seed,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Sample order for `epoch`: identity, or a shuffle seeded by `seed + epoch`.
    pub fn order(&self, epoch: usize) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.dataset.len() as u32).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Batches for `epoch`.
    pub fn batches(&self, epoch: usize) -> impl Iterator<Item = Result<Batch>> + '_ {
        let order = self.order(epoch);
        let chunks: Vec<Vec<u32>> = order
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        chunks.into_iter().map(move |chunk| {
            let subset = self.dataset.select(&chunk)?;
            Ok(Batch {
                inputs: subset.inputs,
                labels: subset.labels.tensor().clone(),
            })
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(n: usize, num_classes: u32) -> Dataset {
        let inputs: Vec<f32> = (0..n * 2).map(|v| v as f32).collect();
        let labels: Vec<u32> = (0..n as u32).map(|i| i % num_classes).collect();
        let inputs = Tensor::from_vec(inputs, (n, 2), &Device::Cpu).unwrap();
        let labels = Tensor::from_vec(labels, n, &Device::Cpu).unwrap();
        Dataset::new(inputs, Labels::Indices(labels), num_classes as usize).unwrap()
    }

    #[test]
    fn one_hot_rows() {
        let idx = Tensor::new(&[2u32, 0, 1], &Device::Cpu).unwrap();
        let rows = one_hot(&idx, 3).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(
            rows,
            vec![vec![0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]
        );
    }

    #[test]
    fn one_hot_rejects_out_of_range() {
        let idx = Tensor::new(&[3u32], &Device::Cpu).unwrap();
        assert!(one_hot(&idx, 3).is_err());
    }

    #[test]
    fn split_is_reproducible_and_disjoint() {
        let train = toy(20, 4);
        let a = split_core_user(&train, toy(5, 4), 0.75, 13).unwrap();
        let b = split_core_user(&train, toy(5, 4), 0.75, 13).unwrap();
        assert_eq!(a.core.len(), 15);
        assert_eq!(a.user_train.len(), 5);
        assert!(a.user_train.labels().is_one_hot());
        assert!(!a.core.labels().is_one_hot());
        assert_eq!(
            a.core.inputs().to_vec2::<f32>().unwrap(),
            b.core.inputs().to_vec2::<f32>().unwrap()
        );

        let mut firsts: Vec<f32> = a
            .core
            .inputs()
            .to_vec2::<f32>()
            .unwrap()
            .into_iter()
            .chain(a.user_train.inputs().to_vec2::<f32>().unwrap())
            .map(|row| row[0])
            .collect();
        firsts.sort_by(|x, y| x.partial_cmp(y).unwrap());
        let expected: Vec<f32> = (0..20).map(|i| (i * 2) as f32).collect();
        assert_eq!(firsts, expected);
    }

    #[test]
    fn split_rate_out_of_range() {
        let err = split_core_user(&toy(4, 2), toy(2, 2), 1.5, 13).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn loader_batches_cover_dataset() {
        let loader = DataLoader::new(toy(10, 3), 4, true, 7);
        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<usize> = loader
            .batches(0)
            .map(|b| b.unwrap().inputs.dim(0).unwrap())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(loader.order(1), loader.order(1));
        assert_ne!(loader.order(0), loader.order(1));
    }

    #[test]
    fn core_user_loaders_shuffle_training_only() {
        let split = split_core_user(&toy(12, 3), toy(6, 3), 0.5, 13).unwrap();
        let loaders = core_user_loaders(split, &DataConfig::default(), true);
        assert_eq!(loaders.core.dataset().len(), 6);
        assert_eq!(loaders.user_test.order(3), (0..6).collect::<Vec<u32>>());
        let replaced = loaders.user_train.with_dataset(toy(64, 3));
        assert_eq!(replaced.num_batches(), 1);
        assert_ne!(replaced.order(0), replaced.order(1));
    }

    #[test]
    fn load_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        let inputs = Tensor::zeros((3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0i64, 4, 1], &Device::Cpu).unwrap();
        let tensors = std::collections::HashMap::from([
            (INPUTS_KEY.to_string(), inputs),
            (LABELS_KEY.to_string(), labels),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let ds = Dataset::load(&path, &Device::Cpu).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.input_dim(), 4);
        assert_eq!(ds.num_classes(), 5);
    }

    #[test]
    fn missing_file_is_resource_error() {
        let err = Dataset::load(Path::new("/nonexistent/train.safetensors"), &Device::Cpu)
            .unwrap_err();
        assert!(err.is_resource());
    }
}
