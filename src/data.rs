use candle_core::{Device, Tensor};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

/// A count matrix with examples as rows and features as columns, plus
/// optional per-example labels used only for clustering accuracy.
pub struct CountDataSet {
    values: Array2<f32>,
    labels: Option<Vec<u32>>,
    /// Optional per-entry noise transform re-applied every epoch, e.g.
    /// count subsampling. `None` means train on the raw counts.
    pub noisy_preprocess: Option<fn(f32) -> f32>,
}

impl CountDataSet {
    pub fn new(values: Array2<f32>) -> Self {
        Self {
            values,
            labels: None,
            noisy_preprocess: None,
        }
    }

    pub fn with_labels(values: Array2<f32>, labels: Vec<u32>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            labels.len() == values.nrows(),
            "label count {} does not match example count {}",
            labels.len(),
            values.nrows()
        );
        Ok(Self {
            values,
            labels: Some(labels),
            noisy_preprocess: None,
        })
    }

    pub fn number_of_examples(&self) -> usize {
        self.values.nrows()
    }

    pub fn number_of_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn labels(&self) -> Option<&[u32]> {
        self.labels.as_deref()
    }

    pub fn number_of_classes(&self) -> Option<usize> {
        self.labels
            .as_ref()
            .map(|ls| ls.iter().map(|&l| l as usize + 1).max().unwrap_or(0))
    }

    /// Per-example totals, shape `(n, 1)`.
    pub fn count_sums(&self) -> Array2<f32> {
        let sums: Vec<f32> = self
            .values
            .axis_iter(ndarray::Axis(0))
            .into_par_iter()
            .map(|row| row.sum())
            .collect();
        Array2::from_shape_vec((sums.len(), 1), sums).expect("count sum shape")
    }

    /// Apply a preprocessing map to every entry, e.g. binarisation or
    /// noise injection before training.
    pub fn map_values<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32 + Sync,
    {
        Self {
            values: self.values.map(|&v| f(v)),
            labels: self.labels.clone(),
            noisy_preprocess: self.noisy_preprocess,
        }
    }

    /// Split off the last `fraction` of examples as a validation set.
    pub fn split_validation(&self, fraction: f64) -> anyhow::Result<(Self, Self)> {
        anyhow::ensure!(
            (0.0..1.0).contains(&fraction),
            "validation fraction must be in [0, 1): {}",
            fraction
        );
        let n = self.number_of_examples();
        let n_valid = (n as f64 * fraction).floor() as usize;
        let n_train = n - n_valid;
        let train = self.values.slice(ndarray::s![..n_train, ..]).to_owned();
        let valid = self.values.slice(ndarray::s![n_train.., ..]).to_owned();
        let (train_labels, valid_labels) = match &self.labels {
            Some(ls) => (
                Some(ls[..n_train].to_vec()),
                Some(ls[n_train..].to_vec()),
            ),
            None => (None, None),
        };
        Ok((
            Self {
                values: train,
                labels: train_labels,
                noisy_preprocess: self.noisy_preprocess,
            },
            Self {
                values: valid,
                labels: valid_labels,
                noisy_preprocess: self.noisy_preprocess,
            },
        ))
    }
}

pub struct MinibatchData {
    pub input: Tensor,
    pub count_sum: Tensor,
    pub labels: Option<Tensor>,
}

/// Minibatch access over a data set. An epoch visits every example once;
/// `shuffle_minibatch` re-partitions the rows.
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_examples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()>;

    /// Deterministic, unshuffled partition for evaluation.
    fn sequential_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

pub struct InMemoryData {
    input_data: Vec<Tensor>,
    count_sum_data: Vec<Tensor>,
    label_data: Option<Vec<u32>>,
    chunks: Vec<Vec<usize>>,
}

impl InMemoryData {
    pub fn new(data: &CountDataSet) -> anyhow::Result<Self> {
        let input_data = rows_to_tensor_vec(data.values());
        let count_sum_data = rows_to_tensor_vec(&data.count_sums());
        Ok(Self {
            input_data,
            count_sum_data,
            label_data: data.labels().map(|ls| ls.to_vec()),
            chunks: vec![],
        })
    }

    fn partition(&mut self, order: Vec<usize>, batch_size: usize) {
        self.chunks = order
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    fn gather(&self, rows: &[usize], data: &[Tensor], device: &Device) -> anyhow::Result<Tensor> {
        let chunk: Vec<Tensor> = rows.iter().map(|&i| data[i].clone()).collect();
        Ok(Tensor::cat(&chunk, 0)?.to_device(device)?)
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let rows = self.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.chunks.len()
            )
        })?;
        let input = self.gather(rows, &self.input_data, target_device)?;
        let count_sum = self.gather(rows, &self.count_sum_data, target_device)?;
        let labels = match &self.label_data {
            Some(ls) => {
                let picked: Vec<u32> = rows.iter().map(|&i| ls[i]).collect();
                Some(Tensor::from_vec(picked, rows.len(), target_device)?)
            }
            None => None,
        };
        Ok(MinibatchData {
            input,
            count_sum,
            labels,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.chunks.len()
    }

    fn num_examples(&self) -> usize {
        self.input_data.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()> {
        let mut order: Vec<usize> = (0..self.input_data.len()).collect();
        order.shuffle(rng);
        self.partition(order, batch_size);
        Ok(())
    }

    fn sequential_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        let order: Vec<usize> = (0..self.input_data.len()).collect();
        self.partition(order, batch_size);
        Ok(())
    }
}

fn rows_to_tensor_vec(data: &Array2<f32>) -> Vec<Tensor> {
    let mut idx_data = data
        .axis_iter(ndarray::Axis(0))
        .enumerate()
        .par_bridge()
        .map(|(i, row)| {
            let v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                .and_then(|v| v.reshape((1, row.len())))
                .expect("failed to create tensor");
            (i, v)
        })
        .collect::<Vec<_>>();

    idx_data.sort_by_key(|(i, _)| *i);
    idx_data.into_iter().map(|(_, t)| t).collect()
}
