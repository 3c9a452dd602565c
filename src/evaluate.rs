use crate::checkpoint::{ModelRepository, SnapshotKind};
use crate::config::CheckpointChoice;
use crate::data::{CountDataSet, DataLoader, InMemoryData};
use crate::model::Model;
use crate::train::{evaluate_split, targets_for};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use log::info;

/// The optional matrices an evaluation can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputVersion {
    /// The targets as the model saw them, e.g. binarised counts.
    Transformed,
    /// Reconstruction means with decomposed predictive uncertainty.
    Reconstructed,
    /// Latent coordinates and, for mixture models, cluster posteriors.
    Latent,
}

impl OutputVersion {
    pub fn parse(name: &str) -> anyhow::Result<Self> {
        match name {
            "transformed" => Ok(OutputVersion::Transformed),
            "reconstructed" => Ok(OutputVersion::Reconstructed),
            "latent" => Ok(OutputVersion::Latent),
            other => Err(anyhow::anyhow!("unknown output version: '{}'", other)),
        }
    }

    /// Parse a request list, rejecting duplicates and unknown names
    /// before any computation runs.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> anyhow::Result<Vec<Self>> {
        let mut versions = Vec::with_capacity(names.len());
        for name in names {
            let version = Self::parse(name.as_ref())?;
            anyhow::ensure!(
                !versions.contains(&version),
                "duplicate output version: '{}'",
                name.as_ref()
            );
            versions.push(version);
        }
        Ok(versions)
    }
}

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub checkpoint: CheckpointChoice,
    pub output_versions: Vec<OutputVersion>,
    pub batch_size: usize,
    pub use_deterministic_z: bool,
    /// Restrict the uncertainty decomposition to the first `n` examples;
    /// `None` decomposes everything.
    pub uncertainty_subset: Option<usize>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointChoice::Latest,
            output_versions: vec![],
            batch_size: 100,
            use_deterministic_z: false,
            uncertainty_subset: None,
        }
    }
}

/// Reconstruction means for the whole set; the variance decomposition
/// covers the requested subset of rows.
pub struct ReconstructionView {
    pub mean: Tensor,
    pub expected_variance: Tensor,
    pub variance_of_mean: Tensor,
}

impl ReconstructionView {
    pub fn total_variance(&self) -> candle_core::Result<Tensor> {
        self.expected_variance.add(&self.variance_of_mean)
    }

    /// Standard deviation explained by the latent representation.
    pub fn explained_stddev(&self) -> candle_core::Result<Tensor> {
        self.variance_of_mean.clamp(0.0, f64::INFINITY)?.sqrt()
    }
}

pub struct LatentView {
    pub z_mean: Tensor,
    pub cluster_probabilities: Option<Tensor>,
    /// Trainable prior centroids of the mixture model, `(K, latent)`.
    pub prior_means: Option<Tensor>,
    pub prior_log_variances: Option<Tensor>,
}

pub struct EvaluationOutput {
    pub epoch: usize,
    pub lower_bound: f64,
    pub reconstruction_error: f64,
    pub kl_divergence: f64,
    pub kl_divergence_y: Option<f64>,
    pub accuracy: Option<f64>,
    pub transformed: Option<Tensor>,
    pub reconstruction: Option<ReconstructionView>,
    pub latent: Option<LatentView>,
}

/// Load the requested checkpoint into `varmap` and return its epoch.
/// Fails with a "not trained" error when the run directory holds nothing.
fn restore_checkpoint(
    repository: &dyn ModelRepository,
    varmap: &mut VarMap,
    choice: CheckpointChoice,
) -> anyhow::Result<usize> {
    match choice {
        CheckpointChoice::Latest => {
            let epoch = repository
                .latest_epoch()?
                .ok_or_else(|| anyhow::anyhow!("model has not been trained yet"))?;
            repository.load_epoch(varmap, epoch)?;
            Ok(epoch)
        }
        CheckpointChoice::EarlyStopping => {
            let epoch = repository
                .snapshot_epoch(SnapshotKind::EarlyStopping)?
                .ok_or_else(|| anyhow::anyhow!("no early-stopping checkpoint was recorded"))?;
            repository.load_snapshot(SnapshotKind::EarlyStopping, varmap)?;
            Ok(epoch)
        }
        CheckpointChoice::Best => {
            let epoch = repository
                .snapshot_epoch(SnapshotKind::Best)?
                .ok_or_else(|| anyhow::anyhow!("no best-model checkpoint was recorded"))?;
            repository.load_snapshot(SnapshotKind::Best, varmap)?;
            Ok(epoch)
        }
    }
}

pub fn evaluate(
    model: &Model,
    varmap: &mut VarMap,
    data: &CountDataSet,
    eval_config: &EvalConfig,
    repository: &dyn ModelRepository,
    device: &Device,
) -> anyhow::Result<EvaluationOutput> {
    anyhow::ensure!(eval_config.batch_size > 0, "batch size must be positive");
    if let Some(n) = eval_config.uncertainty_subset {
        anyhow::ensure!(n > 0, "uncertainty subset must be positive");
    }
    let epoch = restore_checkpoint(repository, varmap, eval_config.checkpoint)?;
    info!("evaluating the checkpoint from epoch {}", epoch);

    let stats = evaluate_split(
        model,
        data,
        eval_config.batch_size,
        device,
        eval_config.use_deterministic_z,
    )?;

    let mut loader = InMemoryData::new(data)?;
    loader.sequential_minibatch(eval_config.batch_size)?;

    let mut transformed = None;
    let mut reconstruction = None;
    let mut latent = None;

    for version in &eval_config.output_versions {
        match version {
            OutputVersion::Transformed => {
                let mut rows = vec![];
                for b in 0..loader.num_minibatch() {
                    let mb = loader.minibatch_data(b, device)?;
                    rows.push(targets_for(
                        &model.config().reconstruction_distribution,
                        &mb.input,
                    )?);
                }
                transformed = Some(Tensor::cat(&rows, 0)?);
            }
            OutputVersion::Reconstructed => {
                reconstruction = Some(reconstruction_view(model, &loader, eval_config, device)?);
            }
            OutputVersion::Latent => {
                let mut z_rows = vec![];
                let mut q_rows = vec![];
                for b in 0..loader.num_minibatch() {
                    let mb = loader.minibatch_data(b, device)?;
                    z_rows.push(model.latent_mean(&mb.input)?);
                    if let Some(q) = model.cluster_probabilities(&mb.input)? {
                        q_rows.push(q);
                    }
                }
                let cluster_probabilities = if q_rows.is_empty() {
                    None
                } else {
                    Some(Tensor::cat(&q_rows, 0)?)
                };
                let (prior_means, prior_log_variances) = match model {
                    Model::Gmvae(m) => {
                        let (means, lnvars) = m.prior_parameters()?;
                        (Some(means), Some(lnvars))
                    }
                    Model::Vae(_) => (None, None),
                };
                latent = Some(LatentView {
                    z_mean: Tensor::cat(&z_rows, 0)?,
                    cluster_probabilities,
                    prior_means,
                    prior_log_variances,
                });
            }
        }
    }

    Ok(EvaluationOutput {
        epoch,
        lower_bound: stats.lower_bound,
        reconstruction_error: stats.reconstruction_error,
        kl_divergence: stats.kl_divergence,
        kl_divergence_y: stats.kl_divergence_y,
        accuracy: stats.accuracy,
        transformed,
        reconstruction,
        latent,
    })
}

fn reconstruction_view(
    model: &Model,
    loader: &InMemoryData,
    eval_config: &EvalConfig,
    device: &Device,
) -> anyhow::Result<ReconstructionView> {
    let limit = eval_config
        .uncertainty_subset
        .unwrap_or(loader.num_examples());

    let mut mean_rows = vec![];
    let mut ev_rows = vec![];
    let mut vom_rows = vec![];
    let mut decomposed = 0usize;

    for b in 0..loader.num_minibatch() {
        let mb = loader.minibatch_data(b, device)?;
        let moments = model.reconstruction_moments(&mb.input, &mb.count_sum)?;
        let rows = moments.mean.dim(0)?;
        mean_rows.push(moments.mean);
        if decomposed < limit {
            let take = rows.min(limit - decomposed);
            ev_rows.push(moments.expected_variance.narrow(0, 0, take)?);
            vom_rows.push(moments.variance_of_mean.narrow(0, 0, take)?);
            decomposed += take;
        }
    }

    Ok(ReconstructionView {
        mean: Tensor::cat(&mean_rows, 0)?,
        expected_variance: Tensor::cat(&ev_rows, 0)?,
        variance_of_mean: Tensor::cat(&vom_rows, 0)?,
    })
}

/// Clustering accuracy under the best one-to-one matching of clusters to
/// label classes on the contingency table.
pub fn cluster_accuracy(assignments: &[u32], labels: &[u32]) -> f64 {
    debug_assert_eq!(assignments.len(), labels.len());
    if assignments.is_empty() {
        return 0.0;
    }
    let n_clusters = assignments.iter().map(|&a| a as usize + 1).max().unwrap_or(1);
    let n_classes = labels.iter().map(|&l| l as usize + 1).max().unwrap_or(1);

    let mut contingency = vec![vec![0usize; n_classes]; n_clusters];
    for (&a, &l) in assignments.iter().zip(labels.iter()) {
        contingency[a as usize][l as usize] += 1;
    }

    optimal_matching(&contingency) as f64 / assignments.len() as f64
}

/// Maximum-weight one-to-one matching on the contingency table, solved
/// with the Hungarian algorithm on the negated counts (zero-padded to a
/// square matrix so unmatched clusters and classes contribute nothing).
fn optimal_matching(contingency: &[Vec<usize>]) -> usize {
    let n = contingency.len().max(contingency[0].len());
    let count = |i: usize, j: usize| -> usize {
        contingency
            .get(i)
            .and_then(|row| row.get(j))
            .copied()
            .unwrap_or(0)
    };

    // row and column potentials, with p[j] the row matched to column j
    let mut u = vec![0i64; n + 1];
    let mut v = vec![0i64; n + 1];
    let mut matched_row = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];
    for i in 1..=n {
        matched_row[0] = i;
        let mut j0 = 0usize;
        let mut min_slack = vec![i64::MAX; n + 1];
        let mut visited = vec![false; n + 1];
        loop {
            visited[j0] = true;
            let i0 = matched_row[j0];
            let mut delta = i64::MAX;
            let mut j1 = 0usize;
            for j in 1..=n {
                if visited[j] {
                    continue;
                }
                let slack = -(count(i0 - 1, j - 1) as i64) - u[i0] - v[j];
                if slack < min_slack[j] {
                    min_slack[j] = slack;
                    way[j] = j0;
                }
                if min_slack[j] < delta {
                    delta = min_slack[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if visited[j] {
                    u[matched_row[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_slack[j] -= delta;
                }
            }
            j0 = j1;
            if matched_row[j0] == 0 {
                break;
            }
        }
        // walk the augmenting path back and flip the matching
        loop {
            let j1 = way[j0];
            matched_row[j0] = matched_row[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    (1..=n).map(|j| count(matched_row[j] - 1, j - 1)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn output_versions_reject_duplicates_and_unknowns() {
        assert!(OutputVersion::parse_list(&["transformed", "latent"]).is_ok());
        assert!(OutputVersion::parse_list(&["latent", "latent"]).is_err());
        assert!(OutputVersion::parse_list(&["imputed"]).is_err());
        assert_eq!(
            OutputVersion::parse_list(&["reconstructed"]).ok(),
            Some(vec![OutputVersion::Reconstructed])
        );
    }

    #[test]
    fn perfect_clustering_scores_one() {
        // clusters are a relabelling of the classes
        let labels = vec![0, 0, 1, 1, 2, 2];
        let assignments = vec![2, 2, 0, 0, 1, 1];
        assert_relative_eq!(cluster_accuracy(&assignments, &labels), 1.0);
    }

    #[test]
    fn mixed_clusters_score_their_majority_overlap() {
        let labels = vec![0, 0, 0, 1, 1, 1];
        let assignments = vec![0, 0, 1, 1, 1, 0];
        // cluster 0 -> class 0 (2 hits), cluster 1 -> class 1 (2 hits)
        assert_relative_eq!(cluster_accuracy(&assignments, &labels), 4.0 / 6.0);
    }

    #[test]
    fn matching_trades_a_large_cell_for_a_better_total() {
        // cluster 0: 5x class 0 and 4x class 1; cluster 1: 5x class 0.
        // taking the single largest cell first would leave cluster 1
        // with nothing; the best matching scores 5 + 4 of 14.
        let mut assignments = vec![];
        let mut labels = vec![];
        for _ in 0..5 {
            assignments.push(0);
            labels.push(0);
        }
        for _ in 0..4 {
            assignments.push(0);
            labels.push(1);
        }
        for _ in 0..5 {
            assignments.push(1);
            labels.push(0);
        }
        assert_relative_eq!(cluster_accuracy(&assignments, &labels), 9.0 / 14.0);
    }

    #[test]
    fn extra_clusters_leave_unmatched_examples_unscored() {
        let labels = vec![0, 0, 0, 0];
        let assignments = vec![0, 1, 2, 3];
        assert_relative_eq!(cluster_accuracy(&assignments, &labels), 0.25);
    }

    #[test]
    fn empty_input_scores_zero() {
        assert_relative_eq!(cluster_accuracy(&[], &[]), 0.0);
    }
}
