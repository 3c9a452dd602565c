use crate::checkpoint::{CurvePoint, ModelRepository, SnapshotKind, Split};
use crate::config::TrainConfig;
use crate::data::{CountDataSet, DataLoader, InMemoryData};
use crate::distributions::DistKind;
use crate::evaluate::cluster_accuracy;
use crate::loss::warm_up_weight;
use crate::model::Model;
use crate::optimizer::ClippedAdamW;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Completed,
    /// The requested epoch count was already reached by an earlier run.
    AlreadyTrained,
    /// The aggregated loss stopped being finite at this epoch.
    Diverged { epoch: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct TrainStatus {
    pub outcome: TrainOutcome,
    pub epochs_trained: usize,
    pub stopped_early: bool,
}

/// Early-stopping bookkeeping reconstructed from a learning curve: the
/// reference bound and how many trailing epochs sit below it. The first
/// stalled epoch lowers the reference to its own bound, so a plateau
/// below a peak does not keep counting as a stall.
pub(crate) fn early_stopping_state(curve: &[CurvePoint]) -> (f64, usize) {
    let mut reference = f64::NEG_INFINITY;
    let mut stalled = 0usize;
    for point in curve {
        if point.lower_bound < reference {
            if stalled == 0 {
                reference = point.lower_bound;
            }
            stalled += 1;
        } else {
            reference = point.lower_bound;
            stalled = 0;
        }
    }
    (reference, stalled)
}

/// Every epoch draws its shuffle order from the run seed and the epoch
/// index alone, so a resumed run replays the same orders as an
/// uninterrupted one.
pub(crate) fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(epoch as u64))
}

/// Train a model against a repository, resuming from its latest epoch
/// checkpoint when one exists.
pub fn train(
    model: &Model,
    varmap: &mut VarMap,
    training_set: &CountDataSet,
    validation_set: Option<&CountDataSet>,
    train_config: &TrainConfig,
    repository: &dyn ModelRepository,
    device: &Device,
) -> anyhow::Result<TrainStatus> {
    model.config().validate()?;
    train_config.validate()?;

    repository.acquire_lock()?;
    let status = run_training(
        model,
        varmap,
        training_set,
        validation_set,
        train_config,
        repository,
        device,
    );
    repository.release_lock()?;
    status
}

fn run_training(
    model: &Model,
    varmap: &mut VarMap,
    training_set: &CountDataSet,
    validation_set: Option<&CountDataSet>,
    train_config: &TrainConfig,
    repository: &dyn ModelRepository,
    device: &Device,
) -> anyhow::Result<TrainStatus> {
    let started = Instant::now();
    let config = model.config().clone();
    let batch_size = train_config.effective_batch_size(&config);

    // resume bookkeeping comes from the run directory and curves alone
    let start_epoch = match repository.latest_epoch()? {
        Some(epoch) if epoch >= train_config.number_of_epochs => {
            info!(
                "already trained for {} epochs, nothing to do",
                train_config.number_of_epochs
            );
            return Ok(TrainStatus {
                outcome: TrainOutcome::AlreadyTrained,
                epochs_trained: 0,
                stopped_early: false,
            });
        }
        Some(epoch) => {
            info!("resuming from epoch {}", epoch);
            repository.load_epoch(varmap, epoch)?;
            epoch
        }
        None => 0,
    };

    // early stopping and the best-model slot both monitor the
    // validation curve; without a validation set neither runs
    let has_validation = validation_set.is_some();
    let validation_curve = repository.load_curves(Split::Validation)?;
    let (mut reference, mut stalled) = if has_validation {
        early_stopping_state(&validation_curve)
    } else {
        (f64::NEG_INFINITY, 0)
    };
    let mut frozen = has_validation && stalled >= train_config.early_stopping_rounds;
    let mut best_lower_bound = validation_curve
        .iter()
        .map(|p| p.lower_bound)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut optimizer = ClippedAdamW::new(varmap, train_config.learning_rate)?;

    let pb = ProgressBar::new(train_config.number_of_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb.inc(start_epoch as u64);

    let mut stopped_early = frozen;
    let mut epochs_trained = 0usize;
    let mut clean_loader = InMemoryData::new(training_set)?;

    for epoch in start_epoch..train_config.number_of_epochs {
        let epoch_number = epoch + 1;
        let warm_up = warm_up_weight(epoch, config.warm_up_epochs);

        // the noise hook yields a fresh corrupted copy every epoch
        let mut noisy_loader = match training_set.noisy_preprocess {
            Some(f) => Some(InMemoryData::new(&training_set.map_values(f))?),
            None => None,
        };
        let loader = noisy_loader.as_mut().unwrap_or(&mut clean_loader);
        let mut rng = epoch_rng(train_config.seed, epoch);
        loader.shuffle_minibatch(batch_size, &mut rng)?;
        if epoch == start_epoch {
            optimizer.set_global_step(start_epoch * loader.num_minibatch());
        }

        let num_minibatch = loader.num_minibatch();
        let log_every = (num_minibatch / 10).max(1);

        for b in 0..num_minibatch {
            let mb = loader.minibatch_data(b, device)?;
            let target = targets_for(&config.reconstruction_distribution, &mb.input)?;
            let losses =
                model.batch_losses(&mb.input, &mb.count_sum, &target, warm_up, false, true)?;

            let objective = losses.objective.to_scalar::<f32>()?;
            if !objective.is_finite() {
                warn!(
                    "loss diverged at epoch {} minibatch {}: {}",
                    epoch_number, b, objective
                );
                repository.append_metadata(&format!("diverged at epoch {}", epoch_number))?;
                return Ok(TrainStatus {
                    outcome: TrainOutcome::Diverged {
                        epoch: epoch_number,
                    },
                    epochs_trained,
                    stopped_early,
                });
            }
            optimizer.backward_step(&losses.objective)?;

            if train_config.verbose && (b + 1) % log_every == 0 {
                info!(
                    "[{}] minibatch {}/{} objective {:.4}",
                    epoch_number,
                    b + 1,
                    num_minibatch,
                    objective
                );
            }
        }

        repository.save_epoch(varmap, epoch_number)?;

        let train_stats = evaluate_split(model, training_set, batch_size, device, false)?;
        repository.append_curve_point(Split::Training, &train_stats.curve_point(epoch_number))?;
        let monitored = match validation_set {
            Some(valid) => {
                let valid_stats = evaluate_split(model, valid, batch_size, device, false)?;
                let point = valid_stats.curve_point(epoch_number);
                repository.append_curve_point(Split::Validation, &point)?;
                valid_stats
            }
            None => train_stats,
        };
        if train_config.verbose {
            info!(
                "[{}] lower bound {:.4} reconstruction error {:.4} KL {:.4}",
                epoch_number,
                monitored.lower_bound,
                monitored.reconstruction_error,
                monitored.kl_divergence
            );
        }

        // early stopping: the first stalled epoch lowers the reference
        // to its own bound and keeps the previous epoch's checkpoint as
        // the candidate; a recovery discards it again
        if has_validation && !frozen {
            if monitored.lower_bound < reference {
                if stalled == 0 {
                    reference = monitored.lower_bound;
                    let previous = epoch_number - 1;
                    if repository.list_epochs()?.contains(&previous) {
                        repository.snapshot_from_epoch(SnapshotKind::EarlyStopping, previous)?;
                    }
                }
                stalled += 1;
                if stalled >= train_config.early_stopping_rounds {
                    info!(
                        "early stopping criterion met at epoch {} ({} stalled epochs)",
                        epoch_number, stalled
                    );
                    frozen = true;
                    stopped_early = true;
                }
            } else {
                reference = monitored.lower_bound;
                if stalled > 0 {
                    repository.clear_snapshot(SnapshotKind::EarlyStopping)?;
                }
                stalled = 0;
            }
        }

        // single best-ever checkpoint, overwritten in place
        if has_validation && monitored.lower_bound > best_lower_bound {
            best_lower_bound = monitored.lower_bound;
            repository.save_snapshot(SnapshotKind::Best, varmap, epoch_number)?;
        }

        epochs_trained += 1;
        pb.inc(1);
    }
    pb.finish_and_clear();

    repository.prune_to_latest()?;
    repository.append_metadata(&format!(
        "trained epochs {}..{} in {:.1}s (model {})",
        start_epoch + 1,
        train_config.number_of_epochs,
        started.elapsed().as_secs_f64(),
        config.name()
    ))?;

    Ok(TrainStatus {
        outcome: TrainOutcome::Completed,
        epochs_trained,
        stopped_early,
    })
}

/// Learning target per batch; Bernoulli reconstruction trains against
/// binarised counts.
pub(crate) fn targets_for(
    reconstruction_distribution: &str,
    input: &Tensor,
) -> candle_core::Result<Tensor> {
    let spec = crate::distributions::resolve(reconstruction_distribution)
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    if spec.kind == DistKind::Bernoulli {
        input.gt(0.5)?.to_dtype(DType::F32)
    } else {
        Ok(input.clone())
    }
}

/// Mean losses of one data split in eval mode.
pub(crate) struct SplitStats {
    pub lower_bound: f64,
    pub reconstruction_error: f64,
    pub kl_divergence: f64,
    pub kl_divergence_y: Option<f64>,
    pub kl_divergence_neurons: Option<Vec<f64>>,
    pub accuracy: Option<f64>,
}

impl SplitStats {
    pub fn curve_point(&self, epoch: usize) -> CurvePoint {
        CurvePoint {
            epoch,
            lower_bound: self.lower_bound,
            reconstruction_error: self.reconstruction_error,
            kl_divergence: self.kl_divergence,
            kl_divergence_y: self.kl_divergence_y,
            kl_divergence_neurons: self.kl_divergence_neurons.clone(),
            accuracy: self.accuracy,
        }
    }
}

pub(crate) fn evaluate_split(
    model: &Model,
    data: &CountDataSet,
    batch_size: usize,
    device: &Device,
    deterministic_z: bool,
) -> anyhow::Result<SplitStats> {
    let config = model.config();
    let mut loader = InMemoryData::new(data)?;
    loader.sequential_minibatch(batch_size)?;

    let n = loader.num_examples() as f64;
    let mut lower_bound = 0.0;
    let mut reconstruction_error = 0.0;
    let mut kl_divergence = 0.0;
    let mut kl_divergence_y: Option<f64> = None;
    let mut kl_neurons: Option<Vec<f64>> = None;
    let mut assignments: Vec<u32> = vec![];
    let mut labels: Vec<u32> = vec![];

    for b in 0..loader.num_minibatch() {
        let mb = loader.minibatch_data(b, device)?;
        let rows = mb.input.dim(0)? as f64;
        let weight = rows / n;
        let target = targets_for(&config.reconstruction_distribution, &mb.input)?;
        let losses =
            model.batch_losses(&mb.input, &mb.count_sum, &target, 1.0, deterministic_z, false)?;

        lower_bound += weight * losses.lower_bound.to_scalar::<f32>()? as f64;
        reconstruction_error += weight * losses.reconstruction_error.to_scalar::<f32>()? as f64;
        kl_divergence += weight * losses.kl_divergence.to_scalar::<f32>()? as f64;
        if let Some(kl_y) = &losses.kl_divergence_y {
            let value = weight * kl_y.to_scalar::<f32>()? as f64;
            *kl_divergence_y.get_or_insert(0.0) += value;
        }
        if let Some(per_dim) = &losses.kl_per_dimension {
            let values = per_dim.to_vec1::<f32>()?;
            let acc = kl_neurons.get_or_insert_with(|| vec![0.0; values.len()]);
            for (slot, v) in acc.iter_mut().zip(values.iter()) {
                *slot += weight * *v as f64;
            }
        }

        if let (Some(probs), Some(mb_labels)) =
            (model.cluster_probabilities(&mb.input)?, &mb.labels)
        {
            let picked = probs.argmax(1)?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
            assignments.extend(picked);
            labels.extend(mb_labels.to_vec1::<u32>()?);
        }
    }

    let accuracy = if assignments.is_empty() {
        None
    } else {
        Some(cluster_accuracy(&assignments, &labels))
    };

    Ok(SplitStats {
        lower_bound,
        reconstruction_error,
        kl_divergence,
        kl_divergence_y,
        kl_divergence_neurons: kl_neurons,
        accuracy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(epoch: usize, lb: f64) -> CurvePoint {
        CurvePoint {
            epoch,
            lower_bound: lb,
            reconstruction_error: 0.0,
            kl_divergence: 0.0,
            kl_divergence_y: None,
            kl_divergence_neurons: None,
            accuracy: None,
        }
    }

    #[test]
    fn stall_counting_resets_on_improvement() {
        let curve = vec![
            point(1, -10.0),
            point(2, -9.0),
            point(3, -9.5),
            point(4, -9.8),
            point(5, -8.0),
            point(6, -8.5),
        ];
        let (reference, stalled) = early_stopping_state(&curve);
        assert_eq!(reference, -8.5);
        assert_eq!(stalled, 1);
    }

    #[test]
    fn a_plateau_below_the_peak_does_not_keep_stalling() {
        let curve = vec![point(1, -5.0), point(2, -6.0), point(3, -6.0), point(4, -6.0)];
        let (reference, stalled) = early_stopping_state(&curve);
        assert_eq!(reference, -6.0);
        assert_eq!(stalled, 0);
    }

    #[test]
    fn consecutive_drops_keep_the_lowered_reference() {
        let curve = vec![point(1, -5.0), point(2, -6.0), point(3, -6.5), point(4, -7.0)];
        let (reference, stalled) = early_stopping_state(&curve);
        assert_eq!(reference, -6.0);
        assert_eq!(stalled, 3);
    }

    #[test]
    fn epoch_shuffle_seeds_are_reproducible_after_resume() {
        use rand::RngCore;
        let full: Vec<u64> = (0..4).map(|e| epoch_rng(11, e).next_u64()).collect();
        let resumed: Vec<u64> = (2..4).map(|e| epoch_rng(11, e).next_u64()).collect();
        assert_eq!(&full[2..], &resumed[..]);
        assert_ne!(full[0], full[1]);
    }

    #[test]
    fn empty_curve_starts_fresh() {
        let (reference, stalled) = early_stopping_state(&[]);
        assert_eq!(reference, f64::NEG_INFINITY);
        assert_eq!(stalled, 0);
    }

    #[test]
    fn ties_count_as_improvement() {
        let curve = vec![point(1, -5.0), point(2, -5.0), point(3, -5.0)];
        let (reference, stalled) = early_stopping_state(&curve);
        assert_eq!(reference, -5.0);
        assert_eq!(stalled, 0);
    }

    #[test]
    fn bernoulli_targets_are_binarised() -> anyhow::Result<()> {
        let x = Tensor::new(&[[0.0f32, 1.0, 7.0]], &Device::Cpu)?;
        let t = targets_for("bernoulli", &x)?;
        assert_eq!(t.flatten_all()?.to_vec1::<f32>()?, vec![0.0, 1.0, 1.0]);
        let t = targets_for("poisson", &x)?;
        assert_eq!(t.flatten_all()?.to_vec1::<f32>()?, vec![0.0, 1.0, 7.0]);
        Ok(())
    }
}
