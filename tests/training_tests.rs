use lentil::checkpoint::{
    CurvePoint, DiskRepository, MemoryRepository, ModelRepository, SnapshotKind, Split,
};
use lentil::config::{CheckpointChoice, LatentPrior, ModelConfig, SampleCounts, TrainConfig};
use lentil::data::CountDataSet;
use lentil::evaluate::{EvalConfig, OutputVersion, evaluate};
use lentil::model::Model;
use lentil::train::{TrainOutcome, train};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use ndarray::Array2;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn toy_counts(n: usize, d: usize) -> CountDataSet {
    let values = Array2::from_shape_fn((n, d), |(i, j)| ((i * 7 + j * 3) % 5) as f32);
    CountDataSet::new(values)
}

fn labelled_counts(n: usize, d: usize, classes: usize) -> CountDataSet {
    let values = Array2::from_shape_fn((n, d), |(i, j)| {
        let class = i % classes;
        (((i + j) % 3) + 4 * usize::from(j % classes == class)) as f32
    });
    let labels: Vec<u32> = (0..n).map(|i| (i % classes) as u32).collect();
    CountDataSet::with_labels(values, labels).unwrap()
}

fn bernoulli_config() -> ModelConfig {
    ModelConfig {
        feature_size: 20,
        latent_size: 2,
        hidden_sizes: vec![10],
        reconstruction_distribution: "bernoulli".to_string(),
        analytical_kl: true,
        ..ModelConfig::default()
    }
}

fn build_model(config: &ModelConfig) -> (VarMap, Model) {
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = Model::new(config, vs).unwrap();
    (varmap, model)
}

fn weights_by_name(varmap: &VarMap) -> anyhow::Result<Vec<(String, Vec<f32>)>> {
    let data = varmap.data().lock().unwrap();
    let mut out: Vec<(String, Vec<f32>)> = vec![];
    for (name, var) in data.iter() {
        out.push((name.clone(), var.flatten_all()?.to_vec1::<f32>()?));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn quick_train_config(epochs: usize) -> TrainConfig {
    TrainConfig {
        number_of_epochs: epochs,
        batch_size: 20,
        learning_rate: 1e-2,
        ..TrainConfig::default()
    }
}

#[test]
fn bernoulli_vae_trains_end_to_end() -> anyhow::Result<()> {
    init_logging();
    let data = toy_counts(100, 20);
    let config = bernoulli_config();
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();

    let status = train(
        &model,
        &mut varmap,
        &data,
        None,
        &quick_train_config(5),
        &repo,
        &Device::Cpu,
    )?;
    assert_eq!(status.outcome, TrainOutcome::Completed);
    assert_eq!(status.epochs_trained, 5);

    let curve = repo.load_curves(Split::Training)?;
    assert_eq!(curve.len(), 5);
    for point in &curve {
        assert!(point.lower_bound.is_finite());
        assert!(point.kl_divergence >= -1e-4, "KL: {}", point.kl_divergence);
        assert!(point.kl_divergence_y.is_none());
        // analytic KL also yields the per-dimension trace
        assert_eq!(
            point.kl_divergence_neurons.as_ref().map(|v| v.len()),
            Some(2)
        );
    }
    // the bound should improve over five epochs on this tiny problem
    assert!(curve.last().unwrap().lower_bound > curve.first().unwrap().lower_bound);

    // only the latest epoch checkpoint survives
    assert_eq!(repo.list_epochs()?, vec![5]);

    // without a validation set neither snapshot slot is written
    assert_eq!(repo.snapshot_epoch(SnapshotKind::Best)?, None);
    assert_eq!(repo.snapshot_epoch(SnapshotKind::EarlyStopping)?, None);
    Ok(())
}

#[test]
fn finished_runs_are_not_retrained() -> anyhow::Result<()> {
    let data = toy_counts(60, 20);
    let config = bernoulli_config();
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();
    let train_config = quick_train_config(3);

    train(&model, &mut varmap, &data, None, &train_config, &repo, &Device::Cpu)?;
    let weights_before = varmap.all_vars()[0].flatten_all()?.to_vec1::<f32>()?;

    let again = train(&model, &mut varmap, &data, None, &train_config, &repo, &Device::Cpu)?;
    assert_eq!(again.outcome, TrainOutcome::AlreadyTrained);
    assert_eq!(again.epochs_trained, 0);
    let weights_after = varmap.all_vars()[0].flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(weights_before, weights_after);
    assert_eq!(repo.load_curves(Split::Training)?.len(), 3);
    Ok(())
}

#[test]
fn interrupted_runs_resume_from_the_last_checkpoint() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let data = toy_counts(60, 20);
    let config = bernoulli_config();
    let repo = DiskRepository::new(dir.path(), &config.name(), "resume")?;

    let (mut varmap, model) = build_model(&config);
    let first = train(
        &model,
        &mut varmap,
        &data,
        None,
        &quick_train_config(2),
        &repo,
        &Device::Cpu,
    )?;
    assert_eq!(first.outcome, TrainOutcome::Completed);
    assert_eq!(repo.latest_epoch()?, Some(2));

    // a fresh process rebuilds the model and picks up at epoch 2
    let (mut varmap2, model2) = build_model(&config);
    let second = train(
        &model2,
        &mut varmap2,
        &data,
        None,
        &quick_train_config(5),
        &repo,
        &Device::Cpu,
    )?;
    assert_eq!(second.outcome, TrainOutcome::Completed);
    assert_eq!(second.epochs_trained, 3);
    assert_eq!(repo.latest_epoch()?, Some(5));
    let epochs: Vec<usize> = repo
        .load_curves(Split::Training)?
        .iter()
        .map(|p| p.epoch)
        .collect();
    assert_eq!(epochs, vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn best_checkpoint_tracks_the_maximal_monitored_bound() -> anyhow::Result<()> {
    let data = toy_counts(80, 20);
    let (train_set, valid_set) = data.split_validation(0.25)?;
    let config = bernoulli_config();
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();

    let status = train(
        &model,
        &mut varmap,
        &train_set,
        Some(&valid_set),
        &quick_train_config(6),
        &repo,
        &Device::Cpu,
    )?;
    assert_eq!(status.outcome, TrainOutcome::Completed);

    let valid_curve = repo.load_curves(Split::Validation)?;
    assert_eq!(valid_curve.len(), 6);
    let best_epoch = valid_curve
        .iter()
        .max_by(|a, b| a.lower_bound.total_cmp(&b.lower_bound))
        .map(|p| p.epoch);
    assert_eq!(repo.snapshot_epoch(SnapshotKind::Best)?, best_epoch);
    Ok(())
}

#[test]
fn early_stopping_keeps_the_checkpoint_before_the_stall() -> anyhow::Result<()> {
    let data = toy_counts(80, 20);
    let (train_set, valid_set) = data.split_validation(0.25)?;
    let config = bernoulli_config();
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();

    // seed the run directory with an epoch-1 checkpoint whose validation
    // bound no later epoch can beat, so epoch 2 stalls immediately
    repo.save_epoch(&varmap, 1)?;
    let initial_weights = weights_by_name(&varmap)?;
    repo.append_curve_point(
        Split::Validation,
        &CurvePoint {
            epoch: 1,
            lower_bound: f64::MAX,
            reconstruction_error: 0.0,
            kl_divergence: 0.0,
            kl_divergence_y: None,
            kl_divergence_neurons: None,
            accuracy: None,
        },
    )?;

    let status = train(
        &model,
        &mut varmap,
        &train_set,
        Some(&valid_set),
        &quick_train_config(2),
        &repo,
        &Device::Cpu,
    )?;
    assert_eq!(status.outcome, TrainOutcome::Completed);
    assert_eq!(status.epochs_trained, 1);

    // the candidate is the epoch trained before the stall, not the
    // stalled epoch itself
    assert_eq!(repo.snapshot_epoch(SnapshotKind::EarlyStopping)?, Some(1));
    let (mut restored, _) = build_model(&config);
    repo.load_snapshot(SnapshotKind::EarlyStopping, &mut restored)?;
    assert_eq!(weights_by_name(&restored)?, initial_weights);
    assert_ne!(weights_by_name(&varmap)?, initial_weights);
    Ok(())
}

#[test]
fn concurrent_runs_against_one_directory_are_rejected() -> anyhow::Result<()> {
    let data = toy_counts(40, 20);
    let config = bernoulli_config();
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();
    repo.acquire_lock()?;

    let result = train(
        &model,
        &mut varmap,
        &data,
        None,
        &quick_train_config(1),
        &repo,
        &Device::Cpu,
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn gmvae_trains_and_reports_cluster_statistics() -> anyhow::Result<()> {
    init_logging();
    let classes = 3;
    let data = labelled_counts(90, 12, classes);
    let config = ModelConfig {
        feature_size: 12,
        latent_size: 2,
        hidden_sizes: vec![8],
        reconstruction_distribution: "poisson".to_string(),
        latent_prior: LatentPrior::GaussianMixture { clusters: classes },
        ..ModelConfig::default()
    };
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();

    let status = train(
        &model,
        &mut varmap,
        &data,
        None,
        &quick_train_config(3),
        &repo,
        &Device::Cpu,
    )?;
    assert_eq!(status.outcome, TrainOutcome::Completed);

    let curve = repo.load_curves(Split::Training)?;
    for point in &curve {
        let kl_y = point.kl_divergence_y.expect("mixture KL-y");
        assert!(kl_y >= -1e-4);
        assert!(kl_y <= (classes as f64).ln() + 1e-4);
        let accuracy = point.accuracy.expect("labelled accuracy");
        assert!((0.0..=1.0).contains(&accuracy));
    }
    Ok(())
}

#[test]
fn evaluation_requires_a_trained_model() -> anyhow::Result<()> {
    let data = toy_counts(30, 20);
    let config = bernoulli_config();
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();

    let result = evaluate(
        &model,
        &mut varmap,
        &data,
        &EvalConfig::default(),
        &repo,
        &Device::Cpu,
    );
    let err = match result {
        Ok(_) => anyhow::bail!("evaluation succeeded without any checkpoint"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("not been trained"));
    Ok(())
}

#[test]
fn evaluation_produces_the_requested_output_views() -> anyhow::Result<()> {
    let data = toy_counts(50, 20);
    let config = ModelConfig {
        monte_carlo_samples: SampleCounts {
            training: 1,
            evaluation: 3,
        },
        ..bernoulli_config()
    };
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();
    train(
        &model,
        &mut varmap,
        &data,
        None,
        &quick_train_config(2),
        &repo,
        &Device::Cpu,
    )?;

    let eval_config = EvalConfig {
        checkpoint: CheckpointChoice::Latest,
        output_versions: OutputVersion::parse_list(&["transformed", "reconstructed", "latent"])?,
        batch_size: 16,
        use_deterministic_z: false,
        uncertainty_subset: Some(7),
    };
    let output = evaluate(&model, &mut varmap, &data, &eval_config, &repo, &Device::Cpu)?;

    assert_eq!(output.epoch, 2);
    assert!(output.lower_bound.is_finite());

    let transformed = output.transformed.expect("transformed view");
    assert_eq!(transformed.dims(), &[50, 20]);
    let max = transformed.max_all()?.to_scalar::<f32>()?;
    assert!(max <= 1.0, "bernoulli targets must be binarised");

    let reconstruction = output.reconstruction.expect("reconstruction view");
    assert_eq!(reconstruction.mean.dims(), &[50, 20]);
    assert_eq!(reconstruction.expected_variance.dims(), &[7, 20]);
    assert_eq!(reconstruction.variance_of_mean.dims(), &[7, 20]);
    let stddev_min = reconstruction
        .explained_stddev()?
        .min_all()?
        .to_scalar::<f32>()?;
    assert!(stddev_min >= 0.0);

    let latent = output.latent.expect("latent view");
    assert_eq!(latent.z_mean.dims(), &[50, 2]);
    assert!(latent.cluster_probabilities.is_none());
    Ok(())
}

#[test]
fn gmvae_evaluation_exposes_cluster_posteriors_and_prior_centroids() -> anyhow::Result<()> {
    let data = labelled_counts(60, 12, 3);
    let config = ModelConfig {
        feature_size: 12,
        latent_size: 2,
        hidden_sizes: vec![8],
        reconstruction_distribution: "poisson".to_string(),
        latent_prior: LatentPrior::GaussianMixture { clusters: 3 },
        ..ModelConfig::default()
    };
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();
    train(
        &model,
        &mut varmap,
        &data,
        None,
        &quick_train_config(2),
        &repo,
        &Device::Cpu,
    )?;

    let eval_config = EvalConfig {
        output_versions: vec![OutputVersion::Latent],
        ..EvalConfig::default()
    };
    let output = evaluate(&model, &mut varmap, &data, &eval_config, &repo, &Device::Cpu)?;
    assert!(output.kl_divergence_y.is_some());
    assert!(output.accuracy.is_some());

    let latent = output.latent.expect("latent view");
    let q = latent.cluster_probabilities.expect("cluster posteriors");
    assert_eq!(q.dims(), &[60, 3]);
    let sums = q.sum(1)?.to_vec1::<f32>()?;
    for s in sums {
        assert!((s - 1.0).abs() < 1e-4);
    }
    assert_eq!(latent.prior_means.map(|t| t.dims().to_vec()), Some(vec![3, 2]));
    Ok(())
}

#[test]
fn snapshot_choices_are_validated_against_what_was_recorded() -> anyhow::Result<()> {
    let data = toy_counts(40, 20);
    let (train_set, valid_set) = data.split_validation(0.25)?;
    let config = bernoulli_config();
    let (mut varmap, model) = build_model(&config);
    let repo = MemoryRepository::new();
    train(
        &model,
        &mut varmap,
        &train_set,
        Some(&valid_set),
        &quick_train_config(2),
        &repo,
        &Device::Cpu,
    )?;

    // the best snapshot always exists after a validated run
    let best = evaluate(
        &model,
        &mut varmap,
        &data,
        &EvalConfig {
            checkpoint: CheckpointChoice::Best,
            ..EvalConfig::default()
        },
        &repo,
        &Device::Cpu,
    )?;
    assert!(best.epoch >= 1);

    // an early-stopping snapshot only exists once the bound stalls
    if repo.snapshot_epoch(SnapshotKind::EarlyStopping)?.is_none() {
        let result = evaluate(
            &model,
            &mut varmap,
            &data,
            &EvalConfig {
                checkpoint: CheckpointChoice::EarlyStopping,
                ..EvalConfig::default()
            },
            &repo,
            &Device::Cpu,
        );
        assert!(result.is_err());
    }
    Ok(())
}
