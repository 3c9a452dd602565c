use crate::distributions::resolve;

use serde::{Deserialize, Serialize};

/// Monte Carlo / importance sample counts, separate for training and
/// evaluation passes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleCounts {
    pub training: usize,
    pub evaluation: usize,
}

impl Default for SampleCounts {
    fn default() -> Self {
        Self {
            training: 1,
            evaluation: 1,
        }
    }
}

/// Dropout rates per layer kind: the hidden layers of both trunks, the
/// encoder's feature input, and the decoder's latent input.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DropoutRates {
    pub hidden: f32,
    pub input: f32,
    pub latent: f32,
}

impl DropoutRates {
    /// Same rate on the hidden layers only; inputs stay untouched.
    pub fn hidden_only(rate: f32) -> Self {
        Self {
            hidden: rate,
            ..Self::default()
        }
    }

    fn all(&self) -> [(f32, &'static str); 3] {
        [
            (self.hidden, "hidden"),
            (self.input, "input"),
            (self.latent, "latent"),
        ]
    }
}

/// Prior over the latent space of the plain VAE, or the mixture structure
/// of the Gaussian-mixture VAE.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LatentPrior {
    /// Standard normal, fixed.
    Unit,
    /// Single Gaussian with trainable mean and log variance.
    Trainable,
    /// Trainable Gaussian mixture prior on a plain VAE.
    Mixture { components: usize },
    /// Full Gaussian-mixture VAE with a categorical posterior over
    /// clusters.
    GaussianMixture { clusters: usize },
}

impl LatentPrior {
    pub fn is_mixture(&self) -> bool {
        matches!(
            self,
            LatentPrior::Mixture { .. } | LatentPrior::GaussianMixture { .. }
        )
    }
}

/// Everything that determines the model graph and its objective. Two
/// equal configs name the same model directory; any difference yields a
/// different name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub feature_size: usize,
    pub latent_size: usize,
    pub hidden_sizes: Vec<usize>,
    pub reconstruction_distribution: String,
    /// k_max of the zero-inflation wrapper; 0 disables it.
    pub number_of_reconstruction_classes: usize,
    pub latent_prior: LatentPrior,
    pub monte_carlo_samples: SampleCounts,
    pub importance_samples: SampleCounts,
    /// Analytic diagonal-Gaussian KL instead of the sampled estimator.
    pub analytical_kl: bool,
    pub batch_normalisation: bool,
    pub dropout_rates: DropoutRates,
    /// Concatenate the normalised count sum onto the decoder input.
    pub count_sum_feature: bool,
    pub kl_weight: f64,
    pub warm_up_epochs: usize,
    /// Proportion of the cluster-prior entropy used as a KL-y floor
    /// (GMVAE only); 0 disables the floor.
    pub proportion_of_free_nats: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            feature_size: 0,
            latent_size: 32,
            hidden_sizes: vec![128],
            reconstruction_distribution: "poisson".to_string(),
            number_of_reconstruction_classes: 0,
            latent_prior: LatentPrior::Unit,
            monte_carlo_samples: SampleCounts::default(),
            importance_samples: SampleCounts::default(),
            analytical_kl: false,
            batch_normalisation: false,
            dropout_rates: DropoutRates::default(),
            count_sum_feature: false,
            kl_weight: 1.0,
            warm_up_epochs: 0,
            proportion_of_free_nats: 0.0,
        }
    }
}

impl ModelConfig {
    /// Reject inconsistent configurations before any graph is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.feature_size > 0, "feature size must be positive");
        anyhow::ensure!(self.latent_size > 0, "latent size must be positive");
        resolve(&self.reconstruction_distribution)?;
        anyhow::ensure!(
            self.monte_carlo_samples.training > 0
                && self.monte_carlo_samples.evaluation > 0
                && self.importance_samples.training > 0
                && self.importance_samples.evaluation > 0,
            "sample counts must be positive"
        );
        if let LatentPrior::Mixture { components } = self.latent_prior {
            anyhow::ensure!(components > 1, "mixture prior needs at least 2 components");
        }
        if let LatentPrior::GaussianMixture { clusters } = self.latent_prior {
            anyhow::ensure!(clusters > 1, "mixture model needs at least 2 clusters");
            anyhow::ensure!(
                self.importance_samples.training == 1 && self.importance_samples.evaluation == 1,
                "mixture models marginalise the clusters exactly and take no importance samples"
            );
        }
        if self.analytical_kl {
            anyhow::ensure!(
                !self.latent_prior.is_mixture(),
                "analytic KL is only available for Gaussian priors"
            );
        }
        for (rate, kind) in self.dropout_rates.all() {
            anyhow::ensure!(
                (0.0..1.0).contains(&rate),
                "{} dropout rate must be in [0, 1): {}",
                kind,
                rate
            );
        }
        anyhow::ensure!(self.kl_weight > 0.0, "KL weight must be positive");
        anyhow::ensure!(
            (0.0..1.0).contains(&self.proportion_of_free_nats),
            "free-nats proportion must be in [0, 1)"
        );
        Ok(())
    }

    pub fn is_gaussian_mixture_model(&self) -> bool {
        matches!(self.latent_prior, LatentPrior::GaussianMixture { .. })
    }

    /// Directory-safe model name encoding every hyperparameter that
    /// changes the trained artefact.
    pub fn name(&self) -> String {
        let mut major = match self.latent_prior {
            LatentPrior::Unit => "VAE".to_string(),
            LatentPrior::Trainable => "VAE-trainable_prior".to_string(),
            LatentPrior::Mixture { components } => {
                format!("VAE-mixture_prior_{}", components)
            }
            LatentPrior::GaussianMixture { clusters } => format!("GMVAE-{}", clusters),
        };
        major.push_str(&format!("-{}", normalise_token(&self.reconstruction_distribution)));
        if self.number_of_reconstruction_classes > 0 {
            major.push_str(&format!("-k_{}", self.number_of_reconstruction_classes));
        }

        let mut minor = vec![
            format!("l_{}", self.latent_size),
            format!(
                "h_{}",
                self.hidden_sizes
                    .iter()
                    .map(|h| h.to_string())
                    .collect::<Vec<_>>()
                    .join("_")
            ),
        ];
        if self.count_sum_feature {
            minor.push("sum".to_string());
        }
        if self.monte_carlo_samples != SampleCounts::default() {
            minor.push(format!(
                "mc_{}_{}",
                self.monte_carlo_samples.training, self.monte_carlo_samples.evaluation
            ));
        }
        if self.importance_samples != SampleCounts::default() {
            minor.push(format!(
                "iw_{}_{}",
                self.importance_samples.training, self.importance_samples.evaluation
            ));
        }
        if self.analytical_kl {
            minor.push("kl".to_string());
        }
        if self.batch_normalisation {
            minor.push("bn".to_string());
        }
        let dropout_parts: Vec<String> = self
            .dropout_rates
            .all()
            .iter()
            .filter(|(rate, _)| *rate > 0.0)
            .map(|(rate, kind)| format!("{}_{}", kind, rate))
            .collect();
        if !dropout_parts.is_empty() {
            minor.push(format!("dropout_{}", dropout_parts.join("_")));
        }
        if (self.kl_weight - 1.0).abs() > f64::EPSILON {
            minor.push(format!("klw_{}", self.kl_weight));
        }
        if self.warm_up_epochs > 0 {
            minor.push(format!("wu_{}", self.warm_up_epochs));
        }
        if self.proportion_of_free_nats > 0.0 {
            minor.push(format!("fn_{}", self.proportion_of_free_nats));
        }

        format!("{}/{}", major, minor.join("-"))
    }
}

fn normalise_token(name: &str) -> String {
    name.replace(' ', "_")
}

/// Knobs of a single training run, separate from the model definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub number_of_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub run_id: String,
    pub seed: u64,
    /// Early-stopping rounds; improvement resets the counter.
    pub early_stopping_rounds: usize,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            number_of_epochs: 100,
            batch_size: 100,
            learning_rate: 1e-4,
            run_id: "default".to_string(),
            seed: 42,
            early_stopping_rounds: 10,
            show_progress: false,
            verbose: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.number_of_epochs > 0, "epoch count must be positive");
        anyhow::ensure!(self.batch_size > 0, "batch size must be positive");
        anyhow::ensure!(self.learning_rate > 0.0, "learning rate must be positive");
        anyhow::ensure!(!self.run_id.is_empty(), "run id must not be empty");
        Ok(())
    }

    /// Batch size shrunk so one step costs roughly the same with tiled
    /// samples, `ceil(batch / (R·L))`.
    pub fn effective_batch_size(&self, model: &ModelConfig) -> usize {
        let tile = model.importance_samples.training * model.monte_carlo_samples.training;
        self.batch_size.div_ceil(tile).max(1)
    }
}

/// Which checkpoint an evaluation loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointChoice {
    Latest,
    EarlyStopping,
    Best,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ModelConfig {
        ModelConfig {
            feature_size: 100,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn unknown_reconstruction_distribution_is_rejected() {
        let cfg = ModelConfig {
            reconstruction_distribution: "zeta".to_string(),
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn analytic_kl_with_mixture_prior_is_rejected() {
        let cfg = ModelConfig {
            analytical_kl: true,
            latent_prior: LatentPrior::Mixture { components: 3 },
            ..base()
        };
        assert!(cfg.validate().is_err());
        let ok = ModelConfig {
            analytical_kl: true,
            ..base()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn per_kind_dropout_rates_are_each_validated() {
        for dropout_rates in [
            DropoutRates::hidden_only(1.0),
            DropoutRates {
                input: -0.1,
                ..DropoutRates::default()
            },
            DropoutRates {
                latent: 1.5,
                ..DropoutRates::default()
            },
        ] {
            let cfg = ModelConfig {
                dropout_rates,
                ..base()
            };
            assert!(cfg.validate().is_err());
        }
        let ok = ModelConfig {
            dropout_rates: DropoutRates {
                hidden: 0.1,
                input: 0.2,
                latent: 0.3,
            },
            ..base()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn mixture_models_reject_importance_sampling() {
        let cfg = ModelConfig {
            latent_prior: LatentPrior::GaussianMixture { clusters: 3 },
            importance_samples: SampleCounts {
                training: 5,
                evaluation: 1,
            },
            ..base()
        };
        assert!(cfg.validate().is_err());
        let ok = ModelConfig {
            latent_prior: LatentPrior::GaussianMixture { clusters: 3 },
            ..base()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn equal_configs_share_a_name_and_any_change_forks_it() {
        let a = base();
        let b = base();
        assert_eq!(a.name(), b.name());

        let variants = [
            ModelConfig {
                latent_size: 16,
                ..base()
            },
            ModelConfig {
                hidden_sizes: vec![128, 64],
                ..base()
            },
            ModelConfig {
                reconstruction_distribution: "negative binomial".to_string(),
                ..base()
            },
            ModelConfig {
                number_of_reconstruction_classes: 2,
                ..base()
            },
            ModelConfig {
                importance_samples: SampleCounts {
                    training: 5,
                    evaluation: 10,
                },
                ..base()
            },
            ModelConfig {
                analytical_kl: true,
                ..base()
            },
            ModelConfig {
                batch_normalisation: true,
                ..base()
            },
            ModelConfig {
                count_sum_feature: true,
                ..base()
            },
            ModelConfig {
                dropout_rates: DropoutRates::hidden_only(0.2),
                ..base()
            },
            ModelConfig {
                dropout_rates: DropoutRates {
                    input: 0.2,
                    ..DropoutRates::default()
                },
                ..base()
            },
            ModelConfig {
                kl_weight: 0.5,
                ..base()
            },
            ModelConfig {
                warm_up_epochs: 20,
                ..base()
            },
            ModelConfig {
                latent_prior: LatentPrior::GaussianMixture { clusters: 7 },
                ..base()
            },
        ];
        let mut names: Vec<String> = variants.iter().map(|c| c.name()).collect();
        names.push(a.name());
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn gmvae_name_carries_cluster_count() {
        let cfg = ModelConfig {
            latent_prior: LatentPrior::GaussianMixture { clusters: 7 },
            ..base()
        };
        assert!(cfg.name().starts_with("GMVAE-7-poisson/"));
    }

    #[test]
    fn effective_batch_size_divides_by_tiled_samples() {
        let model = ModelConfig {
            importance_samples: SampleCounts {
                training: 5,
                evaluation: 1,
            },
            monte_carlo_samples: SampleCounts {
                training: 2,
                evaluation: 1,
            },
            ..base()
        };
        let train = TrainConfig {
            batch_size: 100,
            ..TrainConfig::default()
        };
        assert_eq!(train.effective_batch_size(&model), 10);
        let odd = TrainConfig {
            batch_size: 101,
            ..TrainConfig::default()
        };
        assert_eq!(odd.effective_batch_size(&model), 11);
    }
}
