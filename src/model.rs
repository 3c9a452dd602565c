use crate::config::ModelConfig;
use crate::gmvae::GaussianMixtureVae;
use crate::vae::{Losses, VariationalAutoencoder};

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Reconstruction mean with its uncertainty split into the expected
/// conditional variance and the variance of the conditional mean; the
/// total predictive variance is their sum.
pub struct ReconstructionMoments {
    pub mean: Tensor,
    pub expected_variance: Tensor,
    pub variance_of_mean: Tensor,
}

impl ReconstructionMoments {
    pub fn total_variance(&self) -> Result<Tensor> {
        self.expected_variance.add(&self.variance_of_mean)
    }
}

/// The two model families behind one training/evaluation surface.
pub enum Model {
    Vae(VariationalAutoencoder),
    Gmvae(GaussianMixtureVae),
}

impl Model {
    pub fn new(config: &ModelConfig, vs: VarBuilder) -> anyhow::Result<Self> {
        if config.is_gaussian_mixture_model() {
            Ok(Model::Gmvae(GaussianMixtureVae::new(config, vs)?))
        } else {
            Ok(Model::Vae(VariationalAutoencoder::new(config, vs)?))
        }
    }

    pub fn config(&self) -> &ModelConfig {
        match self {
            Model::Vae(m) => m.config(),
            Model::Gmvae(m) => m.config(),
        }
    }

    /// Forward pass and bound for one batch.
    pub fn batch_losses(
        &self,
        x: &Tensor,
        count_sum: &Tensor,
        target: &Tensor,
        warm_up: f64,
        deterministic_z: bool,
        train: bool,
    ) -> Result<Losses> {
        match self {
            Model::Vae(m) => {
                let out = m.forward(x, count_sum, deterministic_z, train)?;
                m.losses(&out, target, warm_up)
            }
            Model::Gmvae(m) => {
                let out = m.forward(x, count_sum, deterministic_z, train)?;
                m.losses(&out, target, warm_up)
            }
        }
    }

    /// Marginal posterior latent mean, eval mode.
    pub fn latent_mean(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Model::Vae(m) => m.latent_mean(x),
            Model::Gmvae(m) => m.latent_mean(x),
        }
    }

    /// Cluster responsibilities `q(y|x)`; `None` for the plain model.
    pub fn cluster_probabilities(&self, x: &Tensor) -> Result<Option<Tensor>> {
        match self {
            Model::Vae(_) => Ok(None),
            Model::Gmvae(m) => Ok(Some(m.cluster_posterior(x, false)?.probabilities()?)),
        }
    }

    /// Reconstruction moments in eval mode, averaging the latent samples
    /// (and, for the mixture model, the cluster responsibilities).
    pub fn reconstruction_moments(
        &self,
        x: &Tensor,
        count_sum: &Tensor,
    ) -> Result<ReconstructionMoments> {
        match self {
            Model::Vae(m) => {
                let out = m.forward(x, count_sum, false, false)?;
                let s = out.total_samples();
                let b = out.batch_size;
                let d = m.config().feature_size;
                let mean_sbd = out.reconstruction.mean()?.reshape((s, b, d))?;
                let var_sbd = out.reconstruction.variance()?.reshape((s, b, d))?;
                let mean = mean_sbd.mean(0)?;
                let expected_variance = var_sbd.mean(0)?;
                let variance_of_mean = mean_sbd.sqr()?.mean(0)?.sub(&mean.sqr()?)?;
                Ok(ReconstructionMoments {
                    mean,
                    expected_variance,
                    variance_of_mean,
                })
            }
            Model::Gmvae(m) => {
                let out = m.forward(x, count_sum, false, false)?;
                let s = out.monte_carlo_samples;
                let b = out.batch_size;
                let d = m.config().feature_size;
                let q = out.cluster_posterior.probabilities()?;
                let mut mean = Tensor::zeros((b, d), x.dtype(), x.device())?;
                let mut expected_variance = mean.clone();
                let mut second_moment = mean.clone();
                for (k, comp) in out.components.iter().enumerate() {
                    let q_k = q.narrow(1, k, 1)?;
                    let mean_sbd = comp.reconstruction.mean()?.reshape((s, b, d))?;
                    let var_sbd = comp.reconstruction.variance()?.reshape((s, b, d))?;
                    mean = mean.add(&mean_sbd.mean(0)?.broadcast_mul(&q_k)?)?;
                    expected_variance =
                        expected_variance.add(&var_sbd.mean(0)?.broadcast_mul(&q_k)?)?;
                    second_moment =
                        second_moment.add(&mean_sbd.sqr()?.mean(0)?.broadcast_mul(&q_k)?)?;
                }
                let variance_of_mean = second_moment.sub(&mean.sqr()?)?;
                Ok(ReconstructionMoments {
                    mean,
                    expected_variance,
                    variance_of_mean,
                })
            }
        }
    }
}
