use crate::config::{LatentPrior, ModelConfig};
use crate::dense_stack::DenseStack;
use crate::distributions::{Categorical, Distribution, Gaussian, resolve};
use crate::loss::gaussian_kl;
use crate::vae::{GaussianEncoder, Losses, ReconstructionDecoder};

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

/// One mixture component of a forward pass: the cluster-conditional
/// posterior and prior, the latent samples, and the reconstruction.
pub struct GmvaeComponent {
    pub posterior: Gaussian,
    pub prior: Gaussian,
    pub z: Tensor,
    pub reconstruction: Box<dyn Distribution>,
}

pub struct GmvaeOutput {
    pub cluster_posterior: Categorical,
    pub components: Vec<GmvaeComponent>,
    pub monte_carlo_samples: usize,
    pub batch_size: usize,
}

/// Gaussian-mixture VAE: a categorical posterior `q(y|x)` picks among
/// cluster-conditional Gaussian posteriors `q(z|x,y_k)` that share one
/// set of encoder weights over `concat(x, onehot(y))`; the prior
/// `p(z|y_k)` is a trainable linear map of the one-hot cluster code and
/// `p(y)` is uniform.
pub struct GaussianMixtureVae {
    config: ModelConfig,
    clusters: usize,
    y_trunk: DenseStack,
    y_logits: Linear,
    encoder: GaussianEncoder,
    prior_mean: Linear,
    prior_lnvar: Linear,
    decoder: ReconstructionDecoder,
}

impl GaussianMixtureVae {
    pub fn new(config: &ModelConfig, vs: VarBuilder) -> anyhow::Result<Self> {
        config.validate()?;
        let clusters = match config.latent_prior {
            LatentPrior::GaussianMixture { clusters } => clusters,
            _ => anyhow::bail!("GaussianMixtureVae requires a mixture-posterior prior"),
        };
        let spec = resolve(&config.reconstruction_distribution)?;

        let y_trunk = DenseStack::new(
            config.feature_size,
            &config.hidden_sizes,
            config.batch_normalisation,
            config.dropout_rates.input,
            config.dropout_rates.hidden,
            vs.pp("cls"),
        )?;
        let y_logits = candle_nn::linear(y_trunk.dim_out(), clusters, vs.pp("cls.y"))?;

        let encoder = GaussianEncoder::new(
            config.feature_size + clusters,
            config.latent_size,
            &config.hidden_sizes,
            config.batch_normalisation,
            config.dropout_rates.input,
            config.dropout_rates.hidden,
            vs.clone(),
        )?;

        let prior_mean = candle_nn::linear(clusters, config.latent_size, vs.pp("prior.z.mean"))?;
        let prior_lnvar = candle_nn::linear(clusters, config.latent_size, vs.pp("prior.z.lnvar"))?;

        let decoder_in = config.latent_size + usize::from(config.count_sum_feature);
        let decoder = ReconstructionDecoder::new(
            decoder_in,
            config.feature_size,
            &config.hidden_sizes,
            spec,
            config.number_of_reconstruction_classes,
            config.batch_normalisation,
            config.dropout_rates.latent,
            config.dropout_rates.hidden,
            vs,
        )?;

        Ok(Self {
            config: config.clone(),
            clusters,
            y_trunk,
            y_logits,
            encoder,
            prior_mean,
            prior_lnvar,
            decoder,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn number_of_clusters(&self) -> usize {
        self.clusters
    }

    fn onehot(&self, k: usize, device: &candle_core::Device) -> Result<Tensor> {
        let eye = Tensor::eye(self.clusters, DType::F32, device)?;
        eye.narrow(0, k, 1)
    }

    /// `q(y|x)` for a batch.
    pub fn cluster_posterior(&self, x: &Tensor, train: bool) -> Result<Categorical> {
        let h = self.y_trunk.forward_t(x, train)?;
        Ok(Categorical::new(self.y_logits.forward(&h)?))
    }

    /// Trainable prior parameters for every cluster, each `(K, latent)`.
    pub fn prior_parameters(&self) -> Result<(Tensor, Tensor)> {
        let eye = Tensor::eye(self.clusters, DType::F32, self.y_logits.weight().device())?;
        Ok((
            self.prior_mean.forward(&eye)?,
            self.prior_lnvar.forward(&eye)?.clamp(-8.0, 8.0)?,
        ))
    }

    pub fn forward(
        &self,
        x: &Tensor,
        count_sum: &Tensor,
        deterministic_z: bool,
        train: bool,
    ) -> Result<GmvaeOutput> {
        let batch_size = x.dim(0)?;
        let device = x.device();
        let mc = if deterministic_z {
            1
        } else if train {
            self.config.monte_carlo_samples.training
        } else {
            self.config.monte_carlo_samples.evaluation
        };

        let cluster_posterior = self.cluster_posterior(x, train)?;
        let (prior_means, prior_lnvars) = self.prior_parameters()?;

        let count_sum_tiled = count_sum.repeat((mc, 1))?;
        let needs_count_sum = self.decoder.spec().needs_count_sum;

        let mut components = Vec::with_capacity(self.clusters);
        for k in 0..self.clusters {
            let code = self.onehot(k, device)?.broadcast_as((batch_size, self.clusters))?;
            let encoder_input = Tensor::cat(&[x, &code], 1)?;
            let posterior = self.encoder.forward_t(&encoder_input, train)?;
            let prior = Gaussian::new(
                prior_means.narrow(0, k, 1)?,
                prior_lnvars.narrow(0, k, 1)?,
            );

            let z = if deterministic_z {
                posterior.mean()?
            } else {
                posterior
                    .sample(mc)?
                    .reshape((mc * batch_size, self.config.latent_size))?
            };

            let decoder_input = if self.config.count_sum_feature {
                let normalised = (&count_sum_tiled / self.config.feature_size as f64)?;
                Tensor::cat(&[&z, &normalised], 1)?
            } else {
                z.clone()
            };
            let reconstruction = self.decoder.forward_t(
                &decoder_input,
                needs_count_sum.then_some(&count_sum_tiled),
                train,
            )?;

            components.push(GmvaeComponent {
                posterior,
                prior,
                z,
                reconstruction,
            });
        }

        Ok(GmvaeOutput {
            cluster_posterior,
            components,
            monte_carlo_samples: mc,
            batch_size,
        })
    }

    /// Probability-weighted bound over clusters. No importance weighting
    /// here; the categorical posterior is marginalized exactly.
    pub fn losses(&self, out: &GmvaeOutput, target: &Tensor, warm_up: f64) -> Result<Losses> {
        let (mc, b) = (out.monte_carlo_samples, out.batch_size);
        let q = out.cluster_posterior.probabilities()?; // (B, K)
        let target_tiled = target.repeat((mc, 1))?;

        let mut log_px_cols = Vec::with_capacity(self.clusters);
        let mut kl_z_cols = Vec::with_capacity(self.clusters);
        for comp in &out.components {
            let log_px = comp
                .reconstruction
                .log_prob(&target_tiled)?
                .sum(D::Minus1)?
                .reshape((mc, b))?
                .mean(0)?;
            log_px_cols.push(log_px);
            let kl_z = gaussian_kl(
                comp.posterior.mean_ref(),
                comp.posterior.log_variance_ref(),
                comp.prior.mean_ref(),
                comp.prior.log_variance_ref(),
            )?
            .sum(D::Minus1)?;
            kl_z_cols.push(kl_z);
        }
        let log_px = Tensor::stack(&log_px_cols, 1)?; // (B, K)
        let kl_z = Tensor::stack(&kl_z_cols, 1)?;

        let recon_b = q.mul(&log_px)?.sum(D::Minus1)?;
        let kl_z_b = q.mul(&kl_z)?.sum(D::Minus1)?;

        // uniform p(y): KL(q(y|x) || p(y)) = log K - H(q)
        let log_k = (self.clusters as f64).ln();
        let kl_y_b = (out.cluster_posterior.entropy()?.neg()? + log_k)?;
        let free_nats = self.config.proportion_of_free_nats * log_k;
        let kl_y_train = kl_y_b.maximum(free_nats)?;

        let weight = warm_up * self.config.kl_weight;
        let objective = recon_b
            .sub(&(&kl_z_b * weight)?)?
            .sub(&(&kl_y_train * weight)?)?
            .mean_all()?
            .neg()?;
        let lower_bound = recon_b.sub(&kl_z_b)?.sub(&kl_y_b)?.mean_all()?;
        let reconstruction_error = recon_b.mean_all()?.neg()?;
        let kl_divergence = kl_z_b.mean_all()?;
        let kl_divergence_y = kl_y_b.mean_all()?;

        Ok(Losses {
            objective,
            lower_bound,
            reconstruction_error,
            kl_divergence,
            kl_divergence_y: Some(kl_divergence_y),
            kl_per_dimension: None,
        })
    }

    /// Marginal latent mean `sum_k q(y=k|x) E[z|x,y_k]`, eval mode.
    pub fn latent_mean(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.forward(x, &x.sum_keepdim(1)?, true, false)?;
        let q = out.cluster_posterior.probabilities()?;
        let mut acc = Tensor::zeros(
            (out.batch_size, self.config.latent_size),
            DType::F32,
            x.device(),
        )?;
        for (k, comp) in out.components.iter().enumerate() {
            let q_k = q.narrow(1, k, 1)?;
            acc = acc.add(&comp.posterior.mean()?.broadcast_mul(&q_k)?)?;
        }
        Ok(acc)
    }
}
