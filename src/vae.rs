use crate::config::{LatentPrior, ModelConfig, SampleCounts};
use crate::dense_stack::{DenseStack, ParamHead};
use crate::distributions::{
    Bernoulli, Categorized, ConstrainedPoisson, DistKind, Distribution, DistributionSpec,
    Gaussian, GaussianMixture, NegativeBinomial, Poisson, resolve,
};
use crate::loss::{
    gaussian_kl, gaussian_log_prob, log_mean_exp, standard_gaussian_kl,
};

use candle_core::{Result, Tensor, D};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

const MIN_LNVAR: f64 = -8.0;
const MAX_LNVAR: f64 = 8.0;

/// Prior over the latent space. Trainable variants register their
/// parameters with the surrounding `VarBuilder`.
pub enum Prior {
    Unit,
    Trainable { mean: Tensor, log_variance: Tensor },
    Mixture(GaussianMixture),
}

impl Prior {
    pub fn new(latent_prior: LatentPrior, latent_size: usize, vs: VarBuilder) -> Result<Self> {
        use candle_nn::Init;
        match latent_prior {
            LatentPrior::Unit => Ok(Prior::Unit),
            LatentPrior::Trainable => Ok(Prior::Trainable {
                mean: vs.get_with_hints((1, latent_size), "prior.mean", Init::Const(0.0))?,
                log_variance: vs.get_with_hints(
                    (1, latent_size),
                    "prior.lnvar",
                    Init::Const(0.0),
                )?,
            }),
            LatentPrior::Mixture { components } => {
                let logits = vs.get_with_hints(components, "prior.logits", Init::Const(0.0))?;
                let mut means = Vec::with_capacity(components);
                let mut lnvars = Vec::with_capacity(components);
                for j in 0..components {
                    means.push(vs.get_with_hints(
                        (1, latent_size),
                        format!("prior.mean.{}", j).as_str(),
                        Init::Randn {
                            mean: 0.0,
                            stdev: 1.0,
                        },
                    )?);
                    lnvars.push(vs.get_with_hints(
                        (1, latent_size),
                        format!("prior.lnvar.{}", j).as_str(),
                        Init::Const(0.0),
                    )?);
                }
                Ok(Prior::Mixture(GaussianMixture::new(logits, means, lnvars)))
            }
            LatentPrior::GaussianMixture { .. } => Err(candle_core::Error::Msg(
                "mixture-posterior models build their own structured prior".to_string(),
            )),
        }
    }

    /// `log p(z)` with the latent dimension reduced; `z` may carry any
    /// leading sample/batch shape.
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        match self {
            Prior::Unit => {
                let zero = Tensor::zeros(1, z.dtype(), z.device())?;
                gaussian_log_prob(z, &zero, &zero)?.sum(D::Minus1)
            }
            Prior::Trainable {
                mean,
                log_variance,
            } => gaussian_log_prob(z, mean, log_variance)?.sum(D::Minus1),
            Prior::Mixture(gmm) => gmm.log_prob(z),
        }
    }

    /// Closed-form `KL(q ‖ p)` summed over the latent dimension, when the
    /// prior admits one.
    pub fn analytic_kl(&self, posterior: &Gaussian) -> Result<Option<Tensor>> {
        match self {
            Prior::Unit => Ok(Some(
                standard_gaussian_kl(posterior.mean_ref(), posterior.log_variance_ref())?,
            )),
            Prior::Trainable {
                mean,
                log_variance,
            } => Ok(Some(
                gaussian_kl(
                    posterior.mean_ref(),
                    posterior.log_variance_ref(),
                    mean,
                    log_variance,
                )?
                .sum(D::Minus1)?,
            )),
            Prior::Mixture(_) => Ok(None),
        }
    }

    /// Per-latent-dimension closed-form KL averaged over the batch.
    pub fn analytic_kl_per_dim(&self, posterior: &Gaussian) -> Result<Option<Tensor>> {
        let elementwise = match self {
            Prior::Unit => {
                let zero = Tensor::zeros(1, posterior.mean_ref().dtype(), posterior.mean_ref().device())?;
                gaussian_kl(
                    posterior.mean_ref(),
                    posterior.log_variance_ref(),
                    &zero,
                    &zero,
                )?
            }
            Prior::Trainable {
                mean,
                log_variance,
            } => gaussian_kl(
                posterior.mean_ref(),
                posterior.log_variance_ref(),
                mean,
                log_variance,
            )?,
            Prior::Mixture(_) => return Ok(None),
        };
        Ok(Some(elementwise.mean(0)?))
    }

    pub fn as_mixture(&self) -> Option<&GaussianMixture> {
        match self {
            Prior::Mixture(gmm) => Some(gmm),
            _ => None,
        }
    }
}

/// One forward pass: posterior parameters for the batch, tiled latent
/// samples, and the reconstruction distribution over the tiled batch.
pub struct VaeOutput {
    pub posterior: Gaussian,
    pub z: Tensor,
    pub reconstruction: Box<dyn Distribution>,
    pub importance_samples: usize,
    pub monte_carlo_samples: usize,
    pub batch_size: usize,
}

impl VaeOutput {
    pub fn total_samples(&self) -> usize {
        self.importance_samples * self.monte_carlo_samples
    }
}

/// Scalar loss terms of one batch. `objective` is the weighted negative
/// bound fed to the optimizer; `lower_bound` is the unweighted ELBO that
/// learning curves report.
pub struct Losses {
    pub objective: Tensor,
    pub lower_bound: Tensor,
    pub reconstruction_error: Tensor,
    pub kl_divergence: Tensor,
    pub kl_divergence_y: Option<Tensor>,
    pub kl_per_dimension: Option<Tensor>,
}

/// Encoder trunk with Gaussian posterior heads; shared between the plain
/// and the mixture model.
pub struct GaussianEncoder {
    trunk: DenseStack,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl GaussianEncoder {
    pub fn new(
        dim_in: usize,
        latent_size: usize,
        hidden: &[usize],
        batch_normalisation: bool,
        input_dropout_rate: f32,
        hidden_dropout_rate: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let trunk = DenseStack::new(
            dim_in,
            hidden,
            batch_normalisation,
            input_dropout_rate,
            hidden_dropout_rate,
            vs.pp("enc"),
        )?;
        let z_mean = candle_nn::linear(trunk.dim_out(), latent_size, vs.pp("enc.z.mean"))?;
        let z_lnvar = candle_nn::linear(trunk.dim_out(), latent_size, vs.pp("enc.z.lnvar"))?;
        Ok(Self {
            trunk,
            z_mean,
            z_lnvar,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Gaussian> {
        let h = self.trunk.forward_t(x, train)?;
        let mean = self.z_mean.forward(&h)?;
        let lnvar = self.z_lnvar.forward(&h)?.clamp(MIN_LNVAR, MAX_LNVAR)?;
        Ok(Gaussian::new(mean, lnvar))
    }
}

/// Decoder trunk plus the reconstruction-distribution heads.
pub struct ReconstructionDecoder {
    trunk: DenseStack,
    heads: Vec<ParamHead>,
    category_head: Option<Linear>,
    spec: &'static DistributionSpec,
    feature_size: usize,
    k_max: usize,
}

impl ReconstructionDecoder {
    pub fn new(
        dim_in: usize,
        feature_size: usize,
        hidden: &[usize],
        spec: &'static DistributionSpec,
        k_max: usize,
        batch_normalisation: bool,
        latent_dropout_rate: f32,
        hidden_dropout_rate: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        // decoder walks the hidden sizes in reverse
        let reversed: Vec<usize> = hidden.iter().rev().copied().collect();
        let trunk = DenseStack::new(
            dim_in,
            &reversed,
            batch_normalisation,
            latent_dropout_rate,
            hidden_dropout_rate,
            vs.pp("dec"),
        )?;
        let mut heads = Vec::with_capacity(spec.parameters.len());
        for param in spec.parameters {
            heads.push(
                ParamHead::new(trunk.dim_out(), feature_size, *param, vs.pp("dec.x"))?
                    .with_dropout(hidden_dropout_rate),
            );
        }
        let category_head = if k_max > 0 {
            Some(candle_nn::linear(
                trunk.dim_out(),
                feature_size * (k_max + 1),
                vs.pp("dec.x.category"),
            )?)
        } else {
            None
        };
        Ok(Self {
            trunk,
            heads,
            category_head,
            spec,
            feature_size,
            k_max,
        })
    }

    pub fn spec(&self) -> &'static DistributionSpec {
        self.spec
    }

    /// Build the reconstruction distribution for a (tiled) batch.
    /// `count_sum` must match the leading dimension of `input` when the
    /// distribution is count-sum constrained.
    pub fn forward_t(
        &self,
        input: &Tensor,
        count_sum: Option<&Tensor>,
        train: bool,
    ) -> Result<Box<dyn Distribution>> {
        let h = self.trunk.forward_t(input, train)?;
        let mut params = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            params.push(head.forward_t(&h, train)?);
        }

        let base: Box<dyn Distribution> = match self.spec.kind {
            DistKind::Gaussian => Box::new(Gaussian::new(params[0].clone(), params[1].clone())),
            DistKind::Bernoulli => Box::new(Bernoulli::new(params[0].clone())),
            DistKind::Poisson => Box::new(Poisson::new(params[0].clone())),
            DistKind::ConstrainedPoisson => {
                let n = count_sum.ok_or_else(|| {
                    candle_core::Error::Msg(
                        "constrained poisson requires the count sum".to_string(),
                    )
                })?;
                Box::new(ConstrainedPoisson::new(params[0].clone(), n.clone())?)
            }
            DistKind::NegativeBinomial => Box::new(NegativeBinomial::new(
                params[0].clone(),
                params[1].clone(),
            )),
            _ => {
                return Err(candle_core::Error::Msg(format!(
                    "'{}' cannot serve as a reconstruction distribution",
                    self.spec.name
                )));
            }
        };

        if let Some(category_head) = &self.category_head {
            let rows = h.dim(0)?;
            let logits = category_head
                .forward(&h)?
                .reshape((rows, self.feature_size, self.k_max + 1))?;
            Ok(Box::new(Categorized::new(logits, base, self.k_max)))
        } else {
            Ok(base)
        }
    }
}

pub struct VariationalAutoencoder {
    config: ModelConfig,
    encoder: GaussianEncoder,
    decoder: ReconstructionDecoder,
    prior: Prior,
}

impl VariationalAutoencoder {
    pub fn new(config: &ModelConfig, vs: VarBuilder) -> anyhow::Result<Self> {
        config.validate()?;
        anyhow::ensure!(
            !config.is_gaussian_mixture_model(),
            "use GaussianMixtureVae for a mixture posterior"
        );
        let spec = resolve(&config.reconstruction_distribution)?;

        let encoder = GaussianEncoder::new(
            config.feature_size,
            config.latent_size,
            &config.hidden_sizes,
            config.batch_normalisation,
            config.dropout_rates.input,
            config.dropout_rates.hidden,
            vs.clone(),
        )?;
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
            vs.clone(),
        )?;
        let prior = Prior::new(config.latent_prior, config.latent_size, vs)?;

        Ok(Self {
            config: config.clone(),
            encoder,
            decoder,
            prior,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    fn sample_counts(&self, train: bool) -> (usize, usize) {
        (
            pick(self.config.importance_samples, train),
            pick(self.config.monte_carlo_samples, train),
        )
    }

    /// Encode, sample `R·L` latent copies, decode the tiled batch.
    /// `deterministic_z` replaces sampling with the posterior mean and a
    /// single copy.
    pub fn forward(
        &self,
        x: &Tensor,
        count_sum: &Tensor,
        deterministic_z: bool,
        train: bool,
    ) -> Result<VaeOutput> {
        let batch_size = x.dim(0)?;
        let posterior = self.encoder.forward_t(x, train)?;

        let (iw, mc) = if deterministic_z {
            (1, 1)
        } else {
            self.sample_counts(train)
        };
        let total = iw * mc;

        let z = if deterministic_z {
            posterior.mean()?
        } else {
            posterior
                .sample(total)?
                .reshape((total * batch_size, self.config.latent_size))?
        };

        let count_sum_tiled = count_sum.repeat((total, 1))?;
        let decoder_input = if self.config.count_sum_feature {
            let normalised = (&count_sum_tiled / self.config.feature_size as f64)?;
            Tensor::cat(&[&z, &normalised], 1)?
        } else {
            z.clone()
        };
        let needs_count_sum = self.decoder.spec().needs_count_sum;
        let reconstruction = self.decoder.forward_t(
            &decoder_input,
            needs_count_sum.then_some(&count_sum_tiled),
            train,
        )?;

        Ok(VaeOutput {
            posterior,
            z,
            reconstruction,
            importance_samples: iw,
            monte_carlo_samples: mc,
            batch_size,
        })
    }

    /// Assemble the bound from one forward pass. `warm_up` scales the KL
    /// term of the optimized objective only.
    pub fn losses(&self, out: &VaeOutput, target: &Tensor, warm_up: f64) -> Result<Losses> {
        let (iw, mc, b) = (
            out.importance_samples,
            out.monte_carlo_samples,
            out.batch_size,
        );
        let total = iw * mc;
        let k = self.config.latent_size;

        let target_tiled = target.repeat((total, 1))?;
        let log_px = out
            .reconstruction
            .log_prob(&target_tiled)?
            .sum(D::Minus1)?
            .reshape((iw, mc, b))?;

        let analytic = if self.config.analytical_kl {
            self.prior.analytic_kl(&out.posterior)?
        } else {
            None
        };

        // (iw, mc, b) KL term, analytic broadcast or per-sample estimate
        let kl = match &analytic {
            Some(kl_b) => kl_b.reshape((1, 1, b))?.broadcast_as((iw, mc, b))?,
            None => {
                let z = out.z.reshape((iw, mc, b, k))?;
                let log_qz = gaussian_log_prob(
                    &z,
                    out.posterior.mean_ref(),
                    out.posterior.log_variance_ref(),
                )?
                .sum(D::Minus1)?;
                let log_pz = self.prior.log_prob(&z)?;
                log_qz.sub(&log_pz)?
            }
        };

        let weight = warm_up * self.config.kl_weight;
        let objective = log_mean_exp(&log_px.sub(&(&kl * weight)?)?, 0)?
            .mean_all()?
            .neg()?;
        let lower_bound = log_mean_exp(&log_px.sub(&kl)?, 0)?.mean_all()?;
        let reconstruction_error = log_px.mean_all()?.neg()?;
        let kl_divergence = kl.mean_all()?;

        let kl_per_dimension = if self.config.analytical_kl {
            self.prior.analytic_kl_per_dim(&out.posterior)?
        } else {
            None
        };

        Ok(Losses {
            objective,
            lower_bound,
            reconstruction_error,
            kl_divergence,
            kl_divergence_y: None,
            kl_per_dimension,
        })
    }

    /// Marginal latent mean for a batch, eval mode.
    pub fn latent_mean(&self, x: &Tensor) -> Result<Tensor> {
        self.encoder.forward_t(x, false)?.mean()
    }
}

fn pick(counts: SampleCounts, train: bool) -> usize {
    if train {
        counts.training
    } else {
        counts.evaluation
    }
}
