use crate::loss::{gaussian_log_prob, lgamma_approx, log_sum_exp};

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

/// Margin keeping activated parameters strictly inside their support.
pub const EPSILON: f64 = 1e-6;

/// A sampleable, log-density-evaluable distribution over tensors.
///
/// Parameter tensors carry whatever leading batch shape the model gave
/// them; `log_prob` broadcasts the value tensor against the parameters and
/// is elementwise per feature, except for mixtures which aggregate over
/// the event dimension internally.
pub trait Distribution {
    /// Draw `n` samples, prepending a sample dimension to the parameter
    /// shape.
    fn sample(&self, n: usize) -> Result<Tensor>;

    /// Log density (or log mass) evaluated at `x`.
    fn log_prob(&self, x: &Tensor) -> Result<Tensor>;

    fn mean(&self) -> Result<Tensor>;

    fn variance(&self) -> Result<Tensor>;
}

///////////////////////////////////
// parameter specs and catalogue //
///////////////////////////////////

/// Activation squashing a raw dense-layer output into a parameter's
/// support. Applied together with a clip that keeps the value strictly
/// inside the open interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamActivation {
    Identity,
    Softplus,
    Sigmoid,
}

impl ParamActivation {
    /// Activate `raw` and clip into `(min + EPSILON, max - EPSILON)`.
    pub fn apply(&self, raw: &Tensor, support: (f64, f64)) -> Result<Tensor> {
        let activated = match self {
            ParamActivation::Identity => raw.clone(),
            ParamActivation::Softplus => softplus(raw)?,
            ParamActivation::Sigmoid => ops::sigmoid(raw)?,
        };
        let (lo, hi) = support;
        activated.clamp(lo + EPSILON, hi - EPSILON)
    }
}

/// Stable softplus, `max(x, 0) + log(1 + exp(-|x|))`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let linear = x.clamp(0.0, f64::INFINITY)?;
    let log1p = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    linear.add(&log1p)
}

/// Specification of one distribution parameter: its name, open support,
/// the activation mapping reals into that support, and the initial value
/// used when the parameter is a free trainable variable.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub support: (f64, f64),
    pub activation: ParamActivation,
    pub init: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistKind {
    Gaussian,
    UnitGaussian,
    GaussianMixture,
    Categorical,
    Bernoulli,
    Poisson,
    ConstrainedPoisson,
    NegativeBinomial,
}

/// Catalogue entry mapping a distribution name to its parameters and the
/// concrete type the model assembler constructs. Resolved once at model
/// construction; an unknown name is a configuration error raised eagerly.
#[derive(Debug, Clone, Copy)]
pub struct DistributionSpec {
    pub name: &'static str,
    pub kind: DistKind,
    pub parameters: &'static [ParamSpec],
    /// Whether the constructor takes the per-example count sum as an
    /// extra (non-learned) parameter. This is the single rule deciding
    /// when the count-sum covariate is required.
    pub needs_count_sum: bool,
}

const MEAN_SUPPORT: (f64, f64) = (f64::NEG_INFINITY, f64::INFINITY);
const LNVAR_SUPPORT: (f64, f64) = (-8.0, 8.0);
const POSITIVE: (f64, f64) = (0.0, f64::INFINITY);
const UNIT: (f64, f64) = (0.0, 1.0);

static CATALOGUE: &[DistributionSpec] = &[
    DistributionSpec {
        name: "gaussian",
        kind: DistKind::Gaussian,
        parameters: &[
            ParamSpec {
                name: "mean",
                support: MEAN_SUPPORT,
                activation: ParamActivation::Identity,
                init: 0.0,
            },
            ParamSpec {
                name: "log_variance",
                support: LNVAR_SUPPORT,
                activation: ParamActivation::Identity,
                init: 0.0,
            },
        ],
        needs_count_sum: false,
    },
    DistributionSpec {
        name: "unit gaussian",
        kind: DistKind::UnitGaussian,
        parameters: &[],
        needs_count_sum: false,
    },
    DistributionSpec {
        name: "gaussian mixture",
        kind: DistKind::GaussianMixture,
        parameters: &[
            ParamSpec {
                name: "logits",
                support: MEAN_SUPPORT,
                activation: ParamActivation::Identity,
                init: 0.0,
            },
            ParamSpec {
                name: "means",
                support: MEAN_SUPPORT,
                activation: ParamActivation::Identity,
                init: 0.0,
            },
            ParamSpec {
                name: "log_variances",
                support: LNVAR_SUPPORT,
                activation: ParamActivation::Identity,
                init: 0.0,
            },
        ],
        needs_count_sum: false,
    },
    DistributionSpec {
        name: "categorical",
        kind: DistKind::Categorical,
        parameters: &[ParamSpec {
            name: "logits",
            support: MEAN_SUPPORT,
            activation: ParamActivation::Identity,
            init: 0.0,
        }],
        needs_count_sum: false,
    },
    DistributionSpec {
        name: "bernoulli",
        kind: DistKind::Bernoulli,
        parameters: &[ParamSpec {
            name: "probabilities",
            support: UNIT,
            activation: ParamActivation::Sigmoid,
            init: 0.5,
        }],
        needs_count_sum: false,
    },
    DistributionSpec {
        name: "poisson",
        kind: DistKind::Poisson,
        parameters: &[ParamSpec {
            name: "lambda",
            support: POSITIVE,
            activation: ParamActivation::Softplus,
            init: 1.0,
        }],
        needs_count_sum: false,
    },
    DistributionSpec {
        name: "constrained poisson",
        kind: DistKind::ConstrainedPoisson,
        parameters: &[ParamSpec {
            name: "lambda",
            support: POSITIVE,
            activation: ParamActivation::Softplus,
            init: 1.0,
        }],
        needs_count_sum: true,
    },
    DistributionSpec {
        name: "negative binomial",
        kind: DistKind::NegativeBinomial,
        parameters: &[
            ParamSpec {
                name: "p",
                support: UNIT,
                activation: ParamActivation::Sigmoid,
                init: 0.5,
            },
            ParamSpec {
                name: "r",
                support: POSITIVE,
                activation: ParamActivation::Softplus,
                init: 1.0,
            },
        ],
        needs_count_sum: false,
    },
];

/// Look up a distribution by name. Unknown names fail here, at model
/// construction, never inside the training loop.
pub fn resolve(name: &str) -> anyhow::Result<&'static DistributionSpec> {
    CATALOGUE
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| anyhow::anyhow!("unknown distribution: '{}'", name))
}

//////////////
// Gaussian //
//////////////

pub struct Gaussian {
    mean: Tensor,
    log_variance: Tensor,
}

impl Gaussian {
    pub fn new(mean: Tensor, log_variance: Tensor) -> Self {
        Self {
            mean,
            log_variance,
        }
    }

    pub fn mean_ref(&self) -> &Tensor {
        &self.mean
    }

    pub fn log_variance_ref(&self) -> &Tensor {
        &self.log_variance
    }
}

impl Distribution for Gaussian {
    /// Reparameterized sampling, `z = mu + sigma * eps`, so gradients flow
    /// through the parameters.
    fn sample(&self, n: usize) -> Result<Tensor> {
        let mut shape = vec![n];
        shape.extend_from_slice(self.mean.dims());
        let eps = Tensor::randn(0f32, 1f32, shape, self.mean.device())?;
        let std = (&self.log_variance * 0.5)?.exp()?;
        eps.broadcast_mul(&std)?.broadcast_add(&self.mean)
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        gaussian_log_prob(x, &self.mean, &self.log_variance)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.mean.clone())
    }

    fn variance(&self) -> Result<Tensor> {
        self.log_variance.exp()
    }
}

//////////////////////
// Gaussian mixture //
//////////////////////

/// Mixture of diagonal Gaussians with shared mixing logits. Unlike the
/// scalar-event distributions, `log_prob` aggregates over the event
/// (latent) dimension internally, so callers must not sum it again.
pub struct GaussianMixture {
    logits: Tensor,             // (K,)
    means: Vec<Tensor>,         // each (1, latent)
    log_variances: Vec<Tensor>, // each (1, latent)
}

impl GaussianMixture {
    pub fn new(logits: Tensor, means: Vec<Tensor>, log_variances: Vec<Tensor>) -> Self {
        debug_assert_eq!(means.len(), log_variances.len());
        Self {
            logits,
            means,
            log_variances,
        }
    }

    pub fn n_components(&self) -> usize {
        self.means.len()
    }

    /// Mixing probabilities, shape `(K,)`.
    pub fn mixing_probabilities(&self) -> Result<Tensor> {
        ops::softmax(&self.logits, 0)
    }

    pub fn component_mean(&self, k: usize) -> &Tensor {
        &self.means[k]
    }

    pub fn component_variance(&self, k: usize) -> Result<Tensor> {
        self.log_variances[k].exp()
    }

    fn log_mixing(&self) -> Result<Tensor> {
        ops::log_softmax(&self.logits, 0)
    }
}

impl Distribution for GaussianMixture {
    fn sample(&self, n: usize) -> Result<Tensor> {
        let k = self.n_components();
        let device = self.logits.device();
        // Gumbel-argmax component choice, one-hot selection of the
        // per-component reparameterized samples.
        let u = Tensor::rand(0f32, 1f32, (n, k), device)?;
        let gumbel = u.log()?.neg()?.log()?.neg()?;
        let choice = gumbel.broadcast_add(&self.log_mixing()?)?.argmax(1)?;
        let eye = Tensor::eye(k, DType::F32, device)?;
        let onehot = eye.index_select(&choice, 0)?; // (n, K)

        let latent = self.means[0].dim(D::Minus1)?;
        let mut acc = Tensor::zeros((n, latent), DType::F32, device)?;
        for j in 0..k {
            let comp = Gaussian::new(self.means[j].clone(), self.log_variances[j].clone());
            let z_j = comp.sample(n)?.reshape((n, latent))?;
            let w_j = onehot.narrow(1, j, 1)?;
            acc = acc.add(&z_j.broadcast_mul(&w_j)?)?;
        }
        Ok(acc)
    }

    /// `log p(z) = logsumexp_k [ log pi_k + sum_d log N(z_d; mu_kd, s_kd) ]`,
    /// reducing the trailing latent dimension.
    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let log_pi = self.log_mixing()?;
        let mut per_component = Vec::with_capacity(self.n_components());
        for j in 0..self.n_components() {
            let lp = gaussian_log_prob(x, &self.means[j], &self.log_variances[j])?
                .sum(D::Minus1)?
                .broadcast_add(&log_pi.narrow(0, j, 1)?)?;
            per_component.push(lp);
        }
        let stacked = Tensor::stack(&per_component, D::Minus1)?;
        log_sum_exp(&stacked, stacked.rank() - 1)
    }

    fn mean(&self) -> Result<Tensor> {
        let pi = self.mixing_probabilities()?;
        let mut acc = self.means[0].broadcast_mul(&pi.narrow(0, 0, 1)?)?;
        for j in 1..self.n_components() {
            acc = acc.add(&self.means[j].broadcast_mul(&pi.narrow(0, j, 1)?)?)?;
        }
        Ok(acc)
    }

    /// Law of total variance: `sum_k pi_k (s_k^2 + mu_k^2) - mean^2`.
    fn variance(&self) -> Result<Tensor> {
        let pi = self.mixing_probabilities()?;
        let mut second = Tensor::zeros_like(&self.means[0])?;
        for j in 0..self.n_components() {
            let moment = (self.log_variances[j].exp()? + self.means[j].sqr()?)?;
            second = second.add(&moment.broadcast_mul(&pi.narrow(0, j, 1)?)?)?;
        }
        second.sub(&self.mean()?.sqr()?)
    }
}

/////////////////
// Categorical //
/////////////////

pub struct Categorical {
    logits: Tensor, // (..., K)
}

impl Categorical {
    pub fn new(logits: Tensor) -> Self {
        Self { logits }
    }

    pub fn logits_ref(&self) -> &Tensor {
        &self.logits
    }

    pub fn probabilities(&self) -> Result<Tensor> {
        ops::softmax(&self.logits, D::Minus1)
    }

    pub fn log_probabilities(&self) -> Result<Tensor> {
        ops::log_softmax(&self.logits, D::Minus1)
    }

    /// Entropy `H(q) = -sum_k p_k log p_k`, reducing the class dimension.
    pub fn entropy(&self) -> Result<Tensor> {
        let log_p = self.log_probabilities()?;
        log_p.exp()?.mul(&log_p)?.sum(D::Minus1)?.neg()
    }

    /// `KL(self || other)` between two categoricals over the same classes.
    pub fn kl_divergence(&self, other: &Categorical) -> Result<Tensor> {
        let log_q = self.log_probabilities()?;
        let log_p = other.log_probabilities()?;
        log_q
            .exp()?
            .mul(&log_q.broadcast_sub(&log_p)?)?
            .sum(D::Minus1)
    }
}

impl Distribution for Categorical {
    fn sample(&self, n: usize) -> Result<Tensor> {
        let mut shape = vec![n];
        shape.extend_from_slice(self.logits.dims());
        let u = Tensor::rand(0f32, 1f32, shape, self.logits.device())?;
        let gumbel = u.log()?.neg()?.log()?.neg()?;
        let perturbed = gumbel.broadcast_add(&self.log_probabilities()?)?;
        perturbed.argmax(D::Minus1)?.to_dtype(DType::F32)
    }

    /// Log mass of integer class indices (given as a float tensor with one
    /// fewer trailing dimension than the logits).
    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let n_classes = self.logits.dim(D::Minus1)?;
        let idx = x
            .clamp(0.0, (n_classes - 1) as f64)?
            .to_dtype(DType::U32)?
            .unsqueeze(D::Minus1)?;
        let log_p = self.log_probabilities()?;
        log_p.gather(&idx, D::Minus1)?.squeeze(D::Minus1)
    }

    fn mean(&self) -> Result<Tensor> {
        self.probabilities()
    }

    fn variance(&self) -> Result<Tensor> {
        let p = self.probabilities()?;
        (1.0 - &p)?.mul(&p)
    }
}

///////////////
// Bernoulli //
///////////////

pub struct Bernoulli {
    probabilities: Tensor,
}

impl Bernoulli {
    pub fn new(probabilities: Tensor) -> Self {
        Self { probabilities }
    }
}

impl Distribution for Bernoulli {
    fn sample(&self, n: usize) -> Result<Tensor> {
        let mut shape = vec![n];
        shape.extend_from_slice(self.probabilities.dims());
        let u = Tensor::rand(0f32, 1f32, shape, self.probabilities.device())?;
        u.broadcast_lt(&self.probabilities)?.to_dtype(DType::F32)
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        // probabilities are clipped into (eps, 1 - eps), logs stay finite
        let log_p = self.probabilities.log()?;
        let log_1mp = (1.0 - &self.probabilities)?.log()?;
        let on = x.broadcast_mul(&log_p)?;
        let off = (1.0 - x)?.broadcast_mul(&log_1mp)?;
        on.add(&off)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.probabilities.clone())
    }

    fn variance(&self) -> Result<Tensor> {
        (1.0 - &self.probabilities)?.mul(&self.probabilities)
    }
}

/////////////
// Poisson //
/////////////

pub struct Poisson {
    rate: Tensor,
}

impl Poisson {
    pub fn new(rate: Tensor) -> Self {
        Self { rate }
    }
}

impl Distribution for Poisson {
    fn sample(&self, n: usize) -> Result<Tensor> {
        sample_counts_on_host(&self.rate, n, |rng, rate| {
            use rand_distr::{Distribution as _, Poisson as HostPoisson};
            HostPoisson::new(rate.max(1e-8) as f64)
                .map(|d| d.sample(rng) as f32)
                .unwrap_or(0.0)
        })
    }

    /// `x log(lambda) - lambda - lgamma(x + 1)`
    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let ln_rate = self.rate.log()?;
        x.broadcast_mul(&ln_rate)?
            .broadcast_sub(&self.rate)?
            .sub(&lgamma_approx(&(x + 1.0)?)?)
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.rate.clone())
    }

    fn variance(&self) -> Result<Tensor> {
        Ok(self.rate.clone())
    }
}

/////////////////////////
// Constrained Poisson //
/////////////////////////

/// Poisson with rates normalized across features and scaled by the
/// per-example count sum, so the expected total equals the observed total.
pub struct ConstrainedPoisson {
    inner: Poisson,
}

impl ConstrainedPoisson {
    pub fn new(rate: Tensor, count_sum: Tensor) -> Result<Self> {
        let total = rate.sum_keepdim(D::Minus1)?;
        let constrained = rate.broadcast_div(&total)?.broadcast_mul(&count_sum)?;
        Ok(Self {
            inner: Poisson::new(constrained),
        })
    }
}

impl Distribution for ConstrainedPoisson {
    fn sample(&self, n: usize) -> Result<Tensor> {
        self.inner.sample(n)
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        self.inner.log_prob(x)
    }

    fn mean(&self) -> Result<Tensor> {
        self.inner.mean()
    }

    fn variance(&self) -> Result<Tensor> {
        self.inner.variance()
    }
}

///////////////////////
// Negative binomial //
///////////////////////

pub struct NegativeBinomial {
    p: Tensor,
    r: Tensor,
}

impl NegativeBinomial {
    pub fn new(p: Tensor, r: Tensor) -> Self {
        Self { p, r }
    }
}

impl Distribution for NegativeBinomial {
    fn sample(&self, n: usize) -> Result<Tensor> {
        // gamma-Poisson mixture on the host
        let mut shape = vec![n];
        shape.extend_from_slice(self.p.dims());
        let p_host = self.p.flatten_all()?.to_vec1::<f32>()?;
        let r_host = self.r.flatten_all()?.to_vec1::<f32>()?;
        let mut rng = rand::rng();
        let mut out = Vec::with_capacity(n * p_host.len());
        for _ in 0..n {
            for (&p, &r) in p_host.iter().zip(r_host.iter()) {
                use rand_distr::{Distribution as _, Gamma, Poisson as HostPoisson};
                let scale = (p / (1.0 - p)).max(1e-8) as f64;
                let lambda = Gamma::new(r.max(1e-8) as f64, scale)
                    .map(|g| g.sample(&mut rng))
                    .unwrap_or(0.0);
                let x = HostPoisson::new(lambda.max(1e-8))
                    .map(|d| d.sample(&mut rng) as f32)
                    .unwrap_or(0.0);
                out.push(x);
            }
        }
        Tensor::from_vec(out, shape, self.p.device())
    }

    /// `lgamma(x + r) - lgamma(x + 1) - lgamma(r)
    ///  + r log(1 - p) + x log(p)`
    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let combin = lgamma_approx(&x.broadcast_add(&self.r)?)?
            .sub(&lgamma_approx(&(x + 1.0)?)?)?
            .broadcast_sub(&lgamma_approx(&self.r)?)?;
        let tail = self.r.mul(&(1.0 - &self.p)?.log()?)?;
        let head = x.broadcast_mul(&self.p.log()?)?;
        combin.broadcast_add(&tail)?.add(&head)
    }

    fn mean(&self) -> Result<Tensor> {
        self.p.mul(&self.r)?.div(&(1.0 - &self.p)?)
    }

    fn variance(&self) -> Result<Tensor> {
        self.mean()?.div(&(1.0 - &self.p)?)
    }
}

/////////////////////////////////////
// Categorized (zero/low inflation) //
/////////////////////////////////////

/// Mixture of point masses at the counts `0 .. k_max-1` with a base count
/// distribution shifted by `k_max`, weighted by a per-feature categorical
/// over `k_max + 1` classes. Models excess zeros and low counts.
pub struct Categorized {
    cat: Categorical, // logits (..., features, k_max + 1)
    base: Box<dyn Distribution>,
    k_max: usize,
}

impl Categorized {
    pub fn new(cat_logits: Tensor, base: Box<dyn Distribution>, k_max: usize) -> Self {
        Self {
            cat: Categorical::new(cat_logits),
            base,
            k_max,
        }
    }

    fn tail_log_prob(&self) -> Result<Tensor> {
        let log_p = self.cat.log_probabilities()?;
        log_p.narrow(D::Minus1, self.k_max, 1)?.squeeze(D::Minus1)
    }

    fn tail_prob(&self) -> Result<Tensor> {
        self.tail_log_prob()?.exp()
    }

    /// `sum_{k < k_max} pi_k * k`, reducing the class dimension.
    fn point_mass_moment(&self, power: i32) -> Result<Tensor> {
        let device = self.cat.logits_ref().device();
        let values = Tensor::arange(0f32, self.k_max as f32, device)?.powf(power as f64)?;
        let probs = self.cat.probabilities()?.narrow(D::Minus1, 0, self.k_max)?;
        probs.broadcast_mul(&values)?.sum(D::Minus1)
    }
}

impl Distribution for Categorized {
    fn sample(&self, n: usize) -> Result<Tensor> {
        let class = self.cat.sample(n)?; // (n, ..., features)
        let base = self.base.sample(n)?;
        let shifted = (base + self.k_max as f64)?;
        let is_point = class.lt(self.k_max as f64)?;
        is_point.where_cond(&class, &shifted)
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let idx = x
            .clamp(0.0, self.k_max as f64)?
            .to_dtype(DType::U32)?
            .unsqueeze(D::Minus1)?;
        let class_lp = self
            .cat
            .log_probabilities()?
            .gather(&idx, D::Minus1)?
            .squeeze(D::Minus1)?;
        let shifted = (x - self.k_max as f64)?.clamp(0.0, f64::INFINITY)?;
        let tail_lp = self.tail_log_prob()?.add(&self.base.log_prob(&shifted)?)?;
        let is_point = x.lt(self.k_max as f64)?;
        is_point.where_cond(&class_lp, &tail_lp)
    }

    /// Mean keeps the `(batch, features)` parameter shape no matter how
    /// many auxiliary classes exist.
    fn mean(&self) -> Result<Tensor> {
        let point = self.point_mass_moment(1)?;
        let tail = self
            .tail_prob()?
            .mul(&(self.base.mean()? + self.k_max as f64)?)?;
        point.add(&tail)
    }

    fn variance(&self) -> Result<Tensor> {
        let k = self.k_max as f64;
        let base_mean = self.base.mean()?;
        let base_second = (self.base.variance()? + base_mean.sqr()?)?;
        // E[(k + y)^2] = k^2 + 2 k E[y] + E[y^2]
        let tail_second = (((base_mean * (2.0 * k))? + base_second)? + k * k)?;
        let second = self
            .point_mass_moment(2)?
            .add(&self.tail_prob()?.mul(&tail_second)?)?;
        second.sub(&self.mean()?.sqr()?)
    }
}

/// Draw count samples elementwise on the host; `f` maps one parameter
/// value to one draw. Used by distributions without a reparameterized
/// sampler (count likelihood heads are never sampled during training).
fn sample_counts_on_host<F>(params: &Tensor, n: usize, f: F) -> Result<Tensor>
where
    F: Fn(&mut rand::rngs::ThreadRng, f32) -> f32,
{
    let host = params.flatten_all()?.to_vec1::<f32>()?;
    let mut rng = rand::rng();
    let mut out = Vec::with_capacity(n * host.len());
    for _ in 0..n {
        for &v in host.iter() {
            out.push(f(&mut rng, v));
        }
    }
    let mut shape = vec![n];
    shape.extend_from_slice(params.dims());
    Tensor::from_vec(out, shape, params.device())
}
