use candle_core::{Result, Tensor, D};

/// Numerically stabilized `log(sum(exp(t)))` along `dim`.
///
/// The per-row maximum is subtracted before exponentiating so the
/// reduction stays finite for entries as large as +-1e4.
pub fn log_sum_exp(t: &Tensor, dim: usize) -> Result<Tensor> {
    let max = t.max_keepdim(dim)?;
    let shifted = t.broadcast_sub(&max)?;
    let sum = shifted.exp()?.sum(dim)?;
    sum.log()?.add(&max.squeeze(dim)?)
}

/// Numerically stabilized `log(mean(exp(t)))` along `dim`.
///
/// This is the importance-weighting reduction: averaging in probability
/// space, not in log space.
pub fn log_mean_exp(t: &Tensor, dim: usize) -> Result<Tensor> {
    let n = t.dim(dim)? as f64;
    log_sum_exp(t, dim)? - n.ln()
}

/// Elementwise KL divergence between two diagonal Gaussians,
/// `KL(N(mu_q, sigma_q^2) || N(mu_p, sigma_p^2))`, parameterized by mean
/// and log variance. The caller decides how to reduce over dimensions.
pub fn gaussian_kl(
    q_mean: &Tensor,
    q_lnvar: &Tensor,
    p_mean: &Tensor,
    p_lnvar: &Tensor,
) -> Result<Tensor> {
    let var_ratio = q_lnvar.broadcast_sub(p_lnvar)?.exp()?;
    let mean_term = q_mean
        .broadcast_sub(p_mean)?
        .sqr()?
        .broadcast_div(&p_lnvar.exp()?)?;
    ((var_ratio + mean_term)? - 1.0)?
        .broadcast_add(&p_lnvar.broadcast_sub(q_lnvar)?)?
        * 0.5
}

/// KL divergence against the standard normal,
/// `-0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)`, summed over the last
/// dimension.
pub fn standard_gaussian_kl(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.sqr()? - z_lnvar)?.sum(D::Minus1)? * 0.5
}

/// Elementwise Gaussian log density with broadcasting between the value
/// tensor and the (possibly lower-rank) parameter tensors.
pub fn gaussian_log_prob(x: &Tensor, mean: &Tensor, lnvar: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let sq = x.broadcast_sub(mean)?.sqr()?.broadcast_div(&lnvar.exp()?)?;
    sq.broadcast_add(lnvar)?.affine(-0.5, -0.5 * ln_2pi)
}

/// `lgamma` approximation usable on tensors:
/// `-0.0810614667 - x - log(x) + (0.5 + x) * log(1 + x)`
///
/// Accurate enough for count log-likelihoods; exactness is checked against
/// a scalar reference in the tests.
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let term1 = (x.neg()? - 0.0810614667)?;
    let term2 = x.log()?.neg()?;
    let term3 = (x + 0.5)?.mul(&(x + 1.0)?.log()?)?;
    term1.add(&term2)?.add(&term3)
}

/// The linear KL warm-up multiplier, `min(epoch / warm_up_epochs, 1)`,
/// with `epoch` counted from zero so the first epoch trains without KL
/// pressure. Affects only the weighted training objective, never the
/// reported bound.
pub fn warm_up_weight(epoch: usize, warm_up_epochs: usize) -> f64 {
    if warm_up_epochs == 0 {
        1.0
    } else {
        (epoch as f64 / warm_up_epochs as f64).min(1.0)
    }
}
