//! PAC-Bayes divergence and complexity bounds.
//!
//! The KL divergence between posterior and prior is closed-form because
//! both are fully factorized Gaussians. The prior may be perturbed by
//! additive Gaussian noise (std `kappa_post`) before the divergence is
//! taken, which keeps an over-confident prior from dominating. The bound
//! selector maps total KL, sample count and the confidence parameter delta
//! to a scalar penalty; the result stays in the autodiff graph so gradient
//! steps flow into both posterior and prior parameters.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use metabayes_core::ComplexityKind;
use metabayes_models::stochastic::gaussian_like;
use metabayes_models::{StochasticNet, StochasticParam};
use rand::rngs::StdRng;

/// 0-dim f32 zero, used wherever a term is defined as exactly zero.
pub fn zero_scalar(device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((), DType::F32, device)?)
}

fn add_noise(t: &Tensor, std: f64, rng: &mut StdRng) -> Result<Tensor> {
    Ok(t.add(&gaussian_like(t, std, rng)?)?)
}

/// KL(post || prior) for one factorized-Gaussian parameter pair.
pub fn kl_element(
    post: &StochasticParam,
    prior: &StochasticParam,
    kappa_post: f64,
    noised_prior: bool,
    rng: &mut StdRng,
) -> Result<Tensor> {
    ensure!(
        post.shape() == prior.shape(),
        "posterior/prior parameter shape mismatch: {:?} vs {:?}",
        post.shape(),
        prior.shape()
    );
    let (prior_mean, prior_log_var) = if noised_prior && kappa_post > 0.0 {
        (
            add_noise(prior.mean(), kappa_post, rng)?,
            add_noise(prior.log_var(), kappa_post, rng)?,
        )
    } else {
        (prior.mean().clone(), prior.log_var().clone())
    };

    let post_var = post.log_var().exp()?;
    let prior_var = prior_log_var.exp()?;

    let numerator = post.mean().sub(&prior_mean)?.sqr()?.add(&post_var)?;
    let elems = post.mean().elem_count() as f64;
    // Don't add a small number to the denominator: KL must be exactly
    // zero when post == prior.
    let summed = prior_log_var
        .sub(post.log_var())?
        .add(&numerator.div(&prior_var)?)?
        .sum_all()?;
    Ok(summed.affine(0.5, -0.5 * elems)?)
}

/// Total KL between two models of the same architecture, summed over all
/// weight and bias parameter groups.
pub fn total_kl(
    prior: &StochasticNet,
    post: &StochasticNet,
    kappa_post: f64,
    noised_prior: bool,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let prior_params = prior.params();
    let post_params = post.params();
    ensure!(
        prior_params.len() == post_params.len(),
        "prior and posterior architectures differ"
    );
    let device = post_params[0].mean().device().clone();
    let mut total = zero_scalar(&device)?;
    for (post_p, prior_p) in post_params.iter().zip(prior_params.iter()) {
        total = total.add(&kl_element(post_p, prior_p, kappa_post, noised_prior, rng)?)?;
    }
    Ok(total)
}

/// Intra-task complexity term for one posterior.
///
/// `empirical_loss` is only consumed by the Seeger-style bounds;
/// `hyper_kl` only by the NewBound variants (zero when absent).
#[allow(clippy::too_many_arguments)]
pub fn posterior_complexity(
    kind: ComplexityKind,
    prior: &StochasticNet,
    post: &StochasticNet,
    n_samples: usize,
    empirical_loss: &Tensor,
    hyper_kl: Option<&Tensor>,
    delta: f64,
    kappa_post: f64,
    noised_prior: bool,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let device = empirical_loss.device().clone();
    if matches!(kind, ComplexityKind::NoComplexity | ComplexityKind::None) {
        return zero_scalar(&device);
    }

    let tot_kld = total_kl(prior, post, kappa_post, noised_prior, rng)?;
    let n = n_samples as f64;

    let term = match kind {
        ComplexityKind::NoComplexity | ComplexityKind::None => unreachable!(),
        ComplexityKind::Kld => tot_kld,
        ComplexityKind::VariationalBayes => tot_kld.affine(1.0 / n, 0.0)?,
        ComplexityKind::PacBayesPentina => tot_kld.affine((1.0 / n).sqrt(), 0.0)?,
        ComplexityKind::PacBayesMcAllester => {
            let log_term = (2.0 * n.sqrt() / delta).ln();
            tot_kld
                .affine(1.0 / (2.0 * n), log_term / (2.0 * n))?
                .sqrt()?
        }
        ComplexityKind::PacBayesSeeger => {
            let log_term = (2.0 * n.sqrt() / delta).ln();
            let seeger_eps = tot_kld.affine(1.0 / n, log_term / n)?;
            seeger_bound(&seeger_eps, empirical_loss)?
        }
        ComplexityKind::NewBoundMcAllester => {
            ensure!(
                n_samples > 1,
                "NewBoundMcAllaster needs at least 2 training samples"
            );
            let hyper = hyper_or_zero(hyper_kl, &device)?;
            let scale = 1.0 / (2.0 * (n - 1.0));
            let log_term = (2.0 * n / delta).ln();
            hyper
                .add(&tot_kld)?
                .affine(scale, log_term * scale)?
                .sqrt()?
        }
        ComplexityKind::NewBoundSeeger => {
            let hyper = hyper_or_zero(hyper_kl, &device)?;
            let log_term = (4.0 * n.sqrt() / delta).ln();
            let seeger_eps = tot_kld.add(&hyper)?.affine(1.0 / n, log_term / n)?;
            seeger_bound(&seeger_eps, empirical_loss)?
        }
    };
    Ok(term)
}

/// `2e + sqrt(2e * L)`, with the sqrt argument clamped at zero so float
/// error can never produce a NaN.
fn seeger_bound(seeger_eps: &Tensor, empirical_loss: &Tensor) -> Result<Tensor> {
    let sqrt_arg = seeger_eps
        .mul(empirical_loss)?
        .affine(2.0, 0.0)?
        .relu()?
        .sqrt()?;
    Ok(seeger_eps.affine(2.0, 0.0)?.add(&sqrt_arg)?)
}

fn hyper_or_zero(hyper_kl: Option<&Tensor>, device: &Device) -> Result<Tensor> {
    match hyper_kl {
        Some(t) => Ok(t.clone()),
        None => zero_scalar(device),
    }
}

/// Meta-level (across-tasks) complexity term. With zero training tasks the
/// term is defined as zero, the infinite-tasks limit.
pub fn meta_complexity(
    kind: ComplexityKind,
    hyper_kl: &Tensor,
    n_train_tasks: usize,
    delta: f64,
) -> Result<Tensor> {
    if n_train_tasks == 0 {
        return zero_scalar(hyper_kl.device());
    }
    let t = n_train_tasks as f64;
    let term = match kind {
        ComplexityKind::NewBoundMcAllester | ComplexityKind::NewBoundSeeger => {
            let log_term = (4.0 * t.sqrt() / delta).ln();
            hyper_kl.affine(1.0 / (2.0 * t), log_term)?.sqrt()?
        }
        ComplexityKind::Kld => hyper_kl.clone(),
        _ => hyper_kl.affine(1.0 / t.sqrt(), 0.0)?,
    };
    Ok(term)
}

/// L1 norm over all parameters of a stochastic model; the hyper-prior
/// regularizer applied to the shared prior.
pub fn net_l1_norm(net: &StochasticNet) -> Result<Tensor> {
    let device = net.params()[0].mean().device().clone();
    let mut total = zero_scalar(&device)?;
    for param in net.params() {
        total = total.add(&param.mean().abs()?.sum_all()?)?;
        total = total.add(&param.log_var().abs()?.sum_all()?)?;
    }
    Ok(total)
}
