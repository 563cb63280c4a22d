use crate::candle_loss_functions::{gaussian_kl_divergence, log_sum_exp};

use candle_core::{Result, Tensor};
use candle_nn::ops;
use rand::Rng;
use rand_distr::StandardNormal;

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// A batch of Gaussian mixtures over a `k`-dimensional latent space,
/// one mixture of `m` diagonal components per row.
///
/// * `log_weights` - normalized mixture log-weights (n x m)
/// * `means` - component means (n x m x k)
/// * `log_vars` - component log variances (n x m x k)
#[derive(Clone, Debug)]
pub struct GaussianMixture {
    pub log_weights: Tensor,
    pub means: Tensor,
    pub log_vars: Tensor,
}

impl GaussianMixture {
    /// Normalize the logits `logits_nm` by log-softmax and bundle the
    /// component parameters.
    pub fn new(logits_nm: &Tensor, means_nmk: Tensor, log_vars_nmk: Tensor) -> Result<Self> {
        debug_assert_eq!(means_nmk.dims(), log_vars_nmk.dims());
        Ok(Self {
            log_weights: ops::log_softmax(logits_nm, 1)?,
            means: means_nmk,
            log_vars: log_vars_nmk,
        })
    }

    pub fn num_modes(&self) -> usize {
        self.means.dims()[1]
    }

    pub fn dim_latent(&self) -> usize {
        self.means.dims()[2]
    }

    /// mixture weights (n x m), each row sums to one
    pub fn weights(&self) -> Result<Tensor> {
        self.log_weights.exp()
    }

    /// Draw one component per row by the Gumbel-max trick.
    ///
    /// Returns a one-hot (n x m) selection matrix; no gradient flows
    /// through the choice. The uniform noise comes from `rng`.
    pub fn sample_component<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Tensor> {
        let log_w = self.log_weights.detach();
        let (n, m) = log_w.dims2()?;
        let u: Vec<f32> = (0..n * m)
            .map(|_| rng.random::<f32>().clamp(1e-10, 1. - 1e-7))
            .collect();
        let u = Tensor::from_vec(u, (n, m), log_w.device())?.to_dtype(log_w.dtype())?;
        let gumbel = u.log()?.neg()?.log()?.neg()?;
        let choice_n1 = (&log_w + gumbel)?.argmax_keepdim(1)?;

        let modes_1m = Tensor::arange(0u32, m as u32, log_w.device())?.unsqueeze(0)?;
        choice_n1
            .broadcast_eq(&modes_1m)?
            .to_dtype(self.means.dtype())
    }

    /// Reparameterized draw (n x k)
    ///
    /// z = mu[c] + sigma[c] * eps, where c ~ Categorical(w)
    /// and eps ~ N(0, I), both drawn from `rng`
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Tensor> {
        let onehot_nm1 = self.sample_component(rng)?.unsqueeze(2)?;
        let mean_nk = self.means.broadcast_mul(&onehot_nm1)?.sum(1)?;
        let lnvar_nk = self.log_vars.broadcast_mul(&onehot_nm1)?.sum(1)?;

        let (n, k) = mean_nk.dims2()?;
        let eps: Vec<f32> = (0..n * k).map(|_| rng.sample(StandardNormal)).collect();
        let eps = Tensor::from_vec(eps, (n, k), mean_nk.device())?.to_dtype(mean_nk.dtype())?;
        mean_nk + (lnvar_nk * 0.5)?.exp()?.mul(&eps)?
    }

    /// Log density of `z_nk` under each row's mixture (n)
    ///
    /// ln p(z) = logsumexp_m [ ln w(m) + sum_k ln N(z(k); mu(m,k), var(m,k)) ]
    pub fn log_prob(&self, z_nk: &Tensor) -> Result<Tensor> {
        let z_n1k = z_nk.unsqueeze(1)?;
        let diff_sq = self.means.broadcast_sub(&z_n1k)?.sqr()?;
        let scaled = (diff_sq / self.log_vars.exp()?)?;
        let comp_nm = (((scaled + &self.log_vars)? + LN_2PI)?.sum(2)? * (-0.5))?;
        log_sum_exp(&(comp_nm + &self.log_weights)?, 1)
    }

    /// Monte Carlo KL divergence estimate at given draws from `self`
    ///
    /// KL(q || p) ≈ ln q(z) - ln p(z), with z ~ q
    pub fn kl_divergence_at(&self, other: &GaussianMixture, z_nk: &Tensor) -> Result<Tensor> {
        self.log_prob(z_nk)? - other.log_prob(z_nk)?
    }

    /// KL(self || other) per row (n)
    ///
    /// Closed form when both sides are single Gaussians. Otherwise the
    /// average of `num_samples` Monte Carlo estimates: the first at the
    /// given draw `z_nk ~ self`, the rest at fresh draws from `rng`.
    pub fn kl_divergence<R: Rng + ?Sized>(
        &self,
        other: &GaussianMixture,
        z_nk: &Tensor,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        if self.num_modes() == 1 && other.num_modes() == 1 {
            return gaussian_kl_divergence(
                &self.means.squeeze(1)?,
                &self.log_vars.squeeze(1)?,
                &other.means.squeeze(1)?,
                &other.log_vars.squeeze(1)?,
            );
        }

        let num_samples = num_samples.max(1);
        let mut kl_sum = self.kl_divergence_at(other, z_nk)?;
        for _ in 1..num_samples {
            kl_sum = (kl_sum + self.kl_divergence_at(other, &self.sample(rng)?)?)?;
        }
        kl_sum / num_samples as f64
    }
}
