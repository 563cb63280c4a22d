use core::f64;

use candle_core::{Result, Tensor};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// KL divergence between two diagonal Gaussian distributions
///
/// KL(q || p) = 0.5 * sum_d [ lnvar_p - lnvar_q
///                           + (var_q + (mu_q - mu_p)^2) / var_p - 1 ]
///
/// * `q_mean`, `q_lnvar` - mean and log variance of `q`
/// * `p_mean`, `p_lnvar` - mean and log variance of `p`
///
/// Summed over the last dimension.
pub fn gaussian_kl_divergence(
    q_mean: &Tensor,
    q_lnvar: &Tensor,
    p_mean: &Tensor,
    p_lnvar: &Tensor,
) -> Result<Tensor> {
    let q_var = q_lnvar.exp()?;
    let p_var = p_lnvar.exp()?;
    let diff_sq = (q_mean - p_mean)?.sqr()?;
    let ratio = ((q_var + diff_sq)? / p_var)?;
    let kl = (((p_lnvar - q_lnvar)? + ratio)? - 1.)?;
    kl.sum(q_mean.rank() - 1)? * 0.5
}

/// Element-wise Gaussian log density
///
/// ln N(x; mu, var) = -0.5 * [ ln(2π) + ln(var) + (x - mu)^2 / var ]
///
/// * `x` - observed values
/// * `mean` - location
/// * `var` - variance (strictly positive)
pub fn gaussian_log_density(x: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let scaled_sq = (x - mean)?.sqr()?.div(var)?;
    ((scaled_sq + var.log()?)? + LN_2PI)? * (-0.5)
}

/// Log of the modified Bessel function of the first kind, order zero
///
/// Polynomial approximations (Abramowitz & Stegun 9.8.1 and 9.8.2):
/// * x <= 3.75: I0(x) = poly((x/3.75)^2)
/// * x > 3.75:  I0(x) = exp(x) / sqrt(x) * poly(3.75/x)
///
/// The large-argument branch never exponentiates, so very
/// concentrated von Mises heads stay finite.
pub fn log_bessel_i0(kappa: &Tensor) -> Result<Tensor> {
    const SMALL: [f64; 7] = [
        1.0, 3.5156229, 3.0899424, 1.2067492, 0.2659732, 0.0360768, 0.0045813,
    ];
    const LARGE: [f64; 9] = [
        0.39894228,
        0.01328592,
        0.00225319,
        -0.00157565,
        0.00916281,
        -0.02057706,
        0.02635537,
        -0.01647633,
        0.00392377,
    ];
    let x_small = kappa.clamp(0., 3.75)?;
    let t2 = (x_small / 3.75)?.sqr()?;
    let log_small = horner(&t2, &SMALL)?.log()?;

    let x_large = kappa.maximum(3.75)?;
    let u = x_large.recip()?.affine(3.75, 0.)?;
    let log_large = ((&x_large - (x_large.log()? * 0.5)?)? + horner(&u, &LARGE)?.log()?)?;

    kappa.le(3.75)?.where_cond(&log_small, &log_large)
}

/// Evaluate `sum_j coeffs[j] * t^j`
fn horner(t: &Tensor, coeffs: &[f64]) -> Result<Tensor> {
    let mut acc = t.zeros_like()?;
    for &c in coeffs.iter().rev() {
        acc = (acc.mul(t)? + c)?;
    }
    Ok(acc)
}

/// Element-wise von Mises log density on a unit-period circle
///
/// x and loc live on [0, 1), so the angle is 2π (x - loc):
///
/// ln p(x) = kappa * cos(2π (x - loc)) - ln I0(kappa)
///
/// (the 2π Jacobian cancels the 1/2π normalizer)
pub fn von_mises_log_density(x: &Tensor, loc: &Tensor, kappa: &Tensor) -> Result<Tensor> {
    let angle = ((x - loc)? * f64::consts::TAU)?;
    angle.cos()?.mul(kappa)?.sub(&log_bessel_i0(kappa)?)
}

/// Von Mises-Fisher log density on the 2-sphere
///
/// ln p(u) = ln(kappa) - ln(2π) - kappa - ln(1 - exp(-2 kappa)) + kappa * mu'u
///
/// The first and fourth terms are evaluated together as
/// ln g(2 kappa) - ln 2 with g(x) = x / (1 - exp(-x)), using the
/// series 1 + x/2 + x^2/12 below `x = 0.05`.
///
/// * `cos_sim` - inner product mu'u of unit vectors
/// * `kappa` - concentration (strictly positive)
pub fn vmf_s2_log_density(cos_sim: &Tensor, kappa: &Tensor) -> Result<Tensor> {
    const SERIES_MAX: f64 = 0.05;
    let x = (kappa * 2.)?;
    let series = horner(&x, &[1.0, 0.5, 1.0 / 12.0])?;
    let x_big = x.maximum(SERIES_MAX)?;
    let direct = (&x_big / (x_big.neg()?.exp()?.neg()? + 1.)?)?;
    let log_g = x.lt(SERIES_MAX)?.where_cond(&series, &direct)?.log()?;

    let log_norm = ((log_g - kappa)? - (2. * f64::consts::TAU).ln())?;
    log_norm.add(&cos_sim.mul(kappa)?)
}

/// Numerically stable log(sum(exp(x))) along `dim` (dropped)
pub fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    let shifted = x.broadcast_sub(&max)?;
    shifted
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .add(&max)?
        .squeeze(dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    /// log I0(x) = log sum_j (x/2)^{2j} / (j!)^2
    fn log_bessel_i0_series(x: f64) -> f64 {
        let log_half = (0.5 * x).ln();
        let mut log_terms = vec![0.0];
        let mut log_fact = 0.0;
        for j in 1..200 {
            log_fact += (j as f64).ln();
            log_terms.push(2.0 * j as f64 * log_half - 2.0 * log_fact);
        }
        let max = log_terms.iter().cloned().fold(f64::NEG_INFINITY, |a, b| a.max(b));
        max + log_terms.iter().map(|l| (l - max).exp()).sum::<f64>().ln()
    }

    #[test]
    fn bessel_matches_series() -> Result<()> {
        let xs = [0.01f32, 0.5, 1.0, 3.0, 3.75, 4.0, 10.0, 50.0];
        let kappa = Tensor::new(&xs, &Device::Cpu)?;
        let approx: Vec<f32> = log_bessel_i0(&kappa)?.to_vec1()?;
        for (x, a) in xs.iter().zip(approx.iter()) {
            let exact = log_bessel_i0_series(*x as f64);
            assert_abs_diff_eq!(*a as f64, exact, epsilon = 1e-3 * exact.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn von_mises_integrates_to_one() -> Result<()> {
        let dev = Device::Cpu;
        let n = 2000;
        let grid: Vec<f32> = (0..n).map(|i| (i as f32 + 0.5) / n as f32).collect();
        let x = Tensor::from_vec(grid, n, &dev)?;
        for k in [0.5f32, 4.0, 40.0] {
            let loc = Tensor::full(0.3f32, n, &dev)?;
            let kappa = Tensor::full(k, n, &dev)?;
            let dens = von_mises_log_density(&x, &loc, &kappa)?.exp()?;
            let mass = dens.sum_all()?.to_scalar::<f32>()? / n as f32;
            assert_abs_diff_eq!(mass, 1.0, epsilon = 1e-2);
        }
        Ok(())
    }

    #[test]
    fn vmf_flattens_to_uniform_sphere() -> Result<()> {
        let dev = Device::Cpu;
        let kappa = Tensor::new(&[1e-7f32, 1e-3, 0.02], &dev)?;
        let cos_sim = Tensor::zeros(3, candle_core::DType::F32, &dev)?;
        let lp: Vec<f32> = vmf_s2_log_density(&cos_sim, &kappa)?.to_vec1()?;
        let uniform = -(2. * std::f64::consts::TAU).ln();
        for (v, k) in lp.iter().zip([1e-7f64, 1e-3, 0.02]) {
            // exact: ln(k / sinh(k)) + ln(1 / 4π)
            let exact = (k / k.sinh()).ln() + uniform;
            assert_abs_diff_eq!(*v as f64, exact, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn vmf_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        let ks = [0.5f32, 3.0, 40.0];
        let kappa = Tensor::new(&ks, &dev)?;
        let cos_sim = Tensor::new(&[0.2f32, -0.7, 0.95], &dev)?;
        let lp: Vec<f32> = vmf_s2_log_density(&cos_sim, &kappa)?.to_vec1()?;
        for ((v, k), c) in lp.iter().zip(ks).zip([0.2f64, -0.7, 0.95]) {
            let k = k as f64;
            let exact = k.ln() - (2. * std::f64::consts::TAU).ln() - k - (-(-2. * k).exp_m1()).ln() + k * c;
            assert_abs_diff_eq!(*v as f64, exact, epsilon = 1e-4 * exact.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn gaussian_kl_self_is_zero() -> Result<()> {
        let dev = Device::Cpu;
        let mu = Tensor::randn(0f32, 1f32, (4, 3), &dev)?;
        let lv = Tensor::randn(0f32, 1f32, (4, 3), &dev)?;
        let kl = gaussian_kl_divergence(&mu, &lv, &mu, &lv)?;
        assert_eq!(kl.dims(), &[4]);
        for v in kl.to_vec1::<f32>()? {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn log_sum_exp_stable() -> Result<()> {
        let x = Tensor::new(&[[1000f32, 1000.], [-3., 0.]], &Device::Cpu)?;
        let lse: Vec<f32> = log_sum_exp(&x, 1)?.to_vec1()?;
        assert_abs_diff_eq!(lse[0], 1000. + 2f32.ln(), epsilon = 1e-3);
        assert_abs_diff_eq!(lse[1], ((-3f32).exp() + 1.).ln(), epsilon = 1e-5);
        Ok(())
    }
}
