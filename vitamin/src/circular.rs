use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use std::f64::consts::{PI, TAU};

/// Draw an angle from a von Mises distribution (Best & Fisher, 1979)
///
/// * `mu` - mean angle (radians)
/// * `kappa` - concentration
///
/// Returns an angle in [0, 2π). Tiny concentrations fall back to a
/// uniform angle and very large ones to a Gaussian with variance 1/κ.
pub fn sample_von_mises<R: Rng + ?Sized>(rng: &mut R, mu: f64, kappa: f64) -> f64 {
    if kappa < 1e-8 {
        return rng.random_range(0.0..TAU);
    }

    if kappa > 1e5 {
        let eps: f64 = StandardNormal.sample(rng);
        return (mu + eps / kappa.sqrt()).rem_euclid(TAU);
    }

    let tau = 1.0 + (1.0 + 4.0 * kappa * kappa).sqrt();
    let rho = (tau - (2.0 * tau).sqrt()) / (2.0 * kappa);
    let r = (1.0 + rho * rho) / (2.0 * rho);

    loop {
        let u1: f64 = rng.random();
        let u2: f64 = rng.random();
        let z = (PI * u1).cos();
        let f = (1.0 + r * z) / (r + z);
        let c = kappa * (r - f);

        if c * (2.0 - c) - u2 > 0.0 || (c / u2).ln() + 1.0 - c >= 0.0 {
            let u3: f64 = rng.random();
            let theta = f.clamp(-1.0, 1.0).acos();
            let theta = if u3 > 0.5 { theta } else { -theta };
            return (mu + theta).rem_euclid(TAU);
        }
    }
}

/// Draw a unit vector from a von Mises-Fisher distribution on the
/// 2-sphere (Wood, 1994; the S² case has a closed-form inverse CDF)
///
/// * `mu` - mean direction (unit vector)
/// * `kappa` - concentration
pub fn sample_vmf_s2<R: Rng + ?Sized>(rng: &mut R, mu: [f64; 3], kappa: f64) -> [f64; 3] {
    let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);

    // cosine of the angle to the mean direction
    let w = if kappa < 1e-8 {
        2.0 * u - 1.0
    } else {
        (1.0 + (u + (1.0 - u) * (-2.0 * kappa).exp()).ln() / kappa).clamp(-1.0, 1.0)
    };

    let phi = rng.random_range(0.0..TAU);
    let (e1, e2) = orthonormal_basis(mu);
    let s = (1.0 - w * w).max(0.0).sqrt();

    let mut out = [0.0; 3];
    for k in 0..3 {
        out[k] = w * mu[k] + s * (phi.cos() * e1[k] + phi.sin() * e2[k]);
    }
    out
}

/// Two unit vectors orthogonal to `mu` and to each other
fn orthonormal_basis(mu: [f64; 3]) -> ([f64; 3], [f64; 3]) {
    // least aligned coordinate axis
    let axis = if mu[0].abs() <= mu[1].abs() && mu[0].abs() <= mu[2].abs() {
        [1.0, 0.0, 0.0]
    } else if mu[1].abs() <= mu[2].abs() {
        [0.0, 1.0, 0.0]
    } else {
        [0.0, 0.0, 1.0]
    };

    let e1 = normalize3(cross(mu, axis));
    let e2 = cross(mu, e1);
    (e1, e2)
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn normalize3(v: [f64; 3]) -> [f64; 3] {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt().max(1e-12);
    [v[0] / norm, v[1] / norm, v[2] / norm]
}

/// Gaussian draw with standard deviation `sd`
pub fn sample_gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f64, sd: f64) -> f64 {
    match Normal::new(mean, sd) {
        Ok(dist) => dist.sample(rng),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn von_mises_concentrates_on_mean() {
        let mut rng = StdRng::seed_from_u64(11);
        let mu = 1.0;
        let n = 20000;
        let (mut c, mut s) = (0.0, 0.0);
        for _ in 0..n {
            let theta = sample_von_mises(&mut rng, mu, 8.0);
            assert!((0.0..TAU).contains(&theta));
            c += theta.cos();
            s += theta.sin();
        }
        let mean_angle = s.atan2(c);
        assert!((mean_angle - mu).abs() < 0.02);

        // mean resultant length I1(8)/I0(8) ≈ 0.9352
        let r = (c * c + s * s).sqrt() / n as f64;
        assert!((r - 0.9352).abs() < 0.01, "resultant length {}", r);
    }

    #[test]
    fn vmf_samples_are_unit_vectors() {
        let mut rng = StdRng::seed_from_u64(5);
        let mu = normalize3([1.0, 2.0, -0.5]);
        let mut mean_cos = 0.0;
        let n = 5000;
        for _ in 0..n {
            let x = sample_vmf_s2(&mut rng, mu, 20.0);
            let norm = (x[0] * x[0] + x[1] * x[1] + x[2] * x[2]).sqrt();
            assert!((norm - 1.0).abs() < 1e-9);
            mean_cos += x[0] * mu[0] + x[1] * mu[1] + x[2] * mu[2];
        }
        // E[mu'x] = coth(κ) - 1/κ
        let expected = 1.0 / (20f64).tanh() - 1.0 / 20.0;
        assert!((mean_cos / n as f64 - expected).abs() < 0.01);
    }
}
