use crate::circular::{normalize3, sample_gaussian, sample_von_mises, sample_vmf_s2};
use crate::config::{Bounds, ParamRange};
use crate::param_registry::{ParamRegistry, DEC, RA};

use candle_core::{Device, Result, Tensor};
use candle_nn::ops;
use ndarray::{Array2, ArrayView1};
use rand::Rng;
use std::f64::consts::TAU;
use vitamin_nn::candle_loss_functions::{
    gaussian_log_density, von_mises_log_density, vmf_s2_log_density,
};

pub const MIN_LOGVAR: f64 = -16.;
pub const MAX_LOGVAR: f64 = 16.;
/// added to every Gaussian head variance
pub const VAR_FLOOR: f64 = 1e-6;

/// One group-wise output likelihood over normalized parameters
#[derive(Clone, Debug)]
pub enum LikelihoodHead {
    /// independent Gaussians: raw = [mean logits | log variances]
    Gaussian { indices: Vec<usize> },
    /// independent von Mises on a unit period: raw = [loc logits | log
    /// inverse concentrations]
    VonMises { indices: Vec<usize> },
    /// von Mises-Fisher on the sphere for (ra, dec), optionally with a
    /// Gaussian distance: raw = [x, y, z, log inverse concentration
    /// (, distance logit, distance log variance)]
    Sky {
        ra: usize,
        dec: usize,
        distance: Option<usize>,
        ra_range: ParamRange,
        dec_range: ParamRange,
    },
}

impl LikelihoodHead {
    /// width of this head's slice of the decoder output
    pub fn raw_width(&self) -> usize {
        match self {
            LikelihoodHead::Gaussian { indices } | LikelihoodHead::VonMises { indices } => {
                2 * indices.len()
            }
            LikelihoodHead::Sky { distance, .. } => {
                if distance.is_some() {
                    6
                } else {
                    4
                }
            }
        }
    }

    /// Log-likelihood (n) of the observed normalized parameters
    ///
    /// * `x_np` - all normalized parameters (n x p)
    /// * `raw_nr` - this head's raw decoder output (n x raw_width)
    pub fn log_likelihood(&self, x_np: &Tensor, raw_nr: &Tensor) -> Result<Tensor> {
        match self {
            LikelihoodHead::Gaussian { indices } => {
                let k = indices.len();
                let x_nk = select_columns(x_np, indices)?;
                let mean_nk = ops::sigmoid(&raw_nr.narrow(1, 0, k)?)?;
                let var_nk = gaussian_variance(&raw_nr.narrow(1, k, k)?)?;
                gaussian_log_density(&x_nk, &mean_nk, &var_nk)?.sum(1)
            }
            LikelihoodHead::VonMises { indices } => {
                let k = indices.len();
                let x_nk = select_columns(x_np, indices)?;
                let loc_nk = ops::sigmoid(&raw_nr.narrow(1, 0, k)?)?;
                let kappa_nk = concentration(&raw_nr.narrow(1, k, k)?)?;
                von_mises_log_density(&x_nk, &loc_nk, &kappa_nk)?.sum(1)
            }
            LikelihoodHead::Sky {
                ra,
                dec,
                distance,
                ra_range,
                dec_range,
            } => {
                let ra_n = (x_np.narrow(1, *ra, 1)?.affine(ra_range.width(), ra_range.min))?;
                let dec_n = (x_np.narrow(1, *dec, 1)?.affine(dec_range.width(), dec_range.min))?;
                let cos_dec = dec_n.cos()?;
                let unit_n3 = Tensor::cat(
                    &[
                        (&cos_dec * ra_n.cos()?)?,
                        (&cos_dec * ra_n.sin()?)?,
                        dec_n.sin()?,
                    ],
                    1,
                )?;

                let dir_n3 = raw_nr.narrow(1, 0, 3)?;
                let norm_n1 = (dir_n3.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-8)?;
                let mu_n3 = dir_n3.broadcast_div(&norm_n1)?;
                let cos_sim_n = (mu_n3 * unit_n3)?.sum(1)?;
                let kappa_n = concentration(&raw_nr.narrow(1, 3, 1)?)?.squeeze(1)?;

                // density of normalized (ra, dec): solid angle
                // d(omega) = cos(dec) d(ra) d(dec)
                let log_jacobian = ((cos_dec.abs()?.clamp(1e-8, 1.)?.log()?
                    + (ra_range.width() * dec_range.width()).ln())?)
                .squeeze(1)?;

                let mut llik_n = (vmf_s2_log_density(&cos_sim_n, &kappa_n)? + log_jacobian)?;

                if let Some(d) = distance {
                    let x_n1 = x_np.narrow(1, *d, 1)?;
                    let mean_n1 = ops::sigmoid(&raw_nr.narrow(1, 4, 1)?)?;
                    let var_n1 = gaussian_variance(&raw_nr.narrow(1, 5, 1)?)?;
                    llik_n = (llik_n + gaussian_log_density(&x_n1, &mean_n1, &var_n1)?.squeeze(1)?)?;
                }
                Ok(llik_n)
            }
        }
    }

    /// Draw this head's parameters for one row into `out`
    ///
    /// Returns `false` if any decoded statistic is not finite.
    pub fn sample_row<R: Rng + ?Sized>(
        &self,
        raw: ArrayView1<f32>,
        rng: &mut R,
        out: &mut [f32],
    ) -> bool {
        if raw.iter().any(|v| !v.is_finite()) {
            self.targets().into_iter().for_each(|i| out[i] = f32::NAN);
            return false;
        }

        match self {
            LikelihoodHead::Gaussian { indices } => {
                let k = indices.len();
                for (j, &i) in indices.iter().enumerate() {
                    let mean = sigmoid(raw[j] as f64);
                    let sd = host_variance(raw[k + j] as f64).sqrt();
                    out[i] = sample_gaussian(rng, mean, sd) as f32;
                }
            }
            LikelihoodHead::VonMises { indices } => {
                let k = indices.len();
                for (j, &i) in indices.iter().enumerate() {
                    let loc = sigmoid(raw[j] as f64) * TAU;
                    let kappa = host_concentration(raw[k + j] as f64);
                    out[i] = (sample_von_mises(rng, loc, kappa) / TAU) as f32;
                }
            }
            LikelihoodHead::Sky {
                ra,
                dec,
                distance,
                ra_range,
                dec_range,
            } => {
                let mu = normalize3([raw[0] as f64, raw[1] as f64, raw[2] as f64]);
                let kappa = host_concentration(raw[3] as f64);
                let v = sample_vmf_s2(rng, mu, kappa);
                let ra_val = (v[1].atan2(v[0]) - ra_range.min).rem_euclid(ra_range.width());
                let dec_val = v[2].clamp(-1.0, 1.0).asin();
                out[*ra] = (ra_val / ra_range.width()) as f32;
                out[*dec] = ((dec_val - dec_range.min) / dec_range.width()) as f32;

                if let Some(d) = distance {
                    let mean = sigmoid(raw[4] as f64);
                    let sd = host_variance(raw[5] as f64).sqrt();
                    out[*d] = sample_gaussian(rng, mean, sd) as f32;
                }
            }
        }
        self.targets().into_iter().all(|i| out[i].is_finite())
    }

    /// parameter positions this head covers
    pub fn targets(&self) -> Vec<usize> {
        match self {
            LikelihoodHead::Gaussian { indices } | LikelihoodHead::VonMises { indices } => {
                indices.clone()
            }
            LikelihoodHead::Sky {
                ra, dec, distance, ..
            } => [Some(*ra), Some(*dec), *distance].into_iter().flatten().collect(),
        }
    }
}

fn select_columns(x_np: &Tensor, indices: &[usize]) -> Result<Tensor> {
    let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    let idx = Tensor::from_vec(idx, indices.len(), x_np.device())?;
    x_np.index_select(&idx, 1)
}

fn gaussian_variance(raw_lnvar: &Tensor) -> Result<Tensor> {
    raw_lnvar.clamp(MIN_LOGVAR, MAX_LOGVAR)?.exp()? + VAR_FLOOR
}

fn concentration(raw_lnvar: &Tensor) -> Result<Tensor> {
    raw_lnvar.clamp(MIN_LOGVAR, MAX_LOGVAR)?.neg()?.exp()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn host_variance(raw_lnvar: f64) -> f64 {
    raw_lnvar.clamp(MIN_LOGVAR, MAX_LOGVAR).exp() + VAR_FLOOR
}

fn host_concentration(raw_lnvar: f64) -> f64 {
    (-raw_lnvar.clamp(MIN_LOGVAR, MAX_LOGVAR)).exp()
}

///
/// All output likelihoods of the decoder, assembled once from the
/// parameter registry. The decoder's raw output is the concatenation
/// of every head's slice, in the order of `heads`.
///
#[derive(Clone, Debug)]
pub struct LikelihoodHeads {
    heads: Vec<LikelihoodHead>,
    offsets: Vec<usize>,
    raw_dim: usize,
    num_params: usize,
}

impl LikelihoodHeads {
    pub fn new(registry: &ParamRegistry, bounds: &Bounds) -> anyhow::Result<Self> {
        let mut heads = vec![];

        if !registry.gauss().is_empty() {
            heads.push(LikelihoodHead::Gaussian {
                indices: registry.gauss().indices.clone(),
            });
        }

        if !registry.vonmise().is_empty() {
            heads.push(LikelihoodHead::VonMises {
                indices: registry.vonmise().indices.clone(),
            });
        }

        if let Some(sky) = registry.sky_layout() {
            heads.push(LikelihoodHead::Sky {
                ra: sky.ra,
                dec: sky.dec,
                distance: sky.distance,
                ra_range: bounds.get(RA)?,
                dec_range: bounds.get(DEC)?,
            });
        }

        Ok(Self::from_heads(heads, registry.num_params()))
    }

    pub fn from_heads(heads: Vec<LikelihoodHead>, num_params: usize) -> Self {
        let mut offsets = Vec::with_capacity(heads.len());
        let mut raw_dim = 0;
        for h in heads.iter() {
            offsets.push(raw_dim);
            raw_dim += h.raw_width();
        }
        Self {
            heads,
            offsets,
            raw_dim,
            num_params,
        }
    }

    pub fn heads(&self) -> &[LikelihoodHead] {
        &self.heads
    }

    /// decoder output width
    pub fn raw_dim(&self) -> usize {
        self.raw_dim
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Reconstruction log-likelihood (n), summed over heads
    ///
    /// * `x_np` - observed normalized parameters
    /// * `raw_nr` - raw decoder output
    pub fn log_likelihood(&self, x_np: &Tensor, raw_nr: &Tensor) -> Result<Tensor> {
        let n = x_np.dims()[0];
        let mut llik_n = Tensor::zeros(n, raw_nr.dtype(), raw_nr.device())?;
        for (head, &offset) in self.heads.iter().zip(self.offsets.iter()) {
            let raw = raw_nr.narrow(1, offset, head.raw_width())?;
            llik_n = (llik_n + head.log_likelihood(x_np, &raw)?)?;
        }
        Ok(llik_n)
    }

    /// Draw one parameter vector per row of the raw decoder output
    ///
    /// Returns the (n x p) normalized samples in registry order and a
    /// per-row flag marking rows with non-finite statistics or draws.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        raw_nr: &Tensor,
        rng: &mut R,
    ) -> anyhow::Result<(Array2<f32>, Vec<bool>)> {
        let raw_nr = raw_nr.to_device(&Device::Cpu)?.to_dtype(candle_core::DType::F32)?;
        let (n, r) = raw_nr.dims2()?;
        let raw = Array2::from_shape_vec((n, r), raw_nr.flatten_all()?.to_vec1::<f32>()?)?;

        let mut samples = Array2::<f32>::zeros((n, self.num_params));
        let mut flagged = vec![false; n];
        let mut buf = vec![0f32; self.num_params];

        for (i, row) in raw.rows().into_iter().enumerate() {
            let mut finite = true;
            for (head, &offset) in self.heads.iter().zip(self.offsets.iter()) {
                let slice = row.slice(ndarray::s![offset..offset + head.raw_width()]);
                finite &= head.sample_row(slice, rng, &mut buf);
            }
            flagged[i] = !finite;
            samples
                .row_mut(i)
                .iter_mut()
                .zip(buf.iter())
                .for_each(|(s, &b)| *s = b);
        }

        Ok((samples, flagged))
    }
}
