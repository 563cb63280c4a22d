use crate::config::{Bounds, ParamRange, RunConfig};
use crate::error::{config_error, shape_error};
use crate::param_registry::{ParamRegistry, SplitIndex, DISTANCE, GEOCENT_TIME, PHASE};

use ndarray::{Array2, Array3, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::TAU;
use std::sync::Arc;

/// A block of training pairs
///
/// * `params` - normalized source parameters (n x p)
/// * `waveforms` - noise-free waveforms in strain units (n x t x d)
#[derive(Clone, Debug)]
pub struct WaveformChunk {
    pub params: Array2<f32>,
    pub waveforms: Array3<f32>,
}

impl WaveformChunk {
    pub fn new(params: Array2<f32>, waveforms: Array3<f32>) -> anyhow::Result<Self> {
        if params.nrows() != waveforms.len_of(Axis(0)) {
            return Err(shape_error(format!(
                "{} parameter rows vs. {} waveforms",
                params.nrows(),
                waveforms.len_of(Axis(0))
            )));
        }
        Ok(Self { params, waveforms })
    }

    pub fn len(&self) -> usize {
        self.params.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.params.nrows() == 0
    }
}

/// A randomized parameter: its position and physical range
#[derive(Clone, Copy, Debug)]
struct Randomized {
    index: usize,
    range: ParamRange,
}

///
/// Randomizes phase, arrival time and distance of noise-free training
/// pairs, then adds white noise and applies the global amplitude scale
///
pub struct Augmenter {
    phase: Option<Randomized>,
    time: Option<Randomized>,
    distance: Option<Randomized>,
    split: SplitIndex,
    duration: f64,
    noise_amp: f32,
    y_normscale: f32,
    ndata: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Augmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Augmenter")
            .field("phase", &self.phase)
            .field("time", &self.time)
            .field("distance", &self.distance)
            .field("split", &self.split)
            .field("duration", &self.duration)
            .field("noise_amp", &self.noise_amp)
            .field("y_normscale", &self.y_normscale)
            .field("ndata", &self.ndata)
            .finish_non_exhaustive()
    }
}

impl Augmenter {
    pub fn new(config: &RunConfig, registry: &ParamRegistry, bounds: &Bounds) -> anyhow::Result<Self> {
        let lookup = |name: &str, enabled: bool| -> anyhow::Result<Option<Randomized>> {
            match registry.index_of(name) {
                Some(index) if enabled => Ok(Some(Randomized {
                    index,
                    range: bounds.get(name)?,
                })),
                _ => Ok(None),
            }
        };

        let phase = lookup(PHASE, config.augment.phase)?;
        let time = lookup(GEOCENT_TIME, config.augment.time)?;
        let distance = lookup(DISTANCE, config.augment.distance)?;
        if let Some(r) = distance.filter(|r| r.range.min <= 0.) {
            return Err(config_error(format!(
                "rescaling needs a positive luminosity_distance_min, got {}",
                r.range.min
            )));
        }

        let mut planner = FftPlanner::<f32>::new();

        Ok(Self {
            phase,
            time,
            distance,
            split: registry.split(&[PHASE, GEOCENT_TIME, DISTANCE]),
            duration: config.duration,
            noise_amp: config.noise_amp,
            y_normscale: config.y_normscale,
            ndata: config.ndata,
            fft: planner.plan_fft_forward(config.ndata),
            ifft: planner.plan_fft_inverse(config.ndata),
        })
    }

    /// Randomize, add noise and scale a noise-free chunk
    pub fn augment<R: Rng + ?Sized>(
        &self,
        chunk: &WaveformChunk,
        rng: &mut R,
    ) -> anyhow::Result<WaveformChunk> {
        let (n, t, _) = chunk.waveforms.dim();
        if t != self.ndata {
            return Err(shape_error(format!("{} time samples, expected {}", t, self.ndata)));
        }

        let mut subset = chunk.params.select(Axis(1), &self.split.subset);
        let mut shifts = vec![Shift::default(); n];

        for (i, shift) in shifts.iter_mut().enumerate() {
            for (s, &p) in self.split.subset.iter().enumerate() {
                let old = subset[[i, s]] as f64;
                let new: f64 = rng.random();

                if let Some(r) = self.phase.filter(|r| r.index == p) {
                    shift.dphase = (new - old) * r.range.width();
                } else if let Some(r) = self.time.filter(|r| r.index == p) {
                    shift.dtime = (new - old) * r.range.width();
                } else if let Some(r) = self.distance.filter(|r| r.index == p) {
                    let d_old = r.range.min + old * r.range.width();
                    let d_new = r.range.min + new * r.range.width();
                    shift.scale = d_old / d_new;
                } else {
                    continue;
                }
                subset[[i, s]] = new as f32;
            }
        }

        let mut waveforms = chunk.waveforms.clone();

        waveforms
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(shifts.par_iter())
            .for_each(|(mut y_td, shift)| {
                if shift.dphase != 0. || shift.dtime != 0. {
                    for mut y_t in y_td.axis_iter_mut(Axis(1)) {
                        let mut buf: Vec<Complex32> =
                            y_t.iter().map(|&v| Complex32::new(v, 0.)).collect();
                        self.fft.process(&mut buf);
                        self.rotate_spectrum(&mut buf, shift);
                        self.ifft.process(&mut buf);
                        let norm = 1. / self.ndata as f32;
                        y_t.iter_mut().zip(buf.iter()).for_each(|(v, c)| *v = c.re * norm);
                    }
                }
                if shift.scale != 1. {
                    y_td.mapv_inplace(|v| v * shift.scale as f32);
                }
            });

        self.add_noise(&mut waveforms, rng);

        let params = self.reassemble(&chunk.params, &subset);
        WaveformChunk::new(params, waveforms)
    }

    /// Additive white noise `noise_amp * N(0, 1)`, then division by the
    /// global normalization scale
    pub fn add_noise<R: Rng + ?Sized>(&self, waveforms: &mut Array3<f32>, rng: &mut R) {
        let noise_amp = self.noise_amp;
        let scale = self.y_normscale;
        waveforms.mapv_inplace(|v| {
            let eps: f32 = StandardNormal.sample(rng);
            (v + noise_amp * eps) / scale
        });
    }

    /// Put the randomized columns back in registry order
    fn reassemble(&self, params: &Array2<f32>, subset: &Array2<f32>) -> Array2<f32> {
        let complement = params.select(Axis(1), &self.split.complement);
        let mut out = Array2::<f32>::zeros(params.dim());
        let nc = complement.ncols();
        for (j, &c) in self.split.restore.iter().enumerate() {
            if c < nc {
                out.column_mut(j).assign(&complement.column(c));
            } else {
                out.column_mut(j).assign(&subset.column(c - nc));
            }
        }
        out
    }

    /// exp(i dphase) on positive frequencies (conjugate on negative),
    /// times exp(-2 pi i f dt); DC and Nyquist bins keep a real factor
    fn rotate_spectrum(&self, buf: &mut [Complex32], shift: &Shift) {
        let n = buf.len();
        for (k, c) in buf.iter_mut().enumerate() {
            let (signed_k, sign) = if k == 0 || 2 * k == n {
                (k as f64, 0.)
            } else if 2 * k < n {
                (k as f64, 1.)
            } else {
                (k as f64 - n as f64, -1.)
            };
            let freq = signed_k / self.duration;
            let angle = sign * shift.dphase - TAU * freq * shift.dtime;
            let factor = if sign == 0. {
                Complex32::new(angle.cos() as f32, 0.)
            } else {
                Complex32::new(angle.cos() as f32, angle.sin() as f32)
            };
            *c *= factor;
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Shift {
    dphase: f64,
    dtime: f64,
    scale: f64,
}

impl Default for Shift {
    fn default() -> Self {
        Self {
            dphase: 0.,
            dtime: 0.,
            scale: 1.,
        }
    }
}
