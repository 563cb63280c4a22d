use crate::checkpoint::CheckpointStore;
use crate::config::{Bounds, RunConfig};
use crate::decoder::ParamDecoder;
use crate::encoder::MixtureEncoder;
use crate::error::{config_error, shape_error, CvaeError};
use crate::heads::LikelihoodHeads;
use crate::param_registry::ParamRegistry;
use crate::ramp::RampSchedule;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use vitamin_nn::candle_aux_layers::init_varmap_from_rng;
use vitamin_nn::candle_data_loader::DataLoader;
use vitamin_nn::candle_model_traits::{DecoderModuleT, MixtureEncoderModuleT};

/// Where the model is in its life cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CvaeState {
    Built,
    Training,
    Checkpointed,
    Inference,
}

/// Reconstruction loss, KL divergence and `recon + ramp * kl`
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LossTriple {
    pub recon: f32,
    pub kl: f32,
    pub total: f32,
}

impl LossTriple {
    fn new(recon: f32, kl: f32, ramp: f32) -> Self {
        Self {
            recon,
            kl,
            total: recon + ramp * kl,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.recon.is_finite() && self.kl.is_finite() && self.total.is_finite()
    }
}

/// Per-epoch losses
#[derive(Clone, Debug, Default)]
pub struct LossTrace {
    pub train: Vec<LossTriple>,
    pub valid: Vec<LossTriple>,
}

/// Posterior draws for one waveform
///
/// * `samples` - normalized parameters (n x p), registry order
/// * `flagged` - rows whose decoded statistics were not finite
#[derive(Clone, Debug)]
pub struct PosteriorSamples {
    pub samples: Array2<f32>,
    pub flagged: Vec<bool>,
}

impl PosteriorSamples {
    pub fn num_flagged(&self) -> usize {
        self.flagged.iter().filter(|&&f| f).count()
    }

    /// rows that can be trusted
    pub fn finite_samples(&self) -> Array2<f32> {
        let keep: Vec<usize> = (0..self.flagged.len()).filter(|&i| !self.flagged[i]).collect();
        self.samples.select(ndarray::Axis(0), &keep)
    }
}

/// Latent-space diagnostics for one (waveform, parameter) pair
#[derive(Clone, Debug)]
pub struct LatentSamples {
    /// waveform-only encoder component means (m x k)
    pub prior_means: Array2<f32>,
    /// draws from the waveform-only encoder (n x k)
    pub prior_draws: Array2<f32>,
    /// full encoder component means (m x k)
    pub posterior_means: Array2<f32>,
    /// draws from the full encoder (n x k)
    pub posterior_draws: Array2<f32>,
}

///
/// The conditional VAE: owns the three sub-networks, their weights and
/// the optimizer state.
///
/// * `q` - full-information encoder, (waveform, parameters) -> latent
/// * `r1` - waveform-only encoder, waveform -> latent
/// * `r2` - decoder, (latent, waveform) -> likelihood statistics
///
pub struct Cvae<Enc = MixtureEncoder, Dec = ParamDecoder>
where
    Enc: MixtureEncoderModuleT,
    Dec: DecoderModuleT,
{
    config: RunConfig,
    registry: ParamRegistry,
    heads: LikelihoodHeads,
    varmap: VarMap,
    q: Enc,
    r1: Enc,
    r2: Dec,
    adam: AdamW,
    device: Device,
    rng: StdRng,
    ramp: RampSchedule,
    state: CvaeState,
    epoch: usize,
}

impl Cvae<MixtureEncoder, ParamDecoder> {
    /// Will create every weight in one variable map:
    ///
    /// * `q.*` full-information encoder
    /// * `r1.*` waveform-only encoder
    /// * `r2.*` decoder
    ///
    /// # Arguments
    /// * `config` - validated run configuration
    /// * `registry` - parameter partition
    /// * `bounds` - physical ranges (needed by the sky head)
    pub fn new(config: &RunConfig, registry: &ParamRegistry, bounds: &Bounds) -> anyhow::Result<Self> {
        config.validate(bounds)?;

        let device = config.device.to_device(config.device_no)?;
        let heads = LikelihoodHeads::new(registry, bounds)?;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let q = MixtureEncoder::new(config, registry.num_params(), vs.pp("q"))?;
        let r1 = MixtureEncoder::new(config, 0, vs.pp("r1"))?;
        let r2 = ParamDecoder::new(config, heads.raw_dim(), vs.pp("r2"))?;

        Self::from_parts(config, registry, heads, varmap, q, r1, r2, device)
    }
}

impl<Enc, Dec> Cvae<Enc, Dec>
where
    Enc: MixtureEncoderModuleT,
    Dec: DecoderModuleT,
{
    /// Assemble a model from sub-networks whose weights live in
    /// `varmap`
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        config: &RunConfig,
        registry: &ParamRegistry,
        heads: LikelihoodHeads,
        varmap: VarMap,
        q: Enc,
        r1: Enc,
        r2: Dec,
        device: Device,
    ) -> anyhow::Result<Self> {
        if q.dim_latent() != r2.dim_latent() || r1.dim_latent() != r2.dim_latent() {
            return Err(config_error(format!(
                "latent dims: q {}, r1 {}, r2 {}",
                q.dim_latent(),
                r1.dim_latent(),
                r2.dim_latent()
            )));
        }

        if r2.dim_output() != heads.raw_dim() {
            return Err(config_error(format!(
                "decoder emits {} statistics, heads need {}",
                r2.dim_output(),
                heads.raw_dim()
            )));
        }

        let mut rng = match config.seed {
            Some(seed) => {
                if !device.is_cpu() {
                    device.set_seed(seed)?;
                }
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_os_rng(),
        };
        init_varmap_from_rng(&varmap, &mut rng)?;

        let adam = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate as f64,
                weight_decay: 0.,
                ..Default::default()
            },
        )?;

        let ramp = RampSchedule {
            start: config.ramp_start,
            length: config.ramp_end,
            n_cycles: config.ramp_cycles,
            resumed: false,
        };

        Ok(Self {
            config: config.clone(),
            registry: registry.clone(),
            heads,
            varmap,
            q,
            r1,
            r2,
            adam,
            device,
            rng,
            ramp,
            state: CvaeState::Built,
            epoch: 0,
        })
    }

    pub fn state(&self) -> CvaeState {
        self.state
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// KL weight for `epoch`; always 1 after resuming from a checkpoint
    pub fn ramp_weight(&self, epoch: usize) -> f32 {
        self.ramp.weight(epoch)
    }

    ///
    /// Forward pass shared by training and validation
    ///
    /// Returns the scalar reconstruction loss (negative mean
    /// log-likelihood) and mean KL(q || r1). Latent noise comes from
    /// the model's own generator.
    fn forward_loss(
        &mut self,
        x_np: &Tensor,
        y_ntd: &Tensor,
        train: bool,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let prior = self.r1.forward_t(y_ntd, None, train)?;
        let posterior = self.q.forward_t(y_ntd, Some(x_np), train)?;
        let z_nk = posterior.sample(&mut self.rng)?;

        let llik_fn = |x: &Tensor, raw: &Tensor| self.heads.log_likelihood(x, raw);
        let (_, llik_n) = self
            .r2
            .forward_with_llik(&z_nk, y_ntd, x_np, &llik_fn, train)?;

        let kl_n = posterior.kl_divergence(&prior, &z_nk, self.config.n_kl_samples, &mut self.rng)?;

        Ok((llik_n.neg()?.mean_all()?, kl_n.mean_all()?))
    }

    /// One optimizer step on a minibatch
    ///
    /// * `x_np` - normalized parameters (n x p)
    /// * `y_ntd` - normalized waveforms (n x t x d)
    /// * `ramp` - KL weight
    ///
    /// A non-finite loss is returned as `CvaeError::NonFiniteLoss` and
    /// the weights are left as they were.
    pub fn train_step(&mut self, x_np: &Tensor, y_ntd: &Tensor, ramp: f32) -> anyhow::Result<LossTriple> {
        self.check_batch(x_np, y_ntd)?;
        self.state = CvaeState::Training;

        let (recon, kl) = self.forward_loss(x_np, y_ntd, true)?;
        let loss = (&recon + (&kl * ramp as f64)?)?;

        let triple = LossTriple::new(recon.to_scalar::<f32>()?, kl.to_scalar::<f32>()?, ramp);
        if !triple.is_finite() {
            return Err(CvaeError::NonFiniteLoss {
                epoch: self.epoch,
                loss: triple.total,
            }
            .into());
        }

        self.adam.backward_step(&loss)?;
        Ok(triple)
    }

    /// The training loss without an optimizer step (dropout off)
    pub fn compute_loss(&mut self, x_np: &Tensor, y_ntd: &Tensor, ramp: f32) -> anyhow::Result<LossTriple> {
        self.check_batch(x_np, y_ntd)?;
        let (recon, kl) = self.forward_loss(x_np, y_ntd, false)?;
        Ok(LossTriple::new(
            recon.to_scalar::<f32>()?,
            kl.to_scalar::<f32>()?,
            ramp,
        ))
    }

    fn check_batch(&self, x_np: &Tensor, y_ntd: &Tensor) -> anyhow::Result<()> {
        let (n, p) = x_np.dims2()?;
        let (ny, t, d) = y_ntd.dims3()?;
        if n != ny || p != self.registry.num_params() || t != self.config.ndata || d != self.config.n_detectors {
            return Err(shape_error(format!(
                "x: {:?}, y: {:?}; expected (n, {}) and (n, {}, {})",
                x_np.dims(),
                y_ntd.dims(),
                self.registry.num_params(),
                self.config.ndata,
                self.config.n_detectors
            )));
        }
        Ok(())
    }

    /// Repeat a single waveform (1 x t x d) `n` times on the device
    fn repeat_waveform(&self, y_1td: &Array3<f32>, n: usize) -> anyhow::Result<Tensor> {
        let (b, t, d) = y_1td.dim();
        if n == 0 {
            return Err(shape_error("asked for zero samples"));
        }
        if b != 1 || t != self.config.ndata || d != self.config.n_detectors {
            return Err(shape_error(format!(
                "expected one waveform of shape (1, {}, {}), got {:?}",
                self.config.ndata,
                self.config.n_detectors,
                y_1td.shape()
            )));
        }
        let y = Tensor::from_iter(y_1td.iter().copied(), &self.device)?.reshape((1, t, d))?;
        Ok(y.repeat((n, 1, 1))?)
    }

    ///
    /// Draw `n` posterior samples for one waveform (1 x t x d)
    ///
    /// latent z ~ r1(z | y), then one draw from each likelihood head of
    /// r2(x | z, y). No ground truth is used.
    ///
    pub fn gen_samples(&mut self, y_1td: &Array3<f32>, n: usize) -> anyhow::Result<PosteriorSamples> {
        let y_ntd = self.repeat_waveform(y_1td, n)?;
        let prior = self.r1.forward_t(&y_ntd, None, false)?;
        let z_nk = prior.sample(&mut self.rng)?;
        let raw_nr = self.r2.forward_t(&z_nk, &y_ntd, false)?;

        let (samples, flagged) = self.heads.sample(&raw_nr, &mut self.rng)?;
        let posterior = PosteriorSamples { samples, flagged };

        let nflag = posterior.num_flagged();
        if nflag > 0 {
            warn!("{} of {} posterior samples are not finite", nflag, n);
        }
        self.state = CvaeState::Inference;
        Ok(posterior)
    }

    /// `gen_samples` with the configured `n_samples`
    pub fn gen_posterior(&mut self, y_1td: &Array3<f32>) -> anyhow::Result<PosteriorSamples> {
        self.gen_samples(y_1td, self.config.n_samples)
    }

    ///
    /// Component means and `n` latent draws of both encoders for one
    /// waveform (1 x t x d) and its parameters (1 x p)
    ///
    pub fn gen_z_samples(
        &mut self,
        y_1td: &Array3<f32>,
        x_1p: &Array2<f32>,
        n: usize,
    ) -> anyhow::Result<LatentSamples> {
        let p = self.registry.num_params();
        if x_1p.dim() != (1, p) {
            return Err(shape_error(format!(
                "expected parameters of shape (1, {}), got {:?}",
                p,
                x_1p.shape()
            )));
        }

        let y_ntd = self.repeat_waveform(y_1td, n)?;
        let x_np = Tensor::from_iter(x_1p.iter().copied(), &self.device)?
            .reshape((1, p))?
            .repeat((n, 1))?;

        let prior = self.r1.forward_t(&y_ntd, None, false)?;
        let posterior = self.q.forward_t(&y_ntd, Some(&x_np), false)?;

        Ok(LatentSamples {
            prior_means: tensor_to_array2(&prior.means.get(0)?)?,
            prior_draws: tensor_to_array2(&prior.sample(&mut self.rng)?)?,
            posterior_means: tensor_to_array2(&posterior.means.get(0)?)?,
            posterior_draws: tensor_to_array2(&posterior.sample(&mut self.rng)?)?,
        })
    }

    /// Save all three sub-networks under the run label
    pub fn save_checkpoint(&mut self, store: &CheckpointStore) -> anyhow::Result<PathBuf> {
        let path = store.save(&self.varmap, &self.config.run_label)?;
        self.state = CvaeState::Checkpointed;
        Ok(path)
    }

    /// Load all three sub-networks; the KL ramp stays at 1 from now on
    pub fn load_checkpoint(&mut self, store: &CheckpointStore) -> anyhow::Result<()> {
        store.load(&mut self.varmap, &self.config.run_label)?;
        self.ramp.resumed = true;
        self.state = CvaeState::Checkpointed;
        Ok(())
    }

    ///
    /// Train for `num_iterations` epochs
    ///
    /// * `train` - training minibatches, refreshed every epoch
    /// * `valid` - validation minibatches, evaluated every epoch
    /// * `store` - where to save weights every `save_interval` epochs
    ///
    pub fn fit<TrainL, ValidL>(
        &mut self,
        train: &mut TrainL,
        mut valid: Option<&mut ValidL>,
        store: Option<&CheckpointStore>,
    ) -> anyhow::Result<LossTrace>
    where
        TrainL: DataLoader,
        ValidL: DataLoader,
    {
        if self.config.resume_training {
            let store = store.ok_or_else(|| config_error("resuming needs a checkpoint store"))?;
            self.load_checkpoint(store)?;
            info!("resumed {}; KL ramp fixed at 1", self.config.run_label);
        }

        let device = self.device.clone();
        let batch_size = self.config.batch_size;

        let pb = ProgressBar::new(self.config.num_iterations as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        if let Some(valid) = valid.as_deref_mut() {
            valid.shuffle_minibatch(batch_size)?;
        }

        let mut trace = LossTrace::default();

        for epoch in 1..=self.config.num_iterations {
            self.epoch = epoch;
            let ramp = self.ramp.weight(epoch);

            train.refresh(epoch)?;
            train.shuffle_minibatch(batch_size)?;

            let mut tot = LossTriple::default();
            for b in 0..train.num_minibatch() {
                let mb = train.minibatch_data(b, &device)?;
                let step = self.train_step(&mb.params, &mb.waveform, ramp)?;
                tot.recon += step.recon;
                tot.kl += step.kl;
            }
            let nb = train.num_minibatch().max(1) as f32;
            trace.train.push(LossTriple::new(tot.recon / nb, tot.kl / nb, ramp));

            if let Some(valid) = valid.as_deref_mut() {
                let mut tot = LossTriple::default();
                for b in 0..valid.num_minibatch() {
                    let mb = valid.minibatch_data(b, &device)?;
                    let step = self.compute_loss(&mb.params, &mb.waveform, ramp)?;
                    tot.recon += step.recon;
                    tot.kl += step.kl;
                }
                let nb = valid.num_minibatch().max(1) as f32;
                let val = LossTriple::new(tot.recon / nb, tot.kl / nb, ramp);
                if !val.is_finite() {
                    return Err(CvaeError::NonFiniteLoss {
                        epoch,
                        loss: val.total,
                    }
                    .into());
                }
                trace.valid.push(val);
            }

            if self.config.verbose {
                let tr = trace.train.last().ok_or(anyhow::anyhow!("train loss"))?;
                info!(
                    "[{}] ramp: {:.3}, recon: {:.4}, kl: {:.4}, total: {:.4}",
                    epoch, ramp, tr.recon, tr.kl, tr.total
                );
                if let Some(val) = trace.valid.last() {
                    info!(
                        "[{}] validation recon: {:.4}, kl: {:.4}, total: {:.4}",
                        epoch, val.recon, val.kl, val.total
                    );
                }
            }

            if let Some(store) = store {
                if epoch % self.config.save_interval == 0 {
                    self.save_checkpoint(store)?;
                }
            }

            pb.inc(1);
        } // each epoch

        pb.finish_and_clear();
        Ok(trace)
    }
}

fn tensor_to_array2(t: &Tensor) -> anyhow::Result<Array2<f32>> {
    let t = t.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (n, k) = t.dims2()?;
    Ok(Array2::from_shape_vec((n, k), t.flatten_all()?.to_vec1::<f32>()?)?)
}
