use crate::config::RunConfig;
use crate::embedding::WaveformEmbedding;

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};
use vitamin_nn::candle_aux_layers::StackLayers;
use vitamin_nn::candle_mixture::GaussianMixture;
use vitamin_nn::candle_model_traits::MixtureEncoderModuleT;

/// Maps a waveform, and optionally the source parameters, to a
/// Gaussian mixture over the latent space.
///
/// The same structure serves as the waveform-only encoder (`r1`,
/// the prior at inference time) and the full-information encoder
/// (`q`, the approximate posterior).
pub struct MixtureEncoder {
    n_params: usize,
    n_modes: usize,
    dim_latent: usize,
    embed: WaveformEmbedding,
    fc: StackLayers<Linear>,
    z_logits: Linear,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl MixtureEncoderModuleT for MixtureEncoder {
    fn forward_t(
        &self,
        y_ntd: &Tensor,
        x_np: Option<&Tensor>,
        train: bool,
    ) -> Result<GaussianMixture> {
        let min_lv = -8.;
        let max_lv = 8.;

        let h_nh = self.embed.forward_t(y_ntd, train)?;

        let h_nh = match (x_np, self.n_params) {
            (_, 0) => h_nh,
            (Some(x_np), _) => Tensor::cat(&[&h_nh, x_np], 1)?,
            (None, p) => {
                candle_core::bail!("this encoder conditions on {} parameters", p)
            }
        };

        let fc_nl = self.fc.forward_t(&h_nh, train)?;
        let n = fc_nl.dims()[0];
        let (m, k) = (self.n_modes, self.dim_latent);

        let logits_nm = self.z_logits.forward(&fc_nl)?;
        let mean_nmk = self.z_mean.forward(&fc_nl)?.reshape((n, m, k))?;
        let lnvar_nmk = self
            .z_lnvar
            .forward(&fc_nl)?
            .clamp(min_lv, max_lv)?
            .reshape((n, m, k))?;

        GaussianMixture::new(&logits_nm, mean_nmk, lnvar_nmk)
    }

    fn dim_latent(&self) -> usize {
        self.dim_latent
    }

    fn num_modes(&self) -> usize {
        self.n_modes
    }
}

impl MixtureEncoder {
    /// Will create a new encoder with these variables:
    ///
    /// * `conv.{}.weight` convolutional embedding of the waveform
    /// * `fc.{}.weight` where {} is the dense layer index
    /// * `z.logits.weight`, `z.mean.weight`, `z.lnvar.weight`
    ///
    /// # Arguments
    /// * `config` - run configuration (shapes and layer sizes)
    /// * `n_params` - parameters concatenated to the embedding (0 for
    ///   the waveform-only encoder)
    /// * `vs` - variable builder
    pub fn new(config: &RunConfig, n_params: usize, vs: VarBuilder) -> Result<Self> {
        let net = &config.network;
        let embed = WaveformEmbedding::new(config.ndata, config.n_detectors, net, vs.clone())?;

        let mut fc = StackLayers::<Linear>::with_dropout(net.dropout);
        let mut prev_dim = embed.dim_output() + n_params;
        for (j, &next_dim) in net.dense.iter().enumerate() {
            fc.push_with_act(
                candle_nn::linear(prev_dim, next_dim, vs.pp(format!("fc.{}", j)))?,
                candle_nn::Activation::Relu,
            );
            prev_dim = next_dim;
        }

        let (m, k) = (config.n_modes, config.z_dimension);
        let z_logits = candle_nn::linear(prev_dim, m, vs.pp("z.logits"))?;
        let z_mean = candle_nn::linear(prev_dim, m * k, vs.pp("z.mean"))?;
        let z_lnvar = candle_nn::linear(prev_dim, m * k, vs.pp("z.lnvar"))?;

        Ok(Self {
            n_params,
            n_modes: m,
            dim_latent: k,
            embed,
            fc,
            z_logits,
            z_mean,
            z_lnvar,
        })
    }
}
