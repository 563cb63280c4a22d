use crate::config::RunConfig;
use crate::embedding::WaveformEmbedding;

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};
use vitamin_nn::candle_aux_layers::StackLayers;
use vitamin_nn::candle_model_traits::DecoderModuleT;

/// Maps a latent draw and the waveform to the raw statistics of the
/// likelihood heads
pub struct ParamDecoder {
    dim_latent: usize,
    dim_output: usize,
    embed: WaveformEmbedding,
    fc: StackLayers<Linear>,
    raw: Linear,
}

impl DecoderModuleT for ParamDecoder {
    fn forward_t(&self, z_nk: &Tensor, y_ntd: &Tensor, train: bool) -> Result<Tensor> {
        let h_nh = self.embed.forward_t(y_ntd, train)?;
        let hz = Tensor::cat(&[&h_nh, z_nk], 1)?;
        let fc_nl = self.fc.forward_t(&hz, train)?;
        self.raw.forward(&fc_nl)
    }

    fn dim_latent(&self) -> usize {
        self.dim_latent
    }

    fn dim_output(&self) -> usize {
        self.dim_output
    }
}

impl ParamDecoder {
    /// Will create a new decoder with these variables:
    ///
    /// * `conv.{}.weight` convolutional embedding of the waveform
    /// * `fc.{}.weight` where {} is the dense layer index
    /// * `raw.weight`
    ///
    /// # Arguments
    /// * `config` - run configuration
    /// * `dim_output` - total raw width of the likelihood heads
    /// * `vs` - variable builder
    pub fn new(config: &RunConfig, dim_output: usize, vs: VarBuilder) -> Result<Self> {
        let net = &config.network;
        let embed = WaveformEmbedding::new(config.ndata, config.n_detectors, net, vs.clone())?;

        let mut fc = StackLayers::<Linear>::with_dropout(net.dropout);
        let mut prev_dim = embed.dim_output() + config.z_dimension;
        for (j, &next_dim) in net.dense.iter().enumerate() {
            fc.push_with_act(
                candle_nn::linear(prev_dim, next_dim, vs.pp(format!("fc.{}", j)))?,
                candle_nn::Activation::Relu,
            );
            prev_dim = next_dim;
        }

        let raw = candle_nn::linear(prev_dim, dim_output, vs.pp("raw"))?;

        Ok(Self {
            dim_latent: config.z_dimension,
            dim_output,
            embed,
            fc,
            raw,
        })
    }
}
