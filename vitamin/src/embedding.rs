use crate::config::NetworkConfig;

use candle_core::{Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, ModuleT, VarBuilder};
use vitamin_nn::candle_aux_layers::{conv1d_output_len, StackLayers};

/// Convolutional feature extractor shared in shape (not in weights)
/// by all three sub-networks
pub struct WaveformEmbedding {
    convs: StackLayers<Conv1d>,
    out_dim: usize,
}

impl WaveformEmbedding {
    /// Will create variables `conv.{}.weight` and `conv.{}.bias`
    /// under `vs`, one pair per convolutional layer
    ///
    /// # Arguments
    /// * `ndata` - time samples per detector
    /// * `n_detectors` - detector channels
    /// * `net` - layer sizes
    /// * `vs` - variable builder
    pub fn new(ndata: usize, n_detectors: usize, net: &NetworkConfig, vs: VarBuilder) -> Result<Self> {
        let mut convs = StackLayers::<Conv1d>::new();
        let mut channels = n_detectors;
        let mut len = ndata;

        for (j, ((&filters, &kernel), &stride)) in net
            .conv_filters
            .iter()
            .zip(net.conv_kernels.iter())
            .zip(net.conv_strides.iter())
            .enumerate()
        {
            let config = Conv1dConfig {
                padding: kernel / 2,
                stride,
                ..Default::default()
            };
            convs.push_with_act(
                candle_nn::conv1d(channels, filters, kernel, config, vs.pp(format!("conv.{}", j)))?,
                candle_nn::Activation::Relu,
            );
            len = conv1d_output_len(len, kernel, stride, kernel / 2);
            channels = filters;
        }

        if len == 0 {
            candle_core::bail!("waveform of length {} vanishes in the convolutions", ndata);
        }

        Ok(Self {
            convs,
            out_dim: channels * len,
        })
    }

    pub fn dim_output(&self) -> usize {
        self.out_dim
    }

    /// (n x t x d) waveform to (n x out_dim) features
    pub fn forward_t(&self, y_ntd: &Tensor, train: bool) -> Result<Tensor> {
        let y_ndt = y_ntd.transpose(1, 2)?.contiguous()?;
        self.convs.forward_t(&y_ndt, train)?.flatten_from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn output_width_matches_declared() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let net = NetworkConfig {
            conv_filters: vec![4, 3],
            conv_kernels: vec![5, 4],
            conv_strides: vec![2, 2],
            dense: vec![8],
            dropout: 0.,
        };
        let embed = WaveformEmbedding::new(37, 2, &net, vs.pp("r1"))?;
        let y = Tensor::randn(0f32, 1., (3, 37, 2), &dev)?;
        let h = embed.forward_t(&y, false)?;
        assert_eq!(h.dims(), &[3, embed.dim_output()]);
        Ok(())
    }
}
