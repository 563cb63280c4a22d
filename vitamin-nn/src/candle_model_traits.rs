use crate::candle_mixture::GaussianMixture;

use candle_core::{Result, Tensor};

pub trait MixtureEncoderModuleT {
    /// An encoder that maps a waveform (and optionally the source
    /// parameters) to a Gaussian mixture over the latent space
    ///
    /// # Arguments
    /// * `y_ntd` - waveform (n x t x d)
    /// * `x_np` - source parameters (n x p), if conditioning on them
    /// * `train` - whether to use dropout or not
    fn forward_t(
        &self,
        y_ntd: &Tensor,
        x_np: Option<&Tensor>,
        train: bool,
    ) -> Result<GaussianMixture>;

    fn dim_latent(&self) -> usize;

    fn num_modes(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out raw likelihood statistics (n x r)
    ///
    /// * `z_nk` - latent states
    /// * `y_ntd` - waveform to condition on
    fn forward_t(&self, z_nk: &Tensor, y_ntd: &Tensor, train: bool) -> Result<Tensor>;

    /// A decoder that spits out raw statistics and log-likelihood
    /// * `z_nk` - latent states
    /// * `y_ntd` - waveform to condition on
    /// * `x_np` - observed parameters to validate with
    /// * `llik` - fn (observed, raw statistics) -> log-likelihood
    fn forward_with_llik<LlikFn>(
        &self,
        z_nk: &Tensor,
        y_ntd: &Tensor,
        x_np: &Tensor,
        llik: &LlikFn,
        train: bool,
    ) -> Result<(Tensor, Tensor)>
    where
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let raw_nr = self.forward_t(z_nk, y_ntd, train)?;
        let llik_n = llik(x_np, &raw_nr)?;
        Ok((raw_nr, llik_n))
    }

    fn dim_latent(&self) -> usize;

    fn dim_output(&self) -> usize;
}
