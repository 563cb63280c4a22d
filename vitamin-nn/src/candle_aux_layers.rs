use candle_core::{Result, Tensor};
use candle_nn::{Activation, Dropout, Module, ModuleT, VarMap};
use rand::Rng;
use rand_distr::StandardNormal;

/// build a stack of alternating `M` and `A` layers
///
/// An optional dropout is applied after every activation, and only
/// while training.
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
    dropout: Option<Dropout>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: Module,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
                if let Some(dropout) = self.dropout.as_ref() {
                    x = dropout.forward_t(&x, train)?;
                }
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
            dropout: None,
        }
    }

    /// A stack whose hidden activations are followed by dropout
    /// with probability `drop_prob` (no dropout if zero)
    pub fn with_dropout(drop_prob: f32) -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
            dropout: (drop_prob > 0.).then(|| Dropout::new(drop_prob)),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Output length of a 1d convolution (dilation 1)
///
/// * `len` - input length
/// * `kernel` - kernel size
/// * `stride` - stride
/// * `padding` - zero padding on both sides
pub fn conv1d_output_len(len: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    debug_assert!(stride > 0);
    let padded = len + 2 * padding;
    if padded < kernel {
        0
    } else {
        (padded - kernel) / stride + 1
    }
}

///
/// Redraw every variable in `varmap` from `rng`, following candle's
/// default initializers for `linear` and `conv1d`:
///
/// * `<name>.weight` ~ N(0, 2 / fan_in), fan_in = product of all but
///   the first dimension
/// * `<name>.bias` ~ U(-b, b), b = 1 / sqrt(fan_in of `<name>.weight`)
///
/// Variables are visited in name order so the same seed gives the
/// same weights.
///
pub fn init_varmap_from_rng<R: Rng + ?Sized>(varmap: &VarMap, rng: &mut R) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;

    let fan_in = |dims: &[usize]| dims.iter().skip(1).product::<usize>().max(1);

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let numel = var.elem_count();

        let values: Vec<f32> = match name.strip_suffix(".bias") {
            Some(prefix) => {
                let fan = data
                    .get(&format!("{}.weight", prefix))
                    .map(|w| fan_in(w.dims()))
                    .unwrap_or(1);
                let bound = 1. / (fan as f32).sqrt();
                (0..numel).map(|_| rng.random_range(-bound..bound)).collect()
            }
            None => {
                let sd = (2. / fan_in(var.dims()) as f32).sqrt();
                (0..numel)
                    .map(|_| sd * rng.sample::<f32, _>(StandardNormal))
                    .collect()
            }
        };

        let init = Tensor::from_vec(values, var.shape(), var.device())?.to_dtype(var.dtype())?;
        var.set(&init)?;
    }
    Ok(())
}
