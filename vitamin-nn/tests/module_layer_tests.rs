use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder, VarMap};
use vitamin_nn::candle_aux_layers::StackLayers;
use vitamin_nn::candle_data_loader::{DataLoader, InMemoryData};
use vitamin_nn::candle_model_traits::DecoderModuleT;

fn dense_stack(dims: &[usize], dropout: f32, vs: VarBuilder) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::with_dropout(dropout);
    for (j, w) in dims.windows(2).enumerate() {
        fc.push_with_act(
            candle_nn::linear(w[0], w[1], vs.pp(format!("fc.{}", j)))?,
            candle_nn::Activation::Relu,
        );
    }
    Ok(fc)
}

#[test]
fn stack_output_shape() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let fc = dense_stack(&[7, 16, 5], 0., vs)?;
    assert_eq!(fc.len(), 2);

    let x = Tensor::randn(0f32, 1., (4, 7), &dev)?;
    let h = fc.forward_t(&x, true)?;
    assert_eq!(h.dims(), &[4, 5]);
    assert!(h.flatten_all()?.to_vec1::<f32>()?.iter().all(|&v| v >= 0.));
    Ok(())
}

#[test]
fn dropout_only_while_training() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let fc = dense_stack(&[3, 64], 0.5, vs)?;

    let x = Tensor::ones((2, 3), DType::F32, &dev)?;
    let a = fc.forward_t(&x, false)?.to_vec2::<f32>()?;
    let b = fc.forward_t(&x, false)?.to_vec2::<f32>()?;
    assert_eq!(a, b);

    // training: each unit is either dropped or rescaled by 1 / (1 - p)
    let t = fc.forward_t(&x, true)?.to_vec2::<f32>()?;
    let mut dropped = 0;
    for (row_t, row_a) in t.iter().zip(a.iter()) {
        for (&vt, &va) in row_t.iter().zip(row_a.iter()) {
            if va > 0. && vt == 0. {
                dropped += 1;
            } else {
                assert!((vt - 2. * va).abs() < 1e-5, "{} vs {}", vt, va);
            }
        }
    }
    let active = a.iter().flatten().filter(|&&v| v > 0.).count();
    assert!(active > 0);
    assert!(dropped > 0 && dropped < active, "{} of {} dropped", dropped, active);
    Ok(())
}

/// decoder that ignores its inputs
struct ConstantDecoder {
    value: f32,
    dim_latent: usize,
    dim_output: usize,
}

impl DecoderModuleT for ConstantDecoder {
    fn forward_t(&self, z_nk: &Tensor, _y_ntd: &Tensor, _train: bool) -> Result<Tensor> {
        let n = z_nk.dims()[0];
        Tensor::full(self.value, (n, self.dim_output), z_nk.device())
    }

    fn dim_latent(&self) -> usize {
        self.dim_latent
    }

    fn dim_output(&self) -> usize {
        self.dim_output
    }
}

#[test]
fn decoder_with_likelihood() -> Result<()> {
    let dev = Device::Cpu;
    let dec = ConstantDecoder {
        value: 2.,
        dim_latent: 3,
        dim_output: 4,
    };
    let z = Tensor::zeros((5, 3), DType::F32, &dev)?;
    let y = Tensor::zeros((5, 8, 2), DType::F32, &dev)?;
    let x = Tensor::ones((5, 4), DType::F32, &dev)?;

    let sq_err = |x: &Tensor, raw: &Tensor| (x - raw)?.sqr()?.sum(1)?.neg();
    let (raw, llik) = dec.forward_with_llik(&z, &y, &x, &sq_err, false)?;
    assert_eq!(raw.dims(), &[5, 4]);
    assert_eq!(llik.to_vec1::<f32>()?, vec![-4.; 5]);
    Ok(())
}

#[test]
fn loader_covers_every_row_once() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let params = Tensor::arange(0f32, 10., &dev)?.reshape((10, 1))?;
    let waves = Tensor::arange(0f32, 10., &dev)?.reshape((10, 1, 1))?;

    let mut data = InMemoryData::new(&params, &waves)?;
    data.refresh(1)?;
    data.shuffle_minibatch(3)?;
    assert_eq!(data.num_minibatch(), 4);

    let mut seen = vec![];
    for b in 0..data.num_minibatch() {
        let mb = data.minibatch_data(b, &dev)?;
        let p = mb.params.flatten_all()?.to_vec1::<f32>()?;
        let w = mb.waveform.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(p, w);
        seen.extend(p);
    }
    seen.sort_by(|a, b| a.total_cmp(b));
    assert_eq!(seen, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    Ok(())
}
