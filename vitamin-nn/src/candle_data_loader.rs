use candle_core::{Device, Tensor};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

/// A minibatch of paired source parameters and waveforms
pub struct MinibatchData {
    /// normalized source parameters (n x p)
    pub params: Tensor,
    /// normalized waveforms (n x t x d)
    pub waveform: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;

    /// Called at the beginning of every epoch (1-based) so that a
    /// loader can swap in fresh data. Does nothing by default.
    fn refresh(&mut self, _epoch: usize) -> anyhow::Result<()> {
        Ok(())
    }
}

///
/// A simple data loader for in-memory (parameter, waveform) pairs.
/// Each row of the parameter matrix is paired with the waveform of
/// the same index.
///
pub struct InMemoryData {
    params_data: Vec<Tensor>,
    waveform_data: Vec<Tensor>,

    shuffled_params_data: Option<Vec<Tensor>>,
    shuffled_waveform_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with parameters `params` (n x p) and
    /// waveforms `waveforms` (n x t x d)
    ///
    pub fn new<P, W>(params: &P, waveforms: &W) -> anyhow::Result<Self>
    where
        P: RowsToTensorVec,
        W: RowsToTensorVec,
    {
        Self::from_rows(params.rows_to_tensor_vec(), waveforms.rows_to_tensor_vec())
    }

    /// Create a data loader from per-sample tensors (1 x p) and (1 x t x d)
    pub fn from_rows(params_data: Vec<Tensor>, waveform_data: Vec<Tensor>) -> anyhow::Result<Self> {
        if params_data.len() != waveform_data.len() {
            return Err(anyhow::anyhow!(
                "{} parameter rows vs. {} waveforms",
                params_data.len(),
                waveform_data.len()
            ));
        }

        let rows = (0..params_data.len()).collect();

        Ok(InMemoryData {
            params_data,
            waveform_data,
            shuffled_params_data: None,
            shuffled_waveform_data: None,
            minibatches: Minibatches::new(rows),
        })
    }

    /// Fix the shuffling order by a seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.minibatches.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn num_samples(&self) -> usize {
        self.params_data.len()
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        match (
            take_shuffled(batch_idx, target_device, self.shuffled_params_data.as_ref())?,
            take_shuffled(batch_idx, target_device, self.shuffled_waveform_data.as_ref())?,
        ) {
            (Some(params), Some(waveform)) => Ok(MinibatchData { params, waveform }),
            _ => Err(anyhow::anyhow!("need to shuffle data")),
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        /////////////////////
        // shuffle indexes //
        /////////////////////

        self.minibatches.shuffle_minibatch(batch_size);

        let mut shuffled_params = Vec::with_capacity(self.num_minibatch());
        let mut shuffled_waveform = Vec::with_capacity(self.num_minibatch());

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        for samples in self.minibatches.chunks.iter() {
            shuffled_params.push(stack_rows(samples, &self.params_data)?);
            shuffled_waveform.push(stack_rows(samples, &self.waveform_data)?);
        }

        self.shuffled_params_data = Some(shuffled_params);
        self.shuffled_waveform_data = Some(shuffled_waveform);
        Ok(())
    }
}

fn stack_rows(samples: &[usize], data: &[Tensor]) -> anyhow::Result<Tensor> {
    let chunk: Vec<Tensor> = samples.iter().map(|&i| data[i].clone()).collect();
    Ok(Tensor::cat(&chunk, 0)?)
}

/// Take the `batch_idx`-th preloaded tensor onto `target_device`
pub fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
/// Every sample appears in exactly one chunk; the last chunk may be
/// smaller than the batch size.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
    rng: StdRng,
}

impl Minibatches {
    pub fn new(samples: Vec<usize>) -> Self {
        Self {
            samples,
            chunks: vec![],
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        self.samples.shuffle(&mut self.rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }
}

///
/// Convert rows (the first axis) of an array to a vector of `Tensor`,
/// keeping a leading axis of length one on each
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor>;
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let ncol = self.ncols();
        let mut idx_data = self
            .axis_iter(ndarray::Axis(0))
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .and_then(|v| v.reshape((1, ncol)))
                    .expect("failed to create tensor");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for Array3<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let (_, t, d) = self.dim();
        let mut idx_data = self
            .axis_iter(ndarray::Axis(0))
            .enumerate()
            .par_bridge()
            .map(|(i, slab)| {
                let v = Tensor::from_iter(slab.iter().copied(), &Device::Cpu)
                    .and_then(|v| v.reshape((1, t, d)))
                    .expect("failed to create tensor");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        (0..self.dims()[0])
            .filter_map(|i| self.narrow(0, i, 1).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn minibatches_partition_samples() {
        let mut mb = Minibatches::new((0..23).collect());
        mb.shuffle_minibatch(5);
        assert_eq!(mb.chunks.len(), 5);
        assert_eq!(mb.chunks.last().map(|c| c.len()), Some(3));
        let mut all: Vec<usize> = mb.chunks.concat();
        all.sort();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn rows_keep_pairing() -> anyhow::Result<()> {
        let n = 11;
        let params = Array::from_shape_fn((n, 2), |(i, j)| (i * 10 + j) as f32);
        let waves = Array::from_shape_fn((n, 4, 3), |(i, _, _)| i as f32);

        let mut data = InMemoryData::new(&params, &waves)?.with_seed(7);
        data.shuffle_minibatch(4)?;
        assert_eq!(data.num_minibatch(), 3);

        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, &Device::Cpu)?;
            let p = mb.params.to_vec2::<f32>()?;
            let w = mb.waveform.to_vec3::<f32>()?;
            for (prow, wslab) in p.iter().zip(w.iter()) {
                let id = prow[0] / 10.;
                assert_eq!(prow[1], prow[0] + 1.);
                assert!(wslab.iter().flatten().all(|&v| v == id));
            }
        }
        Ok(())
    }
}
