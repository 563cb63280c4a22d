use crate::augment::{Augmenter, WaveformChunk};
use crate::error::config_error;

use candle_core::Device;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vitamin_nn::candle_data_loader::{DataLoader, InMemoryData, MinibatchData};

/// Supplies blocks of noise-free training pairs; file readers live
/// outside this crate and implement this
pub trait ChunkSource {
    fn num_chunks(&self) -> usize;

    fn load_chunk(&mut self, chunk_idx: usize) -> anyhow::Result<WaveformChunk>;
}

/// Chunks already held in memory
pub struct InMemoryChunks {
    chunks: Vec<WaveformChunk>,
}

impl InMemoryChunks {
    pub fn new(chunks: Vec<WaveformChunk>) -> Self {
        Self { chunks }
    }
}

impl ChunkSource for InMemoryChunks {
    fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn load_chunk(&mut self, chunk_idx: usize) -> anyhow::Result<WaveformChunk> {
        self.chunks
            .get(chunk_idx)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no chunk #{}", chunk_idx))
    }
}

///
/// Serves augmented minibatches from one chunk at a time.
///
/// The current chunk is re-augmented at every `refresh`, and the next
/// chunk is loaded every `reload_interval` epochs. Shuffling never
/// mixes rows of different chunks.
///
pub struct WaveformDataLoader<S: ChunkSource> {
    source: S,
    augmenter: Augmenter,
    reload_interval: usize,
    chunk_idx: usize,
    raw_chunk: WaveformChunk,
    data: InMemoryData,
    rng: StdRng,
}

impl<S: ChunkSource> WaveformDataLoader<S> {
    pub fn new(
        mut source: S,
        augmenter: Augmenter,
        reload_interval: usize,
        seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        if source.num_chunks() == 0 {
            return Err(config_error("the training source has no chunks"));
        }

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let raw_chunk = source.load_chunk(0)?;
        let data = Self::prepare(&augmenter, &raw_chunk, &mut rng)?;

        Ok(Self {
            source,
            augmenter,
            reload_interval: reload_interval.max(1),
            chunk_idx: 0,
            raw_chunk,
            data,
            rng,
        })
    }

    fn prepare(
        augmenter: &Augmenter,
        raw_chunk: &WaveformChunk,
        rng: &mut StdRng,
    ) -> anyhow::Result<InMemoryData> {
        let chunk = augmenter.augment(raw_chunk, rng)?;
        Ok(InMemoryData::new(&chunk.params, &chunk.waveforms)?.with_seed(rng.random()))
    }

    pub fn current_chunk(&self) -> usize {
        self.chunk_idx
    }
}

impl<S: ChunkSource> DataLoader for WaveformDataLoader<S> {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        self.data.minibatch_data(batch_idx, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.data.num_minibatch()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.data.shuffle_minibatch(batch_size)
    }

    fn refresh(&mut self, epoch: usize) -> anyhow::Result<()> {
        if epoch > 1 && (epoch - 1) % self.reload_interval == 0 {
            self.chunk_idx = (self.chunk_idx + 1) % self.source.num_chunks();
            self.raw_chunk = self.source.load_chunk(self.chunk_idx)?;
            info!("[{}] loaded chunk #{}", epoch, self.chunk_idx);
        }
        debug!("[{}] augmenting {} pairs", epoch, self.raw_chunk.len());
        self.data = Self::prepare(&self.augmenter, &self.raw_chunk, &mut self.rng)?;
        Ok(())
    }
}
