use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::corpus::NoteSequence;
use crate::error::{Error, Result};
use crate::vocab::PAD_INDEX;

/// Shortest sequence that can produce a training window
pub const MIN_SEQUENCE_LEN: usize = 3;

/// One windowed training example; `next` is `prev` shifted by one position.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub prev: Vec<u32>,
    pub next: Vec<u32>,
    pub prev_offsets: Vec<f32>,
    pub next_offsets: Vec<f32>,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.prev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prev.is_empty()
    }
}

/// Draws random fixed-length windows from a pool of variable-length sequences.
pub struct WindowedDataset {
    sequences: Vec<NoteSequence>,
    window_len: usize,
    expand_coef: usize,
    max_resample: usize,
}

impl WindowedDataset {
    pub fn new(
        sequences: Vec<NoteSequence>,
        window_len: usize,
        expand_coef: usize,
        max_resample: usize,
    ) -> Result<Self> {
        if window_len == 0 {
            return Err(Error::config("window_len", 0, "must be positive"));
        }
        if expand_coef == 0 {
            return Err(Error::config("expand_coef", 0, "must be positive"));
        }
        let usable = sequences
            .iter()
            .filter(|s| s.len() >= MIN_SEQUENCE_LEN)
            .count();
        if usable == 0 {
            return Err(Error::Data(format!(
                "none of {} sequences has at least {} events",
                sequences.len(),
                MIN_SEQUENCE_LEN
            )));
        }
        if usable < sequences.len() {
            debug!(
                "{} of {} sequences are too short and will be resampled",
                sequences.len() - usable,
                sequences.len()
            );
        }
        Ok(Self {
            sequences,
            window_len,
            expand_coef,
            max_resample,
        })
    }

    /// Logical size: every physical sequence appears `expand_coef` times
    pub fn len(&self) -> usize {
        self.expand_coef * self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Window the sequence behind logical index `idx`.
    ///
    /// A too-short sequence is replaced by a uniformly drawn logical index, at
    /// most `max_resample` times; `None` once the retries run out.
    pub fn sample<R: Rng>(&self, idx: usize, rng: &mut R) -> Option<Sample> {
        let mut idx = idx;
        for _ in 0..=self.max_resample {
            let seq = &self.sequences[idx % self.sequences.len()];
            if seq.len() >= MIN_SEQUENCE_LEN {
                return Some(self.window(seq, rng));
            }
            idx = rng.random_range(0..self.len());
        }
        None
    }

    fn window<R: Rng>(&self, seq: &NoteSequence, rng: &mut R) -> Sample {
        let len = seq.len();
        let start = rng.random_range(0..=len - 2);

        let prev_end = (start + self.window_len).min(len);
        let next_end = (start + 1 + self.window_len).min(len);

        let mut prev = seq.ids[start..prev_end].to_vec();
        let next = seq.ids[start + 1..next_end].to_vec();
        let mut prev_offsets = seq.offsets[start..prev_end].to_vec();
        let next_offsets = seq.offsets[start + 1..next_end].to_vec();

        // next can only be shorter, when the window runs into the end
        if prev.len() > next.len() {
            prev.truncate(next.len());
            prev_offsets.truncate(next.len());
        }
        prev_offsets[0] = 0.0;

        assert_eq!(prev.len(), next.len());
        Sample {
            prev,
            next,
            prev_offsets,
            next_offsets,
        }
    }
}

/// A padded micro-batch on the training device.
pub struct Batch {
    /// Input ids `[batch, time]`
    pub prev: Tensor,
    /// Target ids `[batch, time]`
    pub next: Tensor,
    /// Input offsets `[batch, time]`
    pub prev_offsets: Tensor,
    /// Target offsets `[batch, time]`
    pub next_offsets: Tensor,
    /// 1.0 where `prev` is not PAD `[batch, time]`
    pub content_mask: Tensor,
}

impl Batch {
    /// Pad every sample at the end to the longest one (PAD ids, zero offsets)
    pub fn collate(samples: &[Sample], device: &Device) -> Result<Self> {
        let batch_size = samples.len();
        if batch_size == 0 {
            return Err(Error::Data("cannot collate an empty batch".to_string()));
        }
        let max_len = samples.iter().map(Sample::len).max().unwrap_or(0);

        let mut prev = vec![PAD_INDEX; batch_size * max_len];
        let mut next = vec![PAD_INDEX; batch_size * max_len];
        let mut prev_offsets = vec![0f32; batch_size * max_len];
        let mut next_offsets = vec![0f32; batch_size * max_len];

        for (row, sample) in samples.iter().enumerate() {
            let base = row * max_len;
            let n = sample.len();
            prev[base..base + n].copy_from_slice(&sample.prev);
            next[base..base + n].copy_from_slice(&sample.next);
            prev_offsets[base..base + n].copy_from_slice(&sample.prev_offsets);
            next_offsets[base..base + n].copy_from_slice(&sample.next_offsets);
        }

        let content_mask: Vec<f32> = prev
            .iter()
            .map(|&id| if id == PAD_INDEX { 0.0 } else { 1.0 })
            .collect();

        let shape = (batch_size, max_len);
        Ok(Self {
            prev: Tensor::from_vec(prev, shape, device)?,
            next: Tensor::from_vec(next, shape, device)?,
            prev_offsets: Tensor::from_vec(prev_offsets, shape, device)?,
            next_offsets: Tensor::from_vec(next_offsets, shape, device)?,
            content_mask: Tensor::from_vec(content_mask, shape, device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.prev.dims()[0]
    }
}

/// Epoch-wise micro-batch producer over a `WindowedDataset`.
///
/// Indices are shuffled once per epoch and consumed without replacement;
/// windowing runs on a rayon pool with one derived generator per example.
pub struct BatchLoader {
    dataset: WindowedDataset,
    batch_size: usize,
    pool: rayon::ThreadPool,
    indices: Vec<usize>,
    current_pos: usize,
}

impl BatchLoader {
    pub fn new(dataset: WindowedDataset, batch_size: usize, n_jobs: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch_size", 0, "must be positive"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_jobs.max(1))
            .thread_name(|i| format!("window-{}", i))
            .build()
            .map_err(|e| Error::Data(format!("cannot start windowing workers: {}", e)))?;
        let indices = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            batch_size,
            pool,
            indices,
            current_pos: 0,
        })
    }

    pub fn reset<R: Rng>(&mut self, rng: &mut R) {
        self.current_pos = 0;
        self.indices.shuffle(rng);
    }

    /// Full micro-batches per epoch; the incomplete tail is dropped
    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn dataset(&self) -> &WindowedDataset {
        &self.dataset
    }

    pub fn next_batch<R: Rng>(
        &mut self,
        rng: &mut R,
        device: &Device,
    ) -> Result<Option<Batch>> {
        loop {
            if self.current_pos + self.batch_size > self.indices.len() {
                return Ok(None);
            }

            let batch_indices =
                &self.indices[self.current_pos..self.current_pos + self.batch_size];
            self.current_pos += self.batch_size;

            let jobs: Vec<(usize, u64)> = batch_indices
                .iter()
                .map(|&idx| (idx, rng.random::<u64>()))
                .collect();

            let dataset = &self.dataset;
            let samples: Vec<Sample> = self.pool.install(|| {
                jobs.par_iter()
                    .filter_map(|&(idx, seed)| {
                        let mut item_rng = StdRng::seed_from_u64(seed);
                        dataset.sample(idx, &mut item_rng)
                    })
                    .collect()
            });

            if samples.len() < jobs.len() {
                warn!(
                    "{} examples dropped after {} resamples",
                    jobs.len() - samples.len(),
                    dataset.max_resample
                );
            }
            // a fully dropped batch moves on to the next one
            if !samples.is_empty() {
                return Ok(Some(Batch::collate(&samples, device)?));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(len: usize) -> NoteSequence {
        NoteSequence::new(
            (1..=len as u32).collect(),
            (0..len).map(|i| 0.25 + i as f32).collect(),
        )
    }

    #[test]
    fn test_windows_are_aligned_and_start_at_zero_offset() {
        let mut rng = StdRng::seed_from_u64(7);
        for len in 3..12 {
            for window_len in 1..8 {
                let dataset = WindowedDataset::new(vec![seq(len)], window_len, 1, 4).unwrap();
                for _ in 0..20 {
                    let sample = dataset.sample(0, &mut rng).unwrap();
                    assert_eq!(sample.prev.len(), sample.next.len());
                    assert_eq!(sample.prev_offsets.len(), sample.prev.len());
                    assert_eq!(sample.next_offsets.len(), sample.next.len());
                    assert!(sample.len() >= 1);
                    assert!(sample.len() <= window_len.min(len - 1));
                    assert_eq!(sample.prev_offsets[0], 0.0);
                    for (p, n) in sample.prev.iter().zip(&sample.next) {
                        assert_eq!(p + 1, *n);
                    }
                }
            }
        }
    }

    #[test]
    fn test_next_offsets_follow_source() {
        let mut rng = StdRng::seed_from_u64(1);
        let dataset = WindowedDataset::new(vec![seq(6)], 3, 1, 4).unwrap();
        let sample = dataset.sample(0, &mut rng).unwrap();
        let start = sample.prev[0] as usize - 1;
        assert_eq!(sample.next_offsets[0], 0.25 + (start + 1) as f32);
    }

    #[test]
    fn test_short_sequences_are_resampled() {
        let mut rng = StdRng::seed_from_u64(3);
        let dataset = WindowedDataset::new(vec![seq(2), seq(5), seq(1)], 4, 10, 64).unwrap();
        assert_eq!(dataset.len(), 30);
        for idx in 0..dataset.len() {
            let sample = dataset.sample(idx, &mut rng).unwrap();
            assert!(sample.prev.iter().all(|&id| id <= 5));
        }
    }

    #[test]
    fn test_resampling_is_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let dataset = WindowedDataset::new(vec![seq(5), seq(2)], 4, 1, 0).unwrap();
        assert!(dataset.sample(1, &mut rng).is_none());
    }

    #[test]
    fn test_dataset_without_usable_sequences_is_rejected() {
        assert!(matches!(
            WindowedDataset::new(vec![seq(2), seq(1)], 4, 1, 4),
            Err(Error::Data(_))
        ));
        assert!(WindowedDataset::new(vec![seq(5)], 0, 1, 4).is_err());
    }

    #[test]
    fn test_collate_pads_at_the_end() {
        let samples = vec![
            Sample {
                prev: vec![1, 2, 3],
                next: vec![2, 3, 4],
                prev_offsets: vec![0.0, 0.5, 0.5],
                next_offsets: vec![0.5, 0.5, 1.0],
            },
            Sample {
                prev: vec![3],
                next: vec![1],
                prev_offsets: vec![0.0],
                next_offsets: vec![0.25],
            },
        ];
        let batch = Batch::collate(&samples, &Device::Cpu).unwrap();
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(
            batch.prev.to_vec2::<u32>().unwrap(),
            vec![vec![1, 2, 3], vec![3, 0, 0]]
        );
        assert_eq!(
            batch.next_offsets.to_vec2::<f32>().unwrap(),
            vec![vec![0.5, 0.5, 1.0], vec![0.25, 0.0, 0.0]]
        );
        assert_eq!(
            batch.content_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0], vec![1.0, 0.0, 0.0]]
        );
    }

    #[test]
    fn test_loader_covers_pool_without_replacement() {
        let dataset = WindowedDataset::new(vec![seq(8), seq(4)], 3, 5, 4).unwrap();
        let mut loader = BatchLoader::new(dataset, 3, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        loader.reset(&mut rng);

        assert_eq!(loader.num_batches(), 3);
        let mut seen = 0;
        while let Some(batch) = loader.next_batch(&mut rng, &Device::Cpu).unwrap() {
            assert_eq!(batch.batch_size(), 3);
            seen += 1;
        }
        assert_eq!(seen, 3);

        let mut sorted = loader.indices.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_loader_is_deterministic_for_a_seed() {
        let load = || {
            let dataset = WindowedDataset::new(vec![seq(9), seq(6)], 4, 4, 4).unwrap();
            let mut loader = BatchLoader::new(dataset, 2, 3).unwrap();
            let mut rng = StdRng::seed_from_u64(5);
            loader.reset(&mut rng);
            let batch = loader.next_batch(&mut rng, &Device::Cpu).unwrap().unwrap();
            batch.prev.to_vec2::<u32>().unwrap()
        };
        assert_eq!(load(), load());
    }
}
