//! Autoregressive note generation with nucleus (top-p) sampling.

use candle_core::Tensor;
use rand::Rng;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::model::{HiddenState, SequencePredictor};

/// Sampled continuation; `tokens[i]` pairs with `offsets[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub tokens: Vec<u32>,
    pub offsets: Vec<f32>,
}

impl Generation {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.tokens.iter().copied().zip(self.offsets.iter().copied())
    }
}

/// Position of the decoder: the pair to feed next and the state carried so far.
#[derive(Debug, Clone)]
pub struct DecodeState {
    pub token: u32,
    pub offset: f32,
    pub hidden: HiddenState,
}

/// Result of one decoding step
#[derive(Debug, Clone)]
pub struct Step {
    pub token: u32,
    pub offset: f32,
    /// Raw logits the token was sampled from (before temperature)
    pub logits: Vec<f32>,
}

/// Single-sequence decoder; steps are strictly sequential.
pub struct NucleusDecoder<'a> {
    model: &'a SequencePredictor,
    seq_len: usize,
    top_p: f64,
    temperature: f64,
}

impl<'a> NucleusDecoder<'a> {
    pub fn new(model: &'a SequencePredictor, config: &GenerationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            seq_len: config.seq_len,
            top_p: config.top_p,
            temperature: config.temperature,
        })
    }

    /// Cold start (`None`) draws a uniform seed token with offset 0.
    /// A history runs every pair but the last through the model to build the
    /// hidden state; the last pair becomes the first input.
    pub fn start<R: Rng>(&self, history: Option<&[(u32, f32)]>, rng: &mut R) -> Result<DecodeState> {
        let num_embeddings = self.model.config().num_embeddings as u32;
        let Some(history) = history else {
            return Ok(DecodeState {
                token: rng.random_range(0..num_embeddings),
                offset: 0.0,
                hidden: HiddenState::Fresh,
            });
        };

        let Some((&(token, offset), prefix)) = history.split_last() else {
            return Err(Error::config("history", "[]", "must not be empty"));
        };
        if let Some(&(bad, _)) = history.iter().find(|(id, _)| *id >= num_embeddings) {
            return Err(Error::UnknownId(bad));
        }

        let hidden = if prefix.is_empty() {
            HiddenState::Fresh
        } else {
            let device = self.model.device();
            let ids: Vec<u32> = prefix.iter().map(|&(id, _)| id).collect();
            let offsets: Vec<f32> = prefix.iter().map(|&(_, o)| o).collect();
            let ids = Tensor::from_vec(ids, (1, prefix.len()), device)?;
            let offsets = Tensor::from_vec(offsets, (1, prefix.len()), device)?;
            let out = self
                .model
                .forward(&ids, &offsets, HiddenState::Fresh, false)?;
            HiddenState::Carried(out.hidden)
        };

        Ok(DecodeState {
            token,
            offset,
            hidden,
        })
    }

    /// Feed the current pair, sample the next token and adopt the model's own
    /// offset prediction as the next input offset.
    pub fn step<R: Rng>(&self, state: &mut DecodeState, rng: &mut R) -> Result<Step> {
        let device = self.model.device();
        let ids = Tensor::new(&[[state.token]], device)?;
        let offsets = Tensor::new(&[[state.offset]], device)?;

        let out = self
            .model
            .forward(&ids, &offsets, state.hidden.clone(), false)?;

        let logits = out.logits.flatten_all()?;
        let scaled = logits.affine(1.0 / self.temperature, 0.0)?;
        let probs: Vec<f32> = candle_nn::ops::softmax_last_dim(&scaled)?.to_vec1()?;

        let kept = nucleus_filter(&probs, self.top_p);
        let token = sample_index(&kept, rng) as u32;
        let offset = out.offsets.flatten_all()?.to_vec1::<f32>()?[0];

        *state = DecodeState {
            token,
            offset,
            hidden: HiddenState::Carried(out.hidden),
        };

        Ok(Step {
            token,
            offset,
            logits: logits.to_vec1()?,
        })
    }

    /// Exactly `seq_len` sampled pairs; neither the seed nor the history is echoed.
    pub fn generate<R: Rng>(
        &self,
        history: Option<&[(u32, f32)]>,
        rng: &mut R,
    ) -> Result<Generation> {
        let mut state = self.start(history, rng)?;
        let mut tokens = Vec::with_capacity(self.seq_len);
        let mut offsets = Vec::with_capacity(self.seq_len);

        for _ in 0..self.seq_len {
            let step = self.step(&mut state, rng)?;
            tokens.push(step.token);
            offsets.push(step.offset);
        }

        debug!(
            "Generated {} steps (top_p={}, temperature={})",
            tokens.len(),
            self.top_p,
            self.temperature
        );
        Ok(Generation { tokens, offsets })
    }
}

/// Zero every probability outside the smallest descending prefix whose
/// cumulative mass exceeds `top_p`. The most probable entry always survives.
/// The result is not renormalized.
pub fn nucleus_filter(probs: &[f32], top_p: f64) -> Vec<f32> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept = vec![0.0f32; probs.len()];
    let mut cumulative = 0.0f64;
    for idx in order {
        kept[idx] = probs[idx];
        cumulative += probs[idx] as f64;
        if cumulative > top_p {
            break;
        }
    }
    kept
}

/// Draw an index with probability proportional to `weights`.
fn sample_index<R: Rng>(weights: &[f32], rng: &mut R) -> usize {
    let total: f64 = weights.iter().map(|&w| w as f64).sum();
    let r = rng.random::<f64>() * total;

    let mut cumulative = 0.0f64;
    let mut last_nonzero = 0;
    for (i, &w) in weights.iter().enumerate() {
        if w <= 0.0 {
            continue;
        }
        cumulative += w as f64;
        last_nonzero = i;
        if cumulative > r {
            return i;
        }
    }
    // rounding
    last_nonzero
}
