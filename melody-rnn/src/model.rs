use candle_core::{D, DType, Device, Module, Result, Tensor, bail};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, embedding, linear, linear_no_bias};

use crate::config::ModelConfig;

fn sigmoid(x: &Tensor) -> Result<Tensor> {
    (x.neg()?.exp()? + 1.0)?.recip()
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, use_bias: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = if use_bias {
            Some(vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        let x = x.broadcast_mul(&self.weight)?;
        match &self.bias {
            Some(bias) => x.broadcast_add(bias),
            None => Ok(x),
        }
    }
}

/// Single GRU layer over batch-first input.
///
/// Gates follow the usual formulation:
/// `r = σ(W_ir x + W_hr h)`, `z = σ(W_iz x + W_hz h)`,
/// `n = tanh(W_in x + r ⊙ (W_hn h))`, `h' = (1 - z) ⊙ n + z ⊙ h`.
pub struct GruLayer {
    input_proj: Linear,
    hidden_proj: Linear,
}

impl GruLayer {
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let input_proj = linear(input_size, 3 * hidden_size, vb.pp("input_proj"))?;
        let hidden_proj = linear(hidden_size, 3 * hidden_size, vb.pp("hidden_proj"))?;
        Ok(Self {
            input_proj,
            hidden_proj,
        })
    }

    /// One time step: `x` is `[batch, input]`, `h` is `[batch, hidden]`
    pub fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let gi = self.input_proj.forward(x)?.chunk(3, D::Minus1)?;
        let gh = self.hidden_proj.forward(h)?.chunk(3, D::Minus1)?;

        let r = sigmoid(&(&gi[0] + &gh[0])?)?;
        let z = sigmoid(&(&gi[1] + &gh[1])?)?;
        let n = (&gi[2] + (r * &gh[2])?)?.tanh()?;

        // (1 - z) * n + z * h
        &n + (z * (h - &n)?)?
    }

    /// Runs the whole window; returns every step's output and the last state
    pub fn forward(&self, xs: &Tensor, h0: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, seq_len, _) = xs.dims3()?;
        let mut h = h0.clone();
        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x = xs.narrow(1, t, 1)?.squeeze(1)?.contiguous()?;
            h = self.step(&x, &h)?;
            outputs.push(h.clone());
        }
        Ok((Tensor::stack(&outputs, 1)?, h))
    }
}

/// Recurrent state handed to [`SequencePredictor::forward`].
#[derive(Debug, Clone)]
pub enum HiddenState {
    /// Start from the all-zero state
    Fresh,
    /// Continue from a state returned by an earlier call, `[layers, batch, hidden]`
    Carried(Tensor),
}

pub struct PredictorOutput {
    /// Class logits `[batch, time, num_embeddings]`
    pub logits: Tensor,
    /// Predicted offsets `[batch, time]`, never negative
    pub offsets: Tensor,
    /// State after the last position `[layers, batch, hidden]`
    pub hidden: Tensor,
}

/// Dual-head GRU over (token, offset) pairs.
///
/// Token embeddings and a linear projection of the offsets are summed and
/// normalized, run through stacked GRU layers, then rectified and normalized
/// again before separate class and offset heads.
pub struct SequencePredictor {
    embedding: Embedding,
    offset_proj: Linear,
    input_norm: LayerNorm,
    layers: Vec<GruLayer>,
    dropout: Dropout,
    extract_norm: LayerNorm,
    fc_class: Linear,
    fc_offset: Linear,
    config: ModelConfig,
    device: Device,
}

impl SequencePredictor {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let embedding = embedding(config.num_embeddings, h, vb.pp("embedding"))?;
        let offset_proj = linear(1, h, vb.pp("offset_proj"))?;
        let input_norm = LayerNorm::new(h, config.layer_norm_eps, true, vb.pp("input_norm"))?;
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(GruLayer::new(h, h, vb.pp(format!("gru.layers.{}", i)))?);
        }
        let extract_norm =
            LayerNorm::new(h, config.layer_norm_eps, true, vb.pp("extract_norm"))?;
        let fc_class = linear_no_bias(h, config.num_embeddings, vb.pp("fc_class"))?;
        let fc_offset = linear_no_bias(h, 1, vb.pp("fc_offset"))?;
        Ok(Self {
            embedding,
            offset_proj,
            input_norm,
            layers,
            dropout: Dropout::new(config.dropout as f32),
            extract_norm,
            fc_class,
            fc_offset,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    /// All-zero state, one row per layer
    pub fn init_hidden(&self, batch_size: usize) -> Result<Tensor> {
        Tensor::zeros(
            (self.config.num_layers, batch_size, self.config.hidden_size),
            DType::F32,
            &self.device,
        )
    }

    /// `ids` is `[batch, time]` (u32), `offsets` is `[batch, time]` (f32)
    pub fn forward(
        &self,
        ids: &Tensor,
        offsets: &Tensor,
        hidden: HiddenState,
        train: bool,
    ) -> Result<PredictorOutput> {
        let (batch_size, seq_len) = ids.dims2()?;
        if seq_len == 0 {
            bail!("predictor input window is empty");
        }
        if offsets.dims() != ids.dims() {
            bail!(
                "offsets shape {:?} does not match ids shape {:?}",
                offsets.dims(),
                ids.dims()
            );
        }

        let h0 = match hidden {
            HiddenState::Fresh => self.init_hidden(batch_size)?,
            HiddenState::Carried(h) => {
                let expected = [self.config.num_layers, batch_size, self.config.hidden_size];
                if h.dims() != expected.as_slice() {
                    bail!(
                        "carried hidden state has shape {:?}, expected {:?}",
                        h.dims(),
                        expected
                    );
                }
                h
            }
        };

        let offsets = offsets.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
        let x = (self.embedding.forward(ids)? + self.offset_proj.forward(&offsets)?)?;
        let mut x = self.input_norm.forward(&x)?;

        let mut last_states = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let (out, h_last) = layer.forward(&x, &h0.get(i)?)?;
            last_states.push(h_last);
            x = if i + 1 < self.layers.len() {
                self.dropout.forward(&out, train)?
            } else {
                out
            };
        }

        let features = self.extract_norm.forward(&x.relu()?)?;
        let logits = self.fc_class.forward(&features)?;
        let offsets = self.fc_offset.forward(&features)?.relu()?.squeeze(D::Minus1)?;

        Ok(PredictorOutput {
            logits,
            offsets,
            hidden: Tensor::stack(&last_states, 0)?,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_parameters(&self) -> usize {
        self.config.num_parameters()
    }
}
