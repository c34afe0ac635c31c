use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of token ids, PAD included
    pub num_embeddings: usize,
    /// Width of embeddings, offset projection and every GRU layer
    pub hidden_size: usize,
    /// Number of stacked GRU layers
    pub num_layers: usize,
    /// Dropout probability between GRU layers
    pub dropout: f64,
    /// Layer norm epsilon
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl ModelConfig {
    /// Default architecture (256 hidden, 2 layers, 0.2 dropout) for a vocabulary of `num_embeddings` ids
    pub fn new(num_embeddings: usize) -> Self {
        Self {
            num_embeddings,
            hidden_size: 256,
            num_layers: 2,
            dropout: 0.2,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    /// Nano configuration - fastest for testing
    pub fn nano(num_embeddings: usize) -> Self {
        Self {
            num_embeddings,
            hidden_size: 16,
            num_layers: 2,
            dropout: 0.0,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_embeddings < 2 {
            return Err(Error::config(
                "num_embeddings",
                self.num_embeddings,
                "need PAD plus at least one token",
            ));
        }
        if self.hidden_size == 0 {
            return Err(Error::config("hidden_size", 0, "must be positive"));
        }
        if self.num_layers == 0 {
            return Err(Error::config("num_layers", 0, "must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("dropout", self.dropout, "must be in [0, 1)"));
        }
        Ok(())
    }

    /// Name and shape of every predictor variable, in `VarBuilder` naming
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let h = self.hidden_size;
        let n = self.num_embeddings;
        let mut shapes = vec![
            ("embedding.weight".to_string(), vec![n, h]),
            ("offset_proj.weight".to_string(), vec![h, 1]),
            ("offset_proj.bias".to_string(), vec![h]),
            ("input_norm.weight".to_string(), vec![h]),
            ("input_norm.bias".to_string(), vec![h]),
        ];
        for i in 0..self.num_layers {
            for proj in ["input_proj", "hidden_proj"] {
                let prefix = format!("gru.layers.{}.{}", i, proj);
                shapes.push((format!("{}.weight", prefix), vec![3 * h, h]));
                shapes.push((format!("{}.bias", prefix), vec![3 * h]));
            }
        }
        shapes.extend([
            ("extract_norm.weight".to_string(), vec![h]),
            ("extract_norm.bias".to_string(), vec![h]),
            ("fc_class.weight".to_string(), vec![n, h]),
            ("fc_offset.weight".to_string(), vec![1, h]),
        ]);
        shapes
    }

    pub fn num_parameters(&self) -> usize {
        self.parameter_shapes()
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// L2 penalty added to gradients before each Adam step
    pub weight_decay: f64,
    /// Examples per optimizer step
    pub batch_size: usize,
    /// Micro-batches per optimizer step (gradient accumulation)
    pub batch_split: usize,
    /// Number of training epochs
    pub epochs: usize,
    /// Label smoothing in [0, 1]
    pub smoothing: f64,
    /// Weight of the classification loss
    pub w_cls: f64,
    /// Weight of the offset loss
    pub w_off: f64,
    /// Gradient clipping max norm
    pub grad_clip: f64,
    /// Window length of training examples
    pub window_len: usize,
    /// Logical dataset size multiplier
    pub expand_coef: usize,
    /// Windowing worker threads
    pub n_jobs: usize,
    /// Seed of the data sampling generator
    pub seed: u64,
    /// Retries when a drawn sequence is too short to window
    pub max_resample: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 6.25e-5,
            weight_decay: 0.01,
            batch_size: 128,
            batch_split: 1,
            epochs: 10,
            smoothing: 0.0,
            w_cls: 1.0,
            w_off: 10.0,
            grad_clip: 10.0,
            window_len: 256,
            expand_coef: 100,
            n_jobs: 2,
            seed: 0,
            max_resample: 16,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(Error::config(
                "learning_rate",
                self.learning_rate,
                "must be positive",
            ));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(Error::config(
                "weight_decay",
                self.weight_decay,
                "must be non-negative",
            ));
        }
        if self.batch_split == 0 {
            return Err(Error::config("batch_split", 0, "must be positive"));
        }
        if self.batch_size < self.batch_split {
            return Err(Error::config(
                "batch_size",
                self.batch_size,
                "must be at least batch_split",
            ));
        }
        if !(0.0..=1.0).contains(&self.smoothing) {
            return Err(Error::config(
                "smoothing",
                self.smoothing,
                "must be in [0, 1]",
            ));
        }
        if !self.w_cls.is_finite() || !self.w_off.is_finite() {
            return Err(Error::config(
                "w_cls/w_off",
                format!("{}/{}", self.w_cls, self.w_off),
                "must be finite",
            ));
        }
        if !(self.grad_clip > 0.0) {
            return Err(Error::config("grad_clip", self.grad_clip, "must be positive"));
        }
        if self.window_len == 0 {
            return Err(Error::config("window_len", 0, "must be positive"));
        }
        if self.expand_coef == 0 {
            return Err(Error::config("expand_coef", 0, "must be positive"));
        }
        Ok(())
    }

    /// Examples per micro-batch
    pub fn micro_batch_size(&self) -> usize {
        self.batch_size / self.batch_split
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of sampled steps
    pub seq_len: usize,
    /// Nucleus sampling probability
    pub top_p: f64,
    /// Sampling temperature
    pub temperature: f64,
    /// Seed for the sampling generator (OS entropy when absent)
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            seq_len: 256,
            top_p: 0.6,
            temperature: 1.0,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::config("top_p", self.top_p, "must be in [0, 1]"));
        }
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(Error::config(
                "temperature",
                self.temperature,
                "must be positive and finite",
            ));
        }
        Ok(())
    }
}
