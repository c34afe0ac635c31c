use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointMeta, save_checkpoint};
use crate::config::{ModelConfig, TrainingConfig};
use crate::data::BatchLoader;
use crate::error::{Error, Result};
use crate::loss::{CombinedLoss, LabelSmoothingLoss};
use crate::model::{HiddenState, SequencePredictor};
use crate::vocab::Vocab;

/// Receives scalar training metrics keyed by global step.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize);
}

/// Writes every scalar to the `tracing` DEBUG stream
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        debug!(step, value, "{}", tag);
    }
}

/// Incremental mean
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningAverage {
    count: usize,
    value: f64,
}

impl RunningAverage {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        self.value += (value - self.value) / self.count as f64;
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct EpochStats {
    pub class_loss: f64,
    pub offset_loss: f64,
    pub loss: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TrainingSummary {
    pub global_step: usize,
    pub epochs: Vec<EpochStats>,
    /// Micro-batches whose loss was not finite
    pub skipped_batches: usize,
}

#[derive(Default)]
struct EpochAverages {
    class_loss: RunningAverage,
    offset_loss: RunningAverage,
    loss: RunningAverage,
}

impl EpochAverages {
    fn stats(&self) -> EpochStats {
        EpochStats {
            class_loss: self.class_loss.get(),
            offset_loss: self.offset_loss.get(),
            loss: self.loss.get(),
        }
    }
}

pub struct Trainer {
    model: SequencePredictor,
    optimizer: AdamW,
    var_map: VarMap,
    vocab: Vocab,
    model_config: ModelConfig,
    training_config: TrainingConfig,
    criterion: CombinedLoss,
    device: Device,
    rng: StdRng,
    accumulated: Option<GradStore>,
    global_step: usize,
    skipped_batches: usize,
}

impl Trainer {
    pub fn new(
        model_config: ModelConfig,
        training_config: TrainingConfig,
        vocab: Vocab,
        device: Device,
    ) -> Result<Self> {
        model_config.validate()?;
        training_config.validate()?;
        if model_config.num_embeddings != vocab.len() {
            return Err(Error::config(
                "num_embeddings",
                model_config.num_embeddings,
                "must equal the vocabulary size",
            ));
        }

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = SequencePredictor::new(&model_config, vb)?;

        // decay is folded into the gradient as L2, see `add_weight_decay`
        let params = ParamsAdamW {
            lr: training_config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(var_map.all_vars(), params)?;

        let criterion = CombinedLoss::new(
            LabelSmoothingLoss::new(
                vocab.len(),
                training_config.smoothing,
                Some(vocab.pad_index() as usize),
            )?,
            training_config.w_cls,
            training_config.w_off,
        );

        info!(
            "Initialized model with {} parameters",
            model.num_parameters()
        );

        Ok(Self {
            model,
            optimizer,
            var_map,
            vocab,
            rng: StdRng::seed_from_u64(training_config.seed),
            model_config,
            training_config,
            criterion,
            device,
            accumulated: None,
            global_step: 0,
            skipped_batches: 0,
        })
    }

    pub fn train_epoch(
        &mut self,
        epoch: usize,
        loader: &mut BatchLoader,
        metrics: &mut dyn MetricsSink,
    ) -> Result<EpochStats> {
        let num_batches = loader.num_batches();
        let pb = ProgressBar::new(num_batches as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .map_err(|e| Error::Data(format!("progress template: {}", e)))?
                .progress_chars("##-"),
        );
        pb.set_prefix(format!("epoch {}", epoch));

        let batch_split = self.training_config.batch_split;
        let mut averages = EpochAverages::default();
        self.accumulated = None;
        loader.reset(&mut self.rng);

        let mut micro_step = 0usize;
        while let Some(batch) = loader.next_batch(&mut self.rng, &self.device)? {
            let output = self
                .model
                .forward(&batch.prev, &batch.prev_offsets, HiddenState::Fresh, true)?;
            let losses = self.criterion.compute(&output, &batch)?;
            let (class_loss, offset_loss, loss) = losses.values()?;

            if loss.is_finite() {
                averages.class_loss.update(class_loss);
                averages.offset_loss.update(offset_loss);
                averages.loss.update(loss);

                let scaled = losses.total.affine(1.0 / batch_split as f64, 0.0)?;
                self.accumulate(scaled.backward()?)?;
            } else {
                warn!(
                    "Skipping micro-batch with non-finite loss (class {}, offset {})",
                    class_loss, offset_loss
                );
                self.skipped_batches += 1;
            }

            micro_step += 1;
            if micro_step % batch_split == 0 && self.apply_accumulated()? {
                for (tag, value) in [
                    ("training/class_loss", averages.class_loss.get()),
                    ("training/offset_loss", averages.offset_loss.get()),
                    ("training/loss", averages.loss.get()),
                ] {
                    metrics.add_scalar(tag, value, self.global_step);
                }
                self.global_step += 1;
            }

            pb.set_message(format!(
                "cls {:.4} off {:.4} loss {:.4}",
                averages.class_loss.get(),
                averages.offset_loss.get(),
                averages.loss.get()
            ));
            pb.inc(1);
        }

        // an incomplete accumulation cycle is dropped
        self.accumulated = None;
        pb.finish_with_message("done");

        Ok(averages.stats())
    }

    pub fn train(
        &mut self,
        loader: &mut BatchLoader,
        metrics: &mut dyn MetricsSink,
    ) -> Result<TrainingSummary> {
        info!(
            "Starting training for {} epochs ({} micro-batches per epoch)",
            self.training_config.epochs,
            loader.num_batches()
        );

        let mut epochs = Vec::with_capacity(self.training_config.epochs);
        for epoch in 1..=self.training_config.epochs {
            info!("Epoch {}/{}", epoch, self.training_config.epochs);
            let stats = self.train_epoch(epoch, loader, metrics)?;
            info!(
                "Epoch {} loss: {:.4} (class {:.4}, offset {:.4})",
                epoch, stats.loss, stats.class_loss, stats.offset_loss
            );
            epochs.push(stats);
        }

        Ok(TrainingSummary {
            global_step: self.global_step,
            epochs,
            skipped_batches: self.skipped_batches,
        })
    }

    fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        let Some(acc) = self.accumulated.as_mut() else {
            self.accumulated = Some(grads);
            return Ok(());
        };
        for var in self.var_map.all_vars() {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let sum = match acc.get(var.as_tensor()) {
                Some(prev) => (prev + grad)?,
                None => grad.clone(),
            };
            acc.insert(var.as_tensor(), sum);
        }
        Ok(())
    }

    /// Clip, decay and take one optimizer step with the accumulated gradients.
    /// Returns false when every micro-batch of the cycle was skipped.
    fn apply_accumulated(&mut self) -> Result<bool> {
        let Some(mut grads) = self.accumulated.take() else {
            debug!("No gradients accumulated, skipping optimizer step");
            return Ok(false);
        };

        let vars = self.var_map.all_vars();
        let norm = clip_grad_norm(&mut grads, &vars, self.training_config.grad_clip)?;
        if norm > self.training_config.grad_clip {
            debug!("Clipped gradient norm {:.4}", norm);
        }
        add_weight_decay(&mut grads, &vars, self.training_config.weight_decay)?;

        self.optimizer.step(&grads)?;
        Ok(true)
    }

    /// Persist weights, vocabulary, architecture and step counter as one unit
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let meta = CheckpointMeta::new(
            self.model_config.clone(),
            self.vocab.tokens().to_vec(),
            self.global_step,
        );
        save_checkpoint(path.as_ref(), &self.var_map, &meta)?;
        info!("Checkpoint saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn model(&self) -> &SequencePredictor {
        &self.model
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn skipped_batches(&self) -> usize {
        self.skipped_batches
    }
}

/// Global L2 norm of the gradients of `vars`
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sq_norm = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sq_norm += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(sq_norm.sqrt())
}

/// Rescale gradients so their global norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = grad.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

/// L2 regularization: `grad += weight_decay * param`
pub fn add_weight_decay(grads: &mut GradStore, vars: &[Var], weight_decay: f64) -> Result<()> {
    if weight_decay == 0.0 {
        return Ok(());
    }
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let decayed = (grad + var.as_tensor().affine(weight_decay, 0.0)?)?;
            grads.insert(var.as_tensor(), decayed);
        }
    }
    Ok(())
}
