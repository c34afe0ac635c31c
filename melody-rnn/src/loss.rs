//! Training criteria: label-smoothed token classification plus Smooth-L1 on offsets.

use candle_core::{D, DType, Result, Tensor};

use crate::data::Batch;
use crate::error::Error;
use crate::model::PredictorOutput;

/// Cross-entropy over class logits with optional label smoothing.
///
/// With `smoothing == 0` this is NLL averaged over targets that are not
/// `ignore_index`. With `smoothing > 0` it is the batch-mean KL divergence to
/// a target row holding `1 - s` on the true class, `s / (N - k)` on every
/// other class and zero on the ignored class, `k` being the number of
/// excluded columns (the true class, plus the ignored one when it is a
/// valid index).
#[derive(Debug, Clone)]
pub struct LabelSmoothingLoss {
    n_classes: usize,
    smoothing: f64,
    ignore_index: Option<usize>,
}

impl LabelSmoothingLoss {
    pub fn new(
        n_classes: usize,
        smoothing: f64,
        ignore_index: Option<usize>,
    ) -> crate::error::Result<Self> {
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(Error::config("smoothing", smoothing, "must be in [0, 1]"));
        }
        if n_classes == 0 {
            return Err(Error::config("n_classes", 0, "must be positive"));
        }
        Ok(Self {
            n_classes,
            smoothing,
            ignore_index,
        })
    }

    fn ignored_column(&self) -> Option<usize> {
        self.ignore_index.filter(|&i| i < self.n_classes)
    }

    fn fill_value(&self) -> f64 {
        let excluded = 1 + usize::from(self.ignored_column().is_some());
        match self.n_classes.checked_sub(excluded) {
            Some(rest) if rest > 0 => self.smoothing / rest as f64,
            _ => 0.0,
        }
    }

    fn smoothed_rows(&self, targets: &[u32]) -> Vec<f32> {
        let n = self.n_classes;
        let fill = self.fill_value() as f32;
        let confidence = (1.0 - self.smoothing) as f32;
        let mut dist = vec![fill; targets.len() * n];
        for (row, &target) in targets.iter().enumerate() {
            let base = row * n;
            dist[base + target as usize] = confidence;
            if let Some(ignored) = self.ignored_column() {
                dist[base + ignored] = 0.0;
            }
        }
        dist
    }

    /// Smoothed target distribution, one row per target
    pub fn target_distribution(&self, targets: &[u32]) -> Vec<Vec<f32>> {
        self.smoothed_rows(targets)
            .chunks(self.n_classes)
            .map(<[f32]>::to_vec)
            .collect()
    }

    /// `logits` is `[rows, n_classes]`, `targets` is `[rows]` (u32)
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
        if self.smoothing > 0.0 {
            self.smoothed_kl(&log_probs, targets)
        } else {
            self.masked_nll(&log_probs, targets)
        }
    }

    fn masked_nll(&self, log_probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let picked = log_probs
            .gather(&targets.unsqueeze(1)?.contiguous()?, 1)?
            .squeeze(1)?;
        let mask = match self.ignored_column() {
            Some(ignored) => targets.ne(ignored as u32)?.to_dtype(DType::F32)?,
            None => picked.ones_like()?,
        };
        let count = mask.sum_all()?.to_scalar::<f32>()?;
        if count == 0.0 {
            return Tensor::zeros((), DType::F32, log_probs.device());
        }
        (picked * mask)?.sum_all()?.affine(-1.0 / count as f64, 0.0)
    }

    fn smoothed_kl(&self, log_probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let targets = targets.to_vec1::<u32>()?;
        let rows = targets.len();
        if rows == 0 {
            return Tensor::zeros((), DType::F32, log_probs.device());
        }
        let dist = self.smoothed_rows(&targets);
        // sum(t * ln t) does not depend on the model
        let entropy_term: f64 = dist
            .iter()
            .filter(|&&t| t > 0.0)
            .map(|&t| t as f64 * (t as f64).ln())
            .sum();
        let dist = Tensor::from_vec(dist, (rows, self.n_classes), log_probs.device())?;
        let cross = (dist * log_probs)?.sum_all()?;
        cross.affine(-1.0 / rows as f64, entropy_term / rows as f64)
    }
}

/// Smooth-L1 (Huber, beta 1) between `mask * predicted` and `target`, averaged over every position
pub fn masked_smooth_l1(predicted: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let diff = ((predicted * mask)? - target)?;
    let abs = diff.abs()?;
    let clipped = abs.minimum(1.0)?;
    // 0.5 d^2 below 1, |d| - 0.5 above
    let per_elem = ((clipped.sqr()? * 0.5)? + (abs - clipped)?)?;
    per_elem.mean_all()
}

pub struct LossBreakdown {
    pub class: Tensor,
    pub offset: Tensor,
    pub total: Tensor,
}

impl LossBreakdown {
    /// Host copies of (class, offset, total)
    pub fn values(&self) -> Result<(f64, f64, f64)> {
        Ok((
            self.class.to_scalar::<f32>()? as f64,
            self.offset.to_scalar::<f32>()? as f64,
            self.total.to_scalar::<f32>()? as f64,
        ))
    }
}

/// `w_cls * class_loss + w_off * offset_loss`
pub struct CombinedLoss {
    classification: LabelSmoothingLoss,
    w_cls: f64,
    w_off: f64,
}

impl CombinedLoss {
    pub fn new(classification: LabelSmoothingLoss, w_cls: f64, w_off: f64) -> Self {
        Self {
            classification,
            w_cls,
            w_off,
        }
    }

    pub fn compute(&self, output: &PredictorOutput, batch: &Batch) -> Result<LossBreakdown> {
        let (b, t, n) = output.logits.dims3()?;
        let logits = output.logits.reshape((b * t, n))?;
        let targets = batch.next.flatten_all()?;
        let class = self.classification.forward(&logits, &targets)?;

        let offset = masked_smooth_l1(&output.offsets, &batch.next_offsets, &batch.content_mask)?;

        let total = (class.affine(self.w_cls, 0.0)? + offset.affine(self.w_off, 0.0)?)?;
        Ok(LossBreakdown {
            class,
            offset,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits() -> Tensor {
        Tensor::new(
            &[
                [2.0f32, 0.5, -1.0, 0.0],
                [0.1, 0.2, 0.3, 0.4],
                [-1.0, 3.0, 0.0, 1.0],
            ],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn log_softmax_rows(rows: &[[f32; 4]]) -> Vec<Vec<f64>> {
        rows.iter()
            .map(|row| {
                let lse = row.iter().map(|&x| (x as f64).exp()).sum::<f64>().ln();
                row.iter().map(|&x| x as f64 - lse).collect()
            })
            .collect()
    }

    const ROWS: [[f32; 4]; 3] = [
        [2.0, 0.5, -1.0, 0.0],
        [0.1, 0.2, 0.3, 0.4],
        [-1.0, 3.0, 0.0, 1.0],
    ];

    #[test]
    fn test_unsmoothed_is_nll_ignoring_pad() {
        let loss = LabelSmoothingLoss::new(4, 0.0, Some(0)).unwrap();
        let targets = Tensor::new(&[1u32, 0, 3], &Device::Cpu).unwrap();
        let value = loss
            .forward(&logits(), &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64;

        let lp = log_softmax_rows(&ROWS);
        let expected = -(lp[0][1] + lp[2][3]) / 2.0;
        assert!((value - expected).abs() < 1e-5, "{} vs {}", value, expected);
    }

    #[test]
    fn test_out_of_range_smoothing_is_config_error() {
        for s in [-0.1, 1.5, f64::NAN] {
            assert!(matches!(
                LabelSmoothingLoss::new(4, s, Some(0)),
                Err(Error::Config {
                    field: "smoothing",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_all_ignored_targets_give_zero() {
        let loss = LabelSmoothingLoss::new(4, 0.0, Some(0)).unwrap();
        let targets = Tensor::new(&[0u32, 0, 0], &Device::Cpu).unwrap();
        let value = loss.forward(&logits(), &targets).unwrap();
        assert_eq!(value.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_smoothed_rows_sum_to_one_for_content_targets() {
        for &s in &[0.05, 0.1, 0.5, 0.9] {
            let loss = LabelSmoothingLoss::new(6, s, Some(0)).unwrap();
            let rows = loss.target_distribution(&[1, 2, 5]);
            for row in &rows {
                assert_eq!(row[0], 0.0);
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
            assert!((rows[0][1] - (1.0 - s as f32)).abs() < 1e-6);
            assert!((rows[0][2] - s as f32 / 4.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_pad_target_row_loses_its_confidence_mass() {
        let s = 0.2;
        let loss = LabelSmoothingLoss::new(5, s, Some(0)).unwrap();
        let row = &loss.target_distribution(&[0])[0];
        let fill = s / 3.0;
        let sum: f64 = row.iter().map(|&x| x as f64).sum();
        // fill on the four non-pad columns, the pad column's (1 - s) removed
        assert!((sum - 4.0 * fill).abs() < 1e-5);
    }

    #[test]
    fn test_out_of_range_ignore_index_excludes_only_target() {
        let loss = LabelSmoothingLoss::new(4, 0.3, Some(100)).unwrap();
        let rows = loss.target_distribution(&[2]);
        assert!((rows[0][0] - 0.1).abs() < 1e-6);
        let sum: f32 = rows[0].iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);

        let no_ignore = LabelSmoothingLoss::new(4, 0.3, None).unwrap();
        assert_eq!(no_ignore.target_distribution(&[2]), rows);
    }

    #[test]
    fn test_degenerate_class_count_has_no_division_error() {
        let loss = LabelSmoothingLoss::new(2, 0.5, Some(0)).unwrap();
        let rows = loss.target_distribution(&[1]);
        assert_eq!(rows[0], vec![0.0, 0.5]);

        let logits = Tensor::new(&[[0.3f32, -0.2]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        let value = loss.forward(&logits, &targets).unwrap();
        assert!(value.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_smoothed_loss_is_kl_divergence() {
        let s = 0.1;
        let loss = LabelSmoothingLoss::new(4, s, Some(0)).unwrap();
        let targets = [1u32, 2, 3];
        let value = loss
            .forward(&logits(), &Tensor::new(&targets, &Device::Cpu).unwrap())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64;

        let lp = log_softmax_rows(&ROWS);
        let rows = loss.target_distribution(&targets);
        let mut expected = 0.0;
        for (r, row) in rows.iter().enumerate() {
            for (c, &t) in row.iter().enumerate() {
                if t > 0.0 {
                    let t = t as f64;
                    expected += t * (t.ln() - lp[r][c]);
                }
            }
        }
        expected /= 3.0;
        assert!((value - expected).abs() < 1e-5, "{} vs {}", value, expected);
    }

    #[test]
    fn test_masked_smooth_l1() {
        let device = Device::Cpu;
        let predicted = Tensor::new(&[[0.5f32, 3.0, 5.0]], &device).unwrap();
        let target = Tensor::new(&[[0.0f32, 0.0, 0.0]], &device).unwrap();
        let mask = Tensor::new(&[[1.0f32, 1.0, 0.0]], &device).unwrap();
        let value = masked_smooth_l1(&predicted, &target, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // (0.125 + 2.5 + 0) / 3
        assert!((value - 2.625 / 3.0).abs() < 1e-6);
    }
}
