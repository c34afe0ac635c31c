//! Checkpoint directories: `model.safetensors` next to a `checkpoint.json`
//! descriptor holding the architecture, the vocabulary and the step counter.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::SequencePredictor;
use crate::vocab::Vocab;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

const WEIGHTS_FILE: &str = "model.safetensors";
const META_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub model: ModelConfig,
    /// Vocabulary tokens in id order, PAD excluded
    pub tokens: Vec<String>,
    pub global_step: usize,
}

impl CheckpointMeta {
    pub fn new(model: ModelConfig, tokens: Vec<String>, global_step: usize) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            model,
            tokens,
            global_step,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported format version {} (expected {})",
                self.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        if self.model.num_embeddings != self.tokens.len() + 1 {
            return Err(Error::Checkpoint(format!(
                "model has {} embeddings but vocabulary has {} tokens plus PAD",
                self.model.num_embeddings,
                self.tokens.len()
            )));
        }
        self.model.validate()
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Everything needed to resume decoding from disk
pub struct LoadedCheckpoint {
    pub model: SequencePredictor,
    pub vocab: Vocab,
    pub var_map: VarMap,
    pub meta: CheckpointMeta,
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "checkpoint".into());
    name.push(suffix);
    path.with_file_name(name)
}

fn staging_path(path: &Path) -> PathBuf {
    sibling_path(path, ".tmp")
}

fn backup_path(path: &Path) -> PathBuf {
    sibling_path(path, ".old")
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

fn check_weights(var_map: &VarMap, config: &ModelConfig) -> Result<()> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
    let expected = config.parameter_shapes();
    if data.len() != expected.len() {
        return Err(Error::Checkpoint(format!(
            "variable map holds {} tensors, architecture needs {}",
            data.len(),
            expected.len()
        )));
    }
    for (name, shape) in &expected {
        match data.get(name) {
            Some(var) if var.as_tensor().dims() == shape.as_slice() => {}
            Some(var) => {
                return Err(Error::Checkpoint(format!(
                    "{} has shape {:?}, expected {:?}",
                    name,
                    var.as_tensor().dims(),
                    shape
                )));
            }
            None => return Err(Error::Checkpoint(format!("missing tensor {}", name))),
        }
    }
    Ok(())
}

/// Write a checkpoint directory at `path`, replacing any previous one.
///
/// Files are staged in a sibling `.tmp` directory and renamed into place, so
/// readers never see a descriptor without matching weights. A previous
/// checkpoint is moved to `.old` first and only deleted once the new one is
/// in place; if that rename fails it is moved back.
pub fn save_checkpoint(path: &Path, var_map: &VarMap, meta: &CheckpointMeta) -> Result<()> {
    meta.validate()?;
    check_weights(var_map, &meta.model)?;

    let staging = staging_path(path);
    remove_if_present(&staging)?;
    fs::create_dir_all(&staging)?;

    var_map.save(staging.join(WEIGHTS_FILE))?;
    fs::write(staging.join(META_FILE), serde_json::to_string_pretty(meta)?)?;

    let backup = backup_path(path);
    let replaced = path.exists();
    if replaced {
        remove_if_present(&backup)?;
        fs::rename(path, &backup)?;
    }
    if let Err(e) = fs::rename(&staging, path) {
        if replaced && let Err(restore) = fs::rename(&backup, path) {
            warn!(
                "Could not restore {} from {}: {}",
                path.display(),
                backup.display(),
                restore
            );
        }
        return Err(e.into());
    }
    if replaced {
        fs::remove_dir_all(&backup)?;
    }
    debug!(
        "Wrote checkpoint {} (step {}, {} tokens)",
        path.display(),
        meta.global_step,
        meta.tokens.len()
    );
    Ok(())
}

/// Read just the descriptor, without touching the weights
pub fn read_meta<P: AsRef<Path>>(path: P) -> Result<CheckpointMeta> {
    let meta = CheckpointMeta::from_json(path.as_ref().join(META_FILE))?;
    meta.validate()?;
    Ok(meta)
}

/// Rebuild vocabulary and predictor from a checkpoint directory
pub fn load_checkpoint<P: AsRef<Path>>(path: P, device: &Device) -> Result<LoadedCheckpoint> {
    let path = path.as_ref();
    let meta = read_meta(path)?;

    let vocab = Vocab::new(meta.tokens.iter().cloned());
    if vocab.tokens() != meta.tokens.as_slice() {
        return Err(Error::Checkpoint(
            "vocabulary tokens are not sorted and unique".into(),
        ));
    }

    let mut var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
    let model = SequencePredictor::new(&meta.model, vb)?;
    var_map.load(path.join(WEIGHTS_FILE))?;

    info!(
        "Loaded checkpoint {} ({} parameters, vocab {}, step {})",
        path.display(),
        model.num_parameters(),
        vocab.len(),
        meta.global_step
    );

    Ok(LoadedCheckpoint {
        model,
        vocab,
        var_map,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HiddenState;
    use candle_core::Tensor;

    fn tokens() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    fn build() -> (VarMap, SequencePredictor, CheckpointMeta) {
        let config = ModelConfig::nano(4);
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = SequencePredictor::new(&config, vb).unwrap();
        let meta = CheckpointMeta::new(config, tokens(), 7);
        (var_map, model, meta)
    }

    fn logits(model: &SequencePredictor) -> Vec<f32> {
        let device = Device::Cpu;
        let ids = Tensor::new(&[[1u32, 3, 2]], &device).unwrap();
        let offsets = Tensor::new(&[[0.0f32, 0.5, 0.25]], &device).unwrap();
        model
            .forward(&ids, &offsets, HiddenState::Fresh, false)
            .unwrap()
            .logits
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_save_then_load_restores_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let (var_map, model, meta) = build();

        save_checkpoint(&path, &var_map, &meta).unwrap();
        assert!(path.join(WEIGHTS_FILE).is_file());
        assert!(path.join(META_FILE).is_file());
        assert!(!staging_path(&path).exists());

        let loaded = load_checkpoint(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.vocab.len(), 4);
        assert_eq!(loaded.vocab.token_to_id("C"), Some(3));
        assert_eq!(logits(&loaded.model), logits(&model));
    }

    #[test]
    fn test_save_replaces_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let (var_map, _model, meta) = build();

        save_checkpoint(&path, &var_map, &meta).unwrap();
        let later = CheckpointMeta {
            global_step: 12,
            ..meta
        };
        save_checkpoint(&path, &var_map, &later).unwrap();
        assert_eq!(read_meta(&path).unwrap().global_step, 12);
        assert!(!backup_path(&path).exists());
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_stale_backup_does_not_block_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let (var_map, _model, meta) = build();

        save_checkpoint(&path, &var_map, &meta).unwrap();
        let stale = backup_path(&path);
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join(META_FILE), "{}").unwrap();

        let later = CheckpointMeta {
            global_step: 3,
            ..meta
        };
        save_checkpoint(&path, &var_map, &later).unwrap();
        let loaded = load_checkpoint(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.meta.global_step, 3);

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("run.ckpt")]);
    }

    #[test]
    fn test_mismatched_descriptor_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let (var_map, _model, meta) = build();

        let short_vocab = CheckpointMeta {
            tokens: vec!["A".to_string()],
            ..meta.clone()
        };
        assert!(matches!(
            save_checkpoint(&path, &var_map, &short_vocab),
            Err(Error::Checkpoint(_))
        ));

        let wider = CheckpointMeta {
            model: ModelConfig {
                hidden_size: 32,
                ..meta.model.clone()
            },
            ..meta
        };
        assert!(matches!(
            save_checkpoint(&path, &var_map, &wider),
            Err(Error::Checkpoint(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_rejects_unknown_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let (var_map, _model, meta) = build();
        save_checkpoint(&path, &var_map, &meta).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path.join(META_FILE)).unwrap()).unwrap();
        raw["format_version"] = serde_json::json!(99);
        fs::write(path.join(META_FILE), raw.to_string()).unwrap();

        assert!(matches!(
            load_checkpoint(&path, &Device::Cpu),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_load_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_checkpoint(dir.path().join("absent"), &Device::Cpu),
            Err(Error::Io(_))
        ));
    }
}
