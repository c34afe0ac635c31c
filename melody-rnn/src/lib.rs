pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod data;
pub mod error;
pub mod generate;
pub mod loss;
pub mod midi;
pub mod model;
pub mod notes;
pub mod training;
pub mod vocab;

pub use checkpoint::{CheckpointMeta, LoadedCheckpoint, load_checkpoint, save_checkpoint};
pub use config::{GenerationConfig, ModelConfig, TrainingConfig};
pub use corpus::{Corpus, NoteRecord, NoteSequence};
pub use data::{Batch, BatchLoader, Sample, WindowedDataset};
pub use error::{Error, Result};
pub use generate::{Generation, NucleusDecoder};
pub use loss::{CombinedLoss, LabelSmoothingLoss};
pub use model::{HiddenState, PredictorOutput, SequencePredictor};
pub use notes::{NoteEvent, render_events};
pub use training::{MetricsSink, Trainer, TracingMetrics, TrainingSummary};
pub use vocab::{PAD_INDEX, PAD_TOKEN, Vocab};
