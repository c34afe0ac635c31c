use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use melody_rnn::checkpoint::{load_checkpoint, read_meta};
use melody_rnn::config::{GenerationConfig, ModelConfig, TrainingConfig};
use melody_rnn::corpus::{Corpus, NoteRecord};
use melody_rnn::data::{BatchLoader, WindowedDataset};
use melody_rnn::generate::NucleusDecoder;
use melody_rnn::midi::{is_midi_path, write_midi};
use melody_rnn::notes::render_events;
use melody_rnn::training::{Trainer, TracingMetrics};

#[derive(Parser)]
#[command(name = "melody-rnn")]
#[command(about = "Train a recurrent note model and sample melodies from it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new model on MIDI files or a JSONL note corpus
    Train {
        /// Corpus files: .mid/.midi, or .jsonl optionally .gz or .zst compressed
        #[arg(short, long, num_args = 1.., required = true)]
        data: Vec<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = "checkpoints")]
        output: PathBuf,

        /// Experiment name; outputs are <output>/<name>.ckpt and <output>/<name>.train.json
        #[arg(short, long)]
        name: String,

        /// Training configuration JSON; flags below override its fields
        #[arg(long)]
        config: Option<PathBuf>,

        /// GRU hidden size
        #[arg(long, default_value = "256")]
        hidden_size: usize,

        /// Number of GRU layers
        #[arg(long, default_value = "2")]
        num_layers: usize,

        /// Dropout between GRU layers
        #[arg(long, default_value = "0.2")]
        dropout: f64,

        /// Learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Weight decay
        #[arg(long)]
        weight_decay: Option<f64>,

        /// Label smoothing
        #[arg(long)]
        smoothing: Option<f64>,

        /// Weight of the classification loss
        #[arg(long)]
        w_cls: Option<f64>,

        /// Weight of the offset loss
        #[arg(long)]
        w_off: Option<f64>,

        /// Examples per optimizer step
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Micro-batches per optimizer step
        #[arg(long)]
        batch_split: Option<usize>,

        /// Number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Data sampling seed
        #[arg(long)]
        seed: Option<u64>,

        /// Training window length
        #[arg(long)]
        window_len: Option<usize>,

        /// Logical dataset size multiplier
        #[arg(long)]
        expand_coef: Option<usize>,

        /// Windowing worker threads
        #[arg(long)]
        n_jobs: Option<usize>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "false")]
        gpu: bool,

        /// GPU device index (for multi-GPU systems)
        #[arg(long, default_value = "0")]
        gpu_id: usize,
    },

    /// Sample a melody from a trained model
    Generate {
        /// Checkpoint directory
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Output file; `.mid`/`.midi` writes MIDI, anything else JSON
        #[arg(short, long)]
        out: PathBuf,

        /// Number of sampled steps
        #[arg(long, default_value = "256")]
        seq_len: usize,

        /// Nucleus sampling probability
        #[arg(long, default_value = "0.6")]
        top_p: f64,

        /// Sampling temperature
        #[arg(long, default_value = "1.0")]
        temperature: f64,

        /// Sampling seed (random when absent)
        #[arg(long)]
        seed: Option<u64>,

        /// JSONL file whose first piece primes the decoder
        #[arg(long)]
        history: Option<PathBuf>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "false")]
        gpu: bool,
    },

    /// Show checkpoint info
    Info {
        /// Checkpoint directory
        #[arg(short, long)]
        checkpoint: PathBuf,
    },
}

#[allow(unused_variables)]
fn get_device(use_gpu: bool, gpu_id: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            data,
            output,
            name,
            config,
            hidden_size,
            num_layers,
            dropout,
            lr,
            weight_decay,
            smoothing,
            w_cls,
            w_off,
            batch_size,
            batch_split,
            epochs,
            seed,
            window_len,
            expand_coef,
            n_jobs,
            gpu,
            gpu_id,
        } => {
            let mut training_config = match &config {
                Some(path) => TrainingConfig::from_json(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => TrainingConfig::default(),
            };
            override_with(&mut training_config.learning_rate, lr);
            override_with(&mut training_config.weight_decay, weight_decay);
            override_with(&mut training_config.smoothing, smoothing);
            override_with(&mut training_config.w_cls, w_cls);
            override_with(&mut training_config.w_off, w_off);
            override_with(&mut training_config.batch_size, batch_size);
            override_with(&mut training_config.batch_split, batch_split);
            override_with(&mut training_config.epochs, epochs);
            override_with(&mut training_config.seed, seed);
            override_with(&mut training_config.window_len, window_len);
            override_with(&mut training_config.expand_coef, expand_coef);
            override_with(&mut training_config.n_jobs, n_jobs);
            training_config.validate()?;

            let device = get_device(gpu, gpu_id)?;
            info!("Using device: {:?}", device);

            let corpus = Corpus::from_files(&data)?;
            let vocab = corpus.build_vocab();
            info!("Vocabulary size: {} (PAD included)", vocab.len());
            let sequences = corpus.encode(&vocab)?;

            let model_config = ModelConfig {
                hidden_size,
                num_layers,
                dropout,
                ..ModelConfig::new(vocab.len())
            };
            info!("Model config: {:?}", model_config);

            let dataset = WindowedDataset::new(
                sequences,
                training_config.window_len,
                training_config.expand_coef,
                training_config.max_resample,
            )?;
            let mut loader = BatchLoader::new(
                dataset,
                training_config.micro_batch_size(),
                training_config.n_jobs,
            )?;
            info!("Number of micro-batches: {}", loader.num_batches());

            std::fs::create_dir_all(&output)?;
            let train_json = output.join(format!("{}.train.json", name));
            training_config.save_json(&train_json)?;
            info!("Saved training config to {}", train_json.display());

            let mut trainer = Trainer::new(model_config, training_config, vocab, device)?;
            let summary = trainer.train(&mut loader, &mut TracingMetrics)?;
            if summary.skipped_batches > 0 {
                tracing::warn!(
                    "{} micro-batches were skipped for non-finite loss",
                    summary.skipped_batches
                );
            }

            trainer.save_checkpoint(output.join(format!("{}.ckpt", name)))?;
            info!("Training complete after {} steps", summary.global_step);
        }

        Commands::Generate {
            checkpoint,
            out,
            seq_len,
            top_p,
            temperature,
            seed,
            history,
            gpu,
        } => {
            let generation_config = GenerationConfig {
                seq_len,
                top_p,
                temperature,
                seed,
            };
            generation_config.validate()?;

            let device = get_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let loaded = load_checkpoint(&checkpoint, &device)
                .with_context(|| format!("loading {}", checkpoint.display()))?;

            let history = match &history {
                Some(path) => {
                    let corpus = Corpus::from_files(std::slice::from_ref(path))?;
                    let record = corpus
                        .records()
                        .first()
                        .with_context(|| format!("{} holds no piece", path.display()))?;
                    let ids = loaded.vocab.encode(&record.notes)?;
                    let pairs: Vec<(u32, f32)> =
                        ids.into_iter().zip(record.offsets.iter().copied()).collect();
                    Some(pairs)
                }
                None => None,
            };

            let mut rng = match generation_config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let decoder = NucleusDecoder::new(&loaded.model, &generation_config)?;
            let generation = decoder.generate(history.as_deref(), &mut rng)?;

            let notes = loaded.vocab.decode(&generation.tokens)?;
            if is_midi_path(&out) {
                let events = render_events(&notes, &generation.offsets)?;
                write_midi(&events, &out)?;
                info!("Wrote {} note events to {}", events.len(), out.display());
            } else {
                let record = NoteRecord {
                    notes,
                    offsets: generation.offsets,
                };
                std::fs::write(&out, serde_json::to_string(&record)?)?;
                info!("Wrote {} steps to {}", record.notes.len(), out.display());
            }
        }

        Commands::Info { checkpoint } => {
            let meta = read_meta(&checkpoint)?;
            let config = &meta.model;
            println!("Checkpoint: {}", checkpoint.display());
            println!("  Format version: {}", meta.format_version);
            println!("  Vocab size: {} (PAD included)", config.num_embeddings);
            println!("  Hidden size: {}", config.hidden_size);
            println!("  Num layers: {}", config.num_layers);
            println!("  Dropout: {}", config.dropout);
            println!("  Global step: {}", meta.global_step);

            let total = config.num_parameters();
            println!(
                "  Parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}
