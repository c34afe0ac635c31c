//! Error types for melody-rnn

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {field} = {value} ({reason})")]
    Config {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Token not in vocabulary: {0:?}")]
    UnknownToken(String),

    #[error("Id not in vocabulary: {0}")]
    UnknownId(u32),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("MIDI error: {0}")]
    Midi(String),
}

impl Error {
    pub(crate) fn config(field: &'static str, value: impl ToString, reason: &'static str) -> Self {
        Self::Config {
            field,
            value: value.to_string(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
