//! JSONL note corpora.
//!
//! Each line holds one piece: `{"notes": ["C4", "0.4.7"], "offsets": [0.0, 0.5]}`,
//! where `offsets[i]` is the time elapsed since the previous event.
//! `.gz` and `.zst`/`.zstd` files are decompressed transparently.

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::midi::{is_midi_path, read_notes};
use crate::vocab::Vocab;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub notes: Vec<String>,
    pub offsets: Vec<f32>,
}

/// A piece after vocabulary lookup
#[derive(Debug, Clone, PartialEq)]
pub struct NoteSequence {
    pub ids: Vec<u32>,
    pub offsets: Vec<f32>,
}

impl NoteSequence {
    pub fn new(ids: Vec<u32>, offsets: Vec<f32>) -> Self {
        assert_eq!(ids.len(), offsets.len(), "ids and offsets must align");
        Self { ids, offsets }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Raw reader over a corpus file; `.gz`/`.gzip` and `.zst`/`.zstd` are decompressed.
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Box<dyn Read>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let compressed = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    Ok(match compressed.as_deref() {
        Some("gz" | "gzip") => Box::new(GzDecoder::new(file)),
        Some("zst" | "zstd") => Box::new(zstd::Decoder::new(file)?),
        _ => Box::new(file),
    })
}

#[derive(Debug, Clone, Default)]
pub struct Corpus {
    records: Vec<NoteRecord>,
}

impl Corpus {
    pub fn new(records: Vec<NoteRecord>) -> Result<Self> {
        for (i, record) in records.iter().enumerate() {
            check_record(record, i + 1)?;
        }
        Ok(Self { records })
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut corpus = Self::default();
        corpus.extend_from_reader(reader)?;
        Ok(corpus)
    }

    /// Load and concatenate corpus files; a MIDI file contributes one piece,
    /// any other file is read as JSONL
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut corpus = Self::default();
        for path in paths {
            let path = path.as_ref();
            let before = corpus.records.len();
            if is_midi_path(path) {
                corpus.push_midi(path)?;
            } else {
                corpus.extend_from_reader(open_file(path)?)?;
            }
            debug!(
                "Loaded {} pieces from {}",
                corpus.records.len() - before,
                path.display()
            );
        }
        info!("Corpus holds {} pieces", corpus.records.len());
        Ok(corpus)
    }

    fn push_midi(&mut self, path: &Path) -> Result<()> {
        let record = read_notes(path)?;
        check_record(&record, 1)?;
        if record.notes.is_empty() {
            warn!("{} holds no notes", path.display());
        } else {
            self.records.push(record);
        }
        Ok(())
    }

    fn extend_from_reader<R: Read>(&mut self, reader: R) -> Result<()> {
        let reader = BufReader::new(reader);
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: NoteRecord = serde_json::from_str(&line)?;
            check_record(&record, i + 1)?;
            if !record.notes.is_empty() {
                self.records.push(record);
            }
        }
        Ok(())
    }

    pub fn records(&self) -> &[NoteRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn build_vocab(&self) -> Vocab {
        Vocab::new(self.records.iter().flat_map(|r| r.notes.iter().cloned()))
    }

    pub fn encode(&self, vocab: &Vocab) -> Result<Vec<NoteSequence>> {
        self.records
            .iter()
            .map(|r| Ok(NoteSequence::new(vocab.encode(&r.notes)?, r.offsets.clone())))
            .collect()
    }
}

fn check_record(record: &NoteRecord, line: usize) -> Result<()> {
    if record.notes.len() != record.offsets.len() {
        return Err(Error::Data(format!(
            "line {}: {} notes but {} offsets",
            line,
            record.notes.len(),
            record.offsets.len()
        )));
    }
    if let Some(bad) = record.offsets.iter().find(|o| !(o.is_finite() && **o >= 0.0)) {
        return Err(Error::Data(format!(
            "line {}: offset {} is not a non-negative number",
            line, bad
        )));
    }
    Ok(())
}
