//! Turning decoded (token, offset) pairs into timed note events.
//!
//! Tokens come in two spellings: pitch names such as `C4`, `F#3` or `B-2`
//! (`-` is a flat) and chords written as dot-separated pitch classes such as
//! `0.4.7`. Offsets are gaps from the previous event in quarter notes.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::vocab::PAD_TOKEN;

/// Octave chords are placed in
const CHORD_BASE_KEY: u8 = 60;

/// Keys sounding together at `start` quarter notes from the beginning
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    pub start: f64,
    pub keys: Vec<u8>,
}

fn is_chord(token: &str) -> bool {
    token.contains('.') || (!token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
}

fn parse_chord(token: &str) -> Result<Vec<u8>> {
    token
        .split('.')
        .map(|part| match part.parse::<u8>() {
            Ok(pc) if pc < 12 => Ok(CHORD_BASE_KEY + pc),
            _ => Err(Error::Data(format!("bad pitch class {:?} in chord {:?}", part, token))),
        })
        .collect()
}

/// MIDI key of a pitch name, `12 * (octave + 1) + pitch class`
pub fn parse_pitch(name: &str) -> Result<u8> {
    let bad = || Error::Data(format!("unparseable pitch name {:?}", name));

    let mut chars = name.chars();
    let step: i32 = match chars.next().map(|c| c.to_ascii_uppercase()) {
        Some('C') => 0,
        Some('D') => 2,
        Some('E') => 4,
        Some('F') => 5,
        Some('G') => 7,
        Some('A') => 9,
        Some('B') => 11,
        _ => return Err(bad()),
    };

    let rest = chars.as_str();
    let octave_at = rest.find(|c: char| c.is_ascii_digit()).ok_or_else(bad)?;
    let (accidentals, octave) = rest.split_at(octave_at);

    let mut alter = 0i32;
    for c in accidentals.chars() {
        match c {
            '#' => alter += 1,
            '-' => alter -= 1,
            _ => return Err(bad()),
        }
    }
    let octave: i32 = octave.parse().map_err(|_| bad())?;

    let key = 12 * (octave + 1) + step + alter;
    u8::try_from(key)
        .ok()
        .filter(|&k| k < 128)
        .ok_or_else(bad)
}

/// Spelling used when naming MIDI keys; black keys follow the usual sharp/flat choice
const PITCH_NAMES: [&str; 12] = [
    "C", "C#", "D", "E-", "E", "F", "F#", "G", "G#", "A", "B-", "B",
];

/// Pitch name of a MIDI key, the inverse of [`parse_pitch`]
pub fn pitch_name(key: u8) -> String {
    format!("{}{}", PITCH_NAMES[(key % 12) as usize], key as i32 / 12 - 1)
}

/// Token for keys starting together: a pitch name for a single key,
/// otherwise the sorted pitch classes joined by dots
pub fn onset_token(keys: &BTreeSet<u8>) -> String {
    if keys.len() == 1
        && let Some(&key) = keys.first()
    {
        return pitch_name(key);
    }
    let classes: BTreeSet<u8> = keys.iter().map(|k| k % 12).collect();
    classes
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Keys for one token; PAD is a rest and yields no keys
pub fn token_keys(token: &str) -> Result<Vec<u8>> {
    if token == PAD_TOKEN {
        Ok(Vec::new())
    } else if is_chord(token) {
        parse_chord(token)
    } else {
        Ok(vec![parse_pitch(token)?])
    }
}

/// Place each token at the running sum of its offset, every offset clamped to `[0, 1]`.
///
/// PAD tokens advance time but produce no event.
pub fn render_events<S: AsRef<str>>(tokens: &[S], offsets: &[f32]) -> Result<Vec<NoteEvent>> {
    if tokens.len() != offsets.len() {
        return Err(Error::Data(format!(
            "{} tokens but {} offsets",
            tokens.len(),
            offsets.len()
        )));
    }

    let mut events = Vec::with_capacity(tokens.len());
    let mut time = 0.0f64;
    for (token, &offset) in tokens.iter().zip(offsets) {
        let offset = if offset.is_finite() { offset.clamp(0.0, 1.0) } else { 0.0 };
        time += offset as f64;
        let keys = token_keys(token.as_ref())?;
        if !keys.is_empty() {
            events.push(NoteEvent { start: time, keys });
        }
    }
    Ok(events)
}
