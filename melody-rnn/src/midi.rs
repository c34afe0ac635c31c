//! Standard MIDI File input and output, via `midly`.
//!
//! Reading keeps note onsets of the first track that has any, joining keys
//! struck on the same tick into one token. Writing puts everything on one
//! track on channel 0: tempo, a piano program change, then note-on/note-off
//! pairs. Every event sounds for an eighth note.

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::corpus::NoteRecord;
use crate::error::{Error, Result};
use crate::notes::{NoteEvent, onset_token};

/// Ticks per quarter note in MIDI output.
const TICKS_PER_QUARTER: u16 = 480;

/// Length of every note in ticks.
const NOTE_TICKS: u32 = TICKS_PER_QUARTER as u32 / 2;

const TEMPO_BPM: u32 = 120;
const PIANO_PROGRAM: u8 = 0;
const VELOCITY: u8 = 80;

pub fn is_midi_path(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("mid" | "midi")
    )
}

/// Read a MIDI file into one corpus piece.
pub fn read_notes(path: &Path) -> Result<NoteRecord> {
    let bytes = std::fs::read(path)?;
    let smf =
        Smf::parse(&bytes).map_err(|e| Error::Midi(format!("{}: {}", path.display(), e)))?;
    notes_from_smf(&smf)
}

/// Keys of every note-on with non-zero velocity, grouped by absolute tick
fn track_onsets(track: &[TrackEvent]) -> BTreeMap<u64, BTreeSet<u8>> {
    let mut onsets: BTreeMap<u64, BTreeSet<u8>> = BTreeMap::new();
    let mut tick = 0u64;
    for event in track {
        tick += event.delta.as_int() as u64;
        if let TrackEventKind::Midi {
            message: MidiMessage::NoteOn { key, vel },
            ..
        } = event.kind
            && vel.as_int() > 0
        {
            onsets.entry(tick).or_default().insert(key.as_int());
        }
    }
    onsets
}

/// Tokens and offsets (quarter notes since the previous onset) of the first
/// track holding notes.
pub fn notes_from_smf(smf: &Smf) -> Result<NoteRecord> {
    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(tpq) if tpq.as_int() > 0 => tpq.as_int() as f64,
        Timing::Metrical(_) => return Err(Error::Midi("zero ticks per quarter note".into())),
        Timing::Timecode(..) => {
            return Err(Error::Midi("timecode timing is not supported".into()));
        }
    };

    let onsets = smf
        .tracks
        .iter()
        .map(|track| track_onsets(track))
        .find(|onsets| !onsets.is_empty())
        .unwrap_or_default();

    let mut notes = Vec::with_capacity(onsets.len());
    let mut offsets = Vec::with_capacity(onsets.len());
    let mut prev_tick = 0u64;
    for (tick, keys) in onsets {
        notes.push(onset_token(&keys));
        offsets.push(((tick - prev_tick) as f64 / ticks_per_quarter) as f32);
        prev_tick = tick;
    }
    Ok(NoteRecord { notes, offsets })
}

/// Convert events to MIDI and write them to `path`.
pub fn write_midi(events: &[NoteEvent], path: &Path) -> Result<()> {
    let smf = events_to_smf(events)?;
    let mut buf = Vec::new();
    smf.write(&mut buf)
        .map_err(|e| Error::Midi(e.to_string()))?;
    std::fs::write(path, &buf)?;
    Ok(())
}

fn note_message(key: u8, on: bool) -> MidiMessage {
    if on {
        MidiMessage::NoteOn {
            key: u7::new(key),
            vel: u7::new(VELOCITY),
        }
    } else {
        MidiMessage::NoteOff {
            key: u7::new(key),
            vel: u7::new(0),
        }
    }
}

/// Convert events to an in-memory single-track SMF.
pub fn events_to_smf(events: &[NoteEvent]) -> Result<Smf<'static>> {
    // (tick, is_on, key); offs sort before ons at the same tick
    let mut timeline: Vec<(u32, bool, u8)> = Vec::with_capacity(events.len() * 4);
    for event in events {
        if !event.start.is_finite() || event.start < 0.0 {
            return Err(Error::Midi(format!("invalid event start {}", event.start)));
        }
        let tick = (event.start * TICKS_PER_QUARTER as f64).round() as u32;
        for &key in &event.keys {
            if key > 127 {
                return Err(Error::Midi(format!("key {} out of MIDI range", key)));
            }
            timeline.push((tick, true, key));
            timeline.push((tick + NOTE_TICKS, false, key));
        }
    }
    timeline.sort_by_key(|&(tick, on, key)| (tick, on, key));

    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));

    let channel = u4::new(0);
    let mut track: Track<'static> = Vec::with_capacity(timeline.len() + 3);
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(60_000_000 / TEMPO_BPM))),
    });
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Midi {
            channel,
            message: MidiMessage::ProgramChange {
                program: u7::new(PIANO_PROGRAM),
            },
        },
    });

    let mut last_tick = 0u32;
    for (tick, on, key) in timeline {
        track.push(TrackEvent {
            delta: u28::new(tick - last_tick),
            kind: TrackEventKind::Midi {
                channel,
                message: note_message(key, on),
            },
        });
        last_tick = tick;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);
    Ok(smf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(start: f64, keys: &[u8]) -> NoteEvent {
        NoteEvent {
            start,
            keys: keys.to_vec(),
        }
    }

    fn note_ons(smf: &Smf) -> Vec<(u32, u8)> {
        let mut tick = 0u32;
        let mut ons = Vec::new();
        for ev in &smf.tracks[0] {
            tick += ev.delta.as_int();
            if let TrackEventKind::Midi {
                message: MidiMessage::NoteOn { key, .. },
                ..
            } = ev.kind
            {
                ons.push((tick, key.as_int()));
            }
        }
        ons
    }

    #[test]
    fn test_events_to_smf_places_notes_on_ticks() {
        let events = vec![event(0.0, &[60]), event(0.5, &[64]), event(1.5, &[60, 64, 67])];
        let smf = events_to_smf(&events).unwrap();

        assert_eq!(smf.tracks.len(), 1);
        assert_eq!(
            note_ons(&smf),
            vec![(0, 60), (240, 64), (720, 60), (720, 64), (720, 67)]
        );
        assert!(matches!(
            smf.tracks[0].last().unwrap().kind,
            TrackEventKind::Meta(MetaMessage::EndOfTrack)
        ));
    }

    #[test]
    fn test_note_off_precedes_reattack_at_same_tick() {
        let smf = events_to_smf(&[event(0.0, &[60]), event(0.5, &[60])]).unwrap();
        let kinds: Vec<_> = smf.tracks[0]
            .iter()
            .filter_map(|ev| match ev.kind {
                TrackEventKind::Midi { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert!(matches!(kinds[1], MidiMessage::NoteOn { .. }));
        assert!(matches!(kinds[2], MidiMessage::NoteOff { .. }));
        assert!(matches!(kinds[3], MidiMessage::NoteOn { .. }));
    }

    #[test]
    fn test_write_midi_round_trips_through_parser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mid");
        write_midi(&[event(0.0, &[60]), event(1.0, &[62])], &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(note_ons(&smf), vec![(0, 60), (480, 62)]);
    }

    #[test]
    fn test_read_notes_recovers_written_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piece.MID");
        let events = vec![
            event(0.0, &[60]),
            event(0.5, &[60, 64, 67]),
            event(1.0, &[63]),
            event(1.75, &[62, 74]),
        ];
        write_midi(&events, &path).unwrap();
        assert!(is_midi_path(&path));

        let record = read_notes(&path).unwrap();
        assert_eq!(record.notes, vec!["C4", "0.4.7", "E-4", "2"]);
        assert_eq!(record.offsets, vec![0.0, 0.5, 0.5, 0.75]);
    }

    #[test]
    fn test_first_offset_counts_from_track_start() {
        let smf = events_to_smf(&[event(0.25, &[69]), event(0.75, &[71])]).unwrap();
        let record = notes_from_smf(&smf).unwrap();
        assert_eq!(record.notes, vec!["A4", "B4"]);
        assert_eq!(record.offsets, vec![0.25, 0.5]);
    }

    #[test]
    fn test_read_notes_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mid");
        std::fs::write(&path, b"not a midi file").unwrap();
        assert!(matches!(read_notes(&path), Err(Error::Midi(_))));
    }

    #[test]
    fn test_rejects_invalid_events() {
        assert!(events_to_smf(&[event(-1.0, &[60])]).is_err());
        assert!(events_to_smf(&[event(0.0, &[200])]).is_err());
    }
}
