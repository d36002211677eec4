// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Pitch-number and frequency math.
//!
//! Pitch numbers follow the standard piano convention: A4 = 440 Hz = pitch 69,
//! with the playable piano range running from 21 (A0) to 108 (C8). These are
//! the same numbers that appear in MIDI key bytes, which is what lets all
//! three input sources speak one language.

/// Lowest pitch on a standard 88-key piano (A0).
pub const PIANO_MIN_PITCH: u8 = 21;

/// Highest pitch on a standard 88-key piano (C8).
pub const PIANO_MAX_PITCH: u8 = 108;

/// Concert A.
pub const A4_PITCH: u8 = 69;

/// Concert A's frequency.
pub const A4_FREQUENCY_HZ: f64 = 440.0;

/// The number of keys on a standard piano, which is also the number of bins in
/// the polyphonic model's activation vectors.
pub const PIANO_KEY_COUNT: usize = 88;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Whether the given pitch number is within the playable piano range.
pub fn is_piano_pitch(pitch: u8) -> bool {
    (PIANO_MIN_PITCH..=PIANO_MAX_PITCH).contains(&pitch)
}

/// The equal-tempered frequency of the given pitch number.
pub fn pitch_to_frequency(pitch: u8) -> f64 {
    A4_FREQUENCY_HZ * 2.0f64.powf((pitch as f64 - A4_PITCH as f64) / 12.0)
}

/// The piano pitch nearest to the given frequency, or None if the nearest
/// pitch falls outside the playable range (or the frequency is nonsensical).
pub fn frequency_to_nearest_pitch(frequency_hz: f64) -> Option<u8> {
    if frequency_hz <= 0.0 || !frequency_hz.is_finite() {
        return None;
    }
    let pitch = A4_PITCH as f64 + 12.0 * (frequency_hz / A4_FREQUENCY_HZ).log2();
    let pitch = pitch.round();
    if (PIANO_MIN_PITCH as f64..=PIANO_MAX_PITCH as f64).contains(&pitch) {
        Some(pitch as u8)
    } else {
        None
    }
}

/// How far, in cents, the given frequency is from the given pitch's nominal
/// frequency. Stays within 50 cents either way when the pitch is the nearest
/// one.
pub fn cents_offset(frequency_hz: f64, pitch: u8) -> f64 {
    1200.0 * (frequency_hz / pitch_to_frequency(pitch)).log2()
}

/// A human-readable name like "C4" or "A#0". Octaves follow the convention
/// that pitch 60 is C4.
pub fn note_name(pitch: u8) -> String {
    let name = NOTE_NAMES[(pitch % 12) as usize];
    let octave = (pitch / 12) as i32 - 1;
    format!("{name}{octave}")
}
