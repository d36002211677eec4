// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Hysteresis-based onset/offset tracking. The estimators upstream report
//! what's sounding right now; the trackers turn that into discrete NoteOn and
//! NoteOff events while rejecting single-frame flicker.

use super::yin::PitchResult;
use crate::{
    config::{MonoTrackerSettings, PolyTrackerSettings},
    events::{DetectedFrame, NoteEvent, NoteEventKind, NoteEventsFn},
};
use rustc_hash::FxHashMap;

#[derive(Clone, Copy, Debug)]
struct ActiveNote {
    pitch: u8,
    confidence: f64,
    last_voiced_ms: i64,
}

#[derive(Clone, Copy, Debug)]
struct CandidateNote {
    pitch: u8,
    confidence: f64,
    since_ms: i64,
}

/// Tracks a monophonic stream of pitch estimates and emits note events.
///
/// A new pitch must persist for the onset hold before its NoteOn is trusted,
/// which rejects brief misdetections while keeping onset latency bounded. An
/// active pitch must be silent for the release hold before its NoteOff is
/// emitted.
///
/// Each instance exclusively owns its hysteresis state; never share one
/// across streams.
#[derive(Debug, Default)]
pub struct NoteTracker {
    settings: MonoTrackerSettings,
    active: Option<ActiveNote>,
    candidate: Option<CandidateNote>,
    last_timestamp_ms: i64,
}
impl NoteTracker {
    /// Creates a new [NoteTracker] with the given hold durations.
    pub fn new_with(settings: &MonoTrackerSettings) -> Self {
        Self {
            settings: *settings,
            ..Default::default()
        }
    }

    /// Consumes one pitch estimate, calling `events_fn` for each note event
    /// the transition produces (at most a NoteOff followed by a NoteOn).
    pub fn advance(&mut self, result: &PitchResult, events_fn: &mut NoteEventsFn) {
        self.last_timestamp_ms = result.timestamp_ms;
        match (result.voiced, result.pitch) {
            (true, Some(pitch)) => self.advance_voiced(pitch, result, events_fn),
            _ => self.advance_unvoiced(result.timestamp_ms, events_fn),
        }
    }

    /// Emits an immediate NoteOff for any active pitch and clears all state.
    pub fn reset(&mut self, events_fn: &mut NoteEventsFn) {
        if let Some(active) = self.active.take() {
            events_fn(NoteEvent {
                kind: NoteEventKind::NoteOff,
                pitch: active.pitch,
                confidence: active.confidence,
                timestamp_ms: self.last_timestamp_ms,
            });
        }
        self.candidate = None;
    }

    /// The currently active pitch, if any.
    pub fn active_pitch(&self) -> Option<u8> {
        self.active.map(|a| a.pitch)
    }

    fn advance_voiced(&mut self, pitch: u8, result: &PitchResult, events_fn: &mut NoteEventsFn) {
        let now = result.timestamp_ms;

        if let Some(active) = &mut self.active {
            if active.pitch == pitch {
                // Still sounding; nothing to report. A stale candidate from a
                // momentary flicker is abandoned here.
                active.last_voiced_ms = now;
                self.candidate = None;
                return;
            }
        }

        match self.candidate {
            Some(candidate) if candidate.pitch == pitch => {
                if now - candidate.since_ms >= self.settings.onset_hold_ms {
                    if let Some(active) = self.active.take() {
                        events_fn(NoteEvent {
                            kind: NoteEventKind::NoteOff,
                            pitch: active.pitch,
                            confidence: active.confidence,
                            timestamp_ms: now,
                        });
                    }
                    events_fn(NoteEvent {
                        kind: NoteEventKind::NoteOn,
                        pitch,
                        confidence: result.confidence,
                        timestamp_ms: now,
                    });
                    self.active = Some(ActiveNote {
                        pitch,
                        confidence: result.confidence,
                        last_voiced_ms: now,
                    });
                    self.candidate = None;
                }
                // Otherwise the candidate remains, keeping its original
                // start time so the hold keeps accumulating.
            }
            _ => {
                self.candidate = Some(CandidateNote {
                    pitch,
                    confidence: result.confidence,
                    since_ms: now,
                });
            }
        }
    }

    fn advance_unvoiced(&mut self, now: i64, events_fn: &mut NoteEventsFn) {
        self.candidate = None;
        if let Some(active) = self.active {
            if now - active.last_voiced_ms >= self.settings.release_hold_ms {
                events_fn(NoteEvent {
                    kind: NoteEventKind::NoteOff,
                    pitch: active.pitch,
                    confidence: active.confidence,
                    timestamp_ms: now,
                });
                self.active = None;
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TrackedNote {
    confidence: f64,
    last_seen_ms: i64,
}

/// The polyphonic counterpart of [NoteTracker]: tracks a set of simultaneous
/// pitches from the transcriber's detection frames.
///
/// Onsets need no multi-frame confirmation because the model reports onset
/// confidence directly; a pitch flagged as an onset emits NoteOn immediately.
/// A tracked pitch absent from frames for the release hold emits NoteOff.
#[derive(Debug, Default)]
pub struct MultiNoteTracker {
    settings: PolyTrackerSettings,
    notes: FxHashMap<u8, TrackedNote>,
    last_timestamp_ms: i64,
}
impl MultiNoteTracker {
    /// Creates a new [MultiNoteTracker] with the given release hold.
    pub fn new_with(settings: &PolyTrackerSettings) -> Self {
        Self {
            settings: *settings,
            ..Default::default()
        }
    }

    /// Consumes one detection frame, calling `events_fn` for each NoteOff and
    /// NoteOn the frame produces.
    pub fn advance(&mut self, frame: &DetectedFrame, events_fn: &mut NoteEventsFn) {
        let now = frame.timestamp_ms;
        self.last_timestamp_ms = now;

        // Releases first: anything we haven't seen for a while is done.
        // Sorted so that event order is deterministic.
        let mut released: Vec<(u8, f64)> = self
            .notes
            .iter()
            .filter(|(pitch, note)| {
                now - note.last_seen_ms >= self.settings.release_hold_ms
                    && !frame.notes.iter().any(|n| n.pitch == **pitch)
            })
            .map(|(pitch, note)| (*pitch, note.confidence))
            .collect();
        released.sort_unstable_by_key(|(pitch, _)| *pitch);
        for (pitch, confidence) in released {
            self.notes.remove(&pitch);
            events_fn(NoteEvent {
                kind: NoteEventKind::NoteOff,
                pitch,
                confidence,
                timestamp_ms: now,
            });
        }

        for detected in &frame.notes {
            if let Some(note) = self.notes.get_mut(&detected.pitch) {
                note.last_seen_ms = now;
                note.confidence = detected.confidence;
            } else if detected.is_onset {
                self.notes.insert(
                    detected.pitch,
                    TrackedNote {
                        confidence: detected.confidence,
                        last_seen_ms: now,
                    },
                );
                events_fn(NoteEvent {
                    kind: NoteEventKind::NoteOn,
                    pitch: detected.pitch,
                    confidence: detected.confidence,
                    timestamp_ms: now,
                });
            }
            // A pitch that is active but not an onset and not yet tracked is
            // the tail of a note whose beginning we never saw; ignore it.
        }
    }

    /// Emits NoteOff for every tracked pitch and clears state.
    pub fn reset(&mut self, events_fn: &mut NoteEventsFn) {
        let mut pitches: Vec<(u8, f64)> = self
            .notes
            .drain()
            .map(|(pitch, note)| (pitch, note.confidence))
            .collect();
        pitches.sort_unstable_by_key(|(pitch, _)| *pitch);
        for (pitch, confidence) in pitches {
            events_fn(NoteEvent {
                kind: NoteEventKind::NoteOff,
                pitch,
                confidence,
                timestamp_ms: self.last_timestamp_ms,
            });
        }
    }

    /// How many pitches are currently tracked as sounding.
    pub fn active_count(&self) -> usize {
        self.notes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DetectedNote;

    fn voiced(pitch: u8, timestamp_ms: i64) -> PitchResult {
        PitchResult {
            frequency_hz: crate::note::pitch_to_frequency(pitch),
            confidence: 0.9,
            voiced: true,
            pitch: Some(pitch),
            cents_offset: 0.0,
            timestamp_ms,
        }
    }

    fn unvoiced(timestamp_ms: i64) -> PitchResult {
        PitchResult::unvoiced(timestamp_ms)
    }

    fn collect(tracker: &mut NoteTracker, results: &[PitchResult]) -> Vec<NoteEvent> {
        let mut events = Vec::new();
        for result in results {
            tracker.advance(result, &mut |e| events.push(e));
        }
        events
    }

    #[test]
    fn single_frame_flicker_is_rejected() {
        let mut tracker = NoteTracker::default();
        let events = collect(&mut tracker, &[voiced(60, 0), unvoiced(10), unvoiced(200)]);
        assert!(events.is_empty());
    }

    #[test]
    fn sustained_pitch_emits_exactly_one_note_on() {
        let mut tracker = NoteTracker::default();
        let results: Vec<PitchResult> = (0..10).map(|i| voiced(60, i * 20)).collect();
        let events = collect(&mut tracker, &results);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NoteEventKind::NoteOn);
        assert_eq!(events[0].pitch, 60);
        // The onset fires at the first frame where the hold has elapsed.
        assert_eq!(events[0].timestamp_ms, 40);
    }

    #[test]
    fn release_waits_for_hold() {
        let mut tracker = NoteTracker::default();
        let events = collect(
            &mut tracker,
            &[
                voiced(60, 0),
                voiced(60, 40),
                unvoiced(60),
                unvoiced(100),
                unvoiced(120),
            ],
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, NoteEventKind::NoteOn);
        assert_eq!(events[1].kind, NoteEventKind::NoteOff);
        // Last voiced at 40; release hold 80 elapses at 120.
        assert_eq!(events[1].timestamp_ms, 120);
    }

    #[test]
    fn pitch_change_emits_off_then_on() {
        let mut tracker = NoteTracker::default();
        let events = collect(
            &mut tracker,
            &[
                voiced(60, 0),
                voiced(60, 40),
                voiced(64, 80),
                voiced(64, 120),
            ],
        );
        assert_eq!(events.len(), 3);
        assert_eq!(
            (events[0].kind, events[0].pitch),
            (NoteEventKind::NoteOn, 60)
        );
        assert_eq!(
            (events[1].kind, events[1].pitch),
            (NoteEventKind::NoteOff, 60)
        );
        assert_eq!(
            (events[2].kind, events[2].pitch),
            (NoteEventKind::NoteOn, 64)
        );
    }

    #[test]
    fn flicker_between_pitches_does_not_switch() {
        let mut tracker = NoteTracker::default();
        // A single frame of 64 inside a run of 60 should not switch notes.
        let events = collect(
            &mut tracker,
            &[
                voiced(60, 0),
                voiced(60, 40),
                voiced(64, 60),
                voiced(60, 80),
                voiced(60, 120),
            ],
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pitch, 60);
        assert_eq!(tracker.active_pitch(), Some(60));
    }

    #[test]
    fn reset_flushes_active_note() {
        let mut tracker = NoteTracker::default();
        let mut events = collect(&mut tracker, &[voiced(60, 0), voiced(60, 40)]);
        tracker.advance(&voiced(60, 80), &mut |e| events.push(e));
        tracker.reset(&mut |e| events.push(e));
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, NoteEventKind::NoteOff);
        assert_eq!(events[1].pitch, 60);
        assert_eq!(tracker.active_pitch(), None);

        // Reset is idempotent.
        tracker.reset(&mut |_| panic!("nothing left to flush"));
    }

    fn frame(notes: &[(u8, f64, bool)], timestamp_ms: i64) -> DetectedFrame {
        DetectedFrame {
            notes: notes
                .iter()
                .map(|&(pitch, confidence, is_onset)| DetectedNote {
                    pitch,
                    confidence,
                    is_onset,
                })
                .collect(),
            timestamp_ms,
        }
    }

    #[test]
    fn chord_emits_one_note_on_per_pitch() {
        let mut tracker = MultiNoteTracker::default();
        let mut events = Vec::new();
        tracker.advance(
            &frame(&[(60, 0.9, true), (64, 0.8, true), (67, 0.85, true)], 0),
            &mut |e| events.push(e),
        );
        assert_eq!(events.len(), 3);
        let mut pitches: Vec<u8> = events.iter().map(|e| e.pitch).collect();
        pitches.sort_unstable();
        assert_eq!(pitches, vec![60, 64, 67]);
        assert!(events.iter().all(|e| e.kind == NoteEventKind::NoteOn));

        // The same chord again is not a new onset.
        tracker.advance(
            &frame(&[(60, 0.9, false), (64, 0.8, false), (67, 0.85, false)], 40),
            &mut |e| events.push(e),
        );
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn absent_pitch_emits_exactly_one_note_off() {
        let mut tracker = MultiNoteTracker::default();
        let mut events = Vec::new();
        tracker.advance(&frame(&[(60, 0.9, true), (64, 0.8, true)], 0), &mut |e| {
            events.push(e)
        });
        events.clear();

        // 64 disappears; 60 stays.
        tracker.advance(&frame(&[(60, 0.9, false)], 30), &mut |e| events.push(e));
        assert!(events.is_empty(), "release hold hasn't elapsed yet");
        tracker.advance(&frame(&[(60, 0.9, false)], 70), &mut |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NoteEventKind::NoteOff);
        assert_eq!(events[0].pitch, 64);

        // And only once.
        tracker.advance(&frame(&[(60, 0.9, false)], 140), &mut |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn non_onset_pitch_is_not_adopted() {
        let mut tracker = MultiNoteTracker::default();
        let mut events = Vec::new();
        tracker.advance(&frame(&[(60, 0.9, false)], 0), &mut |e| events.push(e));
        assert!(events.is_empty());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn multi_reset_flushes_everything() {
        let mut tracker = MultiNoteTracker::default();
        let mut events = Vec::new();
        tracker.advance(&frame(&[(60, 0.9, true), (64, 0.8, true)], 0), &mut |e| {
            events.push(e)
        });
        events.clear();
        tracker.reset(&mut |e| events.push(e));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == NoteEventKind::NoteOff));
        assert_eq!(events[0].pitch, 60);
        assert_eq!(events[1].pitch, 64);
        assert_eq!(tracker.active_count(), 0);
    }
}
