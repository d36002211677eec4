// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The on-screen touch source: the input of last resort, always available.

use super::{NoteInputSource, ProvidesService, SourceEvent};
use crate::{
    config::InputMethod,
    events::{NoteEventKind, SourceTag, UnifiedInputEvent},
    util::ChannelPair,
};
use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;

/// A [TouchServiceInput] tells [TouchSource] what to do.
#[derive(Debug)]
pub enum TouchServiceInput {
    /// The player pressed an on-screen key.
    KeyDown {
        #[allow(missing_docs)]
        pitch: u8,
        #[allow(missing_docs)]
        velocity: u8,
        #[allow(missing_docs)]
        timestamp_ms: i64,
    },
    /// The player released an on-screen key.
    KeyUp {
        #[allow(missing_docs)]
        pitch: u8,
        #[allow(missing_docs)]
        timestamp_ms: i64,
    },
    /// Begin delivering events.
    Start,
    /// Stop delivering events, flushing held keys as NoteOffs.
    Stop,
    /// Exit the service.
    Quit,
}

/// Republishes on-screen key presses as [UnifiedInputEvent]s tagged
/// [SourceTag::Touch]. Duplicate key-downs for an already-held pitch are
/// suppressed so the event stream keeps its NoteOn/NoteOff pairing invariant.
#[derive(Debug)]
pub struct TouchSource {
    inputs: ChannelPair<TouchServiceInput>,
    events: ChannelPair<SourceEvent>,
}
impl Default for TouchSource {
    fn default() -> Self {
        let r = Self {
            inputs: Default::default(),
            events: Default::default(),
        };
        r.spawn_thread();
        r
    }
}
impl ProvidesService<TouchServiceInput, SourceEvent> for TouchSource {
    fn sender(&self) -> &Sender<TouchServiceInput> {
        &self.inputs.sender
    }

    fn receiver(&self) -> &Receiver<SourceEvent> {
        &self.events.receiver
    }
}
impl NoteInputSource for TouchSource {
    fn method(&self) -> InputMethod {
        InputMethod::Touch
    }

    fn is_available(&self) -> bool {
        true
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn deactivate(&mut self) {}

    fn start(&mut self) {
        self.send_input(TouchServiceInput::Start);
    }

    fn request_stop(&mut self) {
        self.send_input(TouchServiceInput::Stop);
    }

    fn events(&self) -> &Receiver<SourceEvent> {
        &self.events.receiver
    }
}
impl TouchSource {
    fn spawn_thread(&self) {
        let receiver = self.inputs.receiver.clone();
        let sender = self.events.sender.clone();
        std::thread::spawn(move || {
            let mut started = false;
            let mut held: FxHashMap<u8, i64> = Default::default();
            while let Ok(input) = receiver.recv() {
                match input {
                    TouchServiceInput::KeyDown {
                        pitch,
                        velocity,
                        timestamp_ms,
                    } => {
                        if started && !held.contains_key(&pitch) {
                            held.insert(pitch, timestamp_ms);
                            let _ = sender.send(SourceEvent::Note(UnifiedInputEvent {
                                kind: NoteEventKind::NoteOn,
                                pitch,
                                velocity,
                                timestamp_ms,
                                source: SourceTag::Touch,
                            }));
                        }
                    }
                    TouchServiceInput::KeyUp {
                        pitch,
                        timestamp_ms,
                    } => {
                        if started && held.remove(&pitch).is_some() {
                            let _ = sender.send(SourceEvent::Note(UnifiedInputEvent {
                                kind: NoteEventKind::NoteOff,
                                pitch,
                                velocity: 0,
                                timestamp_ms,
                                source: SourceTag::Touch,
                            }));
                        }
                    }
                    TouchServiceInput::Start => {
                        started = true;
                    }
                    TouchServiceInput::Stop => {
                        Self::flush(&mut held, &sender);
                        started = false;
                        let _ = sender.send(SourceEvent::Stopped);
                    }
                    TouchServiceInput::Quit => {
                        Self::flush(&mut held, &sender);
                        break;
                    }
                }
            }
        });
    }

    fn flush(held: &mut FxHashMap<u8, i64>, sender: &Sender<SourceEvent>) {
        let mut pitches: Vec<(u8, i64)> = held.drain().collect();
        pitches.sort_unstable_by_key(|(pitch, _)| *pitch);
        for (pitch, timestamp_ms) in pitches {
            let _ = sender.send(SourceEvent::Note(UnifiedInputEvent {
                kind: NoteEventKind::NoteOff,
                pitch,
                velocity: 0,
                timestamp_ms,
                source: SourceTag::Touch,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recv(source: &TouchSource) -> SourceEvent {
        source
            .receiver()
            .recv_timeout(Duration::from_secs(1))
            .expect("touch service should have replied")
    }

    #[test]
    fn key_presses_become_events() {
        let source = TouchSource::default();
        source.send_input(TouchServiceInput::Start);
        source.send_input(TouchServiceInput::KeyDown {
            pitch: 60,
            velocity: 100,
            timestamp_ms: 10,
        });
        source.send_input(TouchServiceInput::KeyUp {
            pitch: 60,
            timestamp_ms: 50,
        });

        assert_eq!(
            recv(&source),
            SourceEvent::Note(UnifiedInputEvent {
                kind: NoteEventKind::NoteOn,
                pitch: 60,
                velocity: 100,
                timestamp_ms: 10,
                source: SourceTag::Touch,
            })
        );
        assert_eq!(
            recv(&source),
            SourceEvent::Note(UnifiedInputEvent {
                kind: NoteEventKind::NoteOff,
                pitch: 60,
                velocity: 0,
                timestamp_ms: 50,
                source: SourceTag::Touch,
            })
        );
    }

    #[test]
    fn stop_flushes_held_keys() {
        let source = TouchSource::default();
        source.send_input(TouchServiceInput::Start);
        source.send_input(TouchServiceInput::KeyDown {
            pitch: 64,
            velocity: 90,
            timestamp_ms: 0,
        });
        source.send_input(TouchServiceInput::Stop);

        assert!(matches!(recv(&source), SourceEvent::Note(e) if e.kind == NoteEventKind::NoteOn));
        assert_eq!(
            recv(&source),
            SourceEvent::Note(UnifiedInputEvent {
                kind: NoteEventKind::NoteOff,
                pitch: 64,
                velocity: 0,
                timestamp_ms: 0,
                source: SourceTag::Touch,
            })
        );
        assert_eq!(recv(&source), SourceEvent::Stopped);

        // Stop again: nothing left to flush, but it still acks.
        source.send_input(TouchServiceInput::Stop);
        assert_eq!(recv(&source), SourceEvent::Stopped);
    }

    #[test]
    fn events_are_gated_until_start() {
        let source = TouchSource::default();
        source.send_input(TouchServiceInput::KeyDown {
            pitch: 60,
            velocity: 100,
            timestamp_ms: 0,
        });
        source.send_input(TouchServiceInput::Stop);
        // The only event is the Stop ack; the pre-start key press vanished.
        assert_eq!(recv(&source), SourceEvent::Stopped);
    }

    #[test]
    fn duplicate_key_down_is_suppressed() {
        let source = TouchSource::default();
        source.send_input(TouchServiceInput::Start);
        for _ in 0..2 {
            source.send_input(TouchServiceInput::KeyDown {
                pitch: 72,
                velocity: 80,
                timestamp_ms: 5,
            });
        }
        source.send_input(TouchServiceInput::Stop);
        assert!(matches!(recv(&source), SourceEvent::Note(e) if e.kind == NoteEventKind::NoteOn));
        // One flush NoteOff, then the ack. A second NoteOn never happened.
        assert!(matches!(recv(&source), SourceEvent::Note(e) if e.kind == NoteEventKind::NoteOff));
        assert_eq!(recv(&source), SourceEvent::Stopped);
    }
}
