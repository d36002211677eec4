// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The `attune` crate recognizes which musical notes a player is performing,
//! in real time, and delivers a single normalized stream of note-on/note-off
//! events to whatever consumes them (typically a scoring or exercise engine).
//!
//! Three heterogeneous sources hide behind one interface:
//!
//! - A hardware MIDI keyboard ([HardwareMidiSource](crate::services::HardwareMidiSource)),
//!   parsed from raw channel-voice messages with near-zero added latency.
//! - A microphone ([MicrophoneSource](crate::services::MicrophoneSource)),
//!   running either a monophonic YIN pitch estimator plus hysteresis tracker,
//!   or a polyphonic neural transcriber plus multi-note tracker.
//! - On-screen touch ([TouchSource](crate::services::TouchSource)).
//!
//! The [InputArbiter](crate::services::InputArbiter) owns exactly one active
//! source at a time, forwards its events, and compensates per-source latency.
//!
//! This crate does not capture audio, render UI, or score performances. The
//! sample feed is a channel of fixed-size buffers at a declared rate, and the
//! event stream is the only thing that comes out.

pub mod config;
pub mod detection;
pub mod events;
pub mod note;
pub mod services;
pub mod traits;
pub mod types;
pub mod util;

/// A collection of imports that are useful to users of this crate. `use
/// attune::prelude::*;` for easier onboarding.
pub mod prelude {
    pub use crate::{
        config::{InputMethod, InputSettings, MicrophoneSettings, YinSettings},
        detection::{
            MultiNoteTracker, NoteTracker, PitchResult, PolyphonicTranscriber, YinEstimator,
        },
        events::{
            DetectedFrame, DetectedNote, NoteEvent, NoteEventKind, SourceTag, UnifiedInputEvent,
        },
        note::{frequency_to_nearest_pitch, pitch_to_frequency},
        services::{
            HardwareMidiSource, InputArbiter, MicrophoneSource, NoteInputSource, TouchSource,
        },
        traits::HasSettings,
        types::{SampleBuffer, SampleRate},
    };
}
