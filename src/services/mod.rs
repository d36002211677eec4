// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The input sources and the arbiter that wires exactly one of them to the
//! outside world.
//!
//! Each source is a service: a struct owning an input channel and an event
//! channel, with a worker thread in between. The arbiter owns one live source
//! subscription at a time and is the only thing downstream consumers talk to.

use crate::events::UnifiedInputEvent;
use thiserror::Error;

pub use arbiter::{ArbiterEvent, ArbiterInput, InputArbiter, TimingProfile};
pub use microphone::{MicrophoneServiceInput, MicrophoneSource, PipelineKind};
pub use midi::{HardwareMidiSource, MidiDeviceEvent, MidiPortDescriptor, MidiServiceInput};
pub use touch::{TouchServiceInput, TouchSource};
pub use traits::{NoteInputSource, ProvidesService};

pub mod arbiter;
pub mod microphone;
pub mod midi;
pub mod touch;
pub mod traits;

/// Why a source couldn't be activated. The arbiter responds by degrading to
/// the next source in priority order rather than failing the pipeline.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no MIDI input device is available")]
    #[allow(missing_docs)]
    NoMidiDevice,

    #[error("microphone permission has not been granted")]
    #[allow(missing_docs)]
    MicPermissionDenied,

    #[error("transcription model unavailable: {0}")]
    #[allow(missing_docs)]
    ModelUnavailable(String),

    #[error("MIDI connection failed: {0}")]
    #[allow(missing_docs)]
    MidiConnect(String),
}

/// What a source's event channel carries.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceEvent {
    /// A note transition.
    Note(UnifiedInputEvent),
    /// Acknowledges a Stop input, after any active notes were flushed as
    /// NoteOffs. Receiving this guarantees no further events until the next
    /// Start.
    Stopped,
}
