// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Structs that hold configuration information about various parts of the
//! system. Intended to be serialized by the host application; this crate
//! doesn't touch the filesystem.

use crate::{traits::HasSettings, types::SampleRate};
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumIter};

/// Which input source the player prefers. Anything other than [Auto] forces
/// that source, with touch as the fallback if the forced source can't be
/// activated.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumIter, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum InputMethod {
    /// Pick the best available source: MIDI if a device is connected, else
    /// microphone if permission was already granted, else touch.
    #[default]
    Auto,
    #[allow(missing_docs)]
    Midi,
    #[allow(missing_docs)]
    Mic,
    #[allow(missing_docs)]
    Touch,
}

/// Tuning knobs for the YIN pitch estimator.
#[derive(Clone, Debug, Derivative, PartialEq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct YinSettings {
    /// The absolute threshold from the YIN paper: the first dip of the
    /// normalized difference function below this value wins.
    #[derivative(Default(value = "0.15"))]
    pub threshold: f64,

    /// Results whose confidence (1 - d'(tau)) falls below this are reported
    /// unvoiced.
    #[derivative(Default(value = "0.7"))]
    pub min_confidence: f64,

    /// Lowest detectable fundamental.
    #[derivative(Default(value = "50.0"))]
    pub min_frequency_hz: f64,

    /// Highest detectable fundamental.
    #[derivative(Default(value = "2000.0"))]
    pub max_frequency_hz: f64,

    /// Buffers whose RMS falls below this are silence; don't bother looking
    /// for periodicity in them.
    #[derivative(Default(value = "0.01"))]
    pub min_rms: f64,

    /// Analysis window length in samples. Buffers shorter than this produce
    /// unvoiced results.
    #[derivative(Default(value = "2048"))]
    pub window_size: usize,
}
impl YinSettings {
    /// Tuning for a speaker-to-microphone acoustic path, which is noisier and
    /// less periodic than close-miked or direct-line input. These values are
    /// empirical; treat them as starting points, not physics.
    pub fn ambient() -> Self {
        Self {
            threshold: 0.25,
            min_confidence: 0.5,
            ..Default::default()
        }
    }
}

/// Hysteresis durations for the monophonic note tracker.
#[derive(Clone, Copy, Debug, Derivative, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct MonoTrackerSettings {
    /// How long a candidate pitch must persist before its NoteOn is trusted.
    #[derivative(Default(value = "40"))]
    pub onset_hold_ms: i64,

    /// How long an active pitch must stay silent before its NoteOff is
    /// trusted.
    #[derivative(Default(value = "80"))]
    pub release_hold_ms: i64,
}
impl MonoTrackerSettings {
    /// The companion to [YinSettings::ambient()]: slightly longer holds to
    /// ride out room reflections.
    pub fn ambient() -> Self {
        Self {
            onset_hold_ms: 50,
            release_hold_ms: 100,
        }
    }
}

/// Hysteresis durations for the polyphonic note tracker. Onsets need no hold
/// because the model reports onset confidence directly.
#[derive(Clone, Copy, Debug, Derivative, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct PolyTrackerSettings {
    /// How long a tracked pitch must be absent from detection frames before
    /// its NoteOff is emitted.
    #[derivative(Default(value = "60"))]
    pub release_hold_ms: i64,
}

/// Configuration of the polyphonic transcription stage.
#[derive(Clone, Debug, Derivative, PartialEq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct TranscriberSettings {
    /// Activation bins at or above this probability become notes.
    #[derivative(Default(value = "0.5"))]
    pub note_threshold: f32,

    /// A note's onset flag is set when its onset-activation bin is also at or
    /// above this probability.
    #[derivative(Default(value = "0.5"))]
    pub onset_threshold: f32,

    /// At most this many simultaneous notes survive per frame; the rest are
    /// discarded lowest-confidence-first.
    #[derivative(Default(value = "6"))]
    pub max_polyphony: usize,

    /// The sample rate the model was trained at. Incoming audio is resampled
    /// to this rate.
    #[derivative(Default(value = "SampleRate(22050)"))]
    pub model_sample_rate: SampleRate,

    /// How many model-rate samples make up one inference window. Partial
    /// windows produce no output.
    #[derivative(Default(value = "4096"))]
    pub model_window: usize,

    /// Where to find the ONNX model. None means polyphonic mode can't
    /// initialize and the microphone source falls back to monophonic.
    pub model_path: Option<PathBuf>,
}

/// Everything the microphone source needs to know.
#[derive(Clone, Debug, Derivative, PartialEq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct MicrophoneSettings {
    /// The rate the capture layer delivers buffers at.
    pub sample_rate: SampleRate,

    /// The capture layer's buffer length in samples.
    #[derivative(Default(value = "2048"))]
    pub buffer_size: usize,

    /// Whether to attempt the polyphonic pipeline. Even when true, the source
    /// falls back to monophonic if the model can't be loaded.
    pub polyphonic: bool,

    /// Acoustic detection carries no velocity information, so NoteOns are
    /// stamped with this.
    #[derivative(Default(value = "96"))]
    pub default_velocity: u8,

    /// Subtracted from microphone event timestamps by the arbiter to offset
    /// pipeline latency.
    #[derivative(Default(value = "100"))]
    pub latency_compensation_ms: i64,

    /// Microphone sources default to the ambient presets; direct-line input
    /// can override with [YinSettings::default()].
    #[derivative(Default(value = "YinSettings::ambient()"))]
    pub yin: YinSettings,

    #[allow(missing_docs)]
    #[derivative(Default(value = "MonoTrackerSettings::ambient()"))]
    pub mono_tracker: MonoTrackerSettings,

    #[allow(missing_docs)]
    pub poly_tracker: PolyTrackerSettings,

    #[allow(missing_docs)]
    pub transcriber: TranscriberSettings,
}

/// The top of the settings tree: everything configurable about note input.
#[derive(Clone, Debug, Derivative, PartialEq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct InputSettings {
    #[allow(missing_docs)]
    pub preferred_method: InputMethod,

    #[allow(missing_docs)]
    pub microphone: MicrophoneSettings,

    #[serde(skip)]
    has_been_saved: bool,
}
impl HasSettings for InputSettings {
    fn has_been_saved(&self) -> bool {
        self.has_been_saved
    }

    fn needs_save(&mut self) {
        self.has_been_saved = false;
    }

    fn mark_clean(&mut self) {
        self.has_been_saved = true;
    }
}
impl InputSettings {
    /// Updates the preferred input method and marks the struct eligible to
    /// save.
    pub fn set_preferred_method(&mut self, method: InputMethod) {
        if method != self.preferred_method {
            self.preferred_method = method;
            self.needs_save();
        }
    }
}
