// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The signal-processing core: pitch estimation, onset/offset tracking, and
//! polyphonic transcription.
//!
//! Everything here is a synchronous streaming transformation except the
//! transcriber's inference stage, which runs on its own worker thread behind
//! a single-in-flight guard.

pub use tracker::{MultiNoteTracker, NoteTracker};
pub use transcriber::{
    ActivationModel, Activations, LinearResampler, OnnxActivationModel, PolyphonicTranscriber,
};
pub use yin::{PitchResult, YinEstimator};

pub mod tracker;
pub mod transcriber;
pub mod yin;
