// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Common data types used throughout the system.

use serde::{Deserialize, Serialize};
use std::{fmt::Display, sync::Arc};

/// [SampleRate] is a number of audio samples per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SampleRate(pub usize);
impl SampleRate {
    /// The industry-standard sample rate for CD audio.
    pub const DEFAULT_SAMPLE_RATE: usize = 44100;

    #[allow(missing_docs)]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// The rate as a float, for DSP arithmetic.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }
}
impl Default for SampleRate {
    fn default() -> Self {
        Self(Self::DEFAULT_SAMPLE_RATE)
    }
}
impl Display for SampleRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz", self.0)
    }
}
impl From<usize> for SampleRate {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
impl From<SampleRate> for usize {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// One fixed-size chunk of mono audio delivered by the capture layer.
///
/// The samples are reference-counted so that a buffer can be fanned out to a
/// service thread without copying. The timestamp marks the *start* of the
/// buffer in the producer's millisecond clock; consumers never look at a wall
/// clock of their own.
#[derive(Clone, Debug)]
pub struct SampleBuffer {
    #[allow(missing_docs)]
    pub samples: Arc<Vec<f32>>,
    #[allow(missing_docs)]
    pub timestamp_ms: i64,
}
impl SampleBuffer {
    /// Creates a new [SampleBuffer] owning the given samples.
    pub fn new_with(samples: Vec<f32>, timestamp_ms: i64) -> Self {
        Self {
            samples: Arc::new(samples),
            timestamp_ms,
        }
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
