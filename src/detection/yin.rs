// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Time-domain fundamental-frequency estimation using the YIN algorithm
//! (de Cheveigné & Kawahara 2002). One call per incoming audio buffer, on the
//! real-time path, so the estimator pre-allocates all of its scratch space at
//! construction and never allocates per call.

use crate::{
    config::YinSettings,
    note::{cents_offset, frequency_to_nearest_pitch},
    types::SampleRate,
};

/// One estimator output.
///
/// When `voiced` is false the frequency is 0.0 and the pitch is None; this is
/// the normal result for silence, noise, and anything outside the detectable
/// range, not an error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PitchResult {
    #[allow(missing_docs)]
    pub frequency_hz: f64,
    /// 1 - d'(tau) at the chosen lag, 0.0..=1.0.
    pub confidence: f64,
    #[allow(missing_docs)]
    pub voiced: bool,
    /// The nearest piano pitch (21..=108), if the frequency maps to one.
    pub pitch: Option<u8>,
    /// Distance from the nearest pitch, -50.0..=50.0 cents.
    pub cents_offset: f64,
    #[allow(missing_docs)]
    pub timestamp_ms: i64,
}
impl PitchResult {
    /// The result for a buffer in which no stable pitch was found.
    pub fn unvoiced(timestamp_ms: i64) -> Self {
        Self {
            frequency_hz: 0.0,
            confidence: 0.0,
            voiced: false,
            pitch: None,
            cents_offset: 0.0,
            timestamp_ms,
        }
    }
}

/// A YIN pitch estimator with pre-allocated scratch buffers.
///
/// The algorithm: (1) squared-difference function d(tau) over a half-window of
/// lags; (2) cumulative-mean normalization so d'(0) = 1; (3) scan ascending
/// lag for the first dip below the absolute threshold, then descend to that
/// dip's local minimum; (4) parabolic interpolation around the chosen lag for
/// sub-sample resolution.
#[derive(Debug)]
pub struct YinEstimator {
    settings: YinSettings,
    sample_rate: SampleRate,

    /// d'(tau) scratch, length window_size / 2. Allocated once.
    diff: Vec<f32>,

    /// Lag search range derived from the configured frequency range, clamped
    /// to the half-window.
    tau_min: usize,
    tau_max: usize,
}
impl YinEstimator {
    /// Creates a new [YinEstimator] for the given tuning and sample rate.
    pub fn new_with(settings: &YinSettings, sample_rate: SampleRate) -> Self {
        let half_window = settings.window_size / 2;
        let rate = sample_rate.as_f64();
        let tau_min = ((rate / settings.max_frequency_hz).floor() as usize).max(2);
        let tau_max = ((rate / settings.min_frequency_hz).ceil() as usize).min(half_window - 2);
        Self {
            settings: settings.clone(),
            sample_rate,
            diff: vec![0.0; half_window],
            tau_min,
            tau_max,
        }
    }

    #[allow(missing_docs)]
    pub fn settings(&self) -> &YinSettings {
        &self.settings
    }

    /// Estimates the fundamental frequency of one buffer. The buffer must be
    /// at least window_size samples long; shorter buffers yield an unvoiced
    /// result rather than an error.
    pub fn detect(&mut self, samples: &[f32], timestamp_ms: i64) -> PitchResult {
        let window = self.settings.window_size;
        if samples.len() < window {
            return PitchResult::unvoiced(timestamp_ms);
        }
        let samples = &samples[..window];
        let half = window / 2;

        // Silence gate: no point searching for periodicity in nothing.
        let rms =
            (samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / window as f64).sqrt();
        if rms < self.settings.min_rms {
            return PitchResult::unvoiced(timestamp_ms);
        }

        // Step 1: squared-difference function.
        for tau in 1..half {
            let mut sum = 0.0f32;
            for i in 0..half {
                let delta = samples[i] - samples[i + tau];
                sum += delta * delta;
            }
            self.diff[tau] = sum;
        }

        // Step 2: cumulative-mean normalization; d'(0) = 1.
        self.diff[0] = 1.0;
        let mut running_sum = 0.0f32;
        for tau in 1..half {
            running_sum += self.diff[tau];
            if running_sum > 0.0 {
                self.diff[tau] *= tau as f32 / running_sum;
            } else {
                self.diff[tau] = 1.0;
            }
        }

        // Step 3: absolute threshold. Take the first dip below the threshold
        // and ride it down to its local minimum.
        let threshold = self.settings.threshold as f32;
        let mut chosen = None;
        let mut tau = self.tau_min;
        while tau <= self.tau_max {
            if self.diff[tau] < threshold {
                while tau + 1 <= self.tau_max && self.diff[tau + 1] < self.diff[tau] {
                    tau += 1;
                }
                chosen = Some(tau);
                break;
            }
            tau += 1;
        }
        let Some(tau) = chosen else {
            return PitchResult::unvoiced(timestamp_ms);
        };

        let confidence = (1.0 - self.diff[tau] as f64).clamp(0.0, 1.0);
        if confidence < self.settings.min_confidence {
            return PitchResult::unvoiced(timestamp_ms);
        }

        // Step 4: parabolic interpolation around the chosen lag.
        let refined_tau = if tau > 0 && tau + 1 < half {
            let y1 = self.diff[tau - 1];
            let y2 = self.diff[tau];
            let y3 = self.diff[tau + 1];
            let denominator = y1 - 2.0 * y2 + y3;
            if denominator.abs() > f32::EPSILON {
                tau as f64 + ((y1 - y3) / (2.0 * denominator)) as f64
            } else {
                tau as f64
            }
        } else {
            tau as f64
        };

        let frequency_hz = self.sample_rate.as_f64() / refined_tau;
        if frequency_hz < self.settings.min_frequency_hz
            || frequency_hz > self.settings.max_frequency_hz
        {
            return PitchResult::unvoiced(timestamp_ms);
        }

        // Frequencies that don't land on the piano are treated as unvoiced,
        // not clamped.
        let Some(pitch) = frequency_to_nearest_pitch(frequency_hz) else {
            return PitchResult::unvoiced(timestamp_ms);
        };

        PitchResult {
            frequency_hz,
            confidence,
            voiced: true,
            pitch: Some(pitch),
            cents_offset: cents_offset(frequency_hz, pitch),
            timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::note::pitch_to_frequency;
    use more_asserts::{assert_gt, assert_lt};
    use std::f32::consts::TAU;

    fn sine(frequency_hz: f64, sample_rate: SampleRate, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (TAU * (frequency_hz / sample_rate.as_f64()) as f32 * i as f32).sin() * 0.5)
            .collect()
    }

    fn estimator() -> YinEstimator {
        YinEstimator::new_with(&YinSettings::default(), SampleRate::default())
    }

    #[test]
    fn sine_waves_map_to_nearest_pitch() {
        let mut e = estimator();
        // A1 through C7-ish, spanning the detectable 50-2000 Hz range.
        for pitch in [33u8, 45, 57, 60, 69, 81, 93] {
            let f = pitch_to_frequency(pitch);
            let result = e.detect(&sine(f, SampleRate::default(), 2048), 0);
            assert!(result.voiced, "expected {f:.1} Hz to be voiced");
            assert_eq!(result.pitch, Some(pitch), "wrong pitch for {f:.1} Hz");
            assert_lt!(result.cents_offset.abs(), 20.0);
            assert_gt!(result.confidence, 0.7);
        }
    }

    #[test]
    fn detected_frequency_is_accurate() {
        let mut e = estimator();
        let result = e.detect(&sine(440.0, SampleRate::default(), 2048), 0);
        assert!(result.voiced);
        assert_lt!((result.frequency_hz - 440.0).abs(), 2.0);
    }

    #[test]
    fn silence_is_unvoiced() {
        let mut e = estimator();
        let result = e.detect(&vec![0.0; 2048], 5);
        assert!(!result.voiced);
        assert_eq!(result.frequency_hz, 0.0);
        assert_eq!(result.pitch, None);
        assert_eq!(result.timestamp_ms, 5);
    }

    #[test]
    fn quiet_noise_is_unvoiced() {
        let mut rng = oorandom::Rand32::new(42);
        let noise: Vec<f32> = (0..2048)
            .map(|_| (rng.rand_float() - 0.5) * 0.01)
            .collect();
        let mut e = estimator();
        assert!(!e.detect(&noise, 0).voiced);
    }

    #[test]
    fn loud_noise_is_unvoiced() {
        let mut rng = oorandom::Rand32::new(7);
        let noise: Vec<f32> = (0..2048).map(|_| (rng.rand_float() - 0.5) * 0.8).collect();
        let mut e = estimator();
        assert!(!e.detect(&noise, 0).voiced);
    }

    #[test]
    fn short_buffer_is_unvoiced() {
        let mut e = estimator();
        assert!(!e.detect(&sine(440.0, SampleRate::default(), 512), 0).voiced);
    }

    #[test]
    fn out_of_range_frequency_is_unvoiced() {
        let mut e = estimator();
        // 30 Hz is below the default 50 Hz floor.
        assert!(!e.detect(&sine(30.0, SampleRate::default(), 2048), 0).voiced);
    }

    #[test]
    fn ambient_preset_still_detects_clean_tones() {
        let mut e = YinEstimator::new_with(&YinSettings::ambient(), SampleRate::default());
        let result = e.detect(&sine(261.6, SampleRate::default(), 2048), 0);
        assert!(result.voiced);
        assert_eq!(result.pitch, Some(60));
    }
}
