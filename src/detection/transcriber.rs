// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Polyphonic transcription: accumulate audio into a model-rate window, run a
//! pre-trained multi-pitch model over it, and report the pitches that are
//! sounding.
//!
//! Inference cost exceeds one audio-callback period, so inference runs on a
//! dedicated worker thread behind a single-in-flight guard. While a call is
//! outstanding, further complete windows are dropped rather than queued;
//! dropping bounds both backlog growth and latency drift.

use crate::{
    config::TranscriberSettings,
    events::{DetectedFrame, DetectedNote},
    note::{PIANO_KEY_COUNT, PIANO_MIN_PITCH},
    types::SampleRate,
    util::{channels::BoundedChannelPair, ChannelPair},
};
use crossbeam_channel::{Receiver, Sender};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// The two parallel piano-range activation vectors one inference call
/// produces: per-pitch "currently sounding" and per-pitch "just started"
/// probabilities, both 88 bins with bin 0 = A0 (pitch 21).
#[derive(Clone, Debug)]
pub struct Activations {
    #[allow(missing_docs)]
    pub active: Vec<f32>,
    #[allow(missing_docs)]
    pub onset: Vec<f32>,
}

/// The inference seam. The transcriber doesn't care what produces the
/// activation vectors, which keeps it testable without a model file.
pub trait ActivationModel: Send {
    /// Runs the model over one window of model-rate samples.
    fn infer(&mut self, window: &[f32]) -> anyhow::Result<Activations>;
}

/// An [ActivationModel] backed by an ONNX multi-pitch model.
///
/// Expected graph shape: input "audio" of [1, N] mono samples at the model's
/// sample rate; outputs "frames" and "onsets" whose final 88 values are the
/// activation row for the most recent hop.
pub struct OnnxActivationModel {
    session: Session,
}
impl std::fmt::Debug for OnnxActivationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxActivationModel").finish_non_exhaustive()
    }
}
impl OnnxActivationModel {
    /// Loads the model from disk. Failure here is a source-unavailable
    /// condition: the caller is expected to fall back to the monophonic
    /// pipeline, not to die.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(path)?;
        Ok(Self { session })
    }
}
impl ActivationModel for OnnxActivationModel {
    fn infer(&mut self, window: &[f32]) -> anyhow::Result<Activations> {
        let input = Tensor::from_array(([1usize, window.len()], window.to_vec()))?;
        let outputs = self.session.run(ort::inputs!["audio" => input])?;
        let (_, frames) = outputs["frames"].try_extract_tensor::<f32>()?;
        let (_, onsets) = outputs["onsets"].try_extract_tensor::<f32>()?;
        if frames.len() < PIANO_KEY_COUNT || onsets.len() < PIANO_KEY_COUNT {
            anyhow::bail!(
                "model produced {} frame bins and {} onset bins; need at least {}",
                frames.len(),
                onsets.len(),
                PIANO_KEY_COUNT
            );
        }
        Ok(Activations {
            active: frames[frames.len() - PIANO_KEY_COUNT..].to_vec(),
            onset: onsets[onsets.len() - PIANO_KEY_COUNT..].to_vec(),
        })
    }
}

/// A streaming linear-interpolation resampler. Carries its fractional
/// position and the previous sample across calls, so feeding it a long
/// signal in chunks produces the same output as feeding it all at once.
#[derive(Debug)]
pub struct LinearResampler {
    /// Source samples consumed per output sample.
    step: f64,
    /// Position within the current source interval, 0.0..step.
    frac: f64,
    prev: f32,
    primed: bool,
}
impl LinearResampler {
    /// Creates a resampler converting `source` rate to `target` rate.
    pub fn new_with(source: SampleRate, target: SampleRate) -> Self {
        Self {
            step: source.as_f64() / target.as_f64(),
            frac: 0.0,
            prev: 0.0,
            primed: false,
        }
    }

    /// Resamples `input`, appending the output to `out`.
    pub fn resample(&mut self, input: &[f32], out: &mut Vec<f32>) {
        for &sample in input {
            if !self.primed {
                self.prev = sample;
                self.primed = true;
                continue;
            }
            while self.frac < 1.0 {
                out.push(self.prev + (sample - self.prev) * self.frac as f32);
                self.frac += self.step;
            }
            self.frac -= 1.0;
            self.prev = sample;
        }
    }
}

/// The single-slot in-flight guard: a non-blocking try-acquire that makes the
/// at-most-one-concurrent-inference invariant structural rather than
/// conventional.
#[derive(Clone, Debug, Default)]
struct SingleFlight(Arc<AtomicBool>);
impl SingleFlight {
    fn try_acquire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[cfg(test)]
    fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct InferenceJob {
    window: Vec<f32>,
    timestamp_ms: i64,
}

/// Accumulates source-rate audio, resamples it to the model rate, and runs
/// one inference per complete window on a worker thread.
///
/// Feed it buffers with [feed()](Self::feed); poll completed frames with
/// [try_recv_frame()](Self::try_recv_frame). Partial windows produce no
/// output, and a window that fails inference is logged and swallowed so the
/// next window is unaffected.
#[derive(Debug)]
pub struct PolyphonicTranscriber {
    settings: TranscriberSettings,
    resampler: LinearResampler,
    /// Model-rate samples waiting to fill a window.
    pending: Vec<f32>,
    jobs: Sender<InferenceJob>,
    frames: Receiver<DetectedFrame>,
    inflight: SingleFlight,
}
impl PolyphonicTranscriber {
    /// Creates a new [PolyphonicTranscriber] and spawns its inference worker.
    pub fn new_with(
        settings: &TranscriberSettings,
        source_rate: SampleRate,
        model: Box<dyn ActivationModel>,
    ) -> Self {
        // The guard means the job channel never holds more than the one
        // window the worker is about to take, so bounded(1) suffices.
        let jobs: BoundedChannelPair<InferenceJob> = Default::default();
        let frames: ChannelPair<DetectedFrame> = Default::default();
        let inflight = SingleFlight::default();
        Self::spawn_worker(
            model,
            settings.clone(),
            jobs.receiver.clone(),
            frames.sender.clone(),
            inflight.clone(),
        );
        Self {
            settings: settings.clone(),
            resampler: LinearResampler::new_with(source_rate, settings.model_sample_rate),
            pending: Vec::with_capacity(settings.model_window * 2),
            jobs: jobs.sender,
            frames: frames.receiver,
            inflight,
        }
    }

    /// Accumulates one source-rate buffer, dispatching an inference job for
    /// each window that completes (unless one is already outstanding, in
    /// which case the completed window is dropped).
    pub fn feed(&mut self, samples: &[f32], timestamp_ms: i64) {
        self.resampler.resample(samples, &mut self.pending);
        let window = self.settings.model_window;
        while self.pending.len() >= window {
            let window_samples: Vec<f32> = self.pending.drain(..window).collect();
            if self.inflight.try_acquire() {
                if self
                    .jobs
                    .send(InferenceJob {
                        window: window_samples,
                        timestamp_ms,
                    })
                    .is_err()
                {
                    // Worker is gone; don't wedge the guard.
                    self.inflight.release();
                }
            }
        }
    }

    /// Returns the next completed detection frame, if one is ready.
    pub fn try_recv_frame(&self) -> Option<DetectedFrame> {
        self.frames.try_recv().ok()
    }

    fn spawn_worker(
        mut model: Box<dyn ActivationModel>,
        settings: TranscriberSettings,
        jobs: Receiver<InferenceJob>,
        frames: Sender<DetectedFrame>,
        inflight: SingleFlight,
    ) {
        std::thread::spawn(move || {
            while let Ok(job) = jobs.recv() {
                match model.infer(&job.window) {
                    Ok(activations) => {
                        let _ = frames.send(DetectedFrame {
                            notes: select_notes(&activations, &settings),
                            timestamp_ms: job.timestamp_ms,
                        });
                    }
                    Err(e) => eprintln!("transcription window failed: {e:?}"),
                }
                inflight.release();
            }
        });
    }
}

/// Thresholds the activation vectors into notes, capping polyphony by keeping
/// the highest-confidence bins. The cap bounds downstream complexity and
/// discards the ghost notes that inference noise produces at the margin.
fn select_notes(activations: &Activations, settings: &TranscriberSettings) -> Vec<DetectedNote> {
    let bins = activations.active.len().min(PIANO_KEY_COUNT);
    let mut notes: Vec<DetectedNote> = (0..bins)
        .filter(|&bin| activations.active[bin] >= settings.note_threshold)
        .map(|bin| DetectedNote {
            pitch: PIANO_MIN_PITCH + bin as u8,
            confidence: activations.active[bin] as f64,
            is_onset: activations
                .onset
                .get(bin)
                .is_some_and(|&p| p >= settings.onset_threshold),
        })
        .collect();
    if notes.len() > settings.max_polyphony {
        notes.sort_unstable_by(|a, b| b.confidence.total_cmp(&a.confidence));
        notes.truncate(settings.max_polyphony);
    }
    notes.sort_unstable_by_key(|note| note.pitch);
    notes
}
