// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The microphone source: a sample-buffer feed wired to one of two detection
//! pipelines, chosen once at construction.
//!
//! This crate doesn't own the capture device. Whoever does sends fixed-size
//! buffers at the declared rate through this service's input channel; pitch
//! estimation and tracking happen synchronously on the service thread, within
//! one buffer period.

use super::{NoteInputSource, ProvidesService, SourceError, SourceEvent};
use crate::{
    config::{InputMethod, MicrophoneSettings},
    detection::{
        ActivationModel, MultiNoteTracker, NoteTracker, OnnxActivationModel,
        PolyphonicTranscriber, YinEstimator,
    },
    events::{NoteEvent, NoteEventKind, SourceTag, UnifiedInputEvent},
    types::SampleBuffer,
    util::ChannelPair,
};
use crossbeam_channel::{Receiver, Sender};

/// A [MicrophoneServiceInput] tells [MicrophoneSource] what to do.
#[derive(Debug)]
pub enum MicrophoneServiceInput {
    /// One buffer from the capture layer.
    Buffer(SampleBuffer),
    /// Begin delivering events.
    Start,
    /// Stop delivering events, flushing active notes as NoteOffs.
    Stop,
    /// Exit the service.
    Quit,
}

/// Which detection pipeline a [MicrophoneSource] ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    #[allow(missing_docs)]
    Monophonic,
    #[allow(missing_docs)]
    Polyphonic,
}

/// The two-variant detection strategy. Selected once at construction and
/// opaque afterward; the hot path just calls process().
enum Pipeline {
    Mono {
        estimator: YinEstimator,
        tracker: NoteTracker,
    },
    Poly {
        transcriber: PolyphonicTranscriber,
        tracker: MultiNoteTracker,
    },
}
impl Pipeline {
    /// Builds the configured pipeline. If polyphonic initialization fails
    /// (model missing or unloadable), falls back to monophonic rather than
    /// failing outright.
    fn new_with(settings: &MicrophoneSettings) -> (Self, PipelineKind) {
        if settings.polyphonic {
            match Self::try_polyphonic(settings) {
                Ok(pipeline) => return (pipeline, PipelineKind::Polyphonic),
                Err(e) => {
                    eprintln!("polyphonic pipeline unavailable, falling back to monophonic: {e}");
                }
            }
        }
        (
            Self::Mono {
                estimator: YinEstimator::new_with(&settings.yin, settings.sample_rate),
                tracker: NoteTracker::new_with(&settings.mono_tracker),
            },
            PipelineKind::Monophonic,
        )
    }

    /// Like [new_with](Self::new_with), but with a caller-supplied model
    /// instead of one loaded from the configured path.
    fn new_with_model(
        settings: &MicrophoneSettings,
        model: Box<dyn ActivationModel>,
    ) -> (Self, PipelineKind) {
        (
            Self::Poly {
                transcriber: PolyphonicTranscriber::new_with(
                    &settings.transcriber,
                    settings.sample_rate,
                    model,
                ),
                tracker: MultiNoteTracker::new_with(&settings.poly_tracker),
            },
            PipelineKind::Polyphonic,
        )
    }

    fn try_polyphonic(settings: &MicrophoneSettings) -> anyhow::Result<Self> {
        let Some(path) = settings.transcriber.model_path.as_ref() else {
            return Err(
                SourceError::ModelUnavailable("no model path configured".to_string()).into(),
            );
        };
        let model = OnnxActivationModel::from_file(path)?;
        Ok(Self::Poly {
            transcriber: PolyphonicTranscriber::new_with(
                &settings.transcriber,
                settings.sample_rate,
                Box::new(model),
            ),
            tracker: MultiNoteTracker::new_with(&settings.poly_tracker),
        })
    }

    /// Runs one buffer through the pipeline, reporting note transitions.
    fn process(&mut self, buffer: &SampleBuffer, events_fn: &mut dyn FnMut(NoteEvent)) {
        match self {
            Self::Mono { estimator, tracker } => {
                let result = estimator.detect(&buffer.samples, buffer.timestamp_ms);
                tracker.advance(&result, events_fn);
            }
            Self::Poly {
                transcriber,
                tracker,
            } => {
                transcriber.feed(&buffer.samples, buffer.timestamp_ms);
                while let Some(frame) = transcriber.try_recv_frame() {
                    tracker.advance(&frame, events_fn);
                }
            }
        }
    }

    /// Emits NoteOff for anything still sounding.
    fn flush(&mut self, events_fn: &mut dyn FnMut(NoteEvent)) {
        match self {
            Self::Mono { tracker, .. } => tracker.reset(events_fn),
            Self::Poly { tracker, .. } => tracker.reset(events_fn),
        }
    }
}

/// [MicrophoneSource] republishes the detection pipeline's output as
/// [UnifiedInputEvent]s tagged [SourceTag::Mic].
///
/// Acoustic detection carries no velocity, so NoteOns are stamped with the
/// configured default velocity.
#[derive(Debug)]
pub struct MicrophoneSource {
    inputs: ChannelPair<MicrophoneServiceInput>,
    events: ChannelPair<SourceEvent>,
    pipeline_kind: PipelineKind,
}
impl ProvidesService<MicrophoneServiceInput, SourceEvent> for MicrophoneSource {
    fn sender(&self) -> &Sender<MicrophoneServiceInput> {
        &self.inputs.sender
    }

    fn receiver(&self) -> &Receiver<SourceEvent> {
        &self.events.receiver
    }
}
impl NoteInputSource for MicrophoneSource {
    fn method(&self) -> InputMethod {
        InputMethod::Mic
    }

    fn is_available(&self) -> bool {
        // Permission is the arbiter's business; the feed itself is assumed.
        true
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn deactivate(&mut self) {}

    fn start(&mut self) {
        self.send_input(MicrophoneServiceInput::Start);
    }

    fn request_stop(&mut self) {
        self.send_input(MicrophoneServiceInput::Stop);
    }

    fn events(&self) -> &Receiver<SourceEvent> {
        &self.events.receiver
    }
}
impl MicrophoneSource {
    /// Creates a new [MicrophoneSource] with the pipeline the settings ask
    /// for (falling back to monophonic if the polyphonic model can't load).
    pub fn new_with(settings: &MicrophoneSettings) -> Self {
        let (pipeline, pipeline_kind) = Pipeline::new_with(settings);
        Self::new_with_pipeline(settings, pipeline, pipeline_kind)
    }

    /// Creates a polyphonic [MicrophoneSource] around a caller-supplied
    /// model. Useful for hosts that bundle their model some other way, and
    /// for tests.
    pub fn new_with_model(settings: &MicrophoneSettings, model: Box<dyn ActivationModel>) -> Self {
        let (pipeline, pipeline_kind) = Pipeline::new_with_model(settings, model);
        Self::new_with_pipeline(settings, pipeline, pipeline_kind)
    }

    /// Which pipeline construction ended up with.
    pub fn pipeline_kind(&self) -> PipelineKind {
        self.pipeline_kind
    }

    fn new_with_pipeline(
        settings: &MicrophoneSettings,
        pipeline: Pipeline,
        pipeline_kind: PipelineKind,
    ) -> Self {
        let r = Self {
            inputs: Default::default(),
            events: Default::default(),
            pipeline_kind,
        };
        r.spawn_thread(pipeline, settings.default_velocity);
        r
    }

    fn spawn_thread(&self, mut pipeline: Pipeline, default_velocity: u8) {
        let receiver = self.inputs.receiver.clone();
        let sender = self.events.sender.clone();
        std::thread::spawn(move || {
            let mut started = false;
            let emit = |sender: &Sender<SourceEvent>, event: NoteEvent| {
                let _ = sender.send(SourceEvent::Note(UnifiedInputEvent {
                    kind: event.kind,
                    pitch: event.pitch,
                    velocity: match event.kind {
                        NoteEventKind::NoteOn => default_velocity,
                        NoteEventKind::NoteOff => 0,
                    },
                    timestamp_ms: event.timestamp_ms,
                    source: SourceTag::Mic,
                }));
            };
            while let Ok(input) = receiver.recv() {
                match input {
                    MicrophoneServiceInput::Buffer(buffer) => {
                        if started {
                            pipeline.process(&buffer, &mut |event| emit(&sender, event));
                        }
                    }
                    MicrophoneServiceInput::Start => {
                        started = true;
                    }
                    MicrophoneServiceInput::Stop => {
                        pipeline.flush(&mut |event| emit(&sender, event));
                        started = false;
                        let _ = sender.send(SourceEvent::Stopped);
                    }
                    MicrophoneServiceInput::Quit => {
                        pipeline.flush(&mut |event| emit(&sender, event));
                        break;
                    }
                }
            }
        });
    }
}
