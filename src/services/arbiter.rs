// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The arbitration layer: owns one active input source at a time, forwards
//! its note events, and compensates per-source latency.
//!
//! Everything stateful happens on the arbiter's own thread, which is what
//! makes source switching atomic with respect to event delivery: the whole
//! stop/drain/deactivate/activate/start sequence runs to completion before
//! the next input or event is looked at, so concurrent switch requests
//! serialize and no event from the old source is forwarded after its drain
//! completes.

use super::{
    HardwareMidiSource, MicrophoneServiceInput, MicrophoneSource, MidiServiceInput,
    NoteInputSource, SourceError, SourceEvent, TouchServiceInput, TouchSource,
};
use crate::{
    config::{InputMethod, InputSettings},
    events::{EventFanout, SourceTag, UnifiedInputEvent},
    util::ChannelPair,
};
use crossbeam_channel::{never, Receiver, Sender};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// How long to wait for a source to acknowledge a stop before assuming it's
/// wedged and moving on.
const STOP_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-source timing constants for the scoring engine.
///
/// The multiplier widens downstream scoring tolerance to offset pipeline
/// jitter; the compensation is subtracted from event timestamps before they
/// reach subscribers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingProfile {
    #[allow(missing_docs)]
    pub tolerance_multiplier: f64,
    #[allow(missing_docs)]
    pub latency_compensation_ms: i64,
}

/// The microphone pipeline is slow enough that scoring should be half again
/// as forgiving about timing.
pub const MIC_TOLERANCE_MULTIPLIER: f64 = 1.5;

/// Touch registration lag on typical screens.
pub const TOUCH_LATENCY_COMPENSATION_MS: i64 = 20;

fn timing_profile_with(mic_latency_compensation_ms: i64, source: SourceTag) -> TimingProfile {
    match source {
        SourceTag::Midi => TimingProfile {
            tolerance_multiplier: 1.0,
            latency_compensation_ms: 0,
        },
        SourceTag::Mic => TimingProfile {
            tolerance_multiplier: MIC_TOLERANCE_MULTIPLIER,
            latency_compensation_ms: mic_latency_compensation_ms,
        },
        SourceTag::Touch => TimingProfile {
            tolerance_multiplier: 1.0,
            latency_compensation_ms: TOUCH_LATENCY_COMPENSATION_MS,
        },
    }
}

/// An [ArbiterInput] tells [InputArbiter] what to do.
#[derive(Debug)]
pub enum ArbiterInput {
    /// Change the input-method preference and re-arbitrate.
    SetMethod(InputMethod),
    /// Tell the arbiter whether microphone permission has been granted.
    /// Arbitration never triggers a permission prompt on its own; it only
    /// consults this flag.
    SetMicPermission(bool),
    /// Begin forwarding events, selecting a source if none is active.
    Start,
    /// Stop forwarding events, flushing the active source.
    Stop,
    /// Exit the service.
    Quit,
}

/// [ArbiterEvent]s inform subscribers what's going on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArbiterEvent {
    /// A latency-compensated note event from the active source.
    Note(UnifiedInputEvent),
    /// A different source became active.
    MethodChanged(InputMethod),
    #[allow(missing_docs)]
    Started,
    #[allow(missing_docs)]
    Stopped,
}

/// [InputArbiter] owns the three input sources and wires exactly one of them
/// to its subscribers.
///
/// In [InputMethod::Auto], priority is MIDI (if a device is connected) over
/// microphone (only if permission was already granted) over touch. Forced
/// methods bypass priority but fall back to touch if the forced source can't
/// be activated.
#[derive(Debug)]
pub struct InputArbiter {
    inputs: ChannelPair<ArbiterInput>,
    events: EventFanout<ArbiterEvent>,
    active_method: Arc<Mutex<Option<InputMethod>>>,
    mic_latency_compensation_ms: i64,

    touch_sender: Option<Sender<TouchServiceInput>>,
    mic_sender: Option<Sender<MicrophoneServiceInput>>,
    midi_sender: Option<Sender<MidiServiceInput>>,
}
impl InputArbiter {
    /// Creates a new [InputArbiter] owning freshly constructed hardware-MIDI,
    /// microphone, and touch sources.
    pub fn new_with(settings: &InputSettings, mic_permission_granted: bool) -> Self {
        let midi = HardwareMidiSource::default();
        let mic = MicrophoneSource::new_with(&settings.microphone);
        let touch = TouchSource::default();

        use super::ProvidesService;
        let midi_sender = midi.sender().clone();
        let mic_sender = mic.sender().clone();
        let touch_sender = touch.sender().clone();

        let mut r = Self::new_with_sources(
            settings,
            mic_permission_granted,
            vec![Box::new(midi), Box::new(mic), Box::new(touch)],
        );
        r.midi_sender = Some(midi_sender);
        r.mic_sender = Some(mic_sender);
        r.touch_sender = Some(touch_sender);
        r
    }

    /// Creates a new [InputArbiter] over caller-supplied sources. This is the
    /// seam that lets arbitration be exercised without hardware.
    pub fn new_with_sources(
        settings: &InputSettings,
        mic_permission_granted: bool,
        sources: Vec<Box<dyn NoteInputSource>>,
    ) -> Self {
        let r = Self {
            inputs: Default::default(),
            events: Default::default(),
            active_method: Default::default(),
            mic_latency_compensation_ms: settings.microphone.latency_compensation_ms,
            touch_sender: None,
            mic_sender: None,
            midi_sender: None,
        };
        let arbiter_loop = ArbiterLoop {
            sources,
            mode: settings.preferred_method,
            mic_permission: mic_permission_granted,
            started: false,
            active: None,
            events: r.events.clone(),
            active_method: Arc::clone(&r.active_method),
            mic_latency_compensation_ms: r.mic_latency_compensation_ms,
        };
        let receiver = r.inputs.receiver.clone();
        std::thread::spawn(move || arbiter_loop.run(receiver));
        r
    }

    /// The sender side of the Input channel.
    pub fn sender(&self) -> &Sender<ArbiterInput> {
        &self.inputs.sender
    }

    /// A convenience method to send Inputs to the arbiter.
    pub fn send_input(&self, input: ArbiterInput) {
        if let Err(e) = self.inputs.sender.try_send(input) {
            eprintln!("While sending: {e:?}");
        }
    }

    /// Registers a new event subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<ArbiterEvent> {
        self.events.subscribe()
    }

    /// The currently active source, if any.
    pub fn active_method(&self) -> Option<InputMethod> {
        self.active_method.lock().map(|m| *m).unwrap_or(None)
    }

    /// The timing constants for the given source.
    pub fn timing_profile(&self, source: SourceTag) -> TimingProfile {
        timing_profile_with(self.mic_latency_compensation_ms, source)
    }

    /// Where the host UI sends touch key events.
    pub fn touch_sender(&self) -> Option<&Sender<TouchServiceInput>> {
        self.touch_sender.as_ref()
    }

    /// Where the capture layer sends microphone buffers.
    pub fn mic_sender(&self) -> Option<&Sender<MicrophoneServiceInput>> {
        self.mic_sender.as_ref()
    }

    /// Where the host sends MIDI device-lifecycle commands.
    pub fn midi_sender(&self) -> Option<&Sender<MidiServiceInput>> {
        self.midi_sender.as_ref()
    }
}

/// The state that lives on the arbiter thread.
struct ArbiterLoop {
    sources: Vec<Box<dyn NoteInputSource>>,
    mode: InputMethod,
    mic_permission: bool,
    started: bool,
    active: Option<usize>,
    events: EventFanout<ArbiterEvent>,
    active_method: Arc<Mutex<Option<InputMethod>>>,
    mic_latency_compensation_ms: i64,
}
impl ArbiterLoop {
    fn run(mut self, inputs: Receiver<ArbiterInput>) {
        loop {
            let source_events = self
                .active
                .map(|idx| self.sources[idx].events().clone())
                .unwrap_or_else(never);
            crossbeam_channel::select! {
                recv(inputs) -> input => match input {
                    Ok(ArbiterInput::SetMethod(method)) => {
                        self.mode = method;
                        self.switch_active();
                    }
                    Ok(ArbiterInput::SetMicPermission(granted)) => {
                        self.mic_permission = granted;
                    }
                    Ok(ArbiterInput::Start) => self.handle_start(),
                    Ok(ArbiterInput::Stop) => self.handle_stop(),
                    Ok(ArbiterInput::Quit) | Err(_) => {
                        self.handle_stop();
                        break;
                    }
                },
                recv(source_events) -> event => {
                    if let Ok(event) = event {
                        self.handle_source_event(event);
                    }
                }
            }
        }
    }

    fn handle_start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        match self.active {
            Some(idx) => self.sources[idx].start(),
            None => self.switch_active(),
        }
        self.events.publish(ArbiterEvent::Started);
    }

    fn handle_stop(&mut self) {
        if let Some(idx) = self.active {
            self.stop_and_drain(idx);
        }
        if self.started {
            self.started = false;
            self.events.publish(ArbiterEvent::Stopped);
        }
    }

    fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Note(note) => {
                if self.started {
                    self.forward(note);
                }
            }
            // A stray ack, e.g. from a drain that timed out.
            SourceEvent::Stopped => {}
        }
    }

    /// Applies latency compensation and publishes.
    fn forward(&self, mut note: UnifiedInputEvent) {
        note.timestamp_ms -=
            timing_profile_with(self.mic_latency_compensation_ms, note.source)
                .latency_compensation_ms;
        self.events.publish(ArbiterEvent::Note(note));
    }

    /// Stops the source and consumes its event queue up to the Stopped ack.
    /// Everything before the ack was emitted before the stop took effect in
    /// the source, so it's forwarded as usual; the flush NoteOffs are the
    /// tail of that, clearing the consumer's view of what's sounding.
    fn stop_and_drain(&mut self, idx: usize) {
        let receiver = {
            let source = &mut self.sources[idx];
            source.request_stop();
            source.events().clone()
        };
        let deadline = Instant::now() + STOP_ACK_TIMEOUT;
        while let Ok(event) = receiver.recv_deadline(deadline) {
            match event {
                SourceEvent::Stopped => return,
                SourceEvent::Note(note) => {
                    if self.started {
                        self.forward(note);
                    }
                }
            }
        }
        eprintln!("source didn't acknowledge stop in time");
    }

    /// Tears down the active source, then activates the best candidate for
    /// the current mode. Restarts delivery if the arbiter was running.
    fn switch_active(&mut self) {
        if let Some(idx) = self.active.take() {
            self.stop_and_drain(idx);
            self.sources[idx].deactivate();
            self.set_active_method(None);
        }

        let mut candidates = match self.mode {
            InputMethod::Auto => vec![InputMethod::Midi, InputMethod::Mic, InputMethod::Touch],
            method => vec![method, InputMethod::Touch],
        };
        candidates.dedup();

        for method in candidates {
            let Some(idx) = self
                .sources
                .iter()
                .position(|source| source.method() == method)
            else {
                continue;
            };
            if !self.source_available(method, idx) {
                continue;
            }
            if let Err(e) = self.sources[idx].activate() {
                eprintln!("couldn't activate {method} input: {e:?}");
                continue;
            }
            if self.started {
                self.sources[idx].start();
            }
            self.active = Some(idx);
            self.set_active_method(Some(method));
            self.events.publish(ArbiterEvent::MethodChanged(method));
            return;
        }
    }

    fn source_available(&self, method: InputMethod, idx: usize) -> bool {
        if method == InputMethod::Mic && !self.mic_permission {
            eprintln!("skipping microphone input: {}", SourceError::MicPermissionDenied);
            return false;
        }
        self.sources[idx].is_available()
    }

    fn set_active_method(&self, method: Option<InputMethod>) {
        if let Ok(mut active) = self.active_method.lock() {
            *active = method;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoteEventKind;

    /// A scriptable source for exercising arbitration without hardware.
    struct FakeSource {
        method: InputMethod,
        available: bool,
        fail_activation: bool,
        events: ChannelPair<SourceEvent>,
        held: Arc<Mutex<Vec<(u8, i64)>>>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    /// The test's remote control for one [FakeSource].
    #[derive(Clone)]
    struct FakeHandle {
        tag: SourceTag,
        sender: Sender<SourceEvent>,
        held: Arc<Mutex<Vec<(u8, i64)>>>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }
    impl FakeHandle {
        fn emit_note_on(&self, pitch: u8, timestamp_ms: i64) {
            self.held.lock().unwrap().push((pitch, timestamp_ms));
            self.sender
                .send(SourceEvent::Note(UnifiedInputEvent {
                    kind: NoteEventKind::NoteOn,
                    pitch,
                    velocity: 100,
                    timestamp_ms,
                    source: self.tag,
                }))
                .unwrap();
        }

        fn log_contains(&self, entry: &str) -> bool {
            self.log.lock().unwrap().iter().any(|&e| e == entry)
        }
    }

    fn fake(method: InputMethod, available: bool) -> (FakeSource, FakeHandle) {
        let tag = match method {
            InputMethod::Midi => SourceTag::Midi,
            InputMethod::Mic => SourceTag::Mic,
            _ => SourceTag::Touch,
        };
        let source = FakeSource {
            method,
            available,
            fail_activation: false,
            events: Default::default(),
            held: Default::default(),
            log: Default::default(),
        };
        let handle = FakeHandle {
            tag,
            sender: source.events.sender.clone(),
            held: Arc::clone(&source.held),
            log: Arc::clone(&source.log),
        };
        (source, handle)
    }

    impl NoteInputSource for FakeSource {
        fn method(&self) -> InputMethod {
            self.method
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn activate(&mut self) -> anyhow::Result<()> {
            if self.fail_activation {
                anyhow::bail!("scripted activation failure");
            }
            self.log.lock().unwrap().push("activate");
            Ok(())
        }

        fn deactivate(&mut self) {
            self.log.lock().unwrap().push("deactivate");
        }

        fn start(&mut self) {
            self.log.lock().unwrap().push("start");
        }

        fn request_stop(&mut self) {
            self.log.lock().unwrap().push("stop");
            let tag = match self.method {
                InputMethod::Midi => SourceTag::Midi,
                InputMethod::Mic => SourceTag::Mic,
                _ => SourceTag::Touch,
            };
            for (pitch, timestamp_ms) in self.held.lock().unwrap().drain(..) {
                let _ = self.events.sender.send(SourceEvent::Note(UnifiedInputEvent {
                    kind: NoteEventKind::NoteOff,
                    pitch,
                    velocity: 0,
                    timestamp_ms,
                    source: tag,
                }));
            }
            let _ = self.events.sender.send(SourceEvent::Stopped);
        }

        fn events(&self) -> &Receiver<SourceEvent> {
            &self.events.receiver
        }
    }

    fn settings_with(method: InputMethod) -> InputSettings {
        let mut settings = InputSettings::default();
        settings.set_preferred_method(method);
        settings
    }

    fn recv(events: &Receiver<ArbiterEvent>) -> ArbiterEvent {
        events
            .recv_timeout(Duration::from_secs(1))
            .expect("arbiter should have published an event")
    }

    #[test]
    fn auto_prefers_midi_over_mic_over_touch() {
        let (midi, _) = fake(InputMethod::Midi, true);
        let (mic, _) = fake(InputMethod::Mic, true);
        let (touch, _) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Auto),
            true,
            vec![Box::new(midi), Box::new(mic), Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        assert_eq!(recv(&events), ArbiterEvent::MethodChanged(InputMethod::Midi));
        assert_eq!(recv(&events), ArbiterEvent::Started);
        assert_eq!(arbiter.active_method(), Some(InputMethod::Midi));
    }

    #[test]
    fn auto_without_midi_device_selects_mic() {
        let (midi, _) = fake(InputMethod::Midi, false);
        let (mic, _) = fake(InputMethod::Mic, true);
        let (touch, _) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Auto),
            true,
            vec![Box::new(midi), Box::new(mic), Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        assert_eq!(recv(&events), ArbiterEvent::MethodChanged(InputMethod::Mic));
    }

    #[test]
    fn auto_without_mic_permission_selects_touch() {
        let (midi, _) = fake(InputMethod::Midi, false);
        let (mic, _) = fake(InputMethod::Mic, true);
        let (touch, _) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Auto),
            false,
            vec![Box::new(midi), Box::new(mic), Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        assert_eq!(
            recv(&events),
            ArbiterEvent::MethodChanged(InputMethod::Touch)
        );
    }

    #[test]
    fn forced_mic_without_permission_falls_back_to_touch() {
        let (midi, _) = fake(InputMethod::Midi, true);
        let (mic, _) = fake(InputMethod::Mic, true);
        let (touch, _) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Mic),
            false,
            vec![Box::new(midi), Box::new(mic), Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        // MIDI is connected, but a forced method bypasses priority.
        assert_eq!(
            recv(&events),
            ArbiterEvent::MethodChanged(InputMethod::Touch)
        );
    }

    #[test]
    fn activation_failure_falls_back_to_touch() {
        let (mut midi, _) = fake(InputMethod::Midi, true);
        midi.fail_activation = true;
        let (touch, _) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Midi),
            false,
            vec![Box::new(midi), Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        assert_eq!(
            recv(&events),
            ArbiterEvent::MethodChanged(InputMethod::Touch)
        );
    }

    #[test]
    fn switch_from_touch_to_mic_while_started() {
        let (mic, mic_handle) = fake(InputMethod::Mic, true);
        let (touch, touch_handle) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Touch),
            true,
            vec![Box::new(mic), Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        assert_eq!(
            recv(&events),
            ArbiterEvent::MethodChanged(InputMethod::Touch)
        );
        assert_eq!(recv(&events), ArbiterEvent::Started);

        // A touch note sounds, compensated by the 20ms touch latency.
        touch_handle.emit_note_on(60, 1000);
        match recv(&events) {
            ArbiterEvent::Note(note) => {
                assert_eq!(note.kind, NoteEventKind::NoteOn);
                assert_eq!(note.pitch, 60);
                assert_eq!(note.timestamp_ms, 980);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Switch. The held touch note is flushed exactly once, then the new
        // method is announced, and the arbiter is still running.
        arbiter.send_input(ArbiterInput::SetMethod(InputMethod::Mic));
        match recv(&events) {
            ArbiterEvent::Note(note) => {
                assert_eq!(note.kind, NoteEventKind::NoteOff);
                assert_eq!(note.pitch, 60);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(recv(&events), ArbiterEvent::MethodChanged(InputMethod::Mic));
        assert_eq!(arbiter.active_method(), Some(InputMethod::Mic));
        assert!(touch_handle.log_contains("deactivate"));
        assert!(mic_handle.log_contains("start"), "capture should restart");

        // Events now come from the mic, with its 100ms compensation.
        mic_handle.emit_note_on(64, 2000);
        match recv(&events) {
            ArbiterEvent::Note(note) => {
                assert_eq!(note.kind, NoteEventKind::NoteOn);
                assert_eq!(note.pitch, 64);
                assert_eq!(note.timestamp_ms, 1900);
                assert_eq!(note.source, SourceTag::Mic);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn stop_flushes_active_source() {
        let (touch, touch_handle) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Touch),
            false,
            vec![Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        assert_eq!(
            recv(&events),
            ArbiterEvent::MethodChanged(InputMethod::Touch)
        );
        assert_eq!(recv(&events), ArbiterEvent::Started);

        touch_handle.emit_note_on(72, 500);
        assert!(matches!(recv(&events), ArbiterEvent::Note(_)));

        arbiter.send_input(ArbiterInput::Stop);
        match recv(&events) {
            ArbiterEvent::Note(note) => {
                assert_eq!(note.kind, NoteEventKind::NoteOff);
                assert_eq!(note.pitch, 72);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(recv(&events), ArbiterEvent::Stopped);

        // Stop is idempotent: a second one publishes nothing further.
        arbiter.send_input(ArbiterInput::Stop);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn timing_profiles() {
        let arbiter =
            InputArbiter::new_with_sources(&InputSettings::default(), false, Vec::new());
        let midi = arbiter.timing_profile(SourceTag::Midi);
        assert_eq!(midi.tolerance_multiplier, 1.0);
        assert_eq!(midi.latency_compensation_ms, 0);

        let touch = arbiter.timing_profile(SourceTag::Touch);
        assert_eq!(touch.tolerance_multiplier, 1.0);
        assert_eq!(touch.latency_compensation_ms, 20);

        let mic = arbiter.timing_profile(SourceTag::Mic);
        assert_eq!(mic.tolerance_multiplier, 1.5);
        assert_eq!(mic.latency_compensation_ms, 100);
    }

    #[test]
    fn granting_permission_enables_mic_on_next_switch() {
        let (midi, _) = fake(InputMethod::Midi, false);
        let (mic, _) = fake(InputMethod::Mic, true);
        let (touch, _) = fake(InputMethod::Touch, true);
        let arbiter = InputArbiter::new_with_sources(
            &settings_with(InputMethod::Auto),
            false,
            vec![Box::new(midi), Box::new(mic), Box::new(touch)],
        );
        let events = arbiter.subscribe();
        arbiter.send_input(ArbiterInput::Start);
        assert_eq!(
            recv(&events),
            ArbiterEvent::MethodChanged(InputMethod::Touch)
        );
        assert_eq!(recv(&events), ArbiterEvent::Started);

        arbiter.send_input(ArbiterInput::SetMicPermission(true));
        arbiter.send_input(ArbiterInput::SetMethod(InputMethod::Auto));
        assert_eq!(recv(&events), ArbiterEvent::MethodChanged(InputMethod::Mic));
    }
}
