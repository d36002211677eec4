// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The hardware MIDI source: external keyboards plugged in through USB (or
//! anything else the OS presents as a MIDI input port).
//!
//! MIDI is the lowest-latency, highest-confidence source we have, which is
//! why the arbiter prefers it and why its events carry no latency
//! compensation.

use super::{NoteInputSource, ProvidesService, SourceError, SourceEvent};
use crate::{
    config::InputMethod,
    events::{NoteEventKind, SourceTag, UnifiedInputEvent},
    util::ChannelPair,
};
use crossbeam_channel::{Receiver, Sender};
use midir::{Ignore, MidiInput, MidiInputConnection};
use midly::{live::LiveEvent, MidiMessage};
use rustc_hash::FxHashMap;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Identifies one hardware MIDI input port. Descriptors are discovered on
/// enumeration and removed from the device list on disconnect; they are never
/// mutated in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiPortDescriptor {
    /// The OS-assigned stable port id.
    pub id: String,
    /// A human-readable name, usually the device's product name.
    pub name: String,
    /// Whether the port was present at the most recent enumeration.
    pub connected: bool,
}

/// A [MidiServiceInput] tells [HardwareMidiSource] what to do.
#[derive(Debug)]
pub enum MidiServiceInput {
    /// Re-enumerate ports. Call this on device connect/disconnect
    /// notifications from the host.
    RefreshPorts,
    /// Connect to the given port, making it the single active device.
    SelectPort(MidiPortDescriptor),
    /// Connect to the first available port, if any. Always answered with a
    /// [MidiDeviceEvent::PortSelected].
    SelectFirstAvailable,
    /// Drop the active connection.
    Disconnect,
    /// Begin delivering events.
    Start,
    /// Stop delivering events, flushing held notes as NoteOffs.
    Stop,
    /// Exit the service.
    Quit,
}

/// Device-lifecycle news, separate from the note-event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MidiDeviceEvent {
    /// The available input ports were re-enumerated.
    PortsRefreshed(Vec<MidiPortDescriptor>),
    /// The active device changed (None means disconnected).
    PortSelected(Option<MidiPortDescriptor>),
}

/// Parses one raw channel-voice message into the unified event shape.
///
/// Note-on with velocity zero is a note-off, per the MIDI convention that
/// lets keyboards use running status. Control changes and everything else
/// are recognized but have no note shape to map to, so they produce None.
pub(crate) fn parse_midi_message(bytes: &[u8], timestamp_ms: i64) -> Option<UnifiedInputEvent> {
    match LiveEvent::parse(bytes).ok()? {
        LiveEvent::Midi {
            channel: _,
            message,
        } => match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => Some(UnifiedInputEvent {
                kind: NoteEventKind::NoteOff,
                pitch: key.as_int(),
                velocity: 0,
                timestamp_ms,
                source: SourceTag::Midi,
            }),
            MidiMessage::NoteOn { key, vel } => Some(UnifiedInputEvent {
                kind: NoteEventKind::NoteOn,
                pitch: key.as_int(),
                velocity: vel.as_int(),
                timestamp_ms,
                source: SourceTag::Midi,
            }),
            MidiMessage::NoteOff { key, vel } => Some(UnifiedInputEvent {
                kind: NoteEventKind::NoteOff,
                pitch: key.as_int(),
                velocity: vel.as_int(),
                timestamp_ms,
                source: SourceTag::Midi,
            }),
            _ => None,
        },
        _ => None,
    }
}

type HeldNotes = Arc<Mutex<FxHashMap<u8, i64>>>;

/// [HardwareMidiSource] manages external MIDI hardware and republishes its
/// channel-voice messages as [UnifiedInputEvent]s tagged [SourceTag::Midi].
/// At most one device is active (receiving the message-dispatch callback) at
/// a time.
#[derive(Debug)]
pub struct HardwareMidiSource {
    inputs: ChannelPair<MidiServiceInput>,
    events: ChannelPair<SourceEvent>,
    device_events: ChannelPair<MidiDeviceEvent>,

    /// The cached device list, refreshed by the service thread.
    ports: Arc<Mutex<Vec<MidiPortDescriptor>>>,
    started: Arc<AtomicBool>,
}
impl Default for HardwareMidiSource {
    fn default() -> Self {
        let r = Self {
            inputs: Default::default(),
            events: Default::default(),
            device_events: Default::default(),
            ports: Default::default(),
            started: Default::default(),
        };
        r.spawn_thread();
        r
    }
}
impl ProvidesService<MidiServiceInput, SourceEvent> for HardwareMidiSource {
    fn sender(&self) -> &Sender<MidiServiceInput> {
        &self.inputs.sender
    }

    fn receiver(&self) -> &Receiver<SourceEvent> {
        &self.events.receiver
    }
}
impl NoteInputSource for HardwareMidiSource {
    fn method(&self) -> InputMethod {
        InputMethod::Midi
    }

    fn is_available(&self) -> bool {
        self.ports.lock().map(|ports| !ports.is_empty()).unwrap_or(false)
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        // Stale device news from before this activation is irrelevant.
        while self.device_events.receiver.try_recv().is_ok() {}
        self.send_input(MidiServiceInput::SelectFirstAvailable);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while let Ok(event) = self.device_events.receiver.recv_deadline(deadline) {
            match event {
                MidiDeviceEvent::PortSelected(Some(_)) => return Ok(()),
                MidiDeviceEvent::PortSelected(None) => {
                    return Err(SourceError::NoMidiDevice.into())
                }
                MidiDeviceEvent::PortsRefreshed(_) => continue,
            }
        }
        Err(SourceError::NoMidiDevice.into())
    }

    fn deactivate(&mut self) {
        self.send_input(MidiServiceInput::Disconnect);
    }

    fn start(&mut self) {
        self.send_input(MidiServiceInput::Start);
    }

    fn request_stop(&mut self) {
        self.send_input(MidiServiceInput::Stop);
    }

    fn events(&self) -> &Receiver<SourceEvent> {
        &self.events.receiver
    }
}
impl HardwareMidiSource {
    /// The receive side of the device-lifecycle channel.
    pub fn device_events(&self) -> &Receiver<MidiDeviceEvent> {
        &self.device_events.receiver
    }

    /// A snapshot of the known input ports.
    pub fn ports(&self) -> Vec<MidiPortDescriptor> {
        self.ports.lock().map(|ports| ports.clone()).unwrap_or_default()
    }

    fn spawn_thread(&self) {
        let receiver = self.inputs.receiver.clone();
        let events_sender = self.events.sender.clone();
        let device_sender = self.device_events.sender.clone();
        let ports = Arc::clone(&self.ports);
        let started = Arc::clone(&self.started);
        std::thread::spawn(move || {
            let held: HeldNotes = Default::default();
            let mut connection: Option<(MidiPortDescriptor, MidiInputConnection<()>)> = None;

            // Enumerate once up front so availability checks mean something
            // before the first explicit refresh.
            refresh_ports(&ports, &device_sender);

            while let Ok(input) = receiver.recv() {
                match input {
                    MidiServiceInput::RefreshPorts => {
                        let available = refresh_ports(&ports, &device_sender);
                        if let Some((descriptor, _)) = &connection {
                            if !available.contains(descriptor) {
                                // The active device went away.
                                connection = None;
                                flush_held(&held, &events_sender);
                                let _ = device_sender.send(MidiDeviceEvent::PortSelected(None));
                            }
                        }
                    }
                    MidiServiceInput::SelectPort(descriptor) => {
                        let _ = connection.take();
                        flush_held(&held, &events_sender);
                        connection = connect(
                            &descriptor,
                            &events_sender,
                            &held,
                            &started,
                            &device_sender,
                        );
                    }
                    MidiServiceInput::SelectFirstAvailable => {
                        let _ = connection.take();
                        flush_held(&held, &events_sender);
                        let first = refresh_ports(&ports, &device_sender).into_iter().next();
                        connection = match first {
                            Some(descriptor) => connect(
                                &descriptor,
                                &events_sender,
                                &held,
                                &started,
                                &device_sender,
                            ),
                            None => {
                                let _ = device_sender.send(MidiDeviceEvent::PortSelected(None));
                                None
                            }
                        };
                    }
                    MidiServiceInput::Disconnect => {
                        connection = None;
                        flush_held(&held, &events_sender);
                        let _ = device_sender.send(MidiDeviceEvent::PortSelected(None));
                    }
                    MidiServiceInput::Start => {
                        started.store(true, Ordering::Release);
                    }
                    MidiServiceInput::Stop => {
                        started.store(false, Ordering::Release);
                        flush_held(&held, &events_sender);
                        let _ = events_sender.send(SourceEvent::Stopped);
                    }
                    MidiServiceInput::Quit => {
                        flush_held(&held, &events_sender);
                        break;
                    }
                }
            }
        });
    }
}

/// Re-enumerates input ports, updates the shared cache, and announces the new
/// list.
fn refresh_ports(
    ports: &Arc<Mutex<Vec<MidiPortDescriptor>>>,
    device_sender: &Sender<MidiDeviceEvent>,
) -> Vec<MidiPortDescriptor> {
    let descriptors = match MidiInput::new("attune scan") {
        Ok(midi_in) => midi_in
            .ports()
            .iter()
            .filter_map(|port| {
                midi_in.port_name(port).ok().map(|name| MidiPortDescriptor {
                    id: port.id(),
                    name,
                    connected: true,
                })
            })
            .collect(),
        Err(e) => {
            eprintln!("MIDI enumeration failed: {e:?}");
            Vec::new()
        }
    };
    if let Ok(mut cached) = ports.lock() {
        *cached = descriptors.clone();
    }
    let _ = device_sender.send(MidiDeviceEvent::PortsRefreshed(descriptors.clone()));
    descriptors
}

/// Connects to the given port and installs the message-dispatch callback.
fn connect(
    descriptor: &MidiPortDescriptor,
    events_sender: &Sender<SourceEvent>,
    held: &HeldNotes,
    started: &Arc<AtomicBool>,
    device_sender: &Sender<MidiDeviceEvent>,
) -> Option<(MidiPortDescriptor, MidiInputConnection<()>)> {
    let mut midi_in = match MidiInput::new("attune input") {
        Ok(midi_in) => midi_in,
        Err(e) => {
            eprintln!("MIDI input creation failed: {e:?}");
            let _ = device_sender.send(MidiDeviceEvent::PortSelected(None));
            return None;
        }
    };
    midi_in.ignore(Ignore::All);

    let Some(port) = midi_in
        .ports()
        .into_iter()
        .find(|port| port.id() == descriptor.id)
    else {
        let _ = device_sender.send(MidiDeviceEvent::PortSelected(None));
        return None;
    };

    let callback_sender = events_sender.clone();
    let callback_held = Arc::clone(held);
    let callback_started = Arc::clone(started);
    match midi_in.connect(
        &port,
        "attune-input",
        move |timestamp_us, bytes, _| {
            let timestamp_ms = (timestamp_us / 1_000) as i64;
            let Some(event) = parse_midi_message(bytes, timestamp_ms) else {
                return;
            };
            if !callback_started.load(Ordering::Acquire) {
                return;
            }
            // Keep the stream's pairing invariant even if the device
            // misbehaves: no NoteOn for a held pitch, no NoteOff for an
            // unheld one.
            if let Ok(mut held) = callback_held.lock() {
                let keep = match event.kind {
                    NoteEventKind::NoteOn => held.insert(event.pitch, timestamp_ms).is_none(),
                    NoteEventKind::NoteOff => held.remove(&event.pitch).is_some(),
                };
                if keep {
                    let _ = callback_sender.send(SourceEvent::Note(event));
                }
            }
        },
        (),
    ) {
        Ok(connection) => {
            let _ = device_sender.send(MidiDeviceEvent::PortSelected(Some(descriptor.clone())));
            Some((descriptor.clone(), connection))
        }
        Err(e) => {
            eprintln!(
                "{}",
                SourceError::MidiConnect(format!("{}: {e}", descriptor.name))
            );
            let _ = device_sender.send(MidiDeviceEvent::PortSelected(None));
            None
        }
    }
}

/// Emits NoteOff for everything still held, so the consumer's view of what's
/// sounding never survives a stop or disconnect.
fn flush_held(held: &HeldNotes, events_sender: &Sender<SourceEvent>) {
    if let Ok(mut held) = held.lock() {
        let mut pitches: Vec<(u8, i64)> = held.drain().collect();
        pitches.sort_unstable_by_key(|(pitch, _)| *pitch);
        for (pitch, timestamp_ms) in pitches {
            let _ = events_sender.send(SourceEvent::Note(UnifiedInputEvent {
                kind: NoteEventKind::NoteOff,
                pitch,
                velocity: 0,
                timestamp_ms,
                source: SourceTag::Midi,
            }));
        }
    }
}
