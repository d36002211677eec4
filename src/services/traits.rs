// Copyright (c) 2024 Mike Tsao. All rights reserved.

use super::SourceEvent;
use crate::config::InputMethod;
use crossbeam_channel::{Receiver, Sender};

/// Service methods.
///
/// A service is something that usually runs in its own thread, as a daemon,
/// and that communicates with client(s) by crossbeam channels. It accepts
/// Inputs and produces Events.
pub trait ProvidesService<I: core::fmt::Debug, E: core::fmt::Debug> {
    /// The sender side of the Input channel. Use this to send commands to the
    /// service.
    fn sender(&self) -> &Sender<I>;

    /// A convenience method to send Inputs to the service.
    fn send_input(&self, input: I) {
        if let Err(e) = self.sender().try_send(input) {
            eprintln!("While sending: {e:?}");
        }
    }

    /// The receiver side of the Event channel. Integrate this into a listener
    /// loop to respond to events.
    fn receiver(&self) -> &Receiver<E>;
}

/// The seam between the arbiter and the concrete input sources.
///
/// The arbiter holds each source behind this trait, which is what lets the
/// fallback chains be explicit strategy objects instead of branching
/// scattered through the hot path, and what lets arbitration be tested with
/// fake sources.
pub trait NoteInputSource: Send {
    /// The concrete source this is (never [InputMethod::Auto]).
    fn method(&self) -> InputMethod;

    /// Whether the source could plausibly be activated right now (device
    /// connected, etc.). Checking availability must never prompt the user
    /// for anything.
    fn is_available(&self) -> bool;

    /// Acquires whatever the source needs (e.g., connects to a MIDI device).
    /// Failure means the arbiter tries the next source in priority order.
    fn activate(&mut self) -> anyhow::Result<()>;

    /// Releases whatever activate() acquired. Must be idempotent.
    fn deactivate(&mut self);

    /// Begins delivering events.
    fn start(&mut self);

    /// Requests that the source stop delivering events. The source flushes
    /// any active notes as NoteOffs and then emits [SourceEvent::Stopped] on
    /// its event channel. Must be idempotent.
    fn request_stop(&mut self);

    /// The source's event channel.
    fn events(&self) -> &Receiver<SourceEvent>;
}
