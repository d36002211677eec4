// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! The event types that flow through the detection pipeline, and the fan-out
//! machinery that delivers them to subscribers.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use strum_macros::Display;

/// Which physical input produced an event.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTag {
    /// A hardware MIDI keyboard.
    Midi,
    /// The microphone pitch-detection pipeline.
    Mic,
    /// On-screen touch.
    Touch,
}

/// Whether a note started or stopped sounding.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoteEventKind {
    #[allow(missing_docs)]
    NoteOn,
    #[allow(missing_docs)]
    NoteOff,
}

/// A tracker-level note transition.
///
/// For a given tracker instance, a pitch has at most one open NoteOn before
/// its matching NoteOff; no two consecutive events for the same pitch are of
/// the same kind. The trackers enforce this by construction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteEvent {
    #[allow(missing_docs)]
    pub kind: NoteEventKind,
    #[allow(missing_docs)]
    pub pitch: u8,
    /// Detection confidence, 0.0..=1.0.
    pub confidence: f64,
    #[allow(missing_docs)]
    pub timestamp_ms: i64,
}

/// The signature of a function that a tracker calls for each event it emits.
pub type NoteEventsFn<'a> = dyn FnMut(NoteEvent) + 'a;

/// One pitch the polyphonic model reported active in a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectedNote {
    #[allow(missing_docs)]
    pub pitch: u8,
    /// The model's activation probability for this pitch, 0.0..=1.0.
    pub confidence: f64,
    /// Whether the model also flagged this frame as the note's onset.
    pub is_onset: bool,
}

/// One frame of polyphonic detection: every pitch the model considered
/// sounding, each with its own independent onset flag.
#[derive(Clone, Debug)]
pub struct DetectedFrame {
    #[allow(missing_docs)]
    pub notes: Vec<DetectedNote>,
    #[allow(missing_docs)]
    pub timestamp_ms: i64,
}

/// The externally visible event shape that all sources converge to. Immutable
/// once emitted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnifiedInputEvent {
    #[allow(missing_docs)]
    pub kind: NoteEventKind,
    /// MIDI-convention pitch number, 0..=127.
    pub pitch: u8,
    /// 0..=127. Acoustic sources report a configured default.
    pub velocity: u8,
    #[allow(missing_docs)]
    pub timestamp_ms: i64,
    #[allow(missing_docs)]
    pub source: SourceTag,
}

/// A subscriber registry that clones each published event to every live
/// subscriber.
///
/// Dropping the [Receiver] returned by [EventFanout::subscribe()] is the
/// disposer: the dead sender is pruned on the next publish. Cloning the
/// fanout shares the registry, so a service can publish from its worker
/// thread while the owner keeps handing out subscriptions.
#[derive(Debug)]
pub struct EventFanout<T>(Arc<Mutex<Vec<Sender<T>>>>);
impl<T> Clone for EventFanout<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}
impl<T> Default for EventFanout<T> {
    fn default() -> Self {
        Self(Default::default())
    }
}
impl<T: Clone> EventFanout<T> {
    /// Registers a new subscriber and returns the receiving end of its
    /// channel.
    pub fn subscribe(&self) -> Receiver<T> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        if let Ok(mut senders) = self.0.lock() {
            senders.push(sender);
        }
        receiver
    }

    /// Delivers the event to every live subscriber, pruning dead ones.
    pub fn publish(&self, event: T) {
        if let Ok(mut senders) = self.0.lock() {
            senders.retain(|sender| sender.send(event.clone()).is_ok());
        }
    }

    /// How many subscribers were live as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.0.lock().map(|senders| senders.len()).unwrap_or(0)
    }
}
