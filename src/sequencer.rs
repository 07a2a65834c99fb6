//! Local MIDI sequencer interface.
//!
//! The daemon never talks to a kernel sequencer directly; it goes
//! through this trait, which exposes ports as byte sources and sinks
//! plus subscription notifications. The in-process
//! [`VirtualSequencer`] is the implementation the daemon runs with
//! and the seam the tests drive.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use log::debug;
use rtpmidi_core::Signal;

pub type SeqPortId = u32;

/// A remote sequencer port subscribing to (or leaving) one of ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub port: SeqPortId,
    pub name: String,
}

/// MIDI bytes arriving at one of our ports from a subscriber.
#[derive(Debug, Clone)]
pub struct SeqMidiEvent {
    pub source: SeqPortId,
    pub data: Bytes,
}

/// Device classes used by the auto-export filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Hardware,
    Software,
    System,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Hardware => write!(f, "hardware"),
            DeviceKind::Software => write!(f, "software"),
            DeviceKind::System => write!(f, "system"),
        }
    }
}

/// A device port appearing on or leaving the local sequencer.
#[derive(Debug, Clone)]
pub struct PortAnnouncement {
    pub name: String,
    pub kind: DeviceKind,
    pub added: bool,
}

/// Per-port signal bundle.
pub struct PortSignals {
    pub subscribed: Signal<SubscriberInfo>,
    pub unsubscribed: Signal<SubscriberInfo>,
    pub midi: Signal<SeqMidiEvent>,
}

impl PortSignals {
    fn new() -> Rc<PortSignals> {
        Rc::new(PortSignals {
            subscribed: Signal::new(),
            unsubscribed: Signal::new(),
            midi: Signal::new(),
        })
    }
}

pub trait Sequencer {
    fn create_port(&self, name: &str) -> Result<SeqPortId>;
    fn remove_port(&self, port: SeqPortId);
    fn signals(&self, port: SeqPortId) -> Option<Rc<PortSignals>>;
    /// Write bytes out of the port, to every subscriber.
    fn write(&self, port: SeqPortId, data: &[u8]);
    /// Write bytes out of the port, to one subscriber.
    fn write_to(&self, port: SeqPortId, subscriber: SeqPortId, data: &[u8]);
    /// Device ports coming and going, for the auto-export handler.
    fn announcements(&self) -> &Signal<PortAnnouncement>;
}

/// Bytes written out of a virtual port; tests observe these.
#[derive(Debug, Clone)]
pub struct WrittenEvent {
    pub port: SeqPortId,
    /// Target subscriber, or `None` for write-to-all.
    pub subscriber: Option<SeqPortId>,
    pub data: Bytes,
}

struct VirtualPort {
    name: String,
    signals: Rc<PortSignals>,
}

/// In-process sequencer: ports exist as signal bundles and writes are
/// surfaced on [`VirtualSequencer::written`].
pub struct VirtualSequencer {
    ports: RefCell<HashMap<SeqPortId, VirtualPort>>,
    next_port: RefCell<SeqPortId>,
    announcements: Signal<PortAnnouncement>,
    pub written: Signal<WrittenEvent>,
}

impl VirtualSequencer {
    pub fn new() -> Rc<VirtualSequencer> {
        Rc::new(VirtualSequencer {
            ports: RefCell::new(HashMap::new()),
            next_port: RefCell::new(1),
            announcements: Signal::new(),
            written: Signal::new(),
        })
    }

    pub fn port_name(&self, port: SeqPortId) -> Option<String> {
        self.ports.borrow().get(&port).map(|p| p.name.clone())
    }

    pub fn port_count(&self) -> usize {
        self.ports.borrow().len()
    }

    /// Simulate an external subscription to `port`.
    pub fn subscribe(&self, port: SeqPortId, subscriber: SeqPortId, name: &str) {
        let signals = self.signals(port);
        if let Some(signals) = signals {
            signals.subscribed.emit(&SubscriberInfo {
                port: subscriber,
                name: name.to_string(),
            });
        }
    }

    pub fn unsubscribe(&self, port: SeqPortId, subscriber: SeqPortId) {
        let signals = self.signals(port);
        if let Some(signals) = signals {
            signals.unsubscribed.emit(&SubscriberInfo {
                port: subscriber,
                name: String::new(),
            });
        }
    }

    /// Feed bytes into `port` as if a subscriber played them.
    pub fn inject(&self, port: SeqPortId, source: SeqPortId, data: &[u8]) {
        let signals = self.signals(port);
        if let Some(signals) = signals {
            signals.midi.emit(&SeqMidiEvent {
                source,
                data: Bytes::copy_from_slice(data),
            });
        }
    }

    /// Simulate a device port appearing or disappearing.
    pub fn announce_device(&self, name: &str, kind: DeviceKind, added: bool) {
        self.announcements.emit(&PortAnnouncement {
            name: name.to_string(),
            kind,
            added,
        });
    }
}

impl Sequencer for VirtualSequencer {
    fn create_port(&self, name: &str) -> Result<SeqPortId> {
        let mut ports = self.ports.borrow_mut();
        if ports.values().any(|p| p.name == name) {
            return Err(anyhow!("sequencer port '{name}' already exists"));
        }
        let mut next = self.next_port.borrow_mut();
        let id = *next;
        *next += 1;
        ports.insert(
            id,
            VirtualPort {
                name: name.to_string(),
                signals: PortSignals::new(),
            },
        );
        debug!("created sequencer port {id} '{name}'");
        Ok(id)
    }

    fn remove_port(&self, port: SeqPortId) {
        if self.ports.borrow_mut().remove(&port).is_some() {
            debug!("removed sequencer port {port}");
        }
    }

    fn signals(&self, port: SeqPortId) -> Option<Rc<PortSignals>> {
        self.ports.borrow().get(&port).map(|p| Rc::clone(&p.signals))
    }

    fn write(&self, port: SeqPortId, data: &[u8]) {
        self.written.emit(&WrittenEvent {
            port,
            subscriber: None,
            data: Bytes::copy_from_slice(data),
        });
    }

    fn write_to(&self, port: SeqPortId, subscriber: SeqPortId, data: &[u8]) {
        self.written.emit(&WrittenEvent {
            port,
            subscriber: Some(subscriber),
            data: Bytes::copy_from_slice(data),
        });
    }

    fn announcements(&self) -> &Signal<PortAnnouncement> {
        &self.announcements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_port_names_are_rejected() {
        let seq = VirtualSequencer::new();
        seq.create_port("Network").unwrap();
        assert!(seq.create_port("Network").is_err());
    }

    #[test]
    fn injected_bytes_reach_port_signals() {
        let seq = VirtualSequencer::new();
        let port = seq.create_port("p").unwrap();

        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        let _c = seq
            .signals(port)
            .unwrap()
            .midi
            .connect(move |ev| sink.borrow_mut().push(ev.data.clone()));

        seq.inject(port, 9, &[0x90, 0x40, 0x7f]);
        assert_eq!(got.borrow().len(), 1);
    }
}
