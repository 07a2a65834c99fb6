//! The bridge daemon: a router graph of MIDI peers (local sequencer
//! ports, network sessions, raw devices) plus the services that feed
//! it (mDNS discovery, settings, the control socket). The session
//! protocol itself lives in the `rtpmidi_core` crate.

pub mod control;
pub mod hwexport;
pub mod mdns;
pub mod normalizer;
pub mod peers;
pub mod remote_handler;
pub mod router;
pub mod sequencer;
pub mod settings;

pub use router::{MidiPeer, MidiRouter, PeerEvent, PeerHandle, PeerId};
pub use sequencer::{Sequencer, VirtualSequencer};
pub use settings::Settings;
