//! Router nodes: the glue between the router graph and everything
//! that produces or consumes MIDI (local sequencer ports, network
//! sessions, raw devices).

pub mod local_multi_listener;
pub mod local_waiter;
pub mod local_worker;
pub mod network_client;
pub mod network_listener;
pub mod network_multi_listener;
pub mod network_peer;
pub mod rawmidi;

pub use local_multi_listener::LocalMultiListener;
pub use local_waiter::LocalWaiter;
pub use local_worker::LocalWorker;
pub use network_client::NetworkClientPeer;
pub use network_listener::NetworkListener;
pub use network_multi_listener::NetworkMultiListener;
pub use network_peer::NetworkServerPeer;
pub use rawmidi::RawMidiPeer;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use rtpmidi_core::rtppeer::RtpPeer;
use serde_json::json;

use crate::router::PeerHandle;

/// Adapters learn their router handle only at insertion; the signal
/// wiring set up in their constructors shares this slot.
pub(crate) type SharedHandle = Rc<RefCell<Option<PeerHandle>>>;

pub(crate) fn new_shared_handle() -> SharedHandle {
    Rc::new(RefCell::new(None))
}

pub(crate) fn handle_send(handle: &SharedHandle, data: &Bytes) {
    let handle = handle.borrow();
    if let Some(handle) = handle.as_ref() {
        handle.send(data);
    }
}

/// Common session description used by the network adapters.
pub(crate) fn session_status(peer: &RtpPeer) -> serde_json::Value {
    let stats = peer.latency_stats();
    json!({
        "remote_name": peer.remote_name(),
        "status": peer.status().to_string(),
        "latency_ms": peer.latency_ms(),
        "latency_avg_ns": stats.average,
        "latency_stddev_ns": stats.stddev,
    })
}
