//! Router graph properties: fan-out, edge bookkeeping, typed
//! iteration and status reporting.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use serde_json::json;

use rtp_midi_bridge::router::{MidiPeer, MidiRouter, PeerEvent, PeerHandle, PeerId};

/// Minimal node that records everything delivered to it.
struct Sink {
    name: &'static str,
    received: RefCell<Vec<(PeerId, Bytes)>>,
    events: RefCell<Vec<(PeerEvent, PeerId)>>,
    handle: RefCell<Option<PeerHandle>>,
}

impl Sink {
    fn new(name: &'static str) -> Rc<Sink> {
        Rc::new(Sink {
            name,
            received: RefCell::new(Vec::new()),
            events: RefCell::new(Vec::new()),
            handle: RefCell::new(None),
        })
    }
}

impl MidiPeer for Sink {
    fn kind(&self) -> &'static str {
        "test:sink"
    }

    fn send_midi(&self, from: PeerId, data: &Bytes) {
        self.received.borrow_mut().push((from, data.clone()));
    }

    fn status(&self) -> serde_json::Value {
        json!({ "type": self.kind(), "name": self.name })
    }

    fn event(&self, event: PeerEvent, peer: PeerId) {
        self.events.borrow_mut().push((event, peer));
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Node that forwards every delivery back into the router, like the
/// network peers do with traffic arriving from the wire.
struct Forwarder {
    handle: RefCell<Option<PeerHandle>>,
}

impl Forwarder {
    fn new() -> Rc<Forwarder> {
        Rc::new(Forwarder {
            handle: RefCell::new(None),
        })
    }
}

impl MidiPeer for Forwarder {
    fn kind(&self) -> &'static str {
        "test:forwarder"
    }

    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        let handle = self.handle.borrow();
        if let Some(handle) = handle.as_ref() {
            handle.send(data);
        }
    }

    fn status(&self) -> serde_json::Value {
        json!({ "type": self.kind() })
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn fan_out_delivers_to_each_edge_once_in_order() {
    let router = MidiRouter::new();
    let a = Sink::new("a");
    let b = Sink::new("b");
    let c = Sink::new("c");
    let a_id = router.add_peer(a.clone());
    let b_id = router.add_peer(b.clone());
    let c_id = router.add_peer(c.clone());

    router.connect(a_id, b_id);
    router.connect(a_id, c_id);
    // Duplicates are suppressed on insertion.
    router.connect(a_id, b_id);

    let message = Bytes::from_static(&[0x90, 0x40, 0x7f]);
    router.send_midi(a_id, &message);

    assert_eq!(*b.received.borrow(), vec![(a_id, message.clone())]);
    assert_eq!(*c.received.borrow(), vec![(a_id, message.clone())]);
    assert!(a.received.borrow().is_empty());

    // No edges, no deliveries.
    router.send_midi(b_id, &message);
    assert!(a.received.borrow().is_empty());
    assert_eq!(c.received.borrow().len(), 1);
}

#[test]
fn ids_start_at_one_and_are_not_reused() {
    let router = MidiRouter::new();
    let first = router.add_peer(Sink::new("first"));
    assert_eq!(first, 1);
    router.remove_peer(first);
    let second = router.add_peer(Sink::new("second"));
    assert_eq!(second, 2);
}

#[test]
fn removing_a_peer_prunes_both_edge_directions() {
    let router = MidiRouter::new();
    let a = Sink::new("a");
    let b = Sink::new("b");
    let a_id = router.add_peer(a.clone());
    let b_id = router.add_peer(b.clone());
    router.connect(a_id, b_id);
    router.connect(b_id, a_id);

    router.remove_peer(b_id);
    assert!(router.edges_of(a_id).is_empty());

    // Idempotent; sending from the removed id is a no-op.
    router.remove_peer(b_id);
    router.send_midi(b_id, &Bytes::from_static(&[0xf8]));
    assert!(a.received.borrow().is_empty());
}

#[test]
fn forwarding_peers_may_reenter_the_router() {
    let router = MidiRouter::new();
    let forwarder = Forwarder::new();
    let sink = Sink::new("sink");
    let src = Sink::new("src");

    let src_id = router.add_peer(src);
    let fwd_id = router.add_peer(forwarder);
    let sink_id = router.add_peer(sink.clone());

    router.connect(src_id, fwd_id);
    router.connect(fwd_id, sink_id);

    router.send_midi(src_id, &Bytes::from_static(&[0xf8]));
    assert_eq!(sink.received.borrow().len(), 1);
    assert_eq!(sink.received.borrow()[0].0, fwd_id);
}

#[test]
fn connect_and_disconnect_notify_both_endpoints() {
    let router = MidiRouter::new();
    let a = Sink::new("a");
    let b = Sink::new("b");
    let a_id = router.add_peer(a.clone());
    let b_id = router.add_peer(b.clone());

    router.connect(a_id, b_id);
    assert_eq!(*a.events.borrow(), vec![(PeerEvent::ConnectedPeer, b_id)]);
    assert_eq!(*b.events.borrow(), vec![(PeerEvent::ConnectedPeer, a_id)]);

    router.disconnect(a_id, b_id);
    assert_eq!(a.events.borrow().last(), Some(&(PeerEvent::DisconnectedPeer, b_id)));
    assert_eq!(b.events.borrow().last(), Some(&(PeerEvent::DisconnectedPeer, a_id)));
}

#[test]
fn typed_iteration_sees_only_the_requested_kind() {
    let router = MidiRouter::new();
    router.add_peer(Sink::new("a"));
    router.add_peer(Forwarder::new());
    router.add_peer(Sink::new("b"));

    let mut names = Vec::new();
    router.for_each_peer::<Sink>(|_id, sink| names.push(sink.name));
    assert_eq!(names, vec!["a", "b"]);

    let mut forwarders = 0;
    router.for_each_peer::<Forwarder>(|_id, _fwd| forwarders += 1);
    assert_eq!(forwarders, 1);
}

#[test]
fn status_reports_edges_and_counters() {
    let router = MidiRouter::new();
    let a_id = router.add_peer(Sink::new("a"));
    let b_id = router.add_peer(Sink::new("b"));
    router.connect(a_id, b_id);
    router.send_midi(a_id, &Bytes::from_static(&[0xf8]));

    let status = router.status();
    let peers = status.as_array().unwrap();
    assert_eq!(peers.len(), 2);

    let a_status = peers.iter().find(|p| p["id"] == 1).unwrap();
    assert_eq!(a_status["send_to"], serde_json::json!([b_id]));
    assert_eq!(a_status["stats"]["sent"], 1);

    let b_status = peers.iter().find(|p| p["id"] == 2).unwrap();
    assert_eq!(b_status["stats"]["recv"], 1);
}
