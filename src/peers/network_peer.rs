//! Router node wrapping one server-owned session peer. When the
//! remote says goodbye, the node removes itself and the worker nodes
//! wired to it, deferred so the removal never runs inside the peer's
//! own signal emission.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use log::debug;
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::rtppeer::RtpPeer;
use rtpmidi_core::Connection;
use serde_json::json;

use crate::router::{MidiPeer, PeerHandle, PeerId};

use super::{handle_send, new_shared_handle, session_status, SharedHandle};

pub struct NetworkServerPeer {
    peer: Rc<RtpPeer>,
    handle: SharedHandle,
    _connections: RefCell<Vec<Connection>>,
}

impl NetworkServerPeer {
    pub fn new(reactor: &Reactor, peer: Rc<RtpPeer>) -> Rc<NetworkServerPeer> {
        let handle = new_shared_handle();
        let mut connections = Vec::new();

        let handle2 = Rc::clone(&handle);
        connections.push(peer.midi_received.connect(move |data| {
            handle_send(&handle2, data);
        }));

        let handle2 = Rc::clone(&handle);
        let reactor = reactor.clone();
        connections.push(peer.disconnected.connect(move |reason| {
            debug!("session peer disconnected ({reason}), removing router nodes");
            let handle3 = Rc::clone(&handle2);
            reactor.call_later(move || {
                let handle = handle3.borrow().clone();
                if let Some(handle) = handle {
                    if let Some(router) = handle.router() {
                        for neighbour in router.edges_of(handle.id()) {
                            router.remove_peer(neighbour);
                        }
                        router.remove_peer(handle.id());
                    }
                }
            });
        }));

        Rc::new(NetworkServerPeer {
            peer,
            handle,
            _connections: RefCell::new(connections),
        })
    }

    pub fn peer(&self) -> &Rc<RtpPeer> {
        &self.peer
    }
}

impl MidiPeer for NetworkServerPeer {
    fn kind(&self) -> &'static str {
        "network:peer"
    }

    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        self.peer.send_midi(data);
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": self.kind(),
            "name": self.peer.remote_name(),
            "session": session_status(&self.peer),
        })
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
