//! The announced shared server: one socket pair at a configured port,
//! serving any number of remote initiators. Each remote that completes
//! the handshake gets a local sequencer port (a worker) wired to a
//! session node, so every remote shows up as its own local port.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use bytes::Bytes;
use log::{info, warn};
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::rtppeer::RtpPeer;
use rtpmidi_core::rtpserver::RtpServer;
use rtpmidi_core::Connection;
use serde_json::json;

use crate::mdns::MdnsService;
use crate::router::{MidiPeer, PeerHandle, PeerId};
use crate::sequencer::Sequencer;

use super::{new_shared_handle, session_status, LocalWorker, NetworkServerPeer, SharedHandle};

pub struct NetworkMultiListener {
    reactor: Reactor,
    seq: Rc<dyn Sequencer>,
    mdns: Option<MdnsService>,
    name: String,
    server: RtpServer,
    handle: SharedHandle,
    _connections: RefCell<Vec<Connection>>,
}

impl NetworkMultiListener {
    pub fn new(
        reactor: &Reactor,
        seq: Rc<dyn Sequencer>,
        name: &str,
        port: u16,
        mdns: Option<MdnsService>,
    ) -> Result<Rc<NetworkMultiListener>> {
        let server = RtpServer::new(reactor, name, port)?;
        if let Some(mdns) = &mdns {
            mdns.announce(name, server.control_port());
        }

        let listener = Rc::new(NetworkMultiListener {
            reactor: reactor.clone(),
            seq,
            mdns,
            name: name.to_string(),
            server,
            handle: new_shared_handle(),
            _connections: RefCell::new(Vec::new()),
        });

        let weak = Rc::downgrade(&listener);
        let connection = listener.server.connected_event().connect(move |peer| {
            if let Some(listener) = weak.upgrade() {
                listener.on_peer_connected(peer);
            }
        });
        listener._connections.borrow_mut().push(connection);

        Ok(listener)
    }

    pub fn control_port(&self) -> u16 {
        self.server.control_port()
    }

    fn on_peer_connected(&self, peer: &Rc<RtpPeer>) {
        let handle = self.handle.borrow();
        let Some(router) = handle.as_ref().and_then(|h| h.router()) else {
            return;
        };
        let remote_name = peer.remote_name();
        info!("'{remote_name}' connected to '{}'", self.name);

        let worker = match LocalWorker::new(Rc::clone(&self.seq), &remote_name) {
            Ok(worker) => worker,
            Err(err) => {
                warn!("can not create local port for '{remote_name}': {err}");
                return;
            }
        };
        let worker_id = router.add_peer(worker);
        let session_id = router.add_peer(NetworkServerPeer::new(&self.reactor, Rc::clone(peer)));
        router.connect(worker_id, session_id);
        router.connect(session_id, worker_id);
    }
}

impl MidiPeer for NetworkMultiListener {
    fn kind(&self) -> &'static str {
        "network:multi:listener"
    }

    /// Traffic flows through the per-remote session nodes, never
    /// through the multi-listener itself.
    fn send_midi(&self, _from: PeerId, _data: &Bytes) {}

    fn status(&self) -> serde_json::Value {
        let mut peers = Vec::new();
        self.server.for_each_peer(|peer| peers.push(session_status(peer)));
        json!({
            "type": self.kind(),
            "name": self.name,
            "listening": {
                "control_port": self.server.control_port(),
                "midi_port": self.server.midi_port(),
            },
            "peers": peers,
        })
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for NetworkMultiListener {
    fn drop(&mut self) {
        if let Some(mdns) = &self.mdns {
            mdns.unannounce(&self.name, self.server.control_port());
        }
    }
}
