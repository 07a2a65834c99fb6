//! Dedicated network listener: its own server socket pair announced
//! under one name, shared by local subscribers through a use count.
//! The owner that drops the last use removes the node.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;
use bytes::Bytes;
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::rtpserver::RtpServer;
use rtpmidi_core::Connection;
use serde_json::json;

use crate::mdns::MdnsService;
use crate::router::{MidiPeer, PeerHandle, PeerId};

use super::{handle_send, new_shared_handle, session_status, SharedHandle};

pub struct NetworkListener {
    name: String,
    server: RtpServer,
    mdns: Option<MdnsService>,
    use_count: Cell<i32>,
    handle: SharedHandle,
    _connections: RefCell<Vec<Connection>>,
}

impl NetworkListener {
    pub fn new(
        reactor: &Reactor,
        name: &str,
        port: u16,
        mdns: Option<MdnsService>,
    ) -> Result<Rc<NetworkListener>> {
        let server = RtpServer::new(reactor, name, port)?;
        if let Some(mdns) = &mdns {
            mdns.announce(name, server.control_port());
        }

        let handle = new_shared_handle();
        let mut connections = Vec::new();
        let handle2 = Rc::clone(&handle);
        connections.push(server.midi_event().connect(move |data| {
            handle_send(&handle2, data);
        }));

        Ok(Rc::new(NetworkListener {
            name: name.to_string(),
            server,
            mdns,
            use_count: Cell::new(1),
            handle,
            _connections: RefCell::new(connections),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_port(&self) -> u16 {
        self.server.control_port()
    }

    /// One more local subscriber shares this listener.
    pub fn retain(&self) -> i32 {
        self.use_count.set(self.use_count.get() + 1);
        self.use_count.get()
    }

    /// One subscriber left; the caller removes the node at zero.
    pub fn release(&self) -> i32 {
        self.use_count.set(self.use_count.get() - 1);
        self.use_count.get()
    }
}

impl MidiPeer for NetworkListener {
    fn kind(&self) -> &'static str {
        "network:listener"
    }

    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        self.server.send_midi_to_all_peers(data);
    }

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
            "use_count": self.use_count.get(),
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

impl Drop for NetworkListener {
    fn drop(&mut self) {
        if let Some(mdns) = &self.mdns {
            mdns.unannounce(&self.name, self.server.control_port());
        }
    }
}
