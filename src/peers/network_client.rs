//! Router node wrapping an outbound client connector. The owner (a
//! local waiter, or the raw-MIDI wiring) creates the connector, wires
//! its lifecycle signals, and hands it over.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use rtpmidi_core::rtpclient::RtpClient;
use rtpmidi_core::Connection;
use serde_json::json;

use crate::router::{MidiPeer, PeerHandle, PeerId};

use super::{handle_send, new_shared_handle, session_status, SharedHandle};

pub struct NetworkClientPeer {
    client: RtpClient,
    handle: SharedHandle,
    _connections: RefCell<Vec<Connection>>,
}

impl NetworkClientPeer {
    pub fn new(client: RtpClient) -> Rc<NetworkClientPeer> {
        let handle = new_shared_handle();
        let mut connections = Vec::new();

        let handle2 = Rc::clone(&handle);
        connections.push(client.peer().midi_received.connect(move |data| {
            handle_send(&handle2, data);
        }));

        Rc::new(NetworkClientPeer {
            client,
            handle,
            _connections: RefCell::new(connections),
        })
    }

    pub fn client(&self) -> &RtpClient {
        &self.client
    }
}

impl MidiPeer for NetworkClientPeer {
    fn kind(&self) -> &'static str {
        "network:client"
    }

    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        self.client.peer().send_midi(data);
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": self.kind(),
            "name": self.client.peer().remote_name(),
            "remote": self.client.remote_addr().map(|addr| addr.to_string()),
            "session": session_status(&self.client.peer()),
        })
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for NetworkClientPeer {
    fn drop(&mut self) {
        self.client.disconnect();
    }
}
