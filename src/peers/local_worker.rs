//! One local sequencer port bridged straight to the router: bytes
//! played into the port fan out through the graph, router deliveries
//! are written back to the port's subscribers.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use bytes::Bytes;
use rtpmidi_core::Connection;
use serde_json::json;

use crate::router::{MidiPeer, PeerHandle, PeerId};
use crate::sequencer::{SeqPortId, Sequencer};

use super::{handle_send, new_shared_handle, SharedHandle};

pub struct LocalWorker {
    seq: Rc<dyn Sequencer>,
    port: SeqPortId,
    name: String,
    handle: SharedHandle,
    _connections: RefCell<Vec<Connection>>,
}

impl LocalWorker {
    pub fn new(seq: Rc<dyn Sequencer>, name: &str) -> Result<Rc<LocalWorker>> {
        let (port, name) = create_port_with_free_name(&seq, name)?;
        let handle = new_shared_handle();

        let mut connections = Vec::new();
        if let Some(signals) = seq.signals(port) {
            let handle2 = Rc::clone(&handle);
            connections.push(signals.midi.connect(move |ev| {
                handle_send(&handle2, &ev.data);
            }));
        }

        Ok(Rc::new(LocalWorker {
            seq,
            port,
            name,
            handle,
            _connections: RefCell::new(connections),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> SeqPortId {
        self.port
    }
}

/// Sequencer port names must be unique here; a taken name gets a
/// numeric suffix, like desktop sequencers do.
fn create_port_with_free_name(seq: &Rc<dyn Sequencer>, name: &str) -> Result<(SeqPortId, String)> {
    match seq.create_port(name) {
        Ok(port) => Ok((port, name.to_string())),
        Err(first_err) => {
            for n in 2..10 {
                let candidate = format!("{name} ({n})");
                if let Ok(port) = seq.create_port(&candidate) {
                    return Ok((port, candidate));
                }
            }
            Err(first_err)
        }
    }
}

impl MidiPeer for LocalWorker {
    fn kind(&self) -> &'static str {
        "local:worker"
    }

    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        self.seq.write(self.port, data);
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": self.kind(),
            "name": self.name,
            "port": self.port,
        })
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for LocalWorker {
    fn drop(&mut self) {
        self.seq.remove_port(self.port);
    }
}
