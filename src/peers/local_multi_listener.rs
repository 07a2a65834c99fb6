//! The shared local port (usually named after the daemon). Every
//! external subscriber gets its own announced network listener,
//! found by name and shared through the listener's use count, so two
//! subscribers with the same name land on one socket pair.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::Connection;
use serde_json::json;

use crate::mdns::MdnsService;
use crate::router::{MidiPeer, PeerHandle, PeerId};
use crate::sequencer::{SeqPortId, Sequencer, SubscriberInfo};

use super::{new_shared_handle, NetworkListener, SharedHandle};

pub struct LocalMultiListener {
    reactor: Reactor,
    seq: Rc<dyn Sequencer>,
    mdns: Option<MdnsService>,
    name: String,
    port: SeqPortId,
    /// subscriber port → router id of its network listener.
    subscribers: RefCell<HashMap<SeqPortId, PeerId>>,
    handle: SharedHandle,
    _connections: RefCell<Vec<Connection>>,
}

impl LocalMultiListener {
    pub fn new(
        reactor: &Reactor,
        seq: Rc<dyn Sequencer>,
        name: &str,
        mdns: Option<MdnsService>,
    ) -> Result<Rc<LocalMultiListener>> {
        let port = seq.create_port(name)?;
        let listener = Rc::new(LocalMultiListener {
            reactor: reactor.clone(),
            seq: Rc::clone(&seq),
            mdns,
            name: name.to_string(),
            port,
            subscribers: RefCell::new(HashMap::new()),
            handle: new_shared_handle(),
            _connections: RefCell::new(Vec::new()),
        });

        let mut connections = Vec::new();
        if let Some(signals) = seq.signals(port) {
            let weak = Rc::downgrade(&listener);
            connections.push(signals.subscribed.connect(move |sub| {
                if let Some(listener) = weak.upgrade() {
                    listener.on_subscribed(sub);
                }
            }));
            let weak = Rc::downgrade(&listener);
            connections.push(signals.unsubscribed.connect(move |sub| {
                if let Some(listener) = weak.upgrade() {
                    listener.on_unsubscribed(sub.port);
                }
            }));
            let weak = Rc::downgrade(&listener);
            connections.push(signals.midi.connect(move |ev| {
                if let Some(listener) = weak.upgrade() {
                    listener.on_midi(ev.source, &ev.data);
                }
            }));
        }
        *listener._connections.borrow_mut() = connections;

        Ok(listener)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn on_subscribed(&self, sub: &SubscriberInfo) {
        let Some(handle) = self.handle.borrow().clone() else {
            return;
        };
        let Some(router) = handle.router() else {
            return;
        };
        info!(
            "'{}' subscribed to '{}', exporting it on the network",
            sub.name, self.name
        );

        // Share an existing listener with the same name.
        let mut existing = None;
        router.for_each_peer::<NetworkListener>(|id, listener| {
            if listener.name() == sub.name {
                existing = Some(id);
            }
        });
        if let Some(id) = existing {
            if let Some(peer) = router.get_peer(id) {
                if let Some(listener) = peer.as_any().downcast_ref::<NetworkListener>() {
                    let count = listener.retain();
                    debug!("one more user for listener {id}, count {count}");
                }
            }
            self.subscribers.borrow_mut().insert(sub.port, id);
            return;
        }

        let listener = match NetworkListener::new(&self.reactor, &sub.name, 0, self.mdns.clone()) {
            Ok(listener) => listener,
            Err(err) => {
                warn!("can not export '{}': {err}", sub.name);
                return;
            }
        };
        let listener_id = router.add_peer(listener);
        router.connect(listener_id, handle.id());
        self.subscribers.borrow_mut().insert(sub.port, listener_id);
    }

    fn on_unsubscribed(&self, subscriber: SeqPortId) {
        let listener_id = self.subscribers.borrow_mut().remove(&subscriber);
        let Some(listener_id) = listener_id else {
            debug!("unsubscribe from unknown subscriber {subscriber}");
            return;
        };
        let handle = self.handle.borrow();
        let Some(router) = handle.as_ref().and_then(|h| h.router()) else {
            return;
        };
        let Some(peer) = router.get_peer(listener_id) else {
            return;
        };
        let Some(listener) = peer.as_any().downcast_ref::<NetworkListener>() else {
            return;
        };
        let count = listener.release();
        info!("one less user of listener {listener_id}, count {count}");
        if count <= 0 {
            router.remove_peer(listener_id);
        }
    }

    /// Bytes a subscriber played into our port go to that
    /// subscriber's own listener, not to the whole graph.
    fn on_midi(&self, source: SeqPortId, data: &Bytes) {
        let target = self.subscribers.borrow().get(&source).copied();
        let handle = self.handle.borrow();
        let Some(handle) = handle.as_ref() else { return };
        let Some(router) = handle.router() else { return };
        match target {
            Some(target) => router.send_midi_to(handle.id(), target, data),
            None => warn!("MIDI from unknown subscriber {source}"),
        }
    }
}

impl MidiPeer for LocalMultiListener {
    fn kind(&self) -> &'static str {
        "local:multi:listener"
    }

    /// Deliveries go back to the one subscriber whose listener sent
    /// them.
    fn send_midi(&self, from: PeerId, data: &Bytes) {
        let subscribers = self.subscribers.borrow();
        for (subscriber, listener_id) in subscribers.iter() {
            if *listener_id == from {
                self.seq.write_to(self.port, *subscriber, data);
            }
        }
    }

    fn status(&self) -> serde_json::Value {
        let connections: Vec<serde_json::Value> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(subscriber, listener)| {
                json!({ "subscriber": subscriber, "listener": listener })
            })
            .collect();
        json!({
            "type": self.kind(),
            "name": self.name,
            "connections": connections,
        })
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for LocalMultiListener {
    fn drop(&mut self) {
        self.seq.remove_port(self.port);
    }
}
