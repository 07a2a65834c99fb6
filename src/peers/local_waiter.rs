//! Local waiter: a sequencer port standing in for a named remote.
//! Nothing is connected until somebody subscribes to the port; the
//! first subscription spins up a client connector toward the remote's
//! endpoint list, the last unsubscription tears it down again.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use rtpmidi_core::poller::Reactor;
use rtpmidi_core::rtpclient::{Endpoint, RtpClient};
use rtpmidi_core::Connection;
use serde_json::json;

use crate::router::{MidiPeer, PeerHandle, PeerId};
use crate::sequencer::{SeqPortId, Sequencer};

use super::{new_shared_handle, NetworkClientPeer, SharedHandle};

pub struct LocalWaiter {
    reactor: Reactor,
    seq: Rc<dyn Sequencer>,
    remote_name: String,
    port: SeqPortId,
    endpoints: RefCell<Vec<Endpoint>>,
    connection_count: Cell<i32>,
    /// Router id of the live client worker node; 0 when idle.
    client_worker: Cell<PeerId>,
    handle: SharedHandle,
    _connections: RefCell<Vec<Connection>>,
    /// Connections that live only while a client connector does.
    client_connections: RefCell<Vec<Connection>>,
}

impl LocalWaiter {
    pub fn new(
        reactor: &Reactor,
        seq: Rc<dyn Sequencer>,
        remote_name: &str,
        hostname: &str,
        port: &str,
    ) -> Result<Rc<LocalWaiter>> {
        let seq_port = seq.create_port(remote_name)?;
        let handle = new_shared_handle();

        let waiter = Rc::new(LocalWaiter {
            reactor: reactor.clone(),
            seq: Rc::clone(&seq),
            remote_name: remote_name.to_string(),
            port: seq_port,
            endpoints: RefCell::new(vec![Endpoint::new(hostname, port)]),
            connection_count: Cell::new(0),
            client_worker: Cell::new(0),
            handle,
            _connections: RefCell::new(Vec::new()),
            client_connections: RefCell::new(Vec::new()),
        });

        let mut connections = Vec::new();
        if let Some(signals) = seq.signals(seq_port) {
            let weak = Rc::downgrade(&waiter);
            connections.push(signals.subscribed.connect(move |sub| {
                if let Some(waiter) = weak.upgrade() {
                    waiter.on_subscribed(&sub.name);
                }
            }));
            let weak = Rc::downgrade(&waiter);
            connections.push(signals.unsubscribed.connect(move |_sub| {
                if let Some(waiter) = weak.upgrade() {
                    waiter.on_unsubscribed();
                }
            }));
            let weak = Rc::downgrade(&waiter);
            connections.push(signals.midi.connect(move |ev| {
                if let Some(waiter) = weak.upgrade() {
                    let handle = waiter.handle.borrow();
                    if let Some(handle) = handle.as_ref() {
                        handle.send(&ev.data);
                    }
                }
            }));
        }
        *waiter._connections.borrow_mut() = connections;

        Ok(waiter)
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Another address for the same advertised name (several network
    /// interfaces, or a service moving hosts).
    pub fn add_endpoint(&self, hostname: &str, port: &str) {
        let endpoint = Endpoint::new(hostname, port);
        let mut endpoints = self.endpoints.borrow_mut();
        if endpoints.contains(&endpoint) {
            warn!(
                "endpoint {hostname}:{port} for '{}' already known, ignoring",
                self.remote_name
            );
            return;
        }
        debug!("added endpoint {hostname}:{port} for '{}'", self.remote_name);
        endpoints.push(endpoint);
    }

    fn on_subscribed(self: &Rc<Self>, subscriber_name: &str) {
        let count = self.connection_count.get() + 1;
        self.connection_count.set(count);
        if count != 1 {
            return;
        }
        info!(
            "'{subscriber_name}' subscribed; connecting to remote '{}'",
            self.remote_name
        );
        self.connect_to_remote();
    }

    fn on_unsubscribed(self: &Rc<Self>) {
        let count = self.connection_count.get() - 1;
        self.connection_count.set(count.max(0));
        if count > 0 {
            return;
        }
        self.disconnect_from_remote();
    }

    fn connect_to_remote(self: &Rc<Self>) {
        let endpoints = self.endpoints.borrow().clone();
        if endpoints.is_empty() {
            warn!("no endpoints for '{}', can not connect", self.remote_name);
            self.connection_count.set(0);
            return;
        }
        let Some(handle) = self.handle.borrow().clone() else {
            return;
        };
        let Some(router) = handle.router() else {
            return;
        };

        let client = RtpClient::new(&self.reactor, self.remote_name.clone());

        // A final connection failure resets the waiter so the next
        // subscription retries from scratch.
        let weak = Rc::downgrade(self);
        let failed = client.disconnected_event().connect(move |reason| {
            if let Some(waiter) = weak.upgrade() {
                warn!(
                    "connection to '{}' ended: {reason}",
                    waiter.remote_name
                );
                let weak2 = Rc::downgrade(&waiter);
                waiter.reactor.call_later(move || {
                    if let Some(waiter) = weak2.upgrade() {
                        waiter.connection_count.set(0);
                        waiter.disconnect_from_remote();
                    }
                });
            }
        });
        self.client_connections.borrow_mut().push(failed);

        let worker = NetworkClientPeer::new(client);
        let worker_id = router.add_peer(worker.clone());
        self.client_worker.set(worker_id);
        router.connect(worker_id, handle.id());
        router.connect(handle.id(), worker_id);

        worker.client().connect_to(endpoints);
    }

    fn disconnect_from_remote(&self) {
        let worker_id = self.client_worker.replace(0);
        self.client_connections.borrow_mut().clear();
        if worker_id == 0 {
            return;
        }
        debug!("tearing down client for '{}'", self.remote_name);
        let handle = self.handle.borrow();
        if let Some(handle) = handle.as_ref() {
            if let Some(router) = handle.router() {
                router.remove_peer(worker_id);
            }
        }
    }
}

impl MidiPeer for LocalWaiter {
    fn kind(&self) -> &'static str {
        "local:waiter"
    }

    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        self.seq.write(self.port, data);
    }

    fn status(&self) -> serde_json::Value {
        let endpoints: Vec<serde_json::Value> = self
            .endpoints
            .borrow()
            .iter()
            .map(|e| json!({ "hostname": e.hostname, "port": e.port }))
            .collect();
        json!({
            "type": self.kind(),
            "name": self.remote_name,
            "endpoints": endpoints,
            "connection_count": self.connection_count.get(),
            "status": if self.connection_count.get() > 0 { "CONNECTED" } else { "WAITING" },
        })
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for LocalWaiter {
    fn drop(&mut self) {
        self.seq.remove_port(self.port);
    }
}
