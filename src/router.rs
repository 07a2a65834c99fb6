//! MIDI router: a directed multigraph of peers with fan-out delivery.
//!
//! The router is the only strong owner of its nodes. Every node gets a
//! [`PeerHandle`] at insertion, holding a weak back-reference and the
//! node's own id; nodes talk to the router exclusively through it.
//! Removing a node prunes every edge that touches it. A node that
//! wants to remove itself (or its neighbours) from inside a delivery
//! must defer the removal with `call_later` to escape the running call
//! stack.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use log::{debug, info, warn};
use rtpmidi_core::Signal;
use serde_json::json;

pub type PeerId = u32;

/// Lifecycle notifications delivered through [`MidiPeer::event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    ConnectedPeer,
    DisconnectedPeer,
}

/// Back-reference a node holds into the router that owns it.
#[derive(Clone)]
pub struct PeerHandle {
    router: Weak<MidiRouter>,
    id: PeerId,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn router(&self) -> Option<Rc<MidiRouter>> {
        self.router.upgrade()
    }

    /// Fan out `data` from this node to its edge targets.
    pub fn send(&self, data: &Bytes) {
        if let Some(router) = self.router.upgrade() {
            router.send_midi(self.id, data);
        }
    }
}

/// Any node that can sit in the router graph.
pub trait MidiPeer: 'static {
    /// Short machine-readable kind, e.g. `"network:listener"`.
    fn kind(&self) -> &'static str;

    /// Deliver MIDI bytes coming from `from`. Implementations may call
    /// back into the router synchronously to forward downstream.
    fn send_midi(&self, from: PeerId, data: &Bytes);

    /// Self-description for the control plane.
    fn status(&self) -> serde_json::Value;

    /// Edge lifecycle notification; most peers do not care.
    fn event(&self, _event: PeerEvent, _peer: PeerId) {}

    /// Called once when the node is inserted into the router.
    fn attach(&self, handle: PeerHandle);

    fn as_any(&self) -> &dyn Any;
}

struct PeerEntry {
    peer: Rc<dyn MidiPeer>,
    send_to: Vec<PeerId>,
    packets_sent: Cell<u32>,
    packets_recv: Cell<u32>,
}

pub struct MidiRouter {
    peers: RefCell<BTreeMap<PeerId, PeerEntry>>,
    next_id: Cell<PeerId>,
    pub peer_added: Signal<PeerId>,
    pub peer_removed: Signal<PeerId>,
}

impl MidiRouter {
    pub fn new() -> Rc<MidiRouter> {
        Rc::new(MidiRouter {
            peers: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            peer_added: Signal::new(),
            peer_removed: Signal::new(),
        })
    }

    /// Insert a node, returning its id. Ids start at 1 and are never
    /// reused within a run.
    pub fn add_peer(self: &Rc<Self>, peer: Rc<dyn MidiPeer>) -> PeerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        self.peers.borrow_mut().insert(
            id,
            PeerEntry {
                peer: Rc::clone(&peer),
                send_to: Vec::new(),
                packets_sent: Cell::new(0),
                packets_recv: Cell::new(0),
            },
        );
        peer.attach(PeerHandle {
            router: Rc::downgrade(self),
            id,
        });
        info!("added peer {id} ({})", peer.kind());
        self.peer_added.emit(&id);
        id
    }

    /// Drop a node and prune every edge whose source or destination it
    /// is. Idempotent.
    pub fn remove_peer(&self, id: PeerId) {
        let removed = {
            let mut peers = self.peers.borrow_mut();
            let removed = peers.remove(&id);
            if removed.is_some() {
                for entry in peers.values_mut() {
                    entry.send_to.retain(|to| *to != id);
                }
            }
            removed
        };

        if let Some(entry) = removed {
            // Tell the node's former neighbours their edge is gone.
            for to in &entry.send_to {
                if let Some(peer) = self.get_peer(*to) {
                    peer.event(PeerEvent::DisconnectedPeer, id);
                }
            }
            entry.peer.event(PeerEvent::DisconnectedPeer, id);
            info!("removed peer {id}");
            self.peer_removed.emit(&id);
        }
    }

    pub fn get_peer(&self, id: PeerId) -> Option<Rc<dyn MidiPeer>> {
        self.peers.borrow().get(&id).map(|entry| Rc::clone(&entry.peer))
    }

    /// Add the directed edge `from → to`; duplicates are suppressed.
    pub fn connect(&self, from: PeerId, to: PeerId) {
        {
            let mut peers = self.peers.borrow_mut();
            if !peers.contains_key(&from) || !peers.contains_key(&to) {
                warn!("can not connect unknown peers {from} -> {to}");
                return;
            }
            let entry = peers.get_mut(&from).unwrap();
            if entry.send_to.contains(&to) {
                return;
            }
            entry.send_to.push(to);
        }
        debug!("connect {from} -> {to}");
        if let Some(peer) = self.get_peer(from) {
            peer.event(PeerEvent::ConnectedPeer, to);
        }
        if let Some(peer) = self.get_peer(to) {
            peer.event(PeerEvent::ConnectedPeer, from);
        }
    }

    /// Remove the edge `from → to` when present.
    pub fn disconnect(&self, from: PeerId, to: PeerId) {
        let removed = {
            let mut peers = self.peers.borrow_mut();
            match peers.get_mut(&from) {
                Some(entry) => {
                    let before = entry.send_to.len();
                    entry.send_to.retain(|t| *t != to);
                    before != entry.send_to.len()
                }
                None => false,
            }
        };
        if removed {
            debug!("disconnect {from} -> {to}");
            if let Some(peer) = self.get_peer(from) {
                peer.event(PeerEvent::DisconnectedPeer, to);
            }
            if let Some(peer) = self.get_peer(to) {
                peer.event(PeerEvent::DisconnectedPeer, from);
            }
        }
    }

    /// Fan out to every edge destination of `from`, in insertion
    /// order.
    pub fn send_midi(&self, from: PeerId, data: &Bytes) {
        let targets = {
            let peers = self.peers.borrow();
            let Some(entry) = peers.get(&from) else {
                warn!("sending from an unknown peer {from}");
                return;
            };
            entry.packets_sent.set(entry.packets_sent.get() + 1);
            entry.send_to.clone()
        };
        for to in targets {
            self.send_midi_to(from, to, data);
        }
    }

    /// Directed delivery to one node, bypassing the edge list. Used by
    /// nodes that keep their own per-destination map.
    pub fn send_midi_to(&self, from: PeerId, to: PeerId, data: &Bytes) {
        let peer = {
            let peers = self.peers.borrow();
            let Some(entry) = peers.get(&to) else {
                warn!("sending to an unknown peer {to}");
                return;
            };
            entry.packets_recv.set(entry.packets_recv.get() + 1);
            Rc::clone(&entry.peer)
        };
        peer.send_midi(from, data);
    }

    /// Typed iteration for the control plane; the visitor sees only
    /// nodes of the requested concrete type.
    pub fn for_each_peer<T: MidiPeer>(&self, mut f: impl FnMut(PeerId, &T)) {
        let snapshot: Vec<(PeerId, Rc<dyn MidiPeer>)> = self
            .peers
            .borrow()
            .iter()
            .map(|(id, entry)| (*id, Rc::clone(&entry.peer)))
            .collect();
        for (id, peer) in snapshot {
            if let Some(typed) = peer.as_any().downcast_ref::<T>() {
                f(id, typed);
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.borrow().len()
    }

    /// Current edge targets of `id`.
    pub fn edges_of(&self, id: PeerId) -> Vec<PeerId> {
        self.peers
            .borrow()
            .get(&id)
            .map(|entry| entry.send_to.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> serde_json::Value {
        let snapshot: Vec<(PeerId, Rc<dyn MidiPeer>, Vec<PeerId>, u32, u32)> = self
            .peers
            .borrow()
            .iter()
            .map(|(id, entry)| {
                (
                    *id,
                    Rc::clone(&entry.peer),
                    entry.send_to.clone(),
                    entry.packets_sent.get(),
                    entry.packets_recv.get(),
                )
            })
            .collect();

        let peers: Vec<serde_json::Value> = snapshot
            .into_iter()
            .map(|(id, peer, send_to, sent, recv)| {
                let mut status = peer.status();
                if let Some(map) = status.as_object_mut() {
                    map.insert("id".into(), json!(id));
                    map.insert("send_to".into(), json!(send_to));
                    map.insert("stats".into(), json!({ "sent": sent, "recv": recv }));
                }
                status
            })
            .collect();
        json!(peers)
    }
}
