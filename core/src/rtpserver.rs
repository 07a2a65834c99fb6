//! Server listener: one pair of UDP ports shared by any number of
//! concurrent remote peers.
//!
//! Incoming packets are demultiplexed to per-remote peer sessions by
//! initiator token (command packets) or SSRC (clock sync, feedback and
//! MIDI packets). An `IN` from an unknown initiator creates a new
//! peer, bound to the source address the invitation came from. Peers
//! leave the table when their session closes, via a deferred call so a
//! peer is never destroyed while one of its own signals is running.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};

use crate::command;
use crate::error::Result;
use crate::iobuf::Reader;
use crate::poller::{Reactor, Timer};
use crate::rtppeer::{PortKind, RtpPeer, Status};
use crate::signal::{Connection, Signal};
use crate::udppeer::UdpEndpoint;

/// A remote that stops syncing its clock for this long is gone.
const PEER_CK_TIMEOUT: Duration = Duration::from_secs(60);

struct ServerPeer {
    id: u32,
    peer: Rc<RtpPeer>,
    /// Source address of the invitation, port normalized to the
    /// remote's control port.
    control_addr: SocketAddr,
    use_count: i32,
    ck_timeout: Timer,
    _connections: Vec<Connection>,
}

struct ServerState {
    peers: Vec<ServerPeer>,
    next_id: u32,
}

pub struct ServerInner {
    reactor: Reactor,
    name: String,
    // Shared with the per-peer send slots so goodbyes still go out
    // while the server itself is being torn down.
    control: Rc<UdpEndpoint>,
    midi: Rc<UdpEndpoint>,
    state: RefCell<ServerState>,
    /// A remote peer completed the handshake.
    pub connected_event: Signal<Rc<RtpPeer>>,
    /// MIDI received from any of the connected peers.
    pub midi_event: Signal<Bytes>,
    _socket_connections: RefCell<Vec<Connection>>,
}

pub struct RtpServer {
    inner: Rc<ServerInner>,
}

impl RtpServer {
    /// Bind the control socket at `port` (0 for a kernel-chosen one)
    /// and the MIDI socket right above it.
    pub fn new(reactor: &Reactor, name: impl Into<String>, port: u16) -> Result<RtpServer> {
        let (control, midi) = open_port_pair(reactor, port)?;
        let name = name.into();
        info!(
            "listening for RTP-MIDI connections at 0.0.0.0:{} with name '{}'",
            control.local_port(),
            name
        );

        let inner = Rc::new(ServerInner {
            reactor: reactor.clone(),
            name,
            control: Rc::new(control),
            midi: Rc::new(midi),
            state: RefCell::new(ServerState {
                peers: Vec::new(),
                next_id: 1,
            }),
            connected_event: Signal::new(),
            midi_event: Signal::new(),
            _socket_connections: RefCell::new(Vec::new()),
        });

        let mut connections = Vec::new();
        let weak = Rc::downgrade(&inner);
        connections.push(inner.control.on_read().connect(move |ev| {
            if let Some(server) = weak.upgrade() {
                server.data_ready(&ev.data, ev.source, PortKind::Control);
            }
        }));
        let weak = Rc::downgrade(&inner);
        connections.push(inner.midi.on_read().connect(move |ev| {
            if let Some(server) = weak.upgrade() {
                server.data_ready(&ev.data, ev.source, PortKind::Midi);
            }
        }));
        *inner._socket_connections.borrow_mut() = connections;

        Ok(RtpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn control_port(&self) -> u16 {
        self.inner.control.local_port()
    }

    pub fn midi_port(&self) -> u16 {
        self.inner.midi.local_port()
    }

    pub fn connected_event(&self) -> &Signal<Rc<RtpPeer>> {
        &self.inner.connected_event
    }

    pub fn midi_event(&self) -> &Signal<Bytes> {
        &self.inner.midi_event
    }

    pub fn send_midi_to_all_peers(&self, data: &[u8]) {
        let peers: Vec<Rc<RtpPeer>> = self
            .inner
            .state
            .borrow()
            .peers
            .iter()
            .map(|entry| Rc::clone(&entry.peer))
            .collect();
        for peer in peers {
            peer.send_midi(data);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.state.borrow().peers.len()
    }

    pub fn for_each_peer(&self, mut f: impl FnMut(&Rc<RtpPeer>)) {
        let peers: Vec<Rc<RtpPeer>> = self
            .inner
            .state
            .borrow()
            .peers
            .iter()
            .map(|entry| Rc::clone(&entry.peer))
            .collect();
        for peer in &peers {
            f(peer);
        }
    }

    /// Another local subscriber shares this network peer.
    pub fn retain_peer(&self, ssrc: u32) {
        let mut st = self.inner.state.borrow_mut();
        if let Some(entry) = st.peers.iter_mut().find(|e| e.peer.remote_ssrc() == ssrc) {
            entry.use_count += 1;
        }
    }

    /// Drop one use of the peer; the last release disconnects it after
    /// the current call stack unwinds.
    pub fn release_peer(&self, ssrc: u32) {
        let mut remove_id = None;
        {
            let mut st = self.inner.state.borrow_mut();
            if let Some(entry) = st.peers.iter_mut().find(|e| e.peer.remote_ssrc() == ssrc) {
                entry.use_count -= 1;
                if entry.use_count <= 0 {
                    remove_id = Some(entry.id);
                }
            }
        }
        if let Some(id) = remove_id {
            let weak = Rc::downgrade(&self.inner);
            self.inner.reactor.call_later(move || {
                if let Some(server) = weak.upgrade() {
                    server.remove_peer(id, true);
                }
            });
        }
    }
}

fn open_port_pair(reactor: &Reactor, port: u16) -> Result<(UdpEndpoint, UdpEndpoint)> {
    if port != 0 {
        let control = UdpEndpoint::open(reactor, "0.0.0.0", port)?;
        let midi = UdpEndpoint::open(reactor, "0.0.0.0", port + 1)?;
        return Ok((control, midi));
    }
    // Kernel-assigned: ask for a random port and hope its neighbour is
    // free too, a few times over.
    let mut last_err = None;
    for _ in 0..10 {
        let control = UdpEndpoint::open(reactor, "0.0.0.0", 0)?;
        match UdpEndpoint::open(reactor, "0.0.0.0", control.local_port() + 1) {
            Ok(midi) => return Ok((control, midi)),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.expect("no bind attempted"))
}

impl ServerInner {
    fn data_ready(self: &Rc<Self>, data: &Bytes, source: SocketAddr, port: PortKind) {
        let peer = self.peer_for_packet(data, port);
        match peer {
            Some(peer) => {
                self.rearm_ck_timeout(&peer);
                peer.data_ready(data, port);
            }
            None => {
                if command::is_command(data) && data[2] == b'I' && data[3] == b'N' {
                    self.create_peer_from(data, source, port);
                } else {
                    debug!(
                        "packet from unknown peer {source} on {port} port ({} bytes), ignoring",
                        data.len()
                    );
                }
            }
        }
    }

    /// Demultiplex: commands carry the initiator token at offset 8,
    /// except CK/RS which carry the SSRC at offset 4; MIDI packets
    /// carry the SSRC at offset 8.
    fn peer_for_packet(&self, data: &Bytes, port: PortKind) -> Option<Rc<RtpPeer>> {
        if command::is_command(data) {
            let code = ((data[2] as u16) << 8) | data[3] as u16;
            let mut r = Reader::new(data);
            match code {
                command::CMD_IN | command::CMD_OK | command::CMD_BY | command::CMD_NO => {
                    r.seek(8).ok()?;
                    let initiator = r.read_u32().ok()?;
                    self.peer_by_initiator(initiator)
                }
                command::CMD_CK | command::CMD_RS => {
                    r.seek(4).ok()?;
                    let ssrc = r.read_u32().ok()?;
                    self.peer_by_ssrc(ssrc)
                }
                _ => None,
            }
        } else if port == PortKind::Midi && data.len() >= 12 && data[1] & 0x7f == 0x61 {
            let mut r = Reader::new(data);
            r.seek(8).ok()?;
            let ssrc = r.read_u32().ok()?;
            self.peer_by_ssrc(ssrc)
        } else {
            None
        }
    }

    fn peer_by_initiator(&self, initiator: u32) -> Option<Rc<RtpPeer>> {
        self.state
            .borrow()
            .peers
            .iter()
            .find(|entry| entry.peer.initiator_id() == initiator)
            .map(|entry| Rc::clone(&entry.peer))
    }

    fn peer_by_ssrc(&self, ssrc: u32) -> Option<Rc<RtpPeer>> {
        self.state
            .borrow()
            .peers
            .iter()
            .find(|entry| entry.peer.remote_ssrc() == ssrc)
            .map(|entry| Rc::clone(&entry.peer))
    }

    fn create_peer_from(self: &Rc<Self>, data: &Bytes, source: SocketAddr, port: PortKind) {
        let peer = Rc::new(RtpPeer::new(self.name.clone()));
        // The remote sends from its own consecutive pair; normalize to
        // its control port so replies target the right neighbour.
        let mut control_addr = source;
        if port == PortKind::Midi {
            control_addr.set_port(source.port().saturating_sub(1));
        }
        debug!("new invitation from {control_addr} on {port} port");

        let id = {
            let mut st = self.state.borrow_mut();
            let id = st.next_id;
            st.next_id += 1;
            id
        };

        let mut connections = Vec::new();

        // The send path captures the sockets directly, not the server:
        // a peer dropped during server teardown still delivers its BY.
        let control = Rc::clone(&self.control);
        let midi = Rc::clone(&self.midi);
        connections.push(peer.send_event.connect(move |ev| {
            send_to_remote(&control, &midi, &ev.data, control_addr, ev.port);
        }));

        let weak = Rc::downgrade(self);
        let weak_peer = Rc::downgrade(&peer);
        connections.push(peer.status_changed.connect(move |status| {
            let Some(server) = weak.upgrade() else { return };
            let Some(peer) = weak_peer.upgrade() else { return };
            if status.is_connected() {
                server.connected_event.emit(&peer);
            } else if *status == Status::NOT_CONNECTED {
                // Both ports said goodbye; drop the entry once this
                // emission unwinds.
                let weak = Rc::downgrade(&server);
                server.reactor.call_later(move || {
                    if let Some(server) = weak.upgrade() {
                        server.remove_peer(id, false);
                    }
                });
            }
        }));

        let weak = Rc::downgrade(self);
        connections.push(peer.midi_received.connect(move |data| {
            if let Some(server) = weak.upgrade() {
                server.midi_event.emit(data);
            }
        }));

        self.state.borrow_mut().peers.push(ServerPeer {
            id,
            peer: Rc::clone(&peer),
            control_addr,
            use_count: 0,
            ck_timeout: Timer::disabled(),
            _connections: connections,
        });

        self.rearm_ck_timeout(&peer);
        peer.data_ready(data, port);
    }

    fn rearm_ck_timeout(self: &Rc<Self>, peer: &Rc<RtpPeer>) {
        let ssrc = peer.local_ssrc();
        let mut st = self.state.borrow_mut();
        let Some(entry) = st.peers.iter_mut().find(|e| e.peer.local_ssrc() == ssrc) else {
            return;
        };
        let id = entry.id;
        let weak = Rc::downgrade(self);
        entry.ck_timeout = self.reactor.add_timer(PEER_CK_TIMEOUT, move || {
            if let Some(server) = weak.upgrade() {
                warn!("peer went silent, removing it");
                server.remove_peer(id, true);
            }
        });
    }

    fn remove_peer(&self, id: u32, disconnect: bool) {
        let entry = {
            let mut st = self.state.borrow_mut();
            let index = st.peers.iter().position(|entry| entry.id == id);
            index.map(|index| st.peers.remove(index))
        };
        if let Some(mut entry) = entry {
            info!(
                "removing server peer '{}' at {}",
                entry.peer.remote_name(),
                entry.control_addr
            );
            entry.ck_timeout.disable();
            if disconnect {
                entry.peer.disconnect();
            }
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        // Every remote still in session gets its goodbyes now, while
        // the socket pair is certainly alive.
        let peers: Vec<Rc<RtpPeer>> = self
            .state
            .borrow()
            .peers
            .iter()
            .map(|entry| Rc::clone(&entry.peer))
            .collect();
        for peer in peers {
            peer.disconnect();
        }
    }
}

fn send_to_remote(
    control: &UdpEndpoint,
    midi: &UdpEndpoint,
    data: &[u8],
    control_addr: SocketAddr,
    port: PortKind,
) {
    let mut target = control_addr;
    let (socket, target_port) = match port {
        PortKind::Control => (control, control_addr.port()),
        PortKind::Midi => (midi, control_addr.port() + 1),
    };
    target.set_port(target_port);
    if let Err(err) = socket.send_to(data, target) {
        warn!("could not send to {target}: {err}");
    }
}
