//! Client connector: drives one peer from NOT_CONNECTED to CONNECTED
//! against an ordered list of endpoints.
//!
//! The connection sequence is a small explicit state machine
//! (resolve next name → try next address → control handshake → MIDI
//! handshake → steady state) so cancellation is just dropping the
//! state. Attempts are strictly sequential: one address at a time,
//! five seconds each, at most three full rounds over the endpoint
//! list before giving up with `CANT_CONNECT`.
//!
//! Once connected the client keeps the session alive with a CK0 every
//! ten seconds; thirty seconds without an answer tears the session
//! down with `CK_TIMEOUT`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::poller::{Reactor, Timer};
use crate::rtppeer::{DisconnectReason, PortKind, RtpPeer, Status};
use crate::signal::{Connection, Signal};
use crate::udppeer::UdpEndpoint;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CK_INTERVAL: Duration = Duration::from_secs(10);
const CK_WATCHDOG: Duration = Duration::from_secs(30);
const CONNECT_ROUNDS: u32 = 3;
const LOCAL_PORT_PAIR_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub hostname: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: impl Into<String>) -> Endpoint {
        Endpoint {
            hostname: hostname.into(),
            port: port.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitToStart,
    PrepareNextDns,
    ConnectNextIpPort,
    ConnectControl,
    ConnectMidi,
    DisconnectControl,
    AllConnected,
    ErrorCantConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Started,
    Resolved,
    ResolveFailed,
    ResolveListExhausted,
    Connected,
    ConnectFailed,
    ConnectListExhausted,
}

struct ClientState {
    state: State,
    endpoints: Vec<Endpoint>,
    pending: VecDeque<Endpoint>,
    rounds_left: u32,
    resolved: VecDeque<SocketAddr>,
    current: Option<Endpoint>,
    control: Option<UdpEndpoint>,
    midi: Option<UdpEndpoint>,
    remote_addr: Option<SocketAddr>,
    local_base_port: u16,
    connect_timer: Timer,
    ck_timer: Timer,
    ck_watchdog: Timer,
    /// Whether the most recent failed attempt died on the handshake
    /// deadline (rather than resolution or socket setup).
    handshake_timed_out: bool,
    connections: Vec<Connection>,
}

pub struct RtpClient {
    inner: Rc<ClientInner>,
}

pub struct ClientInner {
    reactor: Reactor,
    peer: Rc<RtpPeer>,
    state: RefCell<ClientState>,
    /// Fires with the remote name once the session reaches CONNECTED.
    pub connected_event: Signal<String>,
    /// Final disconnections, including CANT_CONNECT and CK_TIMEOUT.
    pub disconnected_event: Signal<DisconnectReason>,
}

impl RtpClient {
    pub fn new(reactor: &Reactor, local_name: impl Into<String>) -> RtpClient {
        let inner = Rc::new(ClientInner {
            reactor: reactor.clone(),
            peer: Rc::new(RtpPeer::new(local_name)),
            state: RefCell::new(ClientState {
                state: State::WaitToStart,
                endpoints: Vec::new(),
                pending: VecDeque::new(),
                rounds_left: CONNECT_ROUNDS,
                resolved: VecDeque::new(),
                current: None,
                control: None,
                midi: None,
                remote_addr: None,
                local_base_port: 0,
                connect_timer: Timer::disabled(),
                ck_timer: Timer::disabled(),
                ck_watchdog: Timer::disabled(),
                handshake_timed_out: false,
                connections: Vec::new(),
            }),
            connected_event: Signal::new(),
            disconnected_event: Signal::new(),
        });
        ClientInner::wire_peer(&inner);
        RtpClient { inner }
    }

    pub fn peer(&self) -> Rc<RtpPeer> {
        Rc::clone(&self.inner.peer)
    }

    pub fn connected_event(&self) -> &Signal<String> {
        &self.inner.connected_event
    }

    pub fn disconnected_event(&self) -> &Signal<DisconnectReason> {
        &self.inner.disconnected_event
    }

    /// Walk the endpoint list in order until one of them completes the
    /// session handshake or the list is exhausted three times over.
    pub fn connect_to(&self, endpoints: Vec<Endpoint>) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.endpoints = endpoints;
            st.pending = st.endpoints.iter().cloned().collect();
            st.rounds_left = CONNECT_ROUNDS;
        }
        ClientInner::state_machine(&self.inner, Event::Started);
    }

    /// Address of the remote control port, when connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().remote_addr
    }

    pub fn local_base_port(&self) -> u16 {
        self.inner.state.borrow().local_base_port
    }

    /// Tear the session down and stop all timers.
    pub fn disconnect(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.connect_timer.disable();
            st.ck_timer.disable();
            st.ck_watchdog.disable();
        }
        self.inner.peer.disconnect();
    }
}

impl Drop for RtpClient {
    fn drop(&mut self) {
        if self.inner.peer.status() != Status::NOT_CONNECTED {
            self.inner.peer.disconnect();
        }
    }
}

impl ClientInner {
    fn wire_peer(self_rc: &Rc<ClientInner>) {
        let mut connections = Vec::new();

        let weak = Rc::downgrade(self_rc);
        connections.push(self_rc.peer.send_event.connect(move |ev| {
            if let Some(client) = weak.upgrade() {
                client.sendto(&ev.data, ev.port);
            }
        }));

        let weak = Rc::downgrade(self_rc);
        connections.push(self_rc.peer.status_changed.connect(move |status| {
            if let Some(client) = weak.upgrade() {
                let state = client.state.borrow().state;
                match state {
                    State::ConnectControl if status.has_control() => {
                        ClientInner::state_machine(&client, Event::Connected);
                    }
                    State::ConnectMidi if status.is_connected() => {
                        ClientInner::state_machine(&client, Event::Connected);
                    }
                    _ => {}
                }
            }
        }));

        let weak = Rc::downgrade(self_rc);
        connections.push(self_rc.peer.disconnected.connect(move |reason| {
            if let Some(client) = weak.upgrade() {
                client.on_peer_disconnected(*reason);
            }
        }));

        let weak = Rc::downgrade(self_rc);
        connections.push(self_rc.peer.ck_measured.connect(move |_latency| {
            if let Some(client) = weak.upgrade() {
                client.rearm_ck_watchdog();
            }
        }));

        self_rc.state.borrow_mut().connections = connections;
    }

    /// The one transition function. Every edge of the connection
    /// diagram goes through here.
    fn state_machine(self_rc: &Rc<ClientInner>, event: Event) {
        let current = self_rc.state.borrow().state;
        debug!("client state {current:?} on {event:?}");
        match (current, event) {
            (State::WaitToStart, Event::Started) => Self::prepare_next_dns(self_rc),

            (State::PrepareNextDns, Event::Resolved) => Self::connect_next_ip_port(self_rc),
            (State::PrepareNextDns, Event::ResolveFailed) => Self::prepare_next_dns(self_rc),
            (State::PrepareNextDns, Event::ResolveListExhausted) => {
                Self::error_cant_connect(self_rc)
            }

            (State::ConnectNextIpPort, Event::ConnectListExhausted) => {
                Self::prepare_next_dns(self_rc)
            }
            (State::ConnectNextIpPort, Event::ConnectFailed) => {
                Self::connect_next_ip_port(self_rc)
            }

            (State::ConnectControl, Event::Connected) => Self::connect_midi(self_rc),
            (State::ConnectControl, Event::ConnectFailed) => {
                Self::abandon_attempt(self_rc);
                Self::connect_next_ip_port(self_rc);
            }

            (State::ConnectMidi, Event::Connected) => Self::all_connected(self_rc),
            (State::ConnectMidi, Event::ConnectFailed) => {
                Self::disconnect_control(self_rc);
                Self::connect_next_ip_port(self_rc);
            }

            (state, event) => debug!("ignoring {event:?} in state {state:?}"),
        }
    }

    fn prepare_next_dns(self_rc: &Rc<ClientInner>) {
        let endpoint = {
            let mut st = self_rc.state.borrow_mut();
            st.state = State::PrepareNextDns;
            if st.pending.is_empty() {
                if st.rounds_left <= 1 {
                    None
                } else {
                    st.rounds_left -= 1;
                    st.pending = st.endpoints.iter().cloned().collect();
                    st.pending.pop_front()
                }
            } else {
                st.pending.pop_front()
            }
        };

        let Some(endpoint) = endpoint else {
            Self::state_machine(self_rc, Event::ResolveListExhausted);
            return;
        };

        debug!("resolving {}:{}", endpoint.hostname, endpoint.port);
        let resolved: Vec<SocketAddr> =
            match format!("{}:{}", endpoint.hostname, endpoint.port).to_socket_addrs() {
                Ok(addrs) => addrs.collect(),
                Err(err) => {
                    warn!(
                        "can not resolve {}:{}: {err}",
                        endpoint.hostname, endpoint.port
                    );
                    Vec::new()
                }
            };

        {
            let mut st = self_rc.state.borrow_mut();
            st.current = Some(endpoint);
            st.resolved = resolved.into_iter().collect();
        }
        let event = if self_rc.state.borrow().resolved.is_empty() {
            Event::ResolveFailed
        } else {
            Event::Resolved
        };
        Self::state_machine(self_rc, event);
    }

    fn connect_next_ip_port(self_rc: &Rc<ClientInner>) {
        let addr = {
            let mut st = self_rc.state.borrow_mut();
            st.state = State::ConnectNextIpPort;
            st.resolved.pop_front()
        };
        let Some(addr) = addr else {
            Self::state_machine(self_rc, Event::ConnectListExhausted);
            return;
        };

        match Self::open_socket_pair(self_rc, addr) {
            Ok(()) => Self::connect_control(self_rc),
            Err(err) => {
                warn!("could not open local socket pair for {addr}: {err}");
                Self::state_machine(self_rc, Event::ConnectFailed);
            }
        }
    }

    /// Two consecutive local ports: control on a kernel-assigned port,
    /// MIDI on the next one. The pair is retried a few times since the
    /// neighbour port may be taken.
    fn open_socket_pair(self_rc: &Rc<ClientInner>, addr: SocketAddr) -> crate::error::Result<()> {
        let bind_host = if addr.is_ipv4() { "0.0.0.0" } else { "::" };
        let mut last_err = None;

        for _ in 0..LOCAL_PORT_PAIR_ATTEMPTS {
            let control = UdpEndpoint::open(&self_rc.reactor, bind_host, 0)?;
            let base_port = control.local_port();
            let midi = match UdpEndpoint::open(&self_rc.reactor, bind_host, base_port + 1) {
                Ok(midi) => midi,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };

            let mut st = self_rc.state.borrow_mut();
            let peer = Rc::clone(&self_rc.peer);
            st.connections.push(control.on_read().connect(move |ev| {
                peer.data_ready(&ev.data, PortKind::Control);
            }));
            let peer = Rc::clone(&self_rc.peer);
            st.connections.push(midi.on_read().connect(move |ev| {
                peer.data_ready(&ev.data, PortKind::Midi);
            }));

            st.local_base_port = base_port;
            st.remote_addr = Some(addr);
            st.control = Some(control);
            st.midi = Some(midi);
            return Ok(());
        }
        Err(last_err.expect("no attempt made"))
    }

    fn connect_control(self_rc: &Rc<ClientInner>) {
        {
            let mut st = self_rc.state.borrow_mut();
            st.state = State::ConnectControl;
            let weak = Rc::downgrade(self_rc);
            st.connect_timer = self_rc.reactor.add_timer(CONNECT_TIMEOUT, move || {
                if let Some(client) = weak.upgrade() {
                    debug!("handshake deadline expired");
                    client.state.borrow_mut().handshake_timed_out = true;
                    Self::state_machine(&client, Event::ConnectFailed);
                }
            });
        }
        self_rc.peer.connect_to(PortKind::Control);
    }

    fn connect_midi(self_rc: &Rc<ClientInner>) {
        self_rc.state.borrow_mut().state = State::ConnectMidi;
        self_rc.peer.connect_to(PortKind::Midi);
    }

    fn disconnect_control(self_rc: &Rc<ClientInner>) {
        self_rc.state.borrow_mut().state = State::DisconnectControl;
        // Control already answered; leave cleanly before moving on.
        self_rc.peer.disconnect();
        Self::abandon_attempt(self_rc);
    }

    fn abandon_attempt(self_rc: &Rc<ClientInner>) {
        let mut st = self_rc.state.borrow_mut();
        st.connect_timer.disable();
        st.control = None;
        st.midi = None;
    }

    fn all_connected(self_rc: &Rc<ClientInner>) {
        let remote_name = self_rc.peer.remote_name();
        {
            let st = self_rc.state.borrow();
            info!(
                "connected to '{}' ({:?}, resolved to {:?})",
                remote_name, st.current, st.remote_addr
            );
        }
        {
            let mut st = self_rc.state.borrow_mut();
            st.state = State::AllConnected;
            st.connect_timer.disable();
            st.rounds_left = CONNECT_ROUNDS;
        }
        Self::send_ck0_loop(self_rc);
        self_rc.rearm_ck_watchdog();
        self_rc.connected_event.emit(&remote_name);
    }

    fn error_cant_connect(self_rc: &Rc<ClientInner>) {
        warn!("could not connect to any endpoint, giving up");
        let timed_out = {
            let mut st = self_rc.state.borrow_mut();
            st.state = State::ErrorCantConnect;
            st.connect_timer.disable();
            st.control = None;
            st.midi = None;
            st.handshake_timed_out
        };
        let reason = if timed_out {
            DisconnectReason::ConnectTimeout
        } else {
            DisconnectReason::CantConnect
        };
        self_rc.disconnected_event.emit(&reason);
    }

    /// Keepalive: an unsolicited CK0 every ten seconds.
    fn send_ck0_loop(self_rc: &Rc<ClientInner>) {
        self_rc.peer.send_ck0();
        let weak = Rc::downgrade(self_rc);
        let timer = self_rc.reactor.add_timer(CK_INTERVAL, move || {
            if let Some(client) = weak.upgrade() {
                if client.state.borrow().state == State::AllConnected {
                    Self::send_ck0_loop(&client);
                }
            }
        });
        self_rc.state.borrow_mut().ck_timer = timer;
    }

    fn rearm_ck_watchdog(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let timer = self.reactor.add_timer(CK_WATCHDOG, move || {
            if let Some(client) = weak.upgrade() {
                client.ck_timed_out();
            }
        });
        self.state.borrow_mut().ck_watchdog = timer;
    }

    fn ck_timed_out(self: &Rc<Self>) {
        warn!(
            "no clock-sync answer from '{}' in {CK_WATCHDOG:?}, disconnecting",
            self.peer.remote_name()
        );
        {
            let mut st = self.state.borrow_mut();
            st.ck_timer.disable();
            st.ck_watchdog.disable();
        }
        self.peer.disconnect();
        self.disconnected_event.emit(&DisconnectReason::CkTimeout);
    }

    fn on_peer_disconnected(self: &Rc<Self>, reason: DisconnectReason) {
        let state = self.state.borrow().state;
        match state {
            // A rejection mid-handshake just moves to the next
            // candidate.
            State::ConnectControl | State::ConnectMidi
                if reason == DisconnectReason::ConnectionRejected =>
            {
                Self::state_machine(self, Event::ConnectFailed);
            }
            State::AllConnected => {
                let mut st = self.state.borrow_mut();
                st.ck_timer.disable();
                st.ck_watchdog.disable();
                drop(st);
                self.disconnected_event.emit(&reason);
            }
            _ => {}
        }
    }

    fn sendto(&self, data: &[u8], port: PortKind) {
        let (endpoint_missing, target) = {
            let st = self.state.borrow();
            let Some(remote) = st.remote_addr else {
                return;
            };
            let target_port = match port {
                PortKind::Control => remote.port(),
                PortKind::Midi => remote.port() + 1,
            };
            let mut target = remote;
            target.set_port(target_port);
            (
                match port {
                    PortKind::Control => st.control.is_none(),
                    PortKind::Midi => st.midi.is_none(),
                },
                target,
            )
        };
        if endpoint_missing {
            return;
        }

        let st = self.state.borrow();
        let socket = match port {
            PortKind::Control => st.control.as_ref(),
            PortKind::Midi => st.midi.as_ref(),
        };
        if let Some(socket) = socket {
            if let Err(err) = socket.send_to(data, target) {
                drop(st);
                warn!("network error sending to {target}: {err}");
                self.disconnected_event
                    .emit(&DisconnectReason::NetworkError);
            }
        }
    }
}
