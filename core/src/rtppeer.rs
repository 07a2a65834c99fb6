//! One RTP-MIDI session endpoint.
//!
//! The peer is transport-agnostic: whoever owns it (client connector,
//! server listener, tests) feeds raw datagrams into
//! [`RtpPeer::data_ready`] and wires the [`RtpPeer::send_event`]
//! signal to its sockets. The same state machine serves both sides of
//! the handshake.
//!
//! Internal state lives behind a `RefCell`; signal emission happens
//! only after the borrow ends, so a slot may feed data straight back
//! into the emitting peer (the loopback wiring the tests use).

use std::cell::RefCell;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::codec::MidiListParser;
use crate::command::{self, SessionCommand};
use crate::error::{Error, Result};
use crate::iobuf::{Reader, Writer};
use crate::journal::{ReceiveJournal, SendJournal};
use crate::signal::Signal;
use crate::stats::{AverageAndStddev, Stats};

/// RTP payload type for MIDI. We send the low form for
/// interoperability with common Windows clients; both forms are
/// accepted on input.
pub const MIDI_PAYLOAD_TYPE: u8 = 0x61;

const MAX_MIDI_PAYLOAD: usize = 0x0fff;
const NOT_CONNECTED_WARN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Midi,
    Control,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Midi => write!(f, "MIDI"),
            PortKind::Control => write!(f, "Control"),
        }
    }
}

/// Connection status as a bitset of the two ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u8);

impl Status {
    pub const NOT_CONNECTED: Status = Status(0);
    pub const CONTROL_CONNECTED: Status = Status(1);
    pub const MIDI_CONNECTED: Status = Status(2);
    pub const CONNECTED: Status = Status(3);

    fn port_bit(port: PortKind) -> u8 {
        match port {
            PortKind::Control => 1,
            PortKind::Midi => 2,
        }
    }

    fn with(self, port: PortKind) -> Status {
        Status(self.0 | Self::port_bit(port))
    }

    fn without(self, port: PortKind) -> Status {
        Status(self.0 & !Self::port_bit(port))
    }

    pub fn has_control(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn has_midi(self) -> bool {
        self.0 & 2 != 0
    }

    pub fn is_connected(self) -> bool {
        self == Status::CONNECTED
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Status::NOT_CONNECTED => "NOT_CONNECTED",
            Status::CONTROL_CONNECTED => "CONTROL_CONNECTED",
            Status::MIDI_CONNECTED => "MIDI_CONNECTED",
            Status::CONNECTED => "CONNECTED",
            _ => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    CantConnect,
    PeerDisconnected,
    ConnectionRejected,
    Disconnect,
    ConnectTimeout,
    CkTimeout,
    NetworkError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::CantConnect => "CANT_CONNECT",
            DisconnectReason::PeerDisconnected => "PEER_DISCONNECTED",
            DisconnectReason::ConnectionRejected => "CONNECTION_REJECTED",
            DisconnectReason::Disconnect => "DISCONNECT",
            DisconnectReason::ConnectTimeout => "CONNECT_TIMEOUT",
            DisconnectReason::CkTimeout => "CK_TIMEOUT",
            DisconnectReason::NetworkError => "NETWORK_ERROR",
        };
        write!(f, "{name}")
    }
}

/// Outbound datagram produced by the peer.
pub struct SendEvent {
    pub data: Bytes,
    pub port: PortKind,
}

enum Emit {
    Status(Status),
    Midi(Bytes),
    Send(Vec<u8>, PortKind),
    Ck(f32),
    Disconnected(DisconnectReason),
}

struct PeerState {
    status: Status,
    initiator_id: u32,
    local_ssrc: u32,
    remote_ssrc: u32,
    local_name: String,
    remote_name: String,
    seq_nr: u16,
    seq_nr_ack: u16,
    remote_seq_nr: u16,
    timestamp_start: Instant,
    /// Last measured round trip, in 100 µs units.
    latency: u64,
    waiting_ck: bool,
    parser: MidiListParser,
    send_journal: SendJournal,
    recv_journal: ReceiveJournal,
    stats: Stats,
    last_not_connected_warn: Option<Instant>,
}

impl PeerState {
    /// Time since the peer was created, in 100 µs units (ten per
    /// millisecond), the clock RTP-MIDI timestamps use.
    fn timestamp(&self) -> u64 {
        (self.timestamp_start.elapsed().as_micros() / 100) as u64
    }
}

pub struct RtpPeer {
    state: RefCell<PeerState>,
    pub status_changed: Signal<Status>,
    pub midi_received: Signal<Bytes>,
    pub send_event: Signal<SendEvent>,
    pub ck_measured: Signal<f32>,
    pub disconnected: Signal<DisconnectReason>,
}

impl RtpPeer {
    pub fn new(local_name: impl Into<String>) -> RtpPeer {
        let mut local_ssrc = rand::random::<u32>();
        while local_ssrc == 0 {
            local_ssrc = rand::random();
        }
        let seq_nr = rand::random::<u16>();
        RtpPeer {
            state: RefCell::new(PeerState {
                status: Status::NOT_CONNECTED,
                initiator_id: rand::random(),
                local_ssrc,
                remote_ssrc: 0,
                local_name: local_name.into(),
                remote_name: String::new(),
                seq_nr,
                seq_nr_ack: seq_nr,
                remote_seq_nr: 0,
                timestamp_start: Instant::now(),
                latency: 0,
                waiting_ck: false,
                parser: MidiListParser::new(),
                send_journal: SendJournal::new(),
                recv_journal: ReceiveJournal::new(),
                stats: Stats::default(),
                last_not_connected_warn: None,
            }),
            status_changed: Signal::new(),
            midi_received: Signal::new(),
            send_event: Signal::new(),
            ck_measured: Signal::new(),
            disconnected: Signal::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.state.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn local_name(&self) -> String {
        self.state.borrow().local_name.clone()
    }

    pub fn remote_name(&self) -> String {
        self.state.borrow().remote_name.clone()
    }

    pub fn local_ssrc(&self) -> u32 {
        self.state.borrow().local_ssrc
    }

    pub fn remote_ssrc(&self) -> u32 {
        self.state.borrow().remote_ssrc
    }

    pub fn initiator_id(&self) -> u32 {
        self.state.borrow().initiator_id
    }

    pub fn waiting_ck(&self) -> bool {
        self.state.borrow().waiting_ck
    }

    /// Last sequence number received from the remote.
    pub fn remote_seq_nr(&self) -> u16 {
        self.state.borrow().remote_seq_nr
    }

    /// Last measured round trip in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        self.state.borrow().latency as f64 / 10.0
    }

    pub fn latency_stats(&self) -> AverageAndStddev {
        self.state.borrow().stats.average_and_stddev()
    }

    /// Feed one received datagram into the session.
    pub fn data_ready(&self, data: &[u8], port: PortKind) {
        let mut emits = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            if command::is_command(data) {
                self.parse_command(&mut st, data, port, &mut emits)
            } else if port == PortKind::Midi {
                self.parse_midi(&mut st, data, &mut emits)
            } else {
                debug!(
                    "unexpected non-command packet on control port from '{}', {} bytes",
                    st.remote_name,
                    data.len()
                );
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("dropping packet on {port} port: {err}");
        }
        self.fire(emits);
    }

    /// Send an invitation. Used by the client side of the handshake.
    pub fn connect_to(&self, port: PortKind) {
        let mut emits = Vec::new();
        {
            let st = self.state.borrow();
            let invitation = SessionCommand::Invitation {
                initiator: st.initiator_id,
                ssrc: st.local_ssrc,
                name: st.local_name.clone(),
            };
            emits.push(Emit::Send(invitation.to_bytes(), port));
        }
        self.fire(emits);
    }

    /// Start a clock-sync exchange (count=0). The answer eventually
    /// fires [`RtpPeer::ck_measured`].
    pub fn send_ck0(&self) {
        let mut emits = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            st.waiting_ck = true;
            let ck0 = SessionCommand::Sync {
                ssrc: st.local_ssrc,
                count: 0,
                ck: [st.timestamp(), 0, 0],
            };
            emits.push(Emit::Send(ck0.to_bytes(), PortKind::Midi));
        }
        self.fire(emits);
    }

    /// Send a MIDI command list to the remote. Dropped (with a
    /// rate-limited warning) while the session is not established.
    pub fn send_midi(&self, midi: &[u8]) {
        let mut emits = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            self.build_midi_packet(&mut st, midi, &mut emits)
        };
        if let Err(err) = result {
            warn!("can not send MIDI: {err}");
        }
        self.fire(emits);
    }

    /// Local teardown: goodbye on every connected port, then reset.
    pub fn disconnect(&self) {
        let mut emits = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            if st.status.has_midi() {
                self.send_goodbye(&mut st, PortKind::Midi, &mut emits);
            }
            if st.status.has_control() {
                self.send_goodbye(&mut st, PortKind::Control, &mut emits);
            }
            reset(&mut st);
        }
        self.fire(emits);
    }

    fn fire(&self, emits: Vec<Emit>) {
        for emit in emits {
            match emit {
                Emit::Status(status) => self.status_changed.emit(&status),
                Emit::Midi(data) => self.midi_received.emit(&data),
                Emit::Send(data, port) => self.send_event.emit(&SendEvent {
                    data: Bytes::from(data),
                    port,
                }),
                Emit::Ck(latency_ms) => self.ck_measured.emit(&latency_ms),
                Emit::Disconnected(reason) => self.disconnected.emit(&reason),
            }
        }
    }

    fn parse_command(
        &self,
        st: &mut PeerState,
        data: &[u8],
        port: PortKind,
        emits: &mut Vec<Emit>,
    ) -> Result<()> {
        match SessionCommand::parse(data)? {
            SessionCommand::Invitation {
                initiator,
                ssrc,
                name,
            } => self.on_invitation(st, initiator, ssrc, name, port, emits),
            SessionCommand::Accepted {
                initiator,
                ssrc,
                name,
            } => self.on_accepted(st, initiator, ssrc, name, port, emits),
            SessionCommand::Rejected { .. } => self.on_rejected(st, port, emits),
            SessionCommand::Goodbye { ssrc, .. } => self.on_goodbye(st, ssrc, port, emits),
            SessionCommand::Sync { count, ck, .. } => self.on_sync(st, count, ck, port, emits),
            SessionCommand::Feedback { sequence, .. } => {
                st.seq_nr_ack = sequence;
                debug!(
                    "feedback up to sequence {} / {}",
                    st.seq_nr_ack, st.seq_nr
                );
                Ok(())
            }
        }
    }

    /// `IN` received: we are the server side. Answer `OK` and add the
    /// port bit.
    fn on_invitation(
        &self,
        st: &mut PeerState,
        initiator: u32,
        ssrc: u32,
        name: String,
        port: PortKind,
        emits: &mut Vec<Emit>,
    ) -> Result<()> {
        if st.status.is_connected() {
            warn!(
                "'{}' is already connected, accepting anew (split brain?)",
                st.remote_name
            );
        }
        st.initiator_id = initiator;
        st.remote_ssrc = ssrc;
        st.remote_name = name;

        info!(
            "connection request from remote_name=\"{}\" initiator_id={:08X} ssrc={:08X} at {} port",
            st.remote_name, initiator, ssrc, port
        );

        let response = SessionCommand::Accepted {
            initiator,
            ssrc: st.local_ssrc,
            name: st.local_name.clone(),
        };
        emits.push(Emit::Send(response.to_bytes(), port));

        st.status = st.status.with(port);
        emits.push(Emit::Status(st.status));
        Ok(())
    }

    /// `OK` received: we are the client side and the invitation went
    /// through on this port.
    fn on_accepted(
        &self,
        st: &mut PeerState,
        initiator: u32,
        ssrc: u32,
        name: String,
        port: PortKind,
        emits: &mut Vec<Emit>,
    ) -> Result<()> {
        if st.status.is_connected() {
            warn!("already connected; disconnect first to connect again");
            return Ok(());
        }
        if initiator != st.initiator_id {
            warn!(
                "OK for unknown initiator {:08X} (mine is {:08X}), dropping",
                initiator, st.initiator_id
            );
            return Ok(());
        }
        st.remote_ssrc = ssrc;
        st.remote_name = name;

        info!(
            "confirmation from '{}', initiator_id={:08X} ssrc={:08X} at {} port",
            st.remote_name, initiator, ssrc, port
        );

        st.status = st.status.with(port);
        emits.push(Emit::Status(st.status));
        Ok(())
    }

    fn on_rejected(&self, st: &mut PeerState, port: PortKind, emits: &mut Vec<Emit>) -> Result<()> {
        warn!("invitation rejected (NO) by '{}'", st.remote_name);
        st.status = st.status.without(port);
        emits.push(Emit::Status(st.status));
        emits.push(Emit::Disconnected(DisconnectReason::ConnectionRejected));
        Ok(())
    }

    fn on_goodbye(
        &self,
        st: &mut PeerState,
        ssrc: u32,
        port: PortKind,
        emits: &mut Vec<Emit>,
    ) -> Result<()> {
        if ssrc != st.remote_ssrc {
            warn!("goodbye from the wrong peer (ssrc {:08X}), ignoring", ssrc);
            return Ok(());
        }
        let next = st.status.without(port);
        info!(
            "disconnect from '{}' on {} port, {} -> {}",
            st.remote_name, port, st.status, next
        );
        st.status = next;
        emits.push(Emit::Status(st.status));

        // One goodbye is enough; no need to wait for the second port.
        if st.status == Status::NOT_CONNECTED {
            emits.push(Emit::Disconnected(DisconnectReason::PeerDisconnected));
        }
        Ok(())
    }

    fn on_sync(
        &self,
        st: &mut PeerState,
        count: u8,
        ck: [u64; 3],
        port: PortKind,
        emits: &mut Vec<Emit>,
    ) -> Result<()> {
        let mut ck = ck;
        let count = match count {
            0 => {
                // Remote starts the exchange; stamp ck2 with our clock.
                ck[1] = st.timestamp();
                1
            }
            1 => {
                // Our ck0 came back; close the exchange and measure.
                ck[2] = st.timestamp();
                st.latency = ck[2].saturating_sub(ck[0]);
                st.waiting_ck = false;
                info!(
                    "latency {}: {:.2} ms (initiator)",
                    st.remote_name,
                    st.latency as f64 / 10.0
                );
                st.stats
                    .add_sample(Duration::from_nanos(st.latency * 100_000));
                emits.push(Emit::Ck(st.latency as f32 / 10.0));
                2
            }
            2 => {
                // Final message of an exchange the remote initiated.
                st.latency = st.timestamp().saturating_sub(ck[1]);
                info!(
                    "latency {}: {:.2} ms (responder)",
                    st.remote_name,
                    st.latency as f64 / 10.0
                );
                st.stats
                    .add_sample(Duration::from_nanos(st.latency * 100_000));
                emits.push(Emit::Ck(st.latency as f32 / 10.0));
                return Ok(());
            }
            _ => {
                error!("bad CK count {count}, ignoring");
                return Ok(());
            }
        };

        let response = SessionCommand::Sync {
            ssrc: st.local_ssrc,
            count,
            ck,
        };
        emits.push(Emit::Send(response.to_bytes(), port));
        Ok(())
    }

    fn parse_midi(&self, st: &mut PeerState, data: &[u8], emits: &mut Vec<Emit>) -> Result<()> {
        let mut r = Reader::new(data);
        let _flags = r.read_u8()?;
        let payload_type = r.read_u8()? & 0x7f;
        if payload_type != MIDI_PAYLOAD_TYPE {
            warn!("packet with payload type {payload_type:#04x} is not RTP MIDI, ignoring");
            return Ok(());
        }
        st.remote_seq_nr = r.read_u16()?;
        let _timestamp = r.read_u32()?;
        let ssrc = r.read_u32()?;
        if ssrc != st.remote_ssrc {
            warn!(
                "MIDI for unknown SSRC {:08X} (expecting {:08X}), ignoring",
                ssrc, st.remote_ssrc
            );
            return Ok(());
        }

        let header = r.read_u8()?;
        let mut length = (header & 0x0f) as usize;
        if header & 0x80 != 0 {
            length = (length << 8) | r.read_u8()? as usize;
        }
        r.check_available(length)?;

        let mut events = Vec::new();
        if header & 0x40 != 0 {
            // The journal describes packets before this one, so it is
            // applied before the command list.
            let mut journal_reader = r;
            journal_reader.skip(length)?;
            let seqnum = st.recv_journal.parse(&mut journal_reader, &mut events)?;
            debug!("journal parsed, acknowledging sequence {seqnum}");
            st.remote_seq_nr = seqnum;
            let feedback = SessionCommand::Feedback {
                ssrc: st.local_ssrc,
                sequence: seqnum,
            };
            emits.push(Emit::Send(feedback.to_bytes(), PortKind::Control));
        }
        let first_has_delta = header & 0x20 != 0;
        if header & 0x10 != 0 {
            warn!("first command without status byte, ignoring the P flag");
        }

        st.parser.parse_list(&mut r, length, first_has_delta, &mut events)?;

        for event in events {
            st.recv_journal.track_received(&event);
            emits.push(Emit::Midi(event));
        }
        Ok(())
    }

    fn build_midi_packet(
        &self,
        st: &mut PeerState,
        midi: &[u8],
        emits: &mut Vec<Emit>,
    ) -> Result<()> {
        if !st.status.is_connected() {
            let warn_now = st
                .last_not_connected_warn
                .map(|at| at.elapsed() >= NOT_CONNECTED_WARN_INTERVAL)
                .unwrap_or(true);
            if warn_now {
                st.last_not_connected_warn = Some(Instant::now());
                warn!(
                    "can not send MIDI to '{}' yet, not connected ({})",
                    st.remote_name, st.status
                );
            }
            return Ok(());
        }
        if midi.len() > MAX_MIDI_PAYLOAD {
            return Err(Error::BadMidiPacket("MIDI list over 4095 bytes"));
        }

        st.seq_nr = st.seq_nr.wrapping_add(1);
        let timestamp = st.timestamp() as u32;

        let mut buf = [0u8; 4096 + 256];
        let mut w = Writer::new(&mut buf);
        w.write_u8(0x80)?;
        // 0x61, not 0xE1: with the marker bit set the common Windows
        // client stops reading messages.
        w.write_u8(MIDI_PAYLOAD_TYPE)?;
        w.write_u16(st.seq_nr)?;
        w.write_u32(timestamp)?;
        w.write_u32(st.local_ssrc)?;

        let journal = st.send_journal.has_unacked(st.seq_nr_ack);
        let journal_flag = if journal { 0x40 } else { 0 };
        if midi.len() < 16 {
            w.write_u8(journal_flag | midi.len() as u8)?;
        } else {
            w.write_u8(0x80 | journal_flag | ((midi.len() >> 8) as u8 & 0x0f))?;
            w.write_u8(midi.len() as u8)?;
        }
        w.copy_from(midi)?;
        if journal {
            st.send_journal
                .write(&mut w, st.seq_nr.wrapping_sub(1), st.seq_nr_ack)?;
        }

        st.send_journal.record_sent(st.seq_nr, midi);
        emits.push(Emit::Send(w.written().to_vec(), PortKind::Midi));
        Ok(())
    }

    fn send_goodbye(&self, st: &mut PeerState, port: PortKind, emits: &mut Vec<Emit>) {
        debug!("goodbye to '{}' on {} port", st.remote_name, port);
        let goodbye = SessionCommand::Goodbye {
            initiator: st.initiator_id,
            ssrc: st.local_ssrc,
        };
        emits.push(Emit::Send(goodbye.to_bytes(), port));

        st.status = st.status.without(port);
        emits.push(Emit::Status(st.status));
        if st.status == Status::NOT_CONNECTED {
            emits.push(Emit::Disconnected(DisconnectReason::Disconnect));
        }
    }
}

impl Drop for RtpPeer {
    fn drop(&mut self) {
        // A peer that goes away while a session is still up says
        // goodbye on whatever ports remain open; the send slots are
        // still registered at this point.
        if self.status() != Status::NOT_CONNECTED {
            self.disconnect();
        }
        debug!(
            "dropping peer '{}' (local) <-> '{}' (remote)",
            self.local_name(),
            self.remote_name()
        );
    }
}

fn reset(st: &mut PeerState) {
    st.status = Status::NOT_CONNECTED;
    st.remote_name.clear();
    st.remote_ssrc = 0;
    st.initiator_id = rand::random();
    st.waiting_ck = false;
    st.parser.clear_sysex();
}
