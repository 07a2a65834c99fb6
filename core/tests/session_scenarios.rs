//! Session scenarios over a loopback transport: two in-process peers
//! wired so that one peer's outgoing datagrams feed the other's
//! `data_ready`, with no sockets involved.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use rtpmidi_core::rtppeer::{PortKind, RtpPeer, SendEvent, Status};
use rtpmidi_core::signal::Connection;

/// `FF FF 'IN' v2 initiator=0x00123400 ssrc=0x00BEEF00 "peer\0"`.
const CONNECT_MSG: &[u8] = &[
    0xff, 0xff, b'I', b'N', 0x00, 0x00, 0x00, 0x02, 0x00, 0x12, 0x34, 0x00, 0x00, 0xbe, 0xef,
    0x00, b'p', b'e', b'e', b'r', 0x00,
];

const DISCONNECT_MSG: &[u8] = &[
    0xff, 0xff, b'B', b'Y', 0x00, 0x00, 0x00, 0x02, 0x00, 0x12, 0x34, 0x00, 0x00, 0xbe, 0xef,
    0x00,
];

fn collect_statuses(peer: &RtpPeer, into: &Rc<RefCell<Vec<Status>>>) -> Connection {
    let into = Rc::clone(into);
    peer.status_changed.connect(move |status| into.borrow_mut().push(*status))
}

fn collect_midi(peer: &RtpPeer, into: &Rc<RefCell<Vec<Bytes>>>) -> Connection {
    let into = Rc::clone(into);
    peer.midi_received.connect(move |data| into.borrow_mut().push(data.clone()))
}

fn collect_sends(peer: &RtpPeer, into: &Rc<RefCell<Vec<(Bytes, PortKind)>>>) -> Connection {
    let into = Rc::clone(into);
    peer.send_event
        .connect(move |ev: &SendEvent| into.borrow_mut().push((ev.data.clone(), ev.port)))
}

/// Wire `from`'s outgoing datagrams into `to`'s input, same port.
fn loopback(from: &Rc<RtpPeer>, to: &Rc<RtpPeer>) -> Connection {
    let to = Rc::clone(to);
    from.send_event
        .connect(move |ev: &SendEvent| to.data_ready(&ev.data, ev.port))
}

fn midi_packet(ssrc: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 16);
    let mut packet = vec![0x80, 0x61, (seq >> 8) as u8, seq as u8, 0, 0, 0, 0];
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.push(payload.len() as u8);
    packet.extend_from_slice(payload);
    packet
}

// S1: full handshake between two live peers; both reach CONNECTED and
// report it exactly once.
#[test]
fn s1_full_handshake() {
    let client = Rc::new(RtpPeer::new("client"));
    let server = Rc::new(RtpPeer::new("server"));

    let _w1 = loopback(&client, &server);
    let _w2 = loopback(&server, &client);

    let client_statuses = Rc::new(RefCell::new(Vec::new()));
    let server_statuses = Rc::new(RefCell::new(Vec::new()));
    let _c1 = collect_statuses(&client, &client_statuses);
    let _c2 = collect_statuses(&server, &server_statuses);

    client.connect_to(PortKind::Control);
    assert_eq!(client.status(), Status::CONTROL_CONNECTED);
    client.connect_to(PortKind::Midi);

    assert!(client.is_connected());
    assert!(server.is_connected());
    assert_eq!(client.remote_name(), "server");
    assert_eq!(server.remote_name(), "client");

    let connected = |statuses: &RefCell<Vec<Status>>| {
        statuses
            .borrow()
            .iter()
            .filter(|s| s.is_connected())
            .count()
    };
    assert_eq!(connected(&client_statuses), 1);
    assert_eq!(connected(&server_statuses), 1);
}

// S2: the two invitations arrive in the reverse order; the peer goes
// through MIDI_CONNECTED and still reports CONNECTED exactly once.
#[test]
fn s2_reverse_order_handshake() {
    let peer = RtpPeer::new("test");
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let _c = collect_statuses(&peer, &statuses);

    peer.data_ready(CONNECT_MSG, PortKind::Midi);
    assert_eq!(peer.status(), Status::MIDI_CONNECTED);
    assert!(!peer.is_connected());

    peer.data_ready(CONNECT_MSG, PortKind::Control);
    assert!(peer.is_connected());

    assert_eq!(
        *statuses.borrow(),
        vec![Status::MIDI_CONNECTED, Status::CONNECTED]
    );

    peer.data_ready(DISCONNECT_MSG, PortKind::Control);
    assert_eq!(peer.status(), Status::MIDI_CONNECTED);
    assert!(!peer.is_connected());
}

// S3: a short MIDI send produces the compact header with the length in
// the low nibble and the payload verbatim.
#[test]
fn s3_short_midi_send() {
    let peer = RtpPeer::new("test");
    let sends = Rc::new(RefCell::new(Vec::new()));
    let _c = collect_sends(&peer, &sends);

    peer.data_ready(CONNECT_MSG, PortKind::Control);
    peer.data_ready(CONNECT_MSG, PortKind::Midi);
    sends.borrow_mut().clear();

    peer.send_midi(&[0x90, 0x64, 0x7f, 0x68, 0x7f, 0x71, 0x7f]);

    let sends = sends.borrow();
    assert_eq!(sends.len(), 1);
    let (packet, port) = &sends[0];
    assert_eq!(*port, PortKind::Midi);
    assert_eq!(packet[0], 0x80);
    assert_eq!(packet[1], 0x61);
    assert_eq!(packet[12], 0x07);
    assert_eq!(&packet[13..], &[0x90, 0x64, 0x7f, 0x68, 0x7f, 0x71, 0x7f]);
}

// S4: seventeen bytes need the long header: 0x80, 0x11.
#[test]
fn s4_long_midi_send() {
    let peer = RtpPeer::new("test");
    let sends = Rc::new(RefCell::new(Vec::new()));
    let _c = collect_sends(&peer, &sends);

    peer.data_ready(CONNECT_MSG, PortKind::Control);
    peer.data_ready(CONNECT_MSG, PortKind::Midi);
    sends.borrow_mut().clear();

    let sysex = [
        0xf0, 0x7e, 0x7f, 0x06, 0x02, 0x00, 0x01, 0x0c, 0x00, 0x00, 0x00, 0x03, 0x30, 0x32,
        0x32, 0x30, 0xf7,
    ];
    peer.send_midi(&sysex);

    let sends = sends.borrow();
    assert_eq!(sends.len(), 1);
    let (packet, _) = &sends[0];
    assert_eq!(packet[12], 0x80);
    assert_eq!(packet[13], 0x11);
    assert_eq!(&packet[14..], &sysex);
}

// S5: an inbound list with running status decodes into three explicit
// control-change events.
#[test]
fn s5_running_status_list() {
    let peer = RtpPeer::new("test");
    let midi = Rc::new(RefCell::new(Vec::new()));
    let _c = collect_midi(&peer, &midi);

    peer.data_ready(CONNECT_MSG, PortKind::Control);
    peer.data_ready(CONNECT_MSG, PortKind::Midi);

    let packet = midi_packet(
        0x00be_ef00,
        0,
        &[0xbf, 0x6d, 0x24, 0x00, 0x37, 0x01, 0x00, 0x6d, 0x20],
    );
    peer.data_ready(&packet, PortKind::Midi);

    assert_eq!(
        *midi.borrow(),
        vec![
            Bytes::from_static(&[0xbf, 0x6d, 0x24]),
            Bytes::from_static(&[0xbf, 0x37, 0x01]),
            Bytes::from_static(&[0xbf, 0x6d, 0x20]),
        ]
    );
}

// S6: SysEx segmented over two packets arrives as one message; the F4
// cancel marker discards the pending buffer instead.
#[test]
fn s6_segmented_sysex() {
    let peer = RtpPeer::new("test");
    let midi = Rc::new(RefCell::new(Vec::new()));
    let _c = collect_midi(&peer, &midi);

    peer.data_ready(CONNECT_MSG, PortKind::Control);
    peer.data_ready(CONNECT_MSG, PortKind::Midi);

    let first = midi_packet(0x00be_ef00, 1, &[0xf0, 0x01, 0x02, 0x03, 0x04, 0xf0]);
    let second = midi_packet(0x00be_ef00, 2, &[0xf7, 0x05, 0x06, 0x07, 0x08, 0xf7]);
    peer.data_ready(&first, PortKind::Midi);
    assert!(midi.borrow().is_empty());
    peer.data_ready(&second, PortKind::Midi);

    assert_eq!(
        *midi.borrow(),
        vec![Bytes::from_static(&[
            0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xf7
        ])]
    );

    // Cancel variant: a pending buffer followed by F7 F4 yields
    // nothing at all.
    midi.borrow_mut().clear();
    let first = midi_packet(0x00be_ef00, 3, &[0xf0, 0x11, 0x12, 0xf0]);
    let cancel = midi_packet(0x00be_ef00, 4, &[0xf7, 0xf4]);
    peer.data_ready(&first, PortKind::Midi);
    peer.data_ready(&cancel, PortKind::Midi);
    assert!(midi.borrow().is_empty());

    // The buffer really is empty: a fresh complete SysEx passes
    // through untouched by the cancelled fragment.
    let fresh = midi_packet(0x00be_ef00, 5, &[0xf0, 0x42, 0xf7]);
    peer.data_ready(&fresh, PortKind::Midi);
    assert_eq!(*midi.borrow(), vec![Bytes::from_static(&[0xf0, 0x42, 0xf7])]);
}

// S7: chapter-N journals replay the note-on and note-off that were in
// the two packets that never arrived.
#[test]
fn s7_journal_recovery() {
    let peer = RtpPeer::new("test");
    let midi = Rc::new(RefCell::new(Vec::new()));
    let sends = Rc::new(RefCell::new(Vec::new()));
    let _c1 = collect_midi(&peer, &midi);
    let _c2 = collect_sends(&peer, &sends);

    peer.data_ready(CONNECT_MSG, PortKind::Midi);
    peer.data_ready(CONNECT_MSG, PortKind::Control);
    sends.borrow_mut().clear();

    // Sequence 0: nothing but the empty command section.
    peer.data_ready(&midi_packet(0x00be_ef00, 0, &[]), PortKind::Midi);

    // Sequence 2 (sequence 1 was lost): journal only, note-on C4.
    let mut seq2 = vec![0x80, 0x61, 0x00, 0x02, 0x00, 0x00, 0x00, 0x10];
    seq2.extend_from_slice(&0x00be_ef00u32.to_be_bytes());
    seq2.push(0x40); // journal, no MIDI commands
    seq2.extend_from_slice(&[
        0xa1, // S, channel journals, one channel
        0x00, 0x02, // journal covers up to sequence 2
        0x00, 0x00, // channel 0, length 0
        0x08, // chapter N only
        0x01, // one note-on
        0xf0, // no note-off range
        0x48, 0xff, // C4, velocity 127, must-play
    ]);
    peer.data_ready(&seq2, PortKind::Midi);

    // Sequence 4 (sequence 3 lost too): journal only, note-off C4.
    let mut seq4 = vec![0x80, 0x61, 0x00, 0x04, 0x00, 0x00, 0x00, 0x20];
    seq4.extend_from_slice(&0x00be_ef00u32.to_be_bytes());
    seq4.push(0x40);
    seq4.extend_from_slice(&[
        0xa1, 0x00, 0x04, // up to sequence 4
        0x00, 0x00, 0x08, // channel 0, chapter N
        0x00, // no note-ons
        0x99, // low = high = 9 (notes 72..79)
        0x80, // bitmap: note 72
    ]);
    peer.data_ready(&seq4, PortKind::Midi);

    assert_eq!(
        *midi.borrow(),
        vec![
            Bytes::from_static(&[0x90, 0x48, 0x7f]),
            Bytes::from_static(&[0x80, 0x48, 0x00]),
        ]
    );

    // Each parsed journal was acknowledged on the control port.
    let feedback: Vec<u16> = sends
        .borrow()
        .iter()
        .filter(|(data, port)| *port == PortKind::Control && data[2] == b'R' && data[3] == b'S')
        .map(|(data, _)| ((data[8] as u16) << 8) | data[9] as u16)
        .collect();
    assert_eq!(feedback, vec![2, 4]);
}

// Anything from the sizing table survives the send → parse path
// unchanged.
#[test]
fn midi_commands_round_trip_between_peers() {
    let a = Rc::new(RtpPeer::new("a"));
    let b = Rc::new(RtpPeer::new("b"));
    let _w1 = loopback(&a, &b);
    let _w2 = loopback(&b, &a);
    a.connect_to(PortKind::Control);
    a.connect_to(PortKind::Midi);

    let received = Rc::new(RefCell::new(Vec::new()));
    let _c = collect_midi(&b, &received);

    let commands: Vec<&[u8]> = vec![
        &[0x80, 0x40, 0x00],       // note off
        &[0x90, 0x40, 0x7f],       // note on
        &[0xa5, 0x33, 0x11],       // poly aftertouch
        &[0xbf, 0x07, 0x64],       // control change
        &[0xc2, 0x10],             // program change
        &[0xd3, 0x22],             // channel aftertouch
        &[0xe0, 0x00, 0x40],       // pitch bend
        &[0xf1, 0x35],             // MTC quarter frame
        &[0xf2, 0x01, 0x02],       // song position
        &[0xf3, 0x04],             // song select
        &[0xf6],                   // tune request
        &[0xf8],                   // clock
        &[0xfe],                   // active sense
        &[0xf0, 0x7d, 0x01, 0xf7], // sysex
    ];
    for command in &commands {
        a.send_midi(command);
    }

    let received = received.borrow();
    assert_eq!(received.len(), commands.len());
    for (got, sent) in received.iter().zip(&commands) {
        assert_eq!(&got[..], *sent);
    }
}

// Sending MIDI while not connected is silently dropped.
#[test]
fn send_while_not_connected_is_dropped() {
    let peer = RtpPeer::new("test");
    let sends = Rc::new(RefCell::new(Vec::new()));
    let _c = collect_sends(&peer, &sends);

    peer.send_midi(&[0x90, 0x40, 0x7f]);
    assert!(sends.borrow().is_empty());
}

// A BY for each port takes the peer back to NOT_CONNECTED and fires
// the disconnect signal once.
#[test]
fn goodbye_on_both_ports_disconnects() {
    let peer = RtpPeer::new("test");
    let reasons = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reasons);
    let _c = peer
        .disconnected
        .connect(move |reason| sink.borrow_mut().push(*reason));

    peer.data_ready(CONNECT_MSG, PortKind::Control);
    peer.data_ready(CONNECT_MSG, PortKind::Midi);

    peer.data_ready(DISCONNECT_MSG, PortKind::Midi);
    assert!(reasons.borrow().is_empty());
    peer.data_ready(DISCONNECT_MSG, PortKind::Control);

    assert_eq!(peer.status(), Status::NOT_CONNECTED);
    assert_eq!(
        *reasons.borrow(),
        vec![rtpmidi_core::DisconnectReason::PeerDisconnected]
    );
}

// The CK responder echoes the exchange and measures on the closing
// message.
#[test]
fn clock_sync_three_way() {
    let a = Rc::new(RtpPeer::new("a"));
    let b = Rc::new(RtpPeer::new("b"));
    let _w1 = loopback(&a, &b);
    let _w2 = loopback(&b, &a);

    let latencies = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&latencies);
    let _c = a.ck_measured.connect(move |ms| sink.borrow_mut().push(*ms));

    a.connect_to(PortKind::Control);
    a.connect_to(PortKind::Midi);
    assert!(a.is_connected() && b.is_connected());

    assert!(!a.waiting_ck());
    a.send_ck0();
    // The loopback answers synchronously, so by now the exchange is
    // complete and the latency (approximately zero) was recorded.
    assert!(!a.waiting_ck());
    assert_eq!(latencies.borrow().len(), 1);
    assert!(latencies.borrow()[0] >= 0.0);
}
