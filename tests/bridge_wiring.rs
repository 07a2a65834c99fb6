//! End-to-end wiring of the adapters: virtual sequencer ports on one
//! side, live localhost RTP-MIDI sessions on the other, all on one
//! reactor.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtpmidi_core::rtpclient::{Endpoint, RtpClient};
use rtpmidi_core::rtpserver::RtpServer;
use rtpmidi_core::Reactor;

use rtp_midi_bridge::peers::{LocalMultiListener, LocalWaiter, NetworkListener, NetworkMultiListener};
use rtp_midi_bridge::router::MidiRouter;
use rtp_midi_bridge::sequencer::{Sequencer, VirtualSequencer, WrittenEvent};

fn pump_until(reactor: &Reactor, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        reactor.wait(Some(Duration::from_millis(20)));
    }
    done()
}

#[test]
fn waiter_dials_on_first_subscription_and_bridges_midi() {
    let reactor = Reactor::new().unwrap();
    let seq = VirtualSequencer::new();
    let router = MidiRouter::new();

    // The "remote": a plain core server on localhost.
    let server = RtpServer::new(&reactor, "remote", 0).unwrap();
    let server_midi: Rc<RefCell<Vec<Bytes>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&server_midi);
    let _c = server
        .midi_event()
        .connect(move |data| sink.borrow_mut().push(data.clone()));

    let seq_dyn: Rc<dyn Sequencer> = seq.clone();
    let waiter = LocalWaiter::new(
        &reactor,
        Rc::clone(&seq_dyn),
        "remote",
        "127.0.0.1",
        &server.control_port().to_string(),
    )
    .unwrap();
    router.add_peer(waiter);

    // Nothing dialed yet: the waiter sits idle until subscribed.
    assert_eq!(router.peer_count(), 1);
    assert_eq!(server.peer_count(), 0);

    let port = 1; // first created virtual port
    seq.subscribe(port, 100, "player");
    assert!(
        pump_until(&reactor, Duration::from_secs(5), || server.peer_count() == 1),
        "waiter never connected to the remote"
    );
    // The client worker node joined the graph.
    assert_eq!(router.peer_count(), 2);

    // Local sequencer bytes flow out to the remote.
    seq.inject(port, 100, &[0x90, 0x40, 0x7f]);
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        !server_midi.borrow().is_empty()
    }));
    assert_eq!(&server_midi.borrow()[0][..], &[0x90, 0x40, 0x7f]);

    // Remote bytes come back to the sequencer port.
    let written: Rc<RefCell<Vec<WrittenEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&written);
    let _w = seq.written.connect(move |ev| sink.borrow_mut().push(ev.clone()));
    server.send_midi_to_all_peers(&[0x80, 0x40, 0x00]);
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        !written.borrow().is_empty()
    }));
    assert_eq!(&written.borrow()[0].data[..], &[0x80, 0x40, 0x00]);

    // Last unsubscription tears the client down again.
    seq.unsubscribe(port, 100);
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        router.peer_count() == 1 && server.peer_count() == 0
    }));
}

#[test]
fn multi_listener_exports_one_listener_per_subscriber_name() {
    let reactor = Reactor::new().unwrap();
    let seq = VirtualSequencer::new();
    let router = MidiRouter::new();

    let seq_dyn: Rc<dyn Sequencer> = seq.clone();
    let shared =
        LocalMultiListener::new(&reactor, Rc::clone(&seq_dyn), "Network", None).unwrap();
    router.add_peer(shared);
    let network_port = 1;

    seq.subscribe(network_port, 10, "piano");
    assert_eq!(router.peer_count(), 2);

    let mut names = Vec::new();
    router.for_each_peer::<NetworkListener>(|_id, listener| {
        names.push((listener.name().to_string(), listener.control_port()))
    });
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].0, "piano");
    assert_ne!(names[0].1, 0);

    // The same name subscribing again shares the listener.
    seq.subscribe(network_port, 11, "piano");
    assert_eq!(router.peer_count(), 2);

    // Both users must leave before the listener goes away.
    seq.unsubscribe(network_port, 10);
    assert_eq!(router.peer_count(), 2);
    seq.unsubscribe(network_port, 11);
    assert_eq!(router.peer_count(), 1);
}

#[test]
fn network_multi_listener_creates_a_port_per_remote() {
    let reactor = Reactor::new().unwrap();
    let seq = VirtualSequencer::new();
    let router = MidiRouter::new();

    let seq_dyn: Rc<dyn Sequencer> = seq.clone();
    let listener =
        NetworkMultiListener::new(&reactor, Rc::clone(&seq_dyn), "bridge", 0, None).unwrap();
    let control_port = listener.control_port();
    router.add_peer(listener);

    let client = RtpClient::new(&reactor, "padctl");
    client.connect_to(vec![Endpoint::new("127.0.0.1", control_port.to_string())]);

    let peer = client.peer();
    assert!(pump_until(&reactor, Duration::from_secs(5), || peer
        .is_connected()));
    // Listener + worker + session node.
    assert!(pump_until(&reactor, Duration::from_secs(5), || router
        .peer_count()
        == 3));

    // The remote now exists as a local port named after it.
    assert_eq!(seq.port_count(), 1);

    // MIDI from the remote lands on that port.
    let written: Rc<RefCell<Vec<WrittenEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&written);
    let _w = seq.written.connect(move |ev| sink.borrow_mut().push(ev.clone()));
    peer.send_midi(&[0xb0, 0x07, 0x64]);
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        !written.borrow().is_empty()
    }));
    assert_eq!(&written.borrow()[0].data[..], &[0xb0, 0x07, 0x64]);

    // The remote leaving removes the worker pair again.
    client.disconnect();
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        router.peer_count() == 1 && seq.port_count() == 0
    }));
}
