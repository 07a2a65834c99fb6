//! Client connector against a server listener over real localhost
//! sockets, everything driven by one reactor.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtpmidi_core::rtpclient::{Endpoint, RtpClient};
use rtpmidi_core::rtpserver::RtpServer;
use rtpmidi_core::{DisconnectReason, Reactor, Status};

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
fn handshake_and_midi_exchange() {
    let reactor = Reactor::new().unwrap();
    let server = RtpServer::new(&reactor, "test-server", 0).unwrap();
    let client = RtpClient::new(&reactor, "test-client");

    let server_midi: Rc<RefCell<Vec<Bytes>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&server_midi);
    let _c1 = server
        .midi_event()
        .connect(move |data| sink.borrow_mut().push(data.clone()));

    client.connect_to(vec![Endpoint::new(
        "127.0.0.1",
        server.control_port().to_string(),
    )]);

    let peer = client.peer();
    assert!(
        pump_until(&reactor, Duration::from_secs(5), || peer.is_connected()),
        "client never reached CONNECTED"
    );
    assert!(pump_until(&reactor, Duration::from_secs(5), || server
        .peer_count()
        == 1));
    assert_eq!(peer.remote_name(), "test-server");

    // The server learned the client's name from the invitation.
    let mut names = Vec::new();
    server.for_each_peer(|p| names.push(p.remote_name()));
    assert_eq!(names, vec!["test-client".to_string()]);

    // Client to server.
    peer.send_midi(&[0x90, 0x64, 0x7f]);
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        !server_midi.borrow().is_empty()
    }));
    assert_eq!(&server_midi.borrow()[0][..], &[0x90, 0x64, 0x7f]);

    // Server to client.
    let client_midi: Rc<RefCell<Vec<Bytes>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&client_midi);
    let _c2 = peer
        .midi_received
        .connect(move |data| sink.borrow_mut().push(data.clone()));
    server.send_midi_to_all_peers(&[0x80, 0x64, 0x00]);
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        !client_midi.borrow().is_empty()
    }));
    assert_eq!(&client_midi.borrow()[0][..], &[0x80, 0x64, 0x00]);

    // The keepalive CK0 sent on connect got answered and measured.
    assert!(pump_until(&reactor, Duration::from_secs(5), || !peer
        .waiting_ck()));

    // Graceful teardown removes the server-side peer.
    client.disconnect();
    assert!(pump_until(&reactor, Duration::from_secs(5), || server
        .peer_count()
        == 0));
}

#[test]
fn two_clients_are_demultiplexed() {
    let reactor = Reactor::new().unwrap();
    let server = RtpServer::new(&reactor, "shared", 0).unwrap();
    let endpoint = Endpoint::new("127.0.0.1", server.control_port().to_string());

    let one = RtpClient::new(&reactor, "one");
    let two = RtpClient::new(&reactor, "two");
    one.connect_to(vec![endpoint.clone()]);
    two.connect_to(vec![endpoint]);

    let one_peer = one.peer();
    let two_peer = two.peer();
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        one_peer.is_connected() && two_peer.is_connected()
    }));
    assert!(pump_until(&reactor, Duration::from_secs(5), || server
        .peer_count()
        == 2));

    let mut names: Vec<String> = Vec::new();
    server.for_each_peer(|p| names.push(p.remote_name()));
    names.sort();
    assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
}

#[test]
fn dropping_the_server_says_goodbye() {
    let reactor = Reactor::new().unwrap();
    let server = RtpServer::new(&reactor, "short-lived", 0).unwrap();
    let client = RtpClient::new(&reactor, "guest");
    client.connect_to(vec![Endpoint::new(
        "127.0.0.1",
        server.control_port().to_string(),
    )]);

    let peer = client.peer();
    assert!(pump_until(&reactor, Duration::from_secs(5), || peer.is_connected()));

    // Tearing the whole server down mid-session still delivers a BY
    // on both ports, so the remote ends cleanly instead of waiting out
    // a watchdog.
    drop(server);
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        peer.status() == Status::NOT_CONNECTED
    }));
}

#[test]
fn shared_peers_live_until_the_last_release() {
    let reactor = Reactor::new().unwrap();
    let server = RtpServer::new(&reactor, "shared", 0).unwrap();
    let client = RtpClient::new(&reactor, "user");
    client.connect_to(vec![Endpoint::new(
        "127.0.0.1",
        server.control_port().to_string(),
    )]);

    let peer = client.peer();
    assert!(pump_until(&reactor, Duration::from_secs(5), || peer.is_connected()));

    let ssrc = peer.local_ssrc();
    server.retain_peer(ssrc);
    server.retain_peer(ssrc);

    server.release_peer(ssrc);
    reactor.wait(Some(Duration::from_millis(20)));
    assert_eq!(server.peer_count(), 1);

    // The last release drops the peer, one deferred-call cycle later.
    server.release_peer(ssrc);
    assert!(pump_until(&reactor, Duration::from_secs(5), || server
        .peer_count()
        == 0));
}

#[test]
fn unreachable_endpoints_end_in_cant_connect() {
    let reactor = Reactor::new().unwrap();
    let client = RtpClient::new(&reactor, "hopeless");

    let failures: Rc<RefCell<Vec<DisconnectReason>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&failures);
    let _c = client
        .disconnected_event()
        .connect(move |reason| sink.borrow_mut().push(*reason));

    // A hostname that can not resolve exhausts all rounds straight
    // away, without waiting out any handshake deadline.
    client.connect_to(vec![Endpoint::new("does-not-exist.invalid", "5004")]);

    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        !failures.borrow().is_empty()
    }));
    assert_eq!(failures.borrow()[0], DisconnectReason::CantConnect);
}
