//! Control socket: status and graph mutations over line JSON.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use rtpmidi_core::Reactor;
use serde_json::Value;

use rtp_midi_bridge::control::ControlSocket;
use rtp_midi_bridge::router::MidiRouter;

fn request(reactor: &Reactor, stream: &mut UnixStream, line: &str) -> Value {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        reactor.wait(Some(Duration::from_millis(10)));
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                response.extend_from_slice(&chunk[..n]);
                if response.contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => panic!("control read failed: {err}"),
        }
    }
    serde_json::from_slice(&response).expect("control response is JSON")
}

#[test]
fn status_and_graph_commands() {
    let reactor = Reactor::new().unwrap();
    let router = MidiRouter::new();
    let path =
        std::env::temp_dir().join(format!("rtpmidi-bridge-ctl-{}.sock", std::process::id()));
    let control = ControlSocket::new(&reactor, &router, &path).unwrap();

    let mut stream = UnixStream::connect(control.path()).unwrap();
    stream.set_nonblocking(true).unwrap();
    // Let the accept handler run.
    reactor.wait(Some(Duration::from_millis(10)));

    let status = request(&reactor, &mut stream, r#"{"method":"status"}"#);
    assert!(status["result"]["version"].is_string());
    assert_eq!(status["result"]["router"], serde_json::json!([]));

    let help = request(&reactor, &mut stream, r#"{"method":"help"}"#);
    assert!(help["result"].as_array().unwrap().iter().any(|m| m == "status"));

    let err = request(&reactor, &mut stream, r#"{"method":"nope"}"#);
    assert!(err["error"].as_str().unwrap().contains("unknown method"));

    let err = request(&reactor, &mut stream, "not json");
    assert!(err["error"].as_str().unwrap().contains("bad request"));

    drop(control);
    assert!(!path.exists(), "socket file not removed on shutdown");
}
