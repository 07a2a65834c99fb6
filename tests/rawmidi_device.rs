//! Raw-MIDI peer against a FIFO it creates itself.

use std::any::Any;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtpmidi_core::Reactor;
use serde_json::json;

use rtp_midi_bridge::peers::RawMidiPeer;
use rtp_midi_bridge::router::{MidiPeer, MidiRouter, PeerHandle, PeerId};

struct Sink {
    received: RefCell<Vec<Bytes>>,
}

impl MidiPeer for Sink {
    fn kind(&self) -> &'static str {
        "test:sink"
    }
    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        self.received.borrow_mut().push(data.clone());
    }
    fn status(&self) -> serde_json::Value {
        json!({ "type": self.kind() })
    }
    fn attach(&self, _handle: PeerHandle) {}
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn fifo_bytes_become_router_messages() {
    let reactor = Reactor::new().unwrap();
    let router = MidiRouter::new();
    let path = std::env::temp_dir().join(format!("rtpmidi-bridge-test-{}.fifo", std::process::id()));
    let path_str = path.to_str().unwrap().to_string();
    let _ = std::fs::remove_file(&path);

    let device = RawMidiPeer::new(&reactor, "fifo", &path_str);
    let device_id = router.add_peer(device.clone());
    let sink = Rc::new(Sink {
        received: RefCell::new(Vec::new()),
    });
    let sink_id = router.add_peer(sink.clone());

    // The device only opens once an edge exists.
    assert!(!device.is_open());
    router.connect(device_id, sink_id);
    assert!(device.is_open(), "edge did not open the device");

    // Write a stream through the FIFO: two messages, split awkwardly.
    {
        let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(&[0x90, 0x3c]).unwrap();
        writer.flush().unwrap();
        writer.write_all(&[0x7f, 0xc0, 0x07]).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.received.borrow().len() < 2 && Instant::now() < deadline {
        reactor.wait(Some(Duration::from_millis(20)));
    }
    assert_eq!(
        *sink.received.borrow(),
        vec![
            Bytes::from_static(&[0x90, 0x3c, 0x7f]),
            Bytes::from_static(&[0xc0, 0x07]),
        ]
    );

    // Removing the edge closes the device again.
    router.disconnect(device_id, sink_id);
    assert!(!device.is_open());

    let _ = std::fs::remove_file(&path);
}
