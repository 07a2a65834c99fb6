//! Raw-MIDI device peer: bridges a character device (or a FIFO it
//! creates when the path does not exist) into the router. The device
//! is only held open while at least one router edge touches the node;
//! reads are normalized so every router send carries one complete
//! MIDI message.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use log::{debug, error, info, warn};
use rtpmidi_core::poller::{Listener, Reactor};
use serde_json::json;

use crate::normalizer::MidiNormalizer;
use crate::router::{MidiPeer, PeerEvent, PeerHandle, PeerId};

use super::{new_shared_handle, SharedHandle};

pub struct RawMidiPeer {
    reactor: Reactor,
    name: String,
    device: String,
    file: RefCell<Option<File>>,
    listener: RefCell<Option<Listener>>,
    normalizer: RefCell<MidiNormalizer>,
    connection_count: Cell<i32>,
    handle: SharedHandle,
    weak_self: RefCell<Weak<RawMidiPeer>>,
}

impl RawMidiPeer {
    pub fn new(reactor: &Reactor, name: &str, device: &str) -> Rc<RawMidiPeer> {
        info!("raw-MIDI peer '{name}' for device {device}");
        let peer = Rc::new(RawMidiPeer {
            reactor: reactor.clone(),
            name: name.to_string(),
            device: device.to_string(),
            file: RefCell::new(None),
            listener: RefCell::new(None),
            normalizer: RefCell::new(MidiNormalizer::new()),
            connection_count: Cell::new(0),
            handle: new_shared_handle(),
            weak_self: RefCell::new(Weak::new()),
        });
        *peer.weak_self.borrow_mut() = Rc::downgrade(&peer);
        peer
    }

    pub fn is_open(&self) -> bool {
        self.file.borrow().is_some()
    }

    fn open(&self) {
        if self.is_open() {
            return;
        }
        let mut file = open_nonblocking(&self.device);
        if file.is_none() {
            // A missing path becomes a FIFO, handy for testing and for
            // piping software into the graph.
            warn!("device {} does not exist, creating a pipe", self.device);
            if mkfifo(&self.device) {
                file = open_nonblocking(&self.device);
            }
        }
        let Some(file) = file else {
            error!("can not open raw-MIDI device {}", self.device);
            return;
        };

        let fd = file.as_raw_fd();
        let weak = self.weak_self.borrow().clone();
        match self.reactor.add_fd_in(fd, move |_fd| {
            if let Some(peer) = weak.upgrade() {
                peer.read_midi();
            }
        }) {
            Ok(listener) => *self.listener.borrow_mut() = Some(listener),
            Err(err) => {
                // Still usable for writing.
                error!("can not watch {}: {err}; writes only", self.device);
            }
        }
        *self.file.borrow_mut() = Some(file);
        info!("opened raw-MIDI device {}", self.device);
    }

    fn close(&self) {
        if self.file.borrow().is_none() {
            return;
        }
        self.listener.borrow_mut().take();
        self.file.borrow_mut().take();
        info!("closed raw-MIDI device {}", self.device);
    }

    fn read_midi(&self) {
        let mut buffer = [0u8; 1024];
        let count = {
            let file = self.file.borrow();
            let Some(mut file) = file.as_ref() else {
                return;
            };
            match file.read(&mut buffer) {
                Ok(count) => count,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("error reading {}: {err}", self.device);
                    return;
                }
            }
        };
        if count == 0 {
            return;
        }

        let handle = self.handle.borrow();
        let Some(handle) = handle.as_ref() else { return };
        self.normalizer
            .borrow_mut()
            .feed(&buffer[..count], |message| {
                handle.send(&message);
            });
    }
}

fn open_nonblocking(path: &str) -> Option<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .ok()
}

fn mkfifo(path: &str) -> bool {
    let Ok(cpath) = CString::new(path) else {
        return false;
    };
    let r = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
    if r != 0 {
        error!(
            "can not create pipe {path}: {}",
            std::io::Error::last_os_error()
        );
    }
    r == 0
}

impl MidiPeer for RawMidiPeer {
    fn kind(&self) -> &'static str {
        "local:rawmidi"
    }

    fn send_midi(&self, _from: PeerId, data: &Bytes) {
        let file = self.file.borrow();
        let Some(mut file) = file.as_ref() else {
            return;
        };
        if let Err(err) = file.write_all(data) {
            error!("error writing to {}: {err}", self.device);
        }
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": self.kind(),
            "name": self.name,
            "device": self.device,
            "status": if self.is_open() { "open" } else { "closed" },
        })
    }

    fn event(&self, event: PeerEvent, peer: PeerId) {
        match event {
            PeerEvent::ConnectedPeer => {
                let count = self.connection_count.get() + 1;
                self.connection_count.set(count);
                debug!("edge to {peer} up, device use count {count}");
                if count == 1 {
                    self.open();
                }
            }
            PeerEvent::DisconnectedPeer => {
                let count = (self.connection_count.get() - 1).max(0);
                self.connection_count.set(count);
                debug!("edge to {peer} down, device use count {count}");
                if count == 0 {
                    self.close();
                }
            }
        }
    }

    fn attach(&self, handle: PeerHandle) {
        *self.handle.borrow_mut() = Some(handle);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
