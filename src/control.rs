//! JSON control socket: line-delimited requests over a Unix stream
//! socket, mainly `status` for introspection plus a few graph
//! mutations. Connection problems stay with their connection; the
//! daemon never falls over because a control client misbehaved.

use std::cell::{Cell, RefCell};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rtpmidi_core::poller::{Listener, Reactor};
use serde_json::{json, Value};

use crate::router::MidiRouter;

pub struct ControlSocket {
    inner: Rc<ControlInner>,
}

struct ControlClient {
    id: u32,
    stream: UnixStream,
    buffer: Vec<u8>,
    _listener: Listener,
}

struct ControlInner {
    reactor: Reactor,
    router: Rc<MidiRouter>,
    path: PathBuf,
    socket: UnixListener,
    started: Instant,
    clients: RefCell<Vec<ControlClient>>,
    next_client: Cell<u32>,
    _accept_listener: RefCell<Option<Listener>>,
}

impl ControlSocket {
    pub fn new(reactor: &Reactor, router: &Rc<MidiRouter>, path: &Path) -> Result<ControlSocket> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale control socket {}", path.display()))?;
        }
        let socket = UnixListener::bind(path)
            .with_context(|| format!("binding control socket {}", path.display()))?;
        socket.set_nonblocking(true)?;

        let inner = Rc::new(ControlInner {
            reactor: reactor.clone(),
            router: Rc::clone(router),
            path: path.to_path_buf(),
            socket,
            started: Instant::now(),
            clients: RefCell::new(Vec::new()),
            next_client: Cell::new(1),
            _accept_listener: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let listener = reactor.add_fd_in(inner.socket.as_raw_fd(), move |_fd| {
            if let Some(inner) = weak.upgrade() {
                inner.accept_clients();
            }
        })?;
        *inner._accept_listener.borrow_mut() = Some(listener);

        info!("control socket listening at {}", path.display());
        Ok(ControlSocket { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.inner.path);
    }
}

impl ControlInner {
    fn accept_clients(self: &Rc<Self>) {
        loop {
            match self.socket.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = self.add_client(stream) {
                        warn!("rejecting control client: {err}");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("control socket accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn add_client(self: &Rc<Self>, stream: UnixStream) -> Result<()> {
        stream.set_nonblocking(true)?;
        let id = self.next_client.get();
        self.next_client.set(id + 1);

        let weak = Rc::downgrade(self);
        let listener = self
            .reactor
            .add_fd_in(stream.as_raw_fd(), move |_fd| {
                if let Some(inner) = weak.upgrade() {
                    inner.client_readable(id);
                }
            })?;

        debug!("control client {id} connected");
        self.clients.borrow_mut().push(ControlClient {
            id,
            stream,
            buffer: Vec::new(),
            _listener: listener,
        });
        Ok(())
    }

    fn client_readable(&self, id: u32) {
        let mut closed = false;
        let mut requests = Vec::new();
        {
            let mut clients = self.clients.borrow_mut();
            let Some(client) = clients.iter_mut().find(|c| c.id == id) else {
                return;
            };
            let mut chunk = [0u8; 4096];
            match client.stream.read(&mut chunk) {
                Ok(0) => closed = true,
                Ok(n) => {
                    client.buffer.extend_from_slice(&chunk[..n]);
                    while let Some(newline) = client.buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = client.buffer.drain(..=newline).collect();
                        let line = String::from_utf8_lossy(&line).trim().to_string();
                        if !line.is_empty() {
                            requests.push(line);
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!("control client {id} read error: {err}");
                    closed = true;
                }
            }
        }

        for line in requests {
            let response = self.dispatch(&line);
            let mut clients = self.clients.borrow_mut();
            if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
                let mut payload = response.to_string();
                payload.push('\n');
                if let Err(err) = client.stream.write_all(payload.as_bytes()) {
                    debug!("control client {id} write error: {err}");
                    closed = true;
                }
            }
        }

        if closed {
            debug!("control client {id} disconnected");
            self.clients.borrow_mut().retain(|c| c.id != id);
        }
    }

    fn dispatch(&self, line: &str) -> Value {
        let request: Value = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => return json!({ "error": format!("bad request: {err}") }),
        };
        let method = request["method"].as_str().unwrap_or_default();
        let params = &request["params"];

        match method {
            "status" => json!({
                "result": {
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_seconds": self.started.elapsed().as_secs(),
                    "router": self.router.status(),
                }
            }),
            "router.connect" => self.edge_request(params, true),
            "router.disconnect" => self.edge_request(params, false),
            "router.remove" => match params["id"].as_u64() {
                Some(id) => {
                    self.router.remove_peer(id as u32);
                    json!({ "result": "ok" })
                }
                None => json!({ "error": "missing peer id" }),
            },
            "help" => json!({
                "result": ["status", "router.connect", "router.disconnect", "router.remove", "help"]
            }),
            other => json!({ "error": format!("unknown method {other:?}") }),
        }
    }

    fn edge_request(&self, params: &Value, connect: bool) -> Value {
        let (Some(from), Some(to)) = (params["from"].as_u64(), params["to"].as_u64()) else {
            return json!({ "error": "missing from/to peer ids" });
        };
        if connect {
            self.router.connect(from as u32, to as u32);
        } else {
            self.router.disconnect(from as u32, to as u32);
        }
        json!({ "result": "ok" })
    }
}
