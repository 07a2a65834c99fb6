//! Bound UDP socket wired into the reactor.
//!
//! One endpoint wraps one nonblocking socket. Incoming datagrams are
//! surfaced through the [`UdpEndpoint::on_read`] signal together with
//! their source address; outgoing sends resolve and cache the
//! destination. Dropping the endpoint deregisters the descriptor.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use bytes::Bytes;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::poller::{Listener, Reactor};
use crate::signal::Signal;

/// Kernel-reported MTU-sized receive buffer; larger datagrams are
/// silently truncated, framing above must cope.
const RECV_BUFFER_SIZE: usize = 1500;
const MAX_ADDRESS_CACHE_SIZE: usize = 100;

/// One received datagram.
pub struct ReadEvent {
    pub data: Bytes,
    pub source: SocketAddr,
}

struct UdpInner {
    socket: UdpSocket,
    on_read: Signal<ReadEvent>,
    address_cache: RefCell<HashMap<(String, u16), SocketAddr>>,
}

pub struct UdpEndpoint {
    inner: Rc<UdpInner>,
    listener: Listener,
}

impl UdpEndpoint {
    /// Resolve `address:port` and bind the first candidate that takes;
    /// port 0 asks the kernel for a free one.
    pub fn open(reactor: &Reactor, address: &str, port: u16) -> Result<UdpEndpoint> {
        let candidates = (address, port).to_socket_addrs().map_err(|_| Error::Resolve {
            address: address.to_string(),
            port: port.to_string(),
        })?;

        let mut socket = None;
        for candidate in candidates {
            match UdpSocket::bind(candidate) {
                Ok(s) => {
                    socket = Some(s);
                    break;
                }
                Err(err) => debug!("could not bind {candidate}: {err}, trying next"),
            }
        }
        let socket = socket.ok_or_else(|| Error::Resolve {
            address: address.to_string(),
            port: port.to_string(),
        })?;
        socket.set_nonblocking(true)?;

        let inner = Rc::new(UdpInner {
            socket,
            on_read: Signal::new(),
            address_cache: RefCell::new(HashMap::new()),
        });

        let reader = Rc::clone(&inner);
        let listener = reactor.add_fd_in(inner.socket.as_raw_fd(), move |_fd| {
            reader.data_ready();
        })?;

        debug!("udp endpoint listening at {}", inner.socket.local_addr()?);
        Ok(UdpEndpoint { inner, listener })
    }

    pub fn on_read(&self) -> &Signal<ReadEvent> {
        &self.inner.on_read
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn local_port(&self) -> u16 {
        self.inner
            .socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Send to a hostname and port, resolving through the cache.
    pub fn send(&self, data: &[u8], host: &str, port: u16) -> Result<()> {
        let addr = self.inner.resolve(host, port)?;
        self.send_to(data, addr)
    }

    /// Send to an already-resolved address.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        match self.inner.socket.send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(err) if is_transient(&err) => {
                // The datagram is dropped; the next packet retries.
                warn!("transient send error to {addr}: {err}");
                Ok(())
            }
            Err(err) => Err(Error::Network(err)),
        }
    }

    pub fn close(&mut self) {
        self.listener.stop();
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::ENOBUFS)
}

impl UdpInner {
    fn data_ready(&self) {
        let mut raw = [0u8; RECV_BUFFER_SIZE];
        match self.socket.recv_from(&mut raw) {
            Ok((n, source)) => {
                debug!("got {n} bytes from {source}");
                self.on_read.emit(&ReadEvent {
                    data: Bytes::copy_from_slice(&raw[..n]),
                    source,
                });
            }
            Err(err) if is_transient(&err) => {}
            Err(err) => warn!(
                "error reading udp socket at {:?}: {err}",
                self.socket.local_addr()
            ),
        }
    }

    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let key = (host.to_string(), port);
        if let Some(addr) = self.address_cache.borrow().get(&key) {
            return Ok(*addr);
        }

        let addr = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::Resolve {
                address: host.to_string(),
                port: port.to_string(),
            })?;

        let mut cache = self.address_cache.borrow_mut();
        if cache.len() >= MAX_ADDRESS_CACHE_SIZE {
            cache.clear();
        }
        cache.insert(key, addr);
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::{Duration, Instant};

    #[test]
    fn datagrams_arrive_with_source_address() {
        let reactor = Reactor::new().unwrap();
        let a = UdpEndpoint::open(&reactor, "127.0.0.1", 0).unwrap();
        let b = UdpEndpoint::open(&reactor, "127.0.0.1", 0).unwrap();

        let received: Rc<RefCell<Vec<(Bytes, SocketAddr)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        let _conn = b
            .on_read()
            .connect(move |ev| sink.borrow_mut().push((ev.data.clone(), ev.source)));

        a.send(b"hello", "127.0.0.1", b.local_port()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while received.borrow().is_empty() && Instant::now() < deadline {
            reactor.wait(Some(Duration::from_millis(20)));
        }

        let received = received.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0].0[..], b"hello");
        assert_eq!(received[0].1.port(), a.local_port());
    }

    #[test]
    fn resolve_failure_is_an_error() {
        let reactor = Reactor::new().unwrap();
        let a = UdpEndpoint::open(&reactor, "127.0.0.1", 0).unwrap();
        assert!(a
            .send(b"x", "no-such-host.invalid.localdomain", 5004)
            .is_err());
    }
}
