//! RTP-MIDI session protocol (Apple network MIDI) plus the
//! single-threaded runtime it is served from.
//!
//! The building blocks stack up like this: [`poller::Reactor`] owns
//! the thread, [`udppeer::UdpEndpoint`] feeds it datagrams,
//! [`rtppeer::RtpPeer`] speaks the session protocol over any
//! transport, and [`rtpclient::RtpClient`] / [`rtpserver::RtpServer`]
//! own sockets and drive peers from either side of the handshake.

pub mod codec;
pub mod command;
pub mod error;
pub mod iobuf;
pub mod journal;
pub mod poller;
pub mod rtpclient;
pub mod rtppeer;
pub mod rtpserver;
pub mod signal;
pub mod stats;
pub mod udppeer;

pub use error::{Error, Result};
pub use poller::{Listener, Reactor, Timer};
pub use rtpclient::{Endpoint, RtpClient};
pub use rtppeer::{DisconnectReason, PortKind, RtpPeer, Status};
pub use rtpserver::RtpServer;
pub use signal::{Connection, Signal};
