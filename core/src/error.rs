use thiserror::Error;

/// Errors raised while parsing or emitting RTP-MIDI traffic.
///
/// Everything here is recoverable at the packet level: the current
/// packet is dropped and the session keeps serving the socket.
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer overrun at offset {at}")]
    Overrun { at: usize },

    #[error("bad MIDI packet: {0}")]
    BadMidiPacket(&'static str),

    #[error("bad SysEx: {0}")]
    BadSysex(&'static str),

    #[error("unsupported protocol version {0}, only version 2 is understood")]
    BadProtocolVersion(u32),

    #[error("unknown session command {0:#06x}")]
    UnknownCommand(u16),

    #[error("can not resolve {address}:{port}")]
    Resolve { address: String, port: String },

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
