//! Apple session-protocol command packets.
//!
//! Every command starts with the `0xFF 0xFF` signature and a two-byte
//! ASCII code. `IN`/`OK`/`NO`/`BY` carry a protocol version (always 2),
//! the initiator token and the sender SSRC; `CK` carries the three
//! clock timestamps; `RS` acknowledges received sequence numbers.

use crate::error::{Error, Result};
use crate::iobuf::{Reader, Writer};

pub const COMMAND_SIGNATURE: u16 = 0xffff;
pub const PROTOCOL_VERSION: u32 = 2;

pub const CMD_IN: u16 = 0x494e;
pub const CMD_OK: u16 = 0x4f4b;
pub const CMD_NO: u16 = 0x4e4f;
pub const CMD_BY: u16 = 0x4259;
pub const CMD_CK: u16 = 0x434b;
pub const CMD_RS: u16 = 0x5253;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// `IN`: session invitation.
    Invitation {
        initiator: u32,
        ssrc: u32,
        name: String,
    },
    /// `OK`: invitation accepted.
    Accepted {
        initiator: u32,
        ssrc: u32,
        name: String,
    },
    /// `NO`: invitation rejected.
    Rejected { initiator: u32, ssrc: u32 },
    /// `BY`: goodbye.
    Goodbye { initiator: u32, ssrc: u32 },
    /// `CK`: clock synchronization exchange.
    Sync { ssrc: u32, count: u8, ck: [u64; 3] },
    /// `RS`: receiver feedback (journal acknowledge).
    Feedback { ssrc: u32, sequence: u16 },
}

/// The packet starts with the command signature and is long enough to
/// hold a command at all.
pub fn is_command(data: &[u8]) -> bool {
    data.len() >= 12 && data[0] == 0xff && data[1] == 0xff
}

/// Receiver-feedback packets are told apart cheaply during dispatch.
pub fn is_feedback(data: &[u8]) -> bool {
    data.len() >= 12 && data[0] == 0xff && data[1] == 0xff && data[2] == b'R' && data[3] == b'S'
}

impl SessionCommand {
    pub fn code(&self) -> u16 {
        match self {
            SessionCommand::Invitation { .. } => CMD_IN,
            SessionCommand::Accepted { .. } => CMD_OK,
            SessionCommand::Rejected { .. } => CMD_NO,
            SessionCommand::Goodbye { .. } => CMD_BY,
            SessionCommand::Sync { .. } => CMD_CK,
            SessionCommand::Feedback { .. } => CMD_RS,
        }
    }

    pub fn parse(data: &[u8]) -> Result<SessionCommand> {
        let mut r = Reader::new(data);
        let signature = r.read_u16()?;
        if signature != COMMAND_SIGNATURE {
            return Err(Error::BadMidiPacket("missing command signature"));
        }
        let code = r.read_u16()?;
        match code {
            CMD_IN | CMD_OK | CMD_NO | CMD_BY => {
                let protocol = r.read_u32()?;
                if protocol != PROTOCOL_VERSION {
                    return Err(Error::BadProtocolVersion(protocol));
                }
                let initiator = r.read_u32()?;
                let ssrc = r.read_u32()?;
                match code {
                    CMD_IN | CMD_OK => {
                        let name = String::from_utf8_lossy(r.read_cstring()?).into_owned();
                        if code == CMD_IN {
                            Ok(SessionCommand::Invitation {
                                initiator,
                                ssrc,
                                name,
                            })
                        } else {
                            Ok(SessionCommand::Accepted {
                                initiator,
                                ssrc,
                                name,
                            })
                        }
                    }
                    CMD_NO => Ok(SessionCommand::Rejected { initiator, ssrc }),
                    _ => Ok(SessionCommand::Goodbye { initiator, ssrc }),
                }
            }
            CMD_CK => {
                let ssrc = r.read_u32()?;
                let count = r.read_u8()?;
                r.skip(3)?;
                let ck = [r.read_u64()?, r.read_u64()?, r.read_u64()?];
                Ok(SessionCommand::Sync { ssrc, count, ck })
            }
            CMD_RS => {
                let ssrc = r.read_u32()?;
                let sequence = r.read_u16()?;
                Ok(SessionCommand::Feedback { ssrc, sequence })
            }
            other => Err(Error::UnknownCommand(other)),
        }
    }

    pub fn write(&self, w: &mut Writer) -> Result<()> {
        w.write_u16(COMMAND_SIGNATURE)?;
        w.write_u16(self.code())?;
        match self {
            SessionCommand::Invitation {
                initiator,
                ssrc,
                name,
            }
            | SessionCommand::Accepted {
                initiator,
                ssrc,
                name,
            } => {
                w.write_u32(PROTOCOL_VERSION)?;
                w.write_u32(*initiator)?;
                w.write_u32(*ssrc)?;
                w.write_cstring(name.as_bytes())?;
            }
            SessionCommand::Rejected { initiator, ssrc }
            | SessionCommand::Goodbye { initiator, ssrc } => {
                w.write_u32(PROTOCOL_VERSION)?;
                w.write_u32(*initiator)?;
                w.write_u32(*ssrc)?;
            }
            SessionCommand::Sync { ssrc, count, ck } => {
                w.write_u32(*ssrc)?;
                w.write_u8(*count)?;
                w.write_u8(0)?;
                w.write_u16(0)?;
                w.write_u64(ck[0])?;
                w.write_u64(ck[1])?;
                w.write_u64(ck[2])?;
            }
            SessionCommand::Feedback { ssrc, sequence } => {
                w.write_u32(*ssrc)?;
                w.write_u16(*sequence)?;
                w.write_u16(0)?;
            }
        }
        Ok(())
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let capacity = match self {
            SessionCommand::Invitation { name, .. } | SessionCommand::Accepted { name, .. } => {
                17 + name.len()
            }
            _ => 36,
        };
        let mut buf = vec![0u8; capacity];
        let mut w = Writer::new(&mut buf);
        // The buffer is sized from the command itself, so the write
        // can not run out of room.
        self.write(&mut w).expect("command buffer sized to fit");
        let len = w.pos();
        buf.truncate(len);
        buf
    }
}
