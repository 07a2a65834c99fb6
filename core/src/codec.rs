//! MIDI command-list codec.
//!
//! Parses the RFC 6295 MIDI list structure: command sizing, delta-time
//! varints, running status and SysEx reassembly across packets. The
//! parser is stateful because both running status and a segmented
//! SysEx survive from one packet to the next.

use bytes::Bytes;
use log::warn;

use crate::error::{Error, Result};
use crate::iobuf::Reader;

/// Decode one variable-length delta time (one to four bytes, continuation in
/// bit 7). Returns the value and the number of bytes consumed.
pub fn read_delta_time(r: &mut Reader) -> Result<(u32, usize)> {
    let mut byte = r.read_u8()?;
    let mut value = (byte & 0x7f) as u32;
    let mut consumed = 1;
    while byte & 0x80 != 0 {
        if consumed == 4 {
            return Err(Error::BadMidiPacket("delta time longer than four bytes"));
        }
        byte = r.read_u8()?;
        value = (value << 7) | (byte & 0x7f) as u32;
        consumed += 1;
    }
    Ok((value, consumed))
}

/// Encode a delta time with the standard continuation convention.
pub fn write_delta_time(out: &mut Vec<u8>, mut value: u32) {
    let mut chunks = [0u8; 4];
    let mut n = 0;
    loop {
        chunks[n] = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in (1..n).rev() {
        out.push(chunks[i] | 0x80);
    }
    out.push(chunks[0]);
}

pub struct MidiListParser {
    running_status: u8,
    sysex: Vec<u8>,
}

impl Default for MidiListParser {
    fn default() -> Self {
        MidiListParser::new()
    }
}

impl MidiListParser {
    pub fn new() -> Self {
        MidiListParser {
            running_status: 0,
            sysex: Vec::new(),
        }
    }

    /// True while a segmented SysEx is waiting for its continuation.
    pub fn sysex_pending(&self) -> bool {
        !self.sysex.is_empty()
    }

    /// Drop any partially assembled SysEx.
    pub fn clear_sysex(&mut self) {
        self.sysex.clear();
    }

    /// Parse a complete command section of `length` bytes, emitting
    /// each decoded MIDI message into `out`. `first_has_delta` mirrors
    /// the Z flag of the section header.
    pub fn parse_list(
        &mut self,
        r: &mut Reader,
        length: usize,
        first_has_delta: bool,
        out: &mut Vec<Bytes>,
    ) -> Result<()> {
        r.check_available(length)?;

        // The first channel command in a list must carry its status
        // octet (RFC 6295 p.16).
        self.running_status = 0;

        let mut remaining = length;
        if first_has_delta && remaining > 0 {
            let (_delta, consumed) = read_delta_time(r)?;
            remaining = remaining
                .checked_sub(consumed)
                .ok_or(Error::BadMidiPacket("delta time exceeds section"))?;
        }

        while remaining > 0 {
            let cmd_len = self.next_command_length(r)?;
            if cmd_len == 0 || cmd_len > remaining {
                return Err(Error::BadMidiPacket("command exceeds section length"));
            }
            remaining -= cmd_len;

            let first = r.peek_u8()?;
            if self.sysex_pending() || first == 0xf0 {
                let chunk = r.read_slice(cmd_len)?;
                if let Err(err) = self.parse_sysex(chunk, out) {
                    // A broken segmentation drops the buffer but not
                    // the rest of the packet.
                    self.sysex.clear();
                    return Err(err);
                }
            } else if first < 0x80 {
                if self.running_status == 0 {
                    return Err(Error::BadMidiPacket("abbreviated command without status"));
                }
                let mut midi = Vec::with_capacity(cmd_len + 1);
                midi.push(self.running_status);
                midi.extend_from_slice(r.read_slice(cmd_len)?);
                out.push(Bytes::from(midi));
            } else {
                out.push(Bytes::copy_from_slice(r.read_slice(cmd_len)?));
            }

            if remaining > 0 {
                let (_delta, consumed) = read_delta_time(r)?;
                remaining = remaining
                    .checked_sub(consumed)
                    .ok_or(Error::BadMidiPacket("delta time exceeds section"))?;
            }
        }
        Ok(())
    }

    /// Byte length of the command at the cursor, updating running
    /// status. Real-time messages (0xF8..=0xFF) leave running status
    /// alone; system common and SysEx (0xF0..=0xF7) cancel it.
    fn next_command_length(&mut self, r: &Reader) -> Result<usize> {
        let mut status = r.peek_u8()?;
        let mut shortened = 0usize;

        if (0xf0..=0xf7).contains(&status) {
            self.running_status = 0;
        } else if (0x80..0xf0).contains(&status) {
            self.running_status = status;
        } else if status < 0x80 {
            status = self.running_status;
            shortened = 1;
        }

        let length = match status & 0xf0 {
            0x80 | 0x90 | 0xa0 | 0xb0 | 0xe0 => 3,
            0xc0 | 0xd0 => 2,
            _ => match status {
                0xf6 | 0xf8..=0xfc | 0xfe | 0xff => 1,
                0xf1 | 0xf3 => 2,
                0xf2 => 3,
                0xf0 | 0xf7 | 0xf4 => {
                    // A SysEx segment runs up to (and including) the
                    // next byte with the top bit set.
                    let mut length = 2;
                    loop {
                        let byte = r
                            .peek_at(length - 1)
                            .map_err(|_| Error::BadSysex("unexpected SysEx packet end"))?;
                        if byte & 0x80 != 0 {
                            break;
                        }
                        length += 1;
                    }
                    length
                }
                _ => 0,
            },
        };

        if length == 0 || length <= shortened {
            return Err(Error::BadMidiPacket("unexpected MIDI data"));
        }
        Ok(length - shortened)
    }

    /// Apply the SysEx segmentation rules to one chunk:
    /// `F0 … F7` complete, `F0 … F0` opens, `F7 … F0` continues,
    /// `F7 … F7` finishes, `F7 … F4` cancels.
    fn parse_sysex(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) -> Result<()> {
        let last = *chunk.last().ok_or(Error::BadSysex("empty chunk"))?;

        if self.sysex_pending() {
            if chunk[0] != 0xf7 {
                return Err(Error::BadSysex("continuation does not start with F7"));
            }
            self.sysex.extend_from_slice(&chunk[1..chunk.len() - 1]);
            match last {
                0xf7 => {
                    self.sysex.push(0xf7);
                    if self.sysex.len() <= 2 {
                        warn!("not emitting empty SysEx");
                    } else {
                        out.push(Bytes::from(std::mem::take(&mut self.sysex)));
                    }
                    self.sysex.clear();
                }
                0xf4 => self.sysex.clear(),
                0xf0 => {} // middle segment, keep accumulating
                _ => return Err(Error::BadSysex("bad segment end byte")),
            }
        } else {
            debug_assert_eq!(chunk[0], 0xf0);
            match last {
                0xf7 => out.push(Bytes::copy_from_slice(chunk)),
                0xf0 => {
                    // To-be-continued: keep everything except the
                    // trailing continuation marker.
                    self.sysex.extend_from_slice(&chunk[..chunk.len() - 1]);
                }
                _ => return Err(Error::BadSysex("bad segment end byte")),
            }
        }
        Ok(())
    }
}
