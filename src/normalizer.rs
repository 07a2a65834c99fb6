//! Byte-stream normalizer: turns an unframed MIDI byte stream (a raw
//! device, a FIFO) into one complete message per callback, using the
//! standard command sizing table. A SysEx runs until its F7.

use bytes::Bytes;
use log::debug;

enum Waiting {
    /// Next byte decides the message size.
    Start,
    /// Inside a SysEx, collecting until F7.
    SysexEnd,
    /// Collecting a fixed-size message.
    Size(usize),
}

pub struct MidiNormalizer {
    buffer: Vec<u8>,
    waiting: Waiting,
}

impl Default for MidiNormalizer {
    fn default() -> Self {
        MidiNormalizer::new()
    }
}

impl MidiNormalizer {
    pub fn new() -> MidiNormalizer {
        MidiNormalizer {
            buffer: Vec::with_capacity(4),
            waiting: Waiting::Start,
        }
    }

    /// Feed a chunk of stream bytes; `emit` is called once per
    /// complete MIDI message.
    pub fn feed(&mut self, data: &[u8], mut emit: impl FnMut(Bytes)) {
        for &byte in data {
            self.push_byte(byte, &mut emit);
        }
    }

    fn push_byte(&mut self, byte: u8, emit: &mut impl FnMut(Bytes)) {
        match self.waiting {
            Waiting::Start => match message_size(byte) {
                Some(0) => {
                    self.buffer.push(byte);
                    self.waiting = Waiting::SysexEnd;
                }
                Some(1) => emit(Bytes::copy_from_slice(&[byte])),
                Some(size) => {
                    self.buffer.push(byte);
                    self.waiting = Waiting::Size(size);
                }
                None => debug!("dropping stray stream byte {byte:#04x}"),
            },
            Waiting::SysexEnd => {
                self.buffer.push(byte);
                if byte == 0xf7 {
                    emit(Bytes::from(std::mem::take(&mut self.buffer)));
                    self.waiting = Waiting::Start;
                }
            }
            Waiting::Size(size) => {
                self.buffer.push(byte);
                if self.buffer.len() == size {
                    emit(Bytes::from(std::mem::take(&mut self.buffer)));
                    self.waiting = Waiting::Start;
                }
            }
        }
    }
}

/// Message size for a leading status byte: `Some(0)` marks a SysEx
/// (runs to F7), `None` a byte that can not start a message.
fn message_size(byte: u8) -> Option<usize> {
    match byte & 0xf0 {
        0x80 | 0x90 | 0xa0 | 0xb0 | 0xe0 => Some(3),
        0xc0 | 0xd0 => Some(2),
        0xf0 => match byte {
            0xf0 => Some(0),
            0xf1 | 0xf3 => Some(2),
            0xf2 => Some(3),
            0xf6 | 0xf8..=0xfc | 0xfe | 0xff => Some(1),
            _ => None,
        },
        _ => None,
    }
}
