//! Chapter-N recovery journal (RFC 6295 appendix A).
//!
//! The send side records, per channel and note, the last sequence
//! number that touched it; outgoing journaled packets carry a
//! chapter-N block for every channel with activity the remote has not
//! acknowledged yet. The receive side replays note-on/off events that
//! were described by a journal but never received, consulting a table
//! of already-applied note state so that replaying the same journal
//! twice emits nothing new.

use bytes::Bytes;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::iobuf::{Reader, Writer};

const CHANNELS: usize = 16;
const NOTES: usize = 128;

const HEADER_A_CHANNEL: u8 = 0x20;
const CHAPTER_N: u8 = 0x08;
const CHAPTERS_PCMW: u8 = 0xf0;

/// `a` is newer than `b` under wrapping u16 sequence arithmetic.
fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

#[derive(Clone, Copy)]
struct NoteRecord {
    /// Sequence that last turned the note on, and its velocity.
    on: Option<(u16, u8)>,
    /// Sequence that last turned the note off.
    off: Option<u16>,
}

impl NoteRecord {
    const EMPTY: NoteRecord = NoteRecord { on: None, off: None };
}

/// Send-side journal state.
#[derive(Default)]
pub struct SendJournal {
    channels: Vec<[NoteRecord; NOTES]>,
}

impl SendJournal {
    pub fn new() -> Self {
        SendJournal {
            channels: vec![[NoteRecord::EMPTY; NOTES]; CHANNELS],
        }
    }

    /// Record the note activity of an outgoing command list sent with
    /// sequence number `seq`. The list structure (delta times between
    /// commands, running status) matches what the receiving side
    /// parses; non-note commands are ignored.
    pub fn record_sent(&mut self, seq: u16, midi: &[u8]) {
        let mut pos = 0;
        let mut running = 0u8;
        let mut first = true;
        while pos < midi.len() {
            if !first {
                // Step over the delta-time varint.
                let mut continuations = 0;
                while pos < midi.len() && midi[pos] & 0x80 != 0 && continuations < 3 {
                    pos += 1;
                    continuations += 1;
                }
                pos += 1;
                if pos >= midi.len() {
                    break;
                }
            }
            first = false;

            let mut status = midi[pos];
            if status < 0x80 {
                status = running;
            } else {
                pos += 1;
                if (0x80..0xf0).contains(&status) {
                    running = status;
                } else {
                    // System messages carry no note state; stop rather
                    // than misparse an embedded SysEx payload.
                    break;
                }
            }
            let needed = match status & 0xf0 {
                0x80 | 0x90 | 0xa0 | 0xb0 | 0xe0 => 2,
                0xc0 | 0xd0 => 1,
                _ => break,
            };
            if pos + needed > midi.len() {
                break;
            }
            let channel = (status & 0x0f) as usize;
            match status & 0xf0 {
                0x90 if midi[pos + 1] > 0 => {
                    self.channels[channel][midi[pos] as usize & 0x7f].on =
                        Some((seq, midi[pos + 1] & 0x7f));
                    self.channels[channel][midi[pos] as usize & 0x7f].off = None;
                }
                0x90 | 0x80 => {
                    self.channels[channel][midi[pos] as usize & 0x7f].off = Some(seq);
                    self.channels[channel][midi[pos] as usize & 0x7f].on = None;
                }
                _ => {}
            }
            pos += needed;
        }
    }

    /// Anything the remote has not acknowledged yet?
    pub fn has_unacked(&self, seq_ack: u16) -> bool {
        self.channels.iter().any(|notes| {
            notes.iter().any(|record| {
                record.on.map(|(seq, _)| seq_newer(seq, seq_ack)).unwrap_or(false)
                    || record.off.map(|seq| seq_newer(seq, seq_ack)).unwrap_or(false)
            })
        })
    }

    /// Write the journal section describing everything newer than
    /// `seq_ack`, stamped with `seq_sent` (the previous packet).
    /// Returns false without writing when there is nothing to recover.
    pub fn write(&self, w: &mut Writer, seq_sent: u16, seq_ack: u16) -> Result<bool> {
        let mut chapters: Vec<(u8, Vec<u8>)> = Vec::new();
        for (channel, notes) in self.channels.iter().enumerate() {
            if let Some(body) = chapter_n_body(notes, seq_ack) {
                chapters.push((channel as u8, body));
            }
        }
        if chapters.is_empty() {
            return Ok(false);
        }
        if chapters.len() > 15 {
            // TOTCHAN is a four-bit field; the dropped channels recover
            // through a later packet once something else gets acked.
            warn!(
                "journal spans {} channels, sending the first 15",
                chapters.len()
            );
            chapters.truncate(15);
        }

        w.write_u8(HEADER_A_CHANNEL | chapters.len() as u8)?;
        w.write_u16(seq_sent)?;
        for (channel, body) in &chapters {
            let len = body.len() as u16;
            // The channel field is three bits on the wire; bit 7 is the
            // S flag and must stay clear.
            w.write_u8(((channel & 0x07) << 4) | ((len >> 8) as u8 & 0x07))?;
            w.write_u8(len as u8)?;
            w.write_u8(CHAPTER_N)?;
            w.copy_from(body)?;
        }
        Ok(true)
    }
}

fn chapter_n_body(notes: &[NoteRecord; NOTES], seq_ack: u16) -> Option<Vec<u8>> {
    let mut ons: Vec<(u8, u8)> = Vec::new();
    let mut offs: Vec<u8> = Vec::new();
    for (note, record) in notes.iter().enumerate() {
        if let Some((seq, vel)) = record.on {
            if seq_newer(seq, seq_ack) {
                ons.push((note as u8, vel));
            }
        }
        if let Some(seq) = record.off {
            if seq_newer(seq, seq_ack) {
                offs.push(note as u8);
            }
        }
    }
    if ons.is_empty() && offs.is_empty() {
        return None;
    }

    let mut body = Vec::new();
    body.push(ons.len() as u8 & 0x7f);
    let mut bitmaps = Vec::new();
    if offs.is_empty() {
        // LOW > HIGH encodes an empty note-off range.
        body.push(0xf0);
    } else {
        let low = offs.iter().min().unwrap() / 8;
        let high = offs.iter().max().unwrap() / 8;
        body.push((low << 4) | high);
        bitmaps.resize((high - low + 1) as usize, 0u8);
        for note in &offs {
            bitmaps[(note / 8 - low) as usize] |= 0x80 >> (note % 8);
        }
    }
    for (note, vel) in &ons {
        body.push(*note & 0x7f);
        // Bit 7 of the velocity: the note must play on recovery.
        body.push(vel | 0x80);
    }
    body.extend_from_slice(&bitmaps);
    Some(body)
}

/// Receive-side journal application with duplicate suppression.
#[derive(Default)]
pub struct ReceiveJournal {
    /// Velocity of notes currently known on; `None` means off/unknown.
    note_on: Vec<[Option<u8>; NOTES]>,
}

impl ReceiveJournal {
    pub fn new() -> Self {
        ReceiveJournal {
            note_on: vec![[None; NOTES]; CHANNELS],
        }
    }

    /// Track note state from a normally received MIDI message so a
    /// later journal does not replay what already arrived.
    pub fn track_received(&mut self, midi: &[u8]) {
        if midi.len() < 3 {
            return;
        }
        let status = midi[0];
        let channel = (status & 0x0f) as usize;
        let note = (midi[1] & 0x7f) as usize;
        match status & 0xf0 {
            0x90 if midi[2] > 0 => self.note_on[channel][note] = Some(midi[2] & 0x7f),
            0x90 | 0x80 => self.note_on[channel][note] = None,
            _ => {}
        }
    }

    /// Parse a journal section, emitting the missed note events into
    /// `out`. Returns the sequence number the journal acknowledges.
    pub fn parse(&mut self, r: &mut Reader, out: &mut Vec<Bytes>) -> Result<u16> {
        let header = r.read_u8()?;
        let has_channel_journals = header & HEADER_A_CHANNEL != 0;
        let total_channels = header & 0x0f;
        let seqnum = r.read_u16()?;
        debug!("journal for seq {seqnum}, {total_channels} channel(s)");

        if has_channel_journals {
            for _ in 0..total_channels {
                self.parse_channel(r, out)?;
            }
        }
        Ok(seqnum)
    }

    fn parse_channel(&mut self, r: &mut Reader, out: &mut Vec<Bytes>) -> Result<()> {
        let head = r.read_u8()?;
        let length = (((head & 0x07) as usize) << 8) | r.read_u8()? as usize;
        let channel = (head >> 4) & 0x07;
        let chapters = r.read_u8()?;

        if chapters & CHAPTERS_PCMW != 0 {
            // Chapters we do not interpret; their length lets us step
            // over the whole block without guessing the layout.
            warn!("journal carries P/C/M/W chapters, skipping {length} bytes");
            r.skip(length)?;
            return Ok(());
        }
        if chapters & CHAPTER_N != 0 {
            self.parse_chapter_n(channel, r, out)?;
        }
        Ok(())
    }

    fn parse_chapter_n(&mut self, channel: u8, r: &mut Reader, out: &mut Vec<Bytes>) -> Result<()> {
        let note_on_count = r.read_u8()? & 0x7f;
        let range = r.read_u8()?;
        let low = (range >> 4) & 0x0f;
        let high = range & 0x0f;

        for _ in 0..note_on_count {
            let note = r.read_u8()? & 0x7f;
            let velocity = r.read_u8()?;
            let must_play = velocity & 0x80 != 0;
            let velocity = velocity & 0x7f;
            if !must_play {
                continue;
            }
            if self.note_on[channel as usize][note as usize] == Some(velocity) {
                continue; // already applied, stay idempotent
            }
            self.note_on[channel as usize][note as usize] = Some(velocity);
            out.push(Bytes::copy_from_slice(&[0x90 | channel, note, velocity]));
        }

        if low <= high {
            for i in low..=high {
                let bitmap = r.read_u8()?;
                for j in 0..8u8 {
                    if bitmap & (0x80 >> j) == 0 {
                        continue;
                    }
                    let note = i * 8 + j;
                    if note >= NOTES as u8 {
                        return Err(Error::BadMidiPacket("journal note out of range"));
                    }
                    if self.note_on[channel as usize][note as usize].is_none() {
                        continue; // never seen on, nothing to release
                    }
                    self.note_on[channel as usize][note as usize] = None;
                    out.push(Bytes::copy_from_slice(&[0x80 | channel, note, 0]));
                }
            }
        }
        Ok(())
    }
}
