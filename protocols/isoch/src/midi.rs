// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol about MIDI byte stream transferred in AM824 MIDI conformant data channel.
//!
//! The module includes structure, enumeration, and trait and its implementation to parse the
//! byte stream, delivered byte by byte in successive data blocks, into complete MIDI messages,
//! and to encode messages into the byte stream.

use super::am824::serialize_midi;

/// The complete MIDI message, up to 3 bytes. System exclusive message is not expressed.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct MidiMessage {
    bytes: [u8; 3],
    len: usize,
}

impl MidiMessage {
    /// Instantiate with bytes. Bytes more than 3 are ignored.
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(3);
        let mut msg = Self {
            bytes: [0; 3],
            len,
        };
        msg.bytes[..len].copy_from_slice(&bytes[..len]);
        msg
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }
}

/// The state of parser.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MidiParserState {
    /// No status byte is available.
    AwaitingStatus,
    /// The first data byte is expected.
    AwaitingData1,
    /// The second data byte is expected.
    AwaitingData2,
    /// The message is completed. The parser emits it and returns to `AwaitingStatus` at once,
    /// keeping the status as running status if it is for channel voice or mode message.
    Complete,
}

impl Default for MidiParserState {
    fn default() -> Self {
        Self::AwaitingStatus
    }
}

const STATUS_FLAG: u8 = 0x80;
const SYSEX_START: u8 = 0xf0;
const SYSEX_END: u8 = 0xf7;
const TUNE_REQUEST: u8 = 0xf6;
const REALTIME_MIN: u8 = 0xf8;

/// The number of data bytes following the status byte.
fn data_byte_count(status: u8) -> Option<usize> {
    match status {
        0x80..=0xbf | 0xe0..=0xef => Some(2),
        0xc0..=0xdf => Some(1),
        0xf1 | 0xf3 => Some(1),
        0xf2 => Some(2),
        TUNE_REQUEST => Some(0),
        _ => None,
    }
}

/// The parser of MIDI byte stream with running status. The state is kept between calls, thus
/// a message split into several data blocks is completed when the last byte arrives.
#[derive(Default, Debug)]
pub struct MidiParser {
    state: MidiParserState,
    running_status: Option<u8>,
    pending: [u8; 3],
    expected: usize,
    in_sysex: bool,
    discarded: u64,
}

impl MidiParser {
    pub fn state(&self) -> MidiParserState {
        self.state
    }

    /// The number of bytes discarded due to missing status or system exclusive message.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed one byte. The complete message is returned when available.
    pub fn feed(&mut self, byte: u8) -> Option<MidiMessage> {
        if byte >= REALTIME_MIN {
            // System real time message interleaves any message.
            return Some(MidiMessage::new(&[byte]));
        }

        if byte & STATUS_FLAG > 0 {
            self.feed_status(byte)
        } else {
            self.feed_data(byte)
        }
    }

    /// Feed bytes, then call the closure for each complete message.
    pub fn feed_bytes<F>(&mut self, bytes: &[u8], mut cb: F)
    where
        F: FnMut(MidiMessage),
    {
        bytes.iter().for_each(|&byte| {
            if let Some(msg) = self.feed(byte) {
                cb(msg);
            }
        });
    }

    fn feed_status(&mut self, status: u8) -> Option<MidiMessage> {
        // Any status byte terminates the pending message.
        self.in_sysex = false;

        match status {
            SYSEX_START => {
                self.in_sysex = true;
                self.running_status = None;
                self.state = MidiParserState::AwaitingStatus;
                None
            }
            SYSEX_END => {
                self.running_status = None;
                self.state = MidiParserState::AwaitingStatus;
                None
            }
            _ => match data_byte_count(status) {
                Some(0) => {
                    self.running_status = None;
                    self.state = MidiParserState::AwaitingStatus;
                    Some(MidiMessage::new(&[status]))
                }
                Some(count) => {
                    // System common message cancels running status.
                    self.running_status = if status < SYSEX_START {
                        Some(status)
                    } else {
                        None
                    };
                    self.pending[0] = status;
                    self.expected = count;
                    self.state = MidiParserState::AwaitingData1;
                    None
                }
                None => {
                    self.running_status = None;
                    self.state = MidiParserState::AwaitingStatus;
                    self.discarded += 1;
                    None
                }
            },
        }
    }

    fn feed_data(&mut self, data: u8) -> Option<MidiMessage> {
        if self.in_sysex {
            self.discarded += 1;
            return None;
        }

        match self.state {
            MidiParserState::AwaitingStatus | MidiParserState::Complete => {
                match self.running_status {
                    Some(status) => {
                        // The count is always available for the status kept as running.
                        self.pending[0] = status;
                        self.expected = data_byte_count(status).unwrap_or(2);
                        self.push_data1(data)
                    }
                    None => {
                        self.state = MidiParserState::AwaitingStatus;
                        self.discarded += 1;
                        None
                    }
                }
            }
            MidiParserState::AwaitingData1 => self.push_data1(data),
            MidiParserState::AwaitingData2 => {
                self.pending[2] = data;
                self.complete()
            }
        }
    }

    fn push_data1(&mut self, data: u8) -> Option<MidiMessage> {
        self.pending[1] = data;
        if self.expected > 1 {
            self.state = MidiParserState::AwaitingData2;
            None
        } else {
            self.complete()
        }
    }

    fn complete(&mut self) -> Option<MidiMessage> {
        self.state = MidiParserState::AwaitingStatus;
        Some(MidiMessage::new(&self.pending[..(1 + self.expected)]))
    }
}

/// The size of queue in encoder.
pub const MIDI_ENCODER_QUEUE_SIZE: usize = 64;

/// The encoder of MIDI messages to byte stream, emitting one byte per AM824 quadlet. The queue
/// is fixed-size so that no allocation occurs while encoding.
#[derive(Debug)]
pub struct MidiEncoder {
    queue: [u8; MIDI_ENCODER_QUEUE_SIZE],
    head: usize,
    len: usize,
}

impl Default for MidiEncoder {
    fn default() -> Self {
        Self {
            queue: [0; MIDI_ENCODER_QUEUE_SIZE],
            head: 0,
            len: 0,
        }
    }
}

impl MidiEncoder {
    /// Queue the message. When the queue has no space for whole bytes of the message, nothing
    /// is queued and false is returned.
    pub fn push(&mut self, msg: &MidiMessage) -> bool {
        let bytes = msg.as_bytes();
        if self.len + bytes.len() > MIDI_ENCODER_QUEUE_SIZE {
            return false;
        }

        bytes.iter().for_each(|&byte| {
            let pos = (self.head + self.len) % MIDI_ENCODER_QUEUE_SIZE;
            self.queue[pos] = byte;
            self.len += 1;
        });

        true
    }

    /// The number of bytes waiting for transmission.
    pub fn pending(&self) -> usize {
        self.len
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        if self.len == 0 {
            None
        } else {
            let byte = self.queue[self.head];
            self.head = (self.head + 1) % MIDI_ENCODER_QUEUE_SIZE;
            self.len -= 1;
            Some(byte)
        }
    }

    /// Build the quadlet of MIDI conformant data channel with the next byte, or without data.
    pub fn build_slot(&mut self, raw: &mut [u8]) {
        match self.next_byte() {
            Some(byte) => serialize_midi(&[byte], raw),
            None => serialize_midi(&[], raw),
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(parser: &mut MidiParser, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut msgs = Vec::new();
        parser.feed_bytes(bytes, |msg| msgs.push(msg.as_bytes().to_vec()));
        msgs
    }

    #[test]
    fn parser_keeps_state_between_calls() {
        let mut parser = MidiParser::default();
        assert_eq!(parser.state(), MidiParserState::AwaitingStatus);

        assert_eq!(parser.feed(0x90), None);
        assert_eq!(parser.state(), MidiParserState::AwaitingData1);
        assert_eq!(parser.feed(0x3c), None);
        assert_eq!(parser.state(), MidiParserState::AwaitingData2);
        assert_eq!(parser.feed(0x7f), Some(MidiMessage::new(&[0x90, 0x3c, 0x7f])));
        assert_eq!(parser.state(), MidiParserState::AwaitingStatus);

        // The running status survives the return to idle.
        assert_eq!(parser.feed(0x40), None);
        assert_eq!(parser.state(), MidiParserState::AwaitingData2);
        assert_eq!(parser.feed(0x00), Some(MidiMessage::new(&[0x90, 0x40, 0x00])));
        assert_eq!(parser.state(), MidiParserState::AwaitingStatus);

        assert_eq!(parser.feed(0xf6), Some(MidiMessage::new(&[0xf6])));
        assert_eq!(parser.state(), MidiParserState::AwaitingStatus);
    }

    #[test]
    fn parser_running_status() {
        let mut parser = MidiParser::default();
        let msgs = parse(&mut parser, &[0x90, 0x3c, 0x7f, 0x40, 0x00, 0xc1, 0x05, 0x06]);
        assert_eq!(
            msgs,
            vec![
                vec![0x90, 0x3c, 0x7f],
                vec![0x90, 0x40, 0x00],
                vec![0xc1, 0x05],
                vec![0xc1, 0x06],
            ]
        );
    }

    #[test]
    fn parser_resynchronizes_with_new_status() {
        let mut parser = MidiParser::default();
        let msgs = parse(&mut parser, &[0x3c, 0x90, 0x3c, 0xb0, 0x07, 0x64]);
        assert_eq!(msgs, vec![vec![0xb0, 0x07, 0x64]]);
        assert_eq!(parser.discarded(), 1);
    }

    #[test]
    fn parser_passes_realtime_through() {
        let mut parser = MidiParser::default();
        let msgs = parse(&mut parser, &[0x90, 0x3c, 0xf8]);
        assert_eq!(msgs, vec![vec![0xf8]]);
        assert_eq!(parser.state(), MidiParserState::AwaitingData2);

        let msgs = parse(&mut parser, &[0x7f, 0xfe]);
        assert_eq!(msgs, vec![vec![0x90, 0x3c, 0x7f], vec![0xfe]]);
    }

    #[test]
    fn parser_system_messages() {
        let mut parser = MidiParser::default();
        let msgs = parse(
            &mut parser,
            &[0xf0, 0x7e, 0x7f, 0x06, 0x01, 0xf7, 0xf2, 0x10, 0x20, 0x30, 0xf6],
        );
        assert_eq!(msgs, vec![vec![0xf2, 0x10, 0x20], vec![0xf6]]);
        // The data byte after system common message has no running status.
        assert_eq!(parser.discarded(), 5);
    }

    #[test]
    fn encoder_emits_one_byte_per_slot() {
        let mut encoder = MidiEncoder::default();
        assert!(encoder.push(&MidiMessage::new(&[0x90, 0x3c, 0x7f])));
        assert_eq!(encoder.pending(), 3);

        let mut raw = [0; 4];
        encoder.build_slot(&mut raw);
        assert_eq!(raw, [0x81, 0x90, 0x00, 0x00]);
        encoder.build_slot(&mut raw);
        assert_eq!(raw, [0x81, 0x3c, 0x00, 0x00]);
        encoder.build_slot(&mut raw);
        assert_eq!(raw, [0x81, 0x7f, 0x00, 0x00]);
        encoder.build_slot(&mut raw);
        assert_eq!(raw, [0x80, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn encoder_queue_is_bounded() {
        let mut encoder = MidiEncoder::default();
        let msg = MidiMessage::new(&[0x90, 0x3c, 0x7f]);
        (0..(MIDI_ENCODER_QUEUE_SIZE / 3)).for_each(|_| assert!(encoder.push(&msg)));
        assert!(!encoder.push(&msg));
        assert!(encoder.push(&MidiMessage::new(&[0xf8])));
        assert_eq!(encoder.pending(), MIDI_ENCODER_QUEUE_SIZE);

        encoder.clear();
        assert_eq!(encoder.next_byte(), None);
    }
}
